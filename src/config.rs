use std::{path::PathBuf, time::Duration};

use crate::pool::DEFAULT_POOL_SIZE;

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of channel ids in the shared pool, the radio's limit of simultaneous links.
    pub channel_pool_size: u8,
    /// Maximum number of peers that may be connecting or connected at once.
    /// Must not exceed the pool size.
    pub max_connections: usize,
    /// Connection attempts per channel made by the client side of a negotiation.
    pub connect_retries: usize,
    /// Pause between two failed client attempts.
    pub retry_delay: Duration,
    /// Accept windows per channel opened by the server side of a negotiation.
    pub accept_retries: usize,
    /// How long a single accept window stays open.
    ///
    /// Keep it close to `connect_retries * retry_delay` so that both peers
    /// walk the channel pool at the same pace.
    pub accept_timeout: Duration,
    /// Whether lost or failed connections are negotiated again automatically.
    pub reconnect: bool,
    /// Base delay before a reconnect, up to half of it again is added as random jitter.
    pub reconnect_delay: Duration,
    /// Largest frame written or accepted on a ranging stream.
    pub max_frame_size: usize,
    /// In-flight packets kept per connection before the oldest is evicted.
    pub in_flight_capacity: usize,
    /// Radio controller trace to correlate against. `None` disables radio timing.
    pub snoop: Option<SnoopConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_pool_size: DEFAULT_POOL_SIZE,
            max_connections: DEFAULT_POOL_SIZE as usize,
            connect_retries: 3,
            retry_delay: Duration::from_millis(100),
            accept_retries: 1,
            accept_timeout: Duration::from_millis(300),
            reconnect: true,
            reconnect_delay: Duration::from_millis(1000),
            max_frame_size: 990,
            in_flight_capacity: 256,
            snoop: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnoopConfig {
    /// Path of the BTSnoop file written by the radio controller.
    pub path: PathBuf,
    /// How often to check the file for new records.
    pub poll_interval: Duration,
    /// Record offset to start from, 0 reads the file from the beginning.
    pub offset: u64,
}

impl SnoopConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_millis(100),
            offset: 0,
        }
    }
}
