//! The duplex byte streams ranging runs over.
//!
//! A radio link is opened either by connecting to a peer on a channel or by
//! accepting the peer's connection on that channel. Implementations decide
//! what a channel maps to (an RFCOMM service, a TCP port, ...).

use futures::future::BoxFuture;
use tokio::{
    io,
    io::{AsyncRead, AsyncWrite},
};

use crate::{packet::PeerId, pool::ChannelId};

mod memory;
mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;

pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `peer` on `channel`. Fails fast if the peer is not accepting.
    fn connect(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<Self::Stream>>;

    /// Wait for `peer` to connect on `channel`. Dropping the future stops listening.
    fn accept(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<Self::Stream>>;

    /// Peers this device is paired with and may range against.
    fn bonded_peers(&self) -> Vec<PeerId>;
}
