//! # Peerrange
//!
//! Round trip timing between paired radio devices. Every device runs a
//! [`Manager`] which negotiates one link per peer, sends messages over it as
//! timestamped Data packets and answers the peer's packets with Acks. Once
//! all timestamps of an exchange are known a [`Event::TimingComplete`] is
//! emitted, from which the distance between the devices can be estimated.
//!
//! ## Example:
//!
//! ```rust,no_run
//! use peerrange::{packet::distance_meters, Config, Event, Manager, MemoryHub};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!
//!     let (sender1, mut receiver1, task1) = Manager::new(1, hub.transport(1), Config::default());
//!     let (sender2, _receiver2, task2) = Manager::new(2, hub.transport(2), Config::default());
//!     tokio::spawn(task1);
//!     tokio::spawn(task2);
//!
//!     // Both devices have to ask for the link.
//!     sender1.connect(2).await?;
//!     sender2.connect(1).await?;
//!
//!     while let Some(event) = receiver1.recv().await {
//!         match event {
//!             Event::Established { peer, .. } => {
//!                 sender1.send(peer, b"Hello, peer!".to_vec()).await?;
//!             }
//!             Event::TimingComplete { peer, packet } => {
//!                 if let Some(round_trip) = packet.application_round_trip() {
//!                     println!("{} m to peer {}", distance_meters(round_trip), peer);
//!                 }
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Radio controller timestamps are picked up from a BTSnoop trace when
//! [`Config::snoop`] is set.

mod config;
pub mod connection;
pub mod correlator;
mod event;
mod manager;
pub mod negotiator;
pub mod packet;
pub mod pool;
mod receiver;
mod sender;
pub mod snoop;
pub mod transport;
pub mod utils;

pub use config::{Config, SnoopConfig};
pub use event::Event;
pub use manager::Manager;
pub use receiver::Receiver;
pub use sender::{SendError, Sender};

pub use connection::{ConnectionState, Role};
pub use correlator::CorrelationError;
pub use negotiator::NegotiationFailure;
pub use packet::{AckPacket, AckTimePacket, DataPacket, FrameError, Header, Packet, PeerId};
pub use pool::{CapacityError, ChannelId};
pub use snoop::{Direction, SnoopError};
pub use transport::{MemoryHub, MemoryTransport, TcpTransport, Transport};
pub use utils::CancelToken;
