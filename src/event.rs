use crate::{
    connection::{ConnectionState, Role},
    correlator::CorrelationError,
    packet::{DataPacket, PeerId},
    pool::ChannelId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged {
        peer: PeerId,
        old: ConnectionState,
        new: ConnectionState,
    },
    /// A link was set up; followed by the change to [`ConnectionState::Connected`].
    Established {
        peer: PeerId,
        channel: ChannelId,
        role: Role,
    },
    /// A packet sent to `peer` has every timestamp of its exchange.
    TimingComplete { peer: PeerId, packet: DataPacket },
    /// A complete message, reassembled from its fragments.
    Received { peer: PeerId, message: Vec<u8> },
    /// An observation could not be matched and was dropped.
    Rejected {
        peer: PeerId,
        error: CorrelationError,
    },
}
