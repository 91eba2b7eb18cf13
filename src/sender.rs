use thiserror::Error;
use tokio::{
    io,
    sync::{mpsc, oneshot},
};

use crate::{packet::PeerId, pool::CapacityError};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("The manager has shut down.")]
    Disconnected,
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("Peer {0} is not connected.")]
    NotConnected(PeerId),
    #[error("Unable to write to peer.")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), CapacityError>>,
    },
    Disconnect {
        peer: PeerId,
    },
    DisconnectAll,
    SetMaxConnections {
        limit: usize,
        reply: oneshot::Sender<Result<(), CapacityError>>,
    },
    SetReconnect {
        enabled: bool,
    },
    Send {
        peer: PeerId,
        message: Vec<u8>,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    BondedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Handle for issuing commands to a running [`Manager`](crate::Manager).
///
/// Commands are queued and applied in order by the manager task.
#[derive(Debug, Clone)]
pub struct Sender {
    sender: mpsc::UnboundedSender<Command>,
}

impl Sender {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self { sender }
    }

    fn post(&self, command: Command) -> Result<(), SendError> {
        self.sender
            .send(command)
            .map_err(|_| SendError::Disconnected)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SendError> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply))?;
        response.await.map_err(|_| SendError::Disconnected)
    }

    /// Start negotiating with `peer`, replacing any link or negotiation it already has.
    pub async fn connect(&self, peer: PeerId) -> Result<(), SendError> {
        self.request(|reply| Command::Connect { peer, reply })
            .await?
            .map_err(SendError::from)
    }

    /// Close the link to `peer` and stop reconnecting to it.
    pub fn disconnect(&self, peer: PeerId) -> Result<(), SendError> {
        self.post(Command::Disconnect { peer })
    }

    pub fn disconnect_all(&self) -> Result<(), SendError> {
        self.post(Command::DisconnectAll)
    }

    /// Limit simultaneous connections. Existing connections are kept.
    pub async fn set_max_connections(&self, limit: usize) -> Result<(), SendError> {
        self.request(|reply| Command::SetMaxConnections { limit, reply })
            .await?
            .map_err(SendError::from)
    }

    pub fn set_reconnect(&self, enabled: bool) -> Result<(), SendError> {
        self.post(Command::SetReconnect { enabled })
    }

    /// Send `message` to a connected peer, split over as many Data packets as needed.
    pub async fn send(&self, peer: PeerId, message: Vec<u8>) -> Result<(), SendError> {
        self.request(|reply| Command::Send {
            peer,
            message,
            reply,
        })
        .await?
    }

    pub async fn bonded_peers(&self) -> Result<Vec<PeerId>, SendError> {
        self.request(|reply| Command::BondedPeers { reply }).await
    }
}
