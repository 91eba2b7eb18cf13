use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io,
    io::DuplexStream,
    sync::oneshot,
};

use super::Transport;
use crate::{packet::PeerId, pool::ChannelId};

const BUFFER_SIZE: usize = 64 * 1024;

/// (listening device, expected remote, channel)
type ListenKey = (PeerId, PeerId, ChannelId);

#[derive(Debug, Default)]
struct HubState {
    devices: HashSet<PeerId>,
    listeners: HashMap<ListenKey, oneshot::Sender<DuplexStream>>,
}

/// In-process stand-in for the radio: every device created from the same hub
/// can reach every other one. An accept registers its listener when it is
/// called, before the returned future is polled.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its transport.
    pub fn transport(&self, local: PeerId) -> MemoryTransport {
        self.lock().devices.insert(local);
        MemoryTransport {
            local,
            hub: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    hub: MemoryHub,
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    fn connect(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<DuplexStream>> {
        let result = {
            let mut state = self.hub.lock();
            match state.listeners.remove(&(peer, self.local, channel)) {
                Some(listener) => {
                    let (local_end, remote_end) = tokio::io::duplex(BUFFER_SIZE);
                    // Fails if the listener gave up in the meantime.
                    listener
                        .send(remote_end)
                        .map(|()| local_end)
                        .map_err(|_| refused(peer, channel))
                }
                None => Err(refused(peer, channel)),
            }
        };

        futures::future::ready(result).boxed()
    }

    fn accept(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<DuplexStream>> {
        let key = (self.local, peer, channel);
        let receiver = {
            let mut state = self.hub.lock();
            match state.listeners.get(&key) {
                Some(listener) if !listener.is_closed() => None,
                _ => {
                    let (sender, receiver) = oneshot::channel();
                    state.listeners.insert(key, sender);
                    Some(receiver)
                }
            }
        };

        async move {
            match receiver {
                Some(receiver) => receiver.await.map_err(|_| {
                    io::Error::new(io::ErrorKind::ConnectionAborted, "Listener was replaced.")
                }),
                None => Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("Already listening for peer {} on channel {}.", peer, channel),
                )),
            }
        }
        .boxed()
    }

    fn bonded_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .hub
            .lock()
            .devices
            .iter()
            .copied()
            .filter(|peer| *peer != self.local)
            .collect();
        peers.sort_unstable();
        peers
    }
}

fn refused(peer: PeerId, channel: ChannelId) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("Peer {} is not accepting on channel {}.", peer, channel),
    )
}
