use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::Transport;
use crate::{packet::PeerId, pool::ChannelId};

/// Ranging over TCP, for devices on an IP network.
///
/// Channel `n` of a device listens on its base port plus `n`. The connecting
/// side announces its peer id in a single byte so the acceptor can tell who
/// it is talking to.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    local: PeerId,
    address: SocketAddr,
    peers: Arc<HashMap<PeerId, SocketAddr>>,
}

impl TcpTransport {
    /// `address` is this device's base address; `peers` maps peer ids to theirs.
    pub fn new(local: PeerId, address: SocketAddr, peers: HashMap<PeerId, SocketAddr>) -> Self {
        Self {
            local,
            address,
            peers: Arc::new(peers),
        }
    }
}

fn channel_address(base: SocketAddr, channel: ChannelId) -> io::Result<SocketAddr> {
    let port = base.port().checked_add(channel as u16).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Channel {} overflows port {}.", channel, base.port()),
        )
    })?;
    Ok(SocketAddr::new(base.ip(), port))
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn connect(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<TcpStream>> {
        let local = self.local;
        let base = self.peers.get(&peer).copied();

        async move {
            let base = base.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("Unknown peer {}.", peer))
            })?;

            let mut stream = TcpStream::connect(channel_address(base, channel)?).await?;
            stream.set_nodelay(true)?;
            stream.write_u8(local).await?;

            Ok(stream)
        }
        .boxed()
    }

    fn accept(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<TcpStream>> {
        let address = channel_address(self.address, channel);

        async move {
            let listener = TcpListener::bind(address?).await?;
            loop {
                let (mut stream, remote) = listener.accept().await?;
                match stream.read_u8().await {
                    Ok(hello) if hello == peer => {
                        stream.set_nodelay(true)?;
                        return Ok(stream);
                    }
                    Ok(hello) => {
                        log::debug!(
                            "Dropping connection from peer {} ({}) while waiting for peer {}.",
                            hello,
                            remote,
                            peer
                        );
                    }
                    Err(err) => log::debug!("No hello from {}: {}", remote, err),
                }
            }
        }
        .boxed()
    }

    fn bonded_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }
}
