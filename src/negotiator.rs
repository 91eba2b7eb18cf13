//! Races a client attempt against a server listen to open one link to a peer.
//!
//! Neither of two equal peers can assume it is the only one initiating, so
//! both connect and listen at the same time. The two attempts walk the free
//! channels in the same ascending order, which lets one device's client meet
//! the other device's listener. The first attempt to succeed wins and the
//! other one is dropped, which stops it.

use std::sync::Arc;

use futures::{
    future::{self, Either},
    FutureExt,
};
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::{
    connection::Role,
    packet::PeerId,
    pool::ChannelId,
    transport::Transport,
    utils::CancelToken,
    Config,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    #[error("Negotiation with peer {peer} was cancelled.")]
    Cancelled { peer: PeerId },
    #[error("Neither the client nor the server attempt reached peer {peer}.")]
    Exhausted { peer: PeerId },
    #[error("Channel {channel} is already held by another connection.")]
    ChannelInUse { channel: ChannelId },
}

/// A link to a peer, ready for framing.
#[derive(Debug)]
pub struct Negotiated<S> {
    pub peer: PeerId,
    pub channel: ChannelId,
    pub role: Role,
    pub stream: S,
}

/// Open a link to `peer` over the first of `channels` on which one of the
/// two attempts succeeds.
pub async fn negotiate<T: Transport>(
    transport: Arc<T>,
    local: PeerId,
    peer: PeerId,
    channels: Vec<ChannelId>,
    config: Config,
    cancel: CancelToken,
) -> Result<Negotiated<T::Stream>, NegotiationFailure> {
    log::debug!("Negotiating with peer {} over channels {:?}.", peer, channels);

    let client = client_attempt(
        transport.clone(),
        peer,
        channels.clone(),
        config.clone(),
        cancel.clone(),
    )
    .boxed();
    let server = server_attempt(transport, peer, channels, config, cancel.clone()).boxed();

    let race = async move {
        match future::select(client, server).await {
            Either::Left((Some(won), server)) => {
                Some(settle(local, peer, won, Role::Client, server.now_or_never().flatten()))
            }
            Either::Right((Some(won), client)) => {
                Some(settle(local, peer, won, Role::Server, client.now_or_never().flatten()))
            }
            Either::Left((None, server)) => server.await.map(|won| link(peer, won, Role::Server)),
            Either::Right((None, client)) => client.await.map(|won| link(peer, won, Role::Client)),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(NegotiationFailure::Cancelled { peer }),
        result = race => match result {
            Some(negotiated) => {
                log::debug!(
                    "Negotiated channel {} with peer {} as {:?}.",
                    negotiated.channel,
                    peer,
                    negotiated.role
                );
                Ok(negotiated)
            }
            None if cancel.is_cancelled() => Err(NegotiationFailure::Cancelled { peer }),
            None => Err(NegotiationFailure::Exhausted { peer }),
        },
    }
}

/// Pick the link to keep once one attempt has won.
///
/// When the losing attempt had also finished, both devices hold two links and
/// must keep the same one: the device with the lower id keeps its client side.
fn settle<S>(
    local: PeerId,
    peer: PeerId,
    won: (ChannelId, S),
    role: Role,
    other: Option<(ChannelId, S)>,
) -> Negotiated<S> {
    let other = match other {
        Some(other) => other,
        None => return link(peer, won, role),
    };

    let client_role = if local < peer { Role::Client } else { Role::Server };
    log::debug!(
        "Both attempts reached peer {}, keeping the {:?} link.",
        peer,
        client_role
    );
    if role == client_role {
        link(peer, won, role)
    } else {
        link(peer, other, client_role)
    }
}

fn link<S>(peer: PeerId, (channel, stream): (ChannelId, S), role: Role) -> Negotiated<S> {
    Negotiated {
        peer,
        channel,
        role,
        stream,
    }
}

async fn client_attempt<T: Transport>(
    transport: Arc<T>,
    peer: PeerId,
    channels: Vec<ChannelId>,
    config: Config,
    cancel: CancelToken,
) -> Option<(ChannelId, T::Stream)> {
    for channel in channels {
        for attempt in 0..config.connect_retries {
            if cancel.is_cancelled() {
                return None;
            }
            match transport.connect(peer, channel).await {
                Ok(stream) => return Some((channel, stream)),
                Err(err) => log::trace!(
                    "Connect to peer {} on channel {} (attempt {}) failed: {}",
                    peer,
                    channel,
                    attempt,
                    err
                ),
            }
            sleep(config.retry_delay).await;
        }
    }
    None
}

async fn server_attempt<T: Transport>(
    transport: Arc<T>,
    peer: PeerId,
    channels: Vec<ChannelId>,
    config: Config,
    cancel: CancelToken,
) -> Option<(ChannelId, T::Stream)> {
    for channel in channels {
        for attempt in 0..config.accept_retries {
            if cancel.is_cancelled() {
                return None;
            }
            match timeout(config.accept_timeout, transport.accept(peer, channel)).await {
                Ok(Ok(stream)) => return Some((channel, stream)),
                Ok(Err(err)) => {
                    log::trace!(
                        "Accept from peer {} on channel {} (attempt {}) failed: {}",
                        peer,
                        channel,
                        attempt,
                        err
                    );
                    sleep(config.retry_delay).await;
                }
                Err(_) => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> Config {
        Config {
            retry_delay: Duration::from_millis(10),
            accept_timeout: Duration::from_millis(30),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn simultaneous_negotiation_yields_one_link() {
        for _ in 0..20 {
            let hub = MemoryHub::new();
            let a = Arc::new(hub.transport(1));
            let b = Arc::new(hub.transport(2));

            let (left, right) = tokio::join!(
                negotiate(a, 1, 2, vec![0, 1, 2], config(), CancelToken::new()),
                negotiate(b, 2, 1, vec![0, 1, 2], config(), CancelToken::new()),
            );
            let mut left = left.unwrap();
            let mut right = right.unwrap();

            assert_eq!(left.channel, right.channel);
            assert_ne!(left.role, right.role);

            // Both ends of the same link.
            left.stream.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            right.stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
        }
    }

    #[tokio::test]
    async fn one_sided_negotiation_is_accepted_by_listener() {
        let hub = MemoryHub::new();
        let a = Arc::new(hub.transport(1));
        let b = Arc::new(hub.transport(2));

        let listener = {
            let b = b.clone();
            tokio::spawn(async move { b.accept(1, 1).await })
        };
        tokio::task::yield_now().await;

        let negotiated = negotiate(a, 1, 2, vec![1], config(), CancelToken::new())
            .await
            .unwrap();
        assert_eq!(negotiated.role, Role::Client);
        assert_eq!(negotiated.channel, 1);
        assert!(listener.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unreachable_peer_exhausts() {
        let hub = MemoryHub::new();
        let a = Arc::new(hub.transport(1));

        let result = negotiate(a, 1, 2, vec![0, 1], config(), CancelToken::new()).await;
        assert_eq!(result.unwrap_err(), NegotiationFailure::Exhausted { peer: 2 });
    }

    #[tokio::test]
    async fn cancellation_stops_negotiation() {
        let hub = MemoryHub::new();
        let a = Arc::new(hub.transport(1));
        let cancel = CancelToken::new();

        let task = tokio::spawn(negotiate(
            a,
            1,
            2,
            vec![0, 1, 2, 3, 4, 5, 6],
            Config::default(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(
            task.await.unwrap().unwrap_err(),
            NegotiationFailure::Cancelled { peer: 2 }
        );
    }
}
