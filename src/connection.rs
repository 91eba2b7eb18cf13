use std::collections::HashMap;

use tokio::{
    io,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};

use crate::{
    correlator::Correlator,
    packet::{DataPacket, Encoding, Header, Packet, PeerId, DATA_OVERHEAD},
    pool::{CapacityError, ChannelId},
    utils::{now_nanos, read_frame, CancelToken},
};

/// Fragments a message may be split into, bounded by the one-byte part fields.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Which side of the negotiation produced the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// What a per-connection reader task reports to the manager.
#[derive(Debug)]
pub enum Inbound {
    Frame { bytes: Vec<u8>, received_at: u64 },
    Closed(io::Error),
}

#[derive(Debug)]
struct Fragments {
    parts: Vec<Option<Vec<u8>>>,
    missing: usize,
}

/// Everything the manager knows about one remote peer.
#[derive(Debug)]
pub struct Connection<S: AsyncRead + AsyncWrite> {
    pub peer: PeerId,
    pub state: ConnectionState,
    pub channel: Option<ChannelId>,
    pub role: Option<Role>,
    pub correlator: Correlator,
    /// Set by an explicit connect, cleared by an explicit disconnect.
    /// Only wanted peers are reconnected.
    pub wanted: bool,
    /// Bumped on every teardown so that events from earlier attempts can be told apart.
    pub generation: u64,
    cancel: CancelToken,
    write_stream: Option<WriteHalf<S>>,
    next_packet_index: u32,
    next_message_index: u32,
    fragments: HashMap<u32, Fragments>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(peer: PeerId, correlator: Correlator) -> Self {
        Self {
            peer,
            state: ConnectionState::None,
            channel: None,
            role: None,
            correlator,
            wanted: false,
            generation: 0,
            cancel: CancelToken::new(),
            write_stream: None,
            next_packet_index: 0,
            next_message_index: 0,
            fragments: HashMap::new(),
        }
    }

    /// Token for the tasks serving the current generation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Take over a freshly negotiated stream and start reading from it.
    ///
    /// Frames are forwarded to `inbound` tagged with the current generation.
    pub fn attach(
        &mut self,
        stream: S,
        channel: ChannelId,
        role: Role,
        inbound: mpsc::UnboundedSender<(PeerId, u64, Inbound)>,
        max_frame_size: usize,
    ) {
        let (read_stream, write_stream) = io::split(stream);
        self.write_stream = Some(write_stream);
        self.channel = Some(channel);
        self.role = Some(role);

        tokio::spawn(Self::read(
            self.peer,
            self.generation,
            read_stream,
            max_frame_size,
            inbound,
            self.cancel.clone(),
        ));
    }

    /// Stop all tasks of the current generation and forget in-flight state.
    ///
    /// Returns the channel that was held, if any.
    pub async fn teardown(&mut self) -> Option<ChannelId> {
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        self.generation += 1;

        if let Some(mut write_stream) = self.write_stream.take() {
            let _ = write_stream.shutdown().await;
        }

        let evicted = self.correlator.clear();
        if evicted > 0 {
            log::debug!(
                "Dropped {} in-flight packets for peer {}.",
                evicted,
                self.peer
            );
        }
        self.fragments.clear();
        self.role = None;
        self.channel.take()
    }

    /// Encode `packet` for transmission and write it to the peer.
    ///
    /// The packet is stamped with the send time before the write starts, the
    /// stamped packet is left in place for the caller.
    pub async fn write(&mut self, packet: &mut Packet) -> io::Result<()> {
        let write_stream = self.write_stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "No stream attached.")
        })?;

        let bytes = packet
            .encode(Encoding::Transmit { now: now_nanos() })
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        write_stream.write_all(&bytes).await?;
        write_stream.flush().await?;

        Ok(())
    }

    /// Split `message` into Data packets addressed to this connection's peer.
    pub fn fragment(
        &mut self,
        local: PeerId,
        message: &[u8],
        max_frame_size: usize,
    ) -> Result<Vec<DataPacket>, CapacityError> {
        let capacity = max_frame_size.saturating_sub(DATA_OVERHEAD).max(1);
        let parts = ((message.len() + capacity - 1) / capacity).max(1);
        if parts > MAX_FRAGMENTS {
            return Err(CapacityError::MessageTooLarge {
                length: message.len(),
                max_fragments: MAX_FRAGMENTS,
            });
        }

        let message_index = self.next_message_index;
        self.next_message_index = self.next_message_index.wrapping_add(1);

        let mut chunks: Vec<&[u8]> = message.chunks(capacity).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(part, chunk)| {
                let packet_index = self.next_packet_index;
                self.next_packet_index = self.next_packet_index.wrapping_add(1);

                DataPacket::new(
                    Header {
                        src: local,
                        dest: self.peer,
                        packet_index,
                        message_index,
                        message_part: part as u8,
                        message_parts: parts as u8,
                        attempt: 0,
                        app_src_sent: 0,
                    },
                    chunk.to_vec(),
                )
            })
            .collect())
    }

    /// Collect a received fragment, returning the whole message once every part arrived.
    pub fn reassemble(&mut self, packet: &DataPacket) -> Option<Vec<u8>> {
        let header = &packet.header;
        let parts = header.message_parts.max(1) as usize;
        let part = header.message_part as usize;
        if part >= parts {
            log::warn!(
                "Fragment {} of {} from peer {} is out of range.",
                part,
                parts,
                self.peer
            );
            return None;
        }
        if parts == 1 {
            return Some(packet.payload.clone());
        }

        let fragments = self
            .fragments
            .entry(header.message_index)
            .or_insert_with(|| Fragments {
                parts: vec![None; parts],
                missing: parts,
            });
        if fragments.parts.len() != parts {
            log::warn!(
                "Message {} from peer {} changed its fragment count, starting over.",
                header.message_index,
                self.peer
            );
            *fragments = Fragments {
                parts: vec![None; parts],
                missing: parts,
            };
        }

        if fragments.parts[part].is_none() {
            fragments.missing -= 1;
        }
        fragments.parts[part] = Some(packet.payload.clone());

        if fragments.missing > 0 {
            return None;
        }
        self.fragments
            .remove(&header.message_index)
            .map(|fragments| fragments.parts.into_iter().flatten().flatten().collect())
    }

    async fn read(
        peer: PeerId,
        generation: u64,
        mut read_stream: ReadHalf<S>,
        max_frame_size: usize,
        inbound: mpsc::UnboundedSender<(PeerId, u64, Inbound)>,
        cancel: CancelToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = read_frame(&mut read_stream, max_frame_size) => {
                    let event = match result {
                        Ok(bytes) => Inbound::Frame { bytes, received_at: now_nanos() },
                        Err(err) => {
                            log::debug!("Error reading frame from peer {}: {}", peer, err);
                            let _ = inbound.send((peer, generation, Inbound::Closed(err)));
                            break;
                        }
                    };
                    if inbound.send((peer, generation, event)).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
