//! The single task that owns every connection.
//!
//! Negotiations, stream readers and the snoop reader run as their own tasks
//! and post into this one, so the connection map and the in-flight tables
//! are only ever touched from here.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{io, sync::mpsc, time::sleep};

use crate::{
    connection::{Connection, ConnectionState, Inbound},
    correlator::{CorrelationError, Correlator, Observation, Signal},
    event::Event,
    negotiator::{negotiate, Negotiated, NegotiationFailure},
    packet::{
        decode_header, AckPacket, AckTimePacket, Packet, PacketKind, PeerId, DATA_OVERHEAD,
        MARKER, MAX_FRAME_LEN,
    },
    pool::{CapacityError, ChannelPool},
    receiver::{self, Receiver},
    sender::{Command, SendError, Sender},
    snoop::{Direction, SnoopReader, SnoopRecord},
    transport::Transport,
    utils::CancelToken,
    Config,
};

enum Internal<S> {
    Negotiated {
        peer: PeerId,
        generation: u64,
        result: Result<Negotiated<S>, NegotiationFailure>,
    },
    Reconnect {
        peer: PeerId,
        generation: u64,
    },
}

pub struct Manager;

impl Manager {
    /// Create a manager for the device `local`.
    /// Returns a [`Sender`], [`Receiver`] and a [`Future`] which must be spawned
    /// on a tokio runtime.
    pub fn new<T: Transport>(
        local: PeerId,
        transport: T,
        config: Config,
    ) -> (Sender, Receiver<Event>, impl Future<Output = ()>) {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = receiver::channel();

        let task = Self::task(local, transport, config, command_receiver, event_sender);

        (
            Sender::new(command_sender),
            Receiver::new(event_receiver),
            task,
        )
    }

    async fn task<T: Transport>(
        local: PeerId,
        transport: T,
        mut config: Config,
        mut commands: mpsc::UnboundedReceiver<Command>,
        events: receiver::InnerSender<Event>,
    ) {
        let max_frame_size = config.max_frame_size.max(DATA_OVERHEAD + 1).min(MAX_FRAME_LEN);
        if max_frame_size != config.max_frame_size {
            log::warn!(
                "Frame size {} out of range, using {}.",
                config.max_frame_size,
                max_frame_size
            );
            config.max_frame_size = max_frame_size;
        }

        let (inbound_sender, mut inbound_receiver) = mpsc::unbounded_channel();
        let (internal_sender, mut internal_receiver) = mpsc::unbounded_channel();
        let (snoop_sender, mut snoop_receiver) = mpsc::unbounded_channel::<SnoopRecord>();

        let snoop_cancel = CancelToken::new();
        let mut snoop_open = false;
        if let Some(snoop) = config.snoop.clone() {
            snoop_open = true;
            let reader = SnoopReader::from_offset(&snoop.path, MARKER, snoop.offset);
            let cancel = snoop_cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = reader.run(snoop_sender, snoop.poll_interval, cancel).await {
                    log::error!("Snoop log reader stopped: {}", err);
                }
            });
        }

        let mut state = State {
            local,
            transport: Arc::new(transport),
            pool: ChannelPool::new(config.channel_pool_size),
            max_connections: config.max_connections.min(config.channel_pool_size as usize),
            reconnect: config.reconnect,
            radio: config.snoop.is_some(),
            config,
            connections: HashMap::new(),
            events,
            inbound: inbound_sender,
            internal: internal_sender,
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => state.command(command).await,
                    None => break,
                },
                Some((peer, generation, inbound)) = inbound_receiver.recv() => {
                    state.inbound(peer, generation, inbound).await;
                },
                Some(internal) = internal_receiver.recv() => match internal {
                    Internal::Negotiated { peer, generation, result } => {
                        state.negotiated(peer, generation, result).await;
                    }
                    Internal::Reconnect { peer, generation } => {
                        state.reconnect(peer, generation).await;
                    }
                },
                record = snoop_receiver.recv(), if snoop_open => match record {
                    Some(record) => state.snoop(record).await,
                    None => {
                        snoop_open = false;
                        state.radio_lost().await;
                    }
                },
            }
        }

        log::debug!("Manager for device {} shutting down.", local);
        snoop_cancel.cancel();
        state.disconnect_all().await;
    }
}

struct State<T: Transport> {
    local: PeerId,
    transport: Arc<T>,
    config: Config,
    pool: ChannelPool,
    connections: HashMap<PeerId, Connection<T::Stream>>,
    max_connections: usize,
    reconnect: bool,
    /// Whether controller timestamps are still expected.
    radio: bool,
    events: receiver::InnerSender<Event>,
    inbound: mpsc::UnboundedSender<(PeerId, u64, Inbound)>,
    internal: mpsc::UnboundedSender<Internal<T::Stream>>,
}

impl<T: Transport> State<T> {
    async fn command(&mut self, command: Command) {
        match command {
            Command::Connect { peer, reply } => {
                let result = self.connect(peer).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { peer } => self.disconnect(peer).await,
            Command::DisconnectAll => self.disconnect_all().await,
            Command::SetMaxConnections { limit, reply } => {
                let result = if limit > self.pool.size() {
                    Err(CapacityError::ExceedsPool {
                        requested: limit,
                        pool: self.pool.size(),
                    })
                } else {
                    self.max_connections = limit;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::SetReconnect { enabled } => {
                log::debug!("Reconnecting {}.", if enabled { "enabled" } else { "disabled" });
                self.reconnect = enabled;
            }
            Command::Send {
                peer,
                message,
                reply,
            } => {
                let result = self.send(peer, &message).await;
                let _ = reply.send(result);
            }
            Command::BondedPeers { reply } => {
                let _ = reply.send(self.transport.bonded_peers());
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.events.unbounded_send(event).is_err() {
            log::trace!("No one is listening for events.");
        }
    }

    fn set_state(&mut self, peer: PeerId, new: ConnectionState) {
        let old = match self.connections.get_mut(&peer) {
            Some(connection) => std::mem::replace(&mut connection.state, new),
            None => return,
        };
        if old != new {
            log::info!("Peer {}: {:?} -> {:?}", peer, old, new);
            self.emit(Event::StateChanged { peer, old, new });
        }
    }

    fn connection(&mut self, peer: PeerId) -> &mut Connection<T::Stream> {
        let local = self.local;
        let radio = self.radio;
        let capacity = self.config.in_flight_capacity;

        self.connections
            .entry(peer)
            .or_insert_with(|| Connection::new(peer, Correlator::new(local, radio, capacity)))
    }

    async fn connect(&mut self, peer: PeerId) -> Result<(), CapacityError> {
        if peer == self.local {
            log::warn!("Ignoring request to connect device {} to itself.", peer);
            return Ok(());
        }

        let active = self
            .connections
            .values()
            .filter(|connection| connection.peer != peer && connection.is_active())
            .count();
        if active >= self.max_connections {
            return Err(CapacityError::ConnectionLimit {
                limit: self.max_connections,
            });
        }
        let holds_channel = self
            .connections
            .get(&peer)
            .map_or(false, |connection| connection.channel.is_some());
        if self.pool.available().is_empty() && !holds_channel {
            return Err(CapacityError::PoolExhausted);
        }

        self.teardown(peer).await;
        self.connection(peer).wanted = true;
        self.start_negotiation(peer);

        Ok(())
    }

    fn start_negotiation(&mut self, peer: PeerId) {
        let channels = self.pool.available();
        let (generation, cancel) = match self.connections.get(&peer) {
            Some(connection) => (connection.generation, connection.cancel_token()),
            None => return,
        };
        self.set_state(peer, ConnectionState::Connecting);

        let transport = self.transport.clone();
        let config = self.config.clone();
        let internal = self.internal.clone();
        let local = self.local;
        tokio::spawn(async move {
            let result = negotiate(transport, local, peer, channels, config, cancel).await;
            let _ = internal.send(Internal::Negotiated {
                peer,
                generation,
                result,
            });
        });
    }

    async fn negotiated(
        &mut self,
        peer: PeerId,
        generation: u64,
        result: Result<Negotiated<T::Stream>, NegotiationFailure>,
    ) {
        let current = self.connections.get(&peer).map(|connection| connection.generation);
        if current != Some(generation) {
            log::debug!("Discarding outdated negotiation with peer {}.", peer);
            return;
        }

        match result {
            Ok(negotiated) => {
                if !self.pool.acquire(negotiated.channel) {
                    self.failed(
                        peer,
                        NegotiationFailure::ChannelInUse {
                            channel: negotiated.channel,
                        },
                    )
                    .await;
                    return;
                }

                let inbound = self.inbound.clone();
                let max_frame_size = self.config.max_frame_size;
                self.connection(peer).attach(
                    negotiated.stream,
                    negotiated.channel,
                    negotiated.role,
                    inbound,
                    max_frame_size,
                );

                self.emit(Event::Established {
                    peer,
                    channel: negotiated.channel,
                    role: negotiated.role,
                });
                self.set_state(peer, ConnectionState::Connected);
            }
            Err(NegotiationFailure::Cancelled { .. }) => {}
            Err(failure) => self.failed(peer, failure).await,
        }
    }

    async fn failed(&mut self, peer: PeerId, failure: NegotiationFailure) {
        log::info!("{}", failure);
        self.teardown(peer).await;
        self.set_state(peer, ConnectionState::None);
        self.schedule_reconnect(peer);
    }

    /// The link broke underneath us.
    async fn lost(&mut self, peer: PeerId) {
        self.teardown(peer).await;
        self.set_state(peer, ConnectionState::Disconnected);
        self.schedule_reconnect(peer);
    }

    async fn teardown(&mut self, peer: PeerId) {
        let channel = match self.connections.get_mut(&peer) {
            Some(connection) => connection.teardown().await,
            None => return,
        };
        if let Some(channel) = channel {
            self.pool.release(channel);
        }
    }

    fn schedule_reconnect(&mut self, peer: PeerId) {
        let generation = match self.connections.get(&peer) {
            Some(connection) if self.reconnect && connection.wanted => connection.generation,
            _ => return,
        };

        let base = self.config.reconnect_delay;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        let delay = base + Duration::from_millis(jitter);
        log::debug!("Reconnecting to peer {} in {:?}.", peer, delay);

        let internal = self.internal.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = internal.send(Internal::Reconnect { peer, generation });
        });
    }

    async fn reconnect(&mut self, peer: PeerId, generation: u64) {
        let due = self.connections.get(&peer).map_or(false, |connection| {
            connection.generation == generation && connection.wanted && !connection.is_active()
        });
        if !due || !self.reconnect {
            return;
        }

        if let Err(err) = self.connect(peer).await {
            log::warn!("Reconnect to peer {} deferred: {}", peer, err);
            self.schedule_reconnect(peer);
        }
    }

    async fn disconnect(&mut self, peer: PeerId) {
        let old = match self.connections.get_mut(&peer) {
            Some(connection) => {
                connection.wanted = false;
                connection.state
            }
            None => return,
        };

        self.teardown(peer).await;
        match old {
            ConnectionState::Connected => self.set_state(peer, ConnectionState::Disconnected),
            ConnectionState::Connecting => self.set_state(peer, ConnectionState::None),
            ConnectionState::None | ConnectionState::Disconnected => {}
        }
    }

    async fn disconnect_all(&mut self) {
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer).await;
        }
    }

    async fn send(&mut self, peer: PeerId, message: &[u8]) -> Result<(), SendError> {
        let local = self.local;
        let max_frame_size = self.config.max_frame_size;
        let packets = match self.connections.get_mut(&peer) {
            Some(connection) if connection.state == ConnectionState::Connected => {
                connection.fragment(local, message, max_frame_size)?
            }
            _ => return Err(SendError::NotConnected(peer)),
        };

        for data in packets {
            let mut packet = Packet::Data(data);
            self.write(peer, &mut packet).await?;

            let header = packet.header();
            let sent = Observation::application(Direction::Sent, header.app_src_sent);
            if let Some(connection) = self.connections.get_mut(&peer) {
                if let Err(err) = connection.correlator.on_data_observed(header, sent) {
                    log::warn!("Unable to track packet sent to peer {}: {}", peer, err);
                }
            }
        }

        Ok(())
    }

    async fn write(&mut self, peer: PeerId, packet: &mut Packet) -> io::Result<()> {
        let result = match self.connections.get_mut(&peer) {
            Some(connection) => connection.write(packet).await,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "Unknown peer.")),
        };

        if let Err(err) = &result {
            log::warn!("Error writing to peer {}: {}", peer, err);
            self.lost(peer).await;
        }
        result
    }

    async fn inbound(&mut self, peer: PeerId, generation: u64, inbound: Inbound) {
        let current = self.connections.get(&peer).map_or(false, |connection| {
            connection.generation == generation && connection.state == ConnectionState::Connected
        });
        if !current {
            log::trace!("Ignoring outdated input from peer {}.", peer);
            return;
        }

        match inbound {
            Inbound::Frame { bytes, received_at } => self.frame(peer, &bytes, received_at).await,
            Inbound::Closed(err) => {
                log::info!("Link to peer {} closed: {}", peer, err);
                self.lost(peer).await;
            }
        }
    }

    async fn frame(&mut self, peer: PeerId, bytes: &[u8], received_at: u64) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("Dropping frame from peer {}: {}", peer, err);
                return;
            }
        };
        let header = packet.header();
        if header.src != peer || header.dest != self.local {
            log::warn!(
                "Dropping frame from peer {} addressed {} -> {}.",
                peer,
                header.src,
                header.dest
            );
            return;
        }

        let received = Observation::application(Direction::Received, received_at);
        let connection = match self.connections.get_mut(&peer) {
            Some(connection) => connection,
            None => return,
        };

        let mut message = None;
        let result = match &packet {
            Packet::Data(data) => {
                let result = connection.correlator.on_data_observed(&data.header, received);
                if result.is_ok() {
                    message = connection.reassemble(data);
                }
                result
            }
            Packet::Ack(ack) => connection.correlator.on_ack_observed(ack, received),
            Packet::AckTime(ack_time) => {
                connection.correlator.on_ack_time_observed(ack_time, received)
            }
        };

        if let Some(message) = message {
            self.emit(Event::Received { peer, message });
        }
        self.outcome(peer, result).await;
    }

    async fn snoop(&mut self, record: SnoopRecord) {
        let frame = match decode_header(&record.frame) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("Undecodable frame in snoop record at {}: {}", record.offset, err);
                return;
            }
        };

        let header = frame.header;
        let peer = if header.src == self.local {
            header.dest
        } else if header.dest == self.local {
            header.src
        } else {
            log::trace!("Snoop record at {} is not ours.", record.offset);
            return;
        };

        let connection = match self.connections.get_mut(&peer) {
            Some(connection) if connection.state == ConnectionState::Connected => connection,
            _ => {
                log::trace!("Snoop record at {} for unconnected peer {}.", record.offset, peer);
                return;
            }
        };

        let observed = Observation::radio(record.direction, record.radio_time);
        let correlator = &mut connection.correlator;
        let result = match frame.kind {
            PacketKind::Data => correlator.on_data_observed(&header, observed),
            PacketKind::Ack => correlator.on_ack_observed(
                &AckPacket {
                    header,
                    ..Default::default()
                },
                observed,
            ),
            PacketKind::AckTime => correlator.on_ack_time_observed(
                &AckTimePacket {
                    header,
                    ..Default::default()
                },
                observed,
            ),
        };

        self.outcome(peer, result).await;
    }

    /// The snoop reader is gone. Carry on with application timestamps only.
    async fn radio_lost(&mut self) {
        if !self.radio {
            return;
        }
        log::warn!("No more radio timestamps, ranging on application timestamps only.");
        self.radio = false;

        let mut due = Vec::new();
        for (peer, connection) in self.connections.iter_mut() {
            let signals = connection.correlator.disable_radio();
            due.extend(signals.into_iter().map(|signal| (*peer, signal)));
        }
        for (peer, signal) in due {
            self.signal(peer, signal).await;
        }
    }

    async fn outcome(&mut self, peer: PeerId, result: Result<Option<Signal>, CorrelationError>) {
        match result {
            Ok(Some(signal)) => self.signal(peer, signal).await,
            Ok(None) => {}
            Err(error) => {
                log::debug!("Rejected observation for peer {}: {}", peer, error);
                self.emit(Event::Rejected { peer, error });
            }
        }
    }

    async fn signal(&mut self, peer: PeerId, signal: Signal) {
        match signal {
            Signal::AckReady(ack) => {
                let mut packet = Packet::Ack(ack);
                if self.write(peer, &mut packet).await.is_err() {
                    return;
                }
                if let (Packet::Ack(ack), Some(connection)) =
                    (&packet, self.connections.get_mut(&peer))
                {
                    let sent = Observation::application(Direction::Sent, ack.dest_sent);
                    if let Err(err) = connection.correlator.on_ack_observed(ack, sent) {
                        log::warn!("Unable to track ack sent to peer {}: {}", peer, err);
                    }
                }
            }
            Signal::AckTimeReady(ack_time) => {
                let _ = self.write(peer, &mut Packet::AckTime(ack_time)).await;
            }
            Signal::TimingComplete(packet) => {
                log::debug!(
                    "Packet {} to peer {} complete, round trip {:?} ns (radio {:?} ns).",
                    packet.header.packet_index,
                    peer,
                    packet.application_round_trip(),
                    packet.radio_round_trip()
                );
                self.emit(Event::TimingComplete { peer, packet });
            }
        }
    }
}
