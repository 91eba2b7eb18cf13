use std::{
    collections::HashMap,
    fs::OpenOptions,
    io,
    io::Write,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    time::{sleep, timeout},
};

use peerrange::{
    packet::{Encoding, MARKER},
    snoop::writer,
    utils::{now_nanos, read_frame},
    AckPacket, AckTimePacket, CapacityError, ChannelId, Config, ConnectionState,
    CorrelationError, Direction, Event, Manager, MemoryHub, MemoryTransport, Packet, PeerId,
    Receiver, SendError, Sender, SnoopConfig, Transport,
};

fn config() -> Config {
    Config {
        retry_delay: Duration::from_millis(10),
        accept_timeout: Duration::from_millis(40),
        reconnect_delay: Duration::from_millis(50),
        ..Config::default()
    }
}

fn spawn_manager(hub: &MemoryHub, local: PeerId, config: Config) -> (Sender, Receiver<Event>) {
    let (sender, receiver, task) = Manager::new(local, hub.transport(local), config);
    tokio::spawn(task);
    (sender, receiver)
}

/// Wait for the first event accepted by `filter`, discarding the others.
async fn wait_for<T>(
    receiver: &mut Receiver<Event>,
    mut filter: impl FnMut(Event) -> Option<T>,
) -> Result<T> {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = receiver.recv().await {
            if let Some(found) = filter(event) {
                return Ok(found);
            }
        }
        Err(anyhow!("Manager shut down."))
    })
    .await?
}

async fn wait_for_state(
    receiver: &mut Receiver<Event>,
    peer: PeerId,
    state: ConnectionState,
) -> Result<ConnectionState> {
    wait_for(receiver, |event| match event {
        Event::StateChanged { peer: p, old, new } if p == peer && new == state => Some(old),
        _ => None,
    })
    .await
}

struct Pair {
    a: Sender,
    a_events: Receiver<Event>,
    b: Sender,
    b_events: Receiver<Event>,
}

async fn connected_pair(config: Config) -> Result<Pair> {
    let hub = MemoryHub::new();
    let (a, mut a_events) = spawn_manager(&hub, 1, config.clone());
    let (b, mut b_events) = spawn_manager(&hub, 2, config);

    let (left, right) = tokio::join!(a.connect(2), b.connect(1));
    left?;
    right?;

    wait_for_state(&mut a_events, 2, ConnectionState::Connected).await?;
    wait_for_state(&mut b_events, 1, ConnectionState::Connected).await?;

    Ok(Pair {
        a,
        a_events,
        b,
        b_events,
    })
}

#[tokio::test]
async fn simultaneous_connect_yields_one_link() -> Result<()> {
    let hub = MemoryHub::new();
    let (a, mut a_events) = spawn_manager(&hub, 1, config());
    let (b, mut b_events) = spawn_manager(&hub, 2, config());

    let (left, right) = tokio::join!(a.connect(2), b.connect(1));
    left?;
    right?;

    let established = |event: Event| match event {
        Event::Established { channel, role, .. } => Some((channel, role)),
        _ => None,
    };
    let (a_channel, a_role) = wait_for(&mut a_events, established).await?;
    let (b_channel, b_role) = wait_for(&mut b_events, established).await?;

    assert_eq!(a_channel, b_channel);
    assert_ne!(a_role, b_role);
    Ok(())
}

#[tokio::test]
async fn message_is_delivered_and_timed() -> Result<()> {
    let mut pair = connected_pair(config()).await?;

    pair.a.send(2, b"hello".to_vec()).await?;

    let (peer, message) = wait_for(&mut pair.b_events, |event| match event {
        Event::Received { peer, message } => Some((peer, message)),
        _ => None,
    })
    .await?;
    assert_eq!(peer, 1);
    assert_eq!(message, b"hello");

    let packet = wait_for(&mut pair.a_events, |event| match event {
        Event::TimingComplete { peer: 2, packet } => Some(packet),
        _ => None,
    })
    .await?;
    assert_eq!(packet.header.src, 1);
    assert_eq!(packet.header.dest, 2);
    assert!(packet.is_application_complete());
    assert!(packet.application_round_trip().unwrap_or(-1) >= 0);
    assert_eq!(packet.radio_round_trip(), None);
    Ok(())
}

#[tokio::test]
async fn fragmented_message_is_reassembled() -> Result<()> {
    let mut pair = connected_pair(Config {
        max_frame_size: 200,
        ..config()
    })
    .await?;

    let message: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    pair.b.send(1, message.clone()).await?;

    let received = wait_for(&mut pair.a_events, |event| match event {
        Event::Received { peer: 2, message } => Some(message),
        _ => None,
    })
    .await?;
    assert_eq!(received, message);
    Ok(())
}

#[tokio::test]
async fn lost_link_is_reconnected() -> Result<()> {
    let mut pair = connected_pair(config()).await?;

    pair.b.disconnect(1)?;

    let old = wait_for_state(&mut pair.b_events, 1, ConnectionState::Disconnected).await?;
    assert_eq!(old, ConnectionState::Connected);

    wait_for_state(&mut pair.a_events, 2, ConnectionState::Disconnected).await?;
    let old = wait_for_state(&mut pair.a_events, 2, ConnectionState::Connecting).await?;
    assert_eq!(old, ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn lost_link_stays_down_without_reconnect() -> Result<()> {
    let mut pair = connected_pair(config()).await?;

    pair.a.set_reconnect(false)?;
    // Commands are applied in order, so this returns once reconnecting is off.
    pair.a.bonded_peers().await?;
    pair.b.disconnect(1)?;

    wait_for_state(&mut pair.a_events, 2, ConnectionState::Disconnected).await?;

    let next = wait_for(&mut pair.a_events, |event| match event {
        Event::StateChanged { .. } => Some(event),
        _ => None,
    });
    assert!(timeout(Duration::from_millis(300), next).await.is_err());
    Ok(())
}

#[tokio::test]
async fn connection_limit_is_enforced() -> Result<()> {
    let hub = MemoryHub::new();
    let (a, _a_events) = spawn_manager(
        &hub,
        1,
        Config {
            max_connections: 1,
            ..config()
        },
    );

    a.connect(2).await?;
    match a.connect(3).await {
        Err(SendError::Capacity(CapacityError::ConnectionLimit { limit: 1 })) => {}
        other => panic!("unexpected result {:?}", other),
    }

    // Reconnecting the same peer does not count against the limit.
    a.connect(2).await?;

    match a.set_max_connections(100).await {
        Err(SendError::Capacity(CapacityError::ExceedsPool {
            requested: 100,
            pool: 7,
        })) => {}
        other => panic!("unexpected result {:?}", other),
    }
    a.set_max_connections(2).await?;
    a.connect(3).await?;
    Ok(())
}

#[tokio::test]
async fn send_checks_connection_and_size() -> Result<()> {
    let pair = connected_pair(Config {
        max_frame_size: 200,
        ..config()
    })
    .await?;

    match pair.a.send(5, b"x".to_vec()).await {
        Err(SendError::NotConnected(5)) => {}
        other => panic!("unexpected result {:?}", other),
    }

    let message = vec![0u8; 200 * 256];
    match pair.a.send(2, message).await {
        Err(SendError::Capacity(CapacityError::MessageTooLarge { .. })) => {}
        other => panic!("unexpected result {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn bonded_peers_come_from_the_transport() -> Result<()> {
    let hub = MemoryHub::new();
    let (a, _a_events) = spawn_manager(&hub, 1, config());
    hub.transport(3);
    hub.transport(2);

    assert_eq!(a.bonded_peers().await?, vec![2, 3]);
    Ok(())
}

#[tokio::test]
async fn radio_timestamps_are_taken_from_the_snoop_log() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let directory = tempfile::tempdir()?;
    let path = directory.path().join("btsnoop_hci.log");
    std::fs::write(&path, writer::file_header())?;

    let append = |payload: &[u8], direction, time| -> Result<()> {
        // Prefix with ACL framing bytes the reader has to skip.
        let mut record = vec![0x02, 0x01, 0x20, 0x00, 0x00];
        record.extend_from_slice(payload);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&writer::record(&record, record.len(), direction, 0, time))?;
        Ok(())
    };

    let hub = MemoryHub::new();
    let peer = hub.transport(2);
    let listener = peer.accept(1, 0);

    let mut snoop = SnoopConfig::new(&path);
    snoop.poll_interval = Duration::from_millis(10);
    let (a, mut a_events) = spawn_manager(
        &hub,
        1,
        Config {
            snoop: Some(snoop),
            ..config()
        },
    );

    a.connect(2).await?;
    let mut stream = timeout(Duration::from_secs(5), listener).await??;
    wait_for_state(&mut a_events, 2, ConnectionState::Connected).await?;

    a.send(2, b"ping".to_vec()).await?;
    let data_frame = read_frame(&mut stream, 990).await?;
    let data = match Packet::decode(&data_frame)? {
        Packet::Data(data) => data,
        other => return Err(anyhow!("expected data, got {:?}", other)),
    };
    assert_eq!(data.payload, b"ping");

    let t0 = data.header.app_src_sent / 1_000 * 1_000;
    let mut ack = Packet::Ack(AckPacket {
        header: data.header.reply(),
        dest_received: 500,
        dest_sent: 700,
        radio_dest_received: t0 + 2_000,
    });
    let ack_frame = ack.encode(Encoding::Store)?;
    let mut ack_time = Packet::AckTime(AckTimePacket {
        header: data.header.reply(),
        radio_dest_sent: t0 + 3_000,
    });
    let ack_time_frame = ack_time.encode(Encoding::Store)?;

    append(&data_frame, Direction::Sent, t0 + 1_000)?;
    append(&ack_frame, Direction::Received, t0 + 4_000)?;
    assert_eq!(&ack_frame[..MARKER.len()], MARKER);

    stream.write_all(&ack_frame).await?;
    stream.write_all(&ack_time_frame).await?;

    let packet = wait_for(&mut a_events, |event| match event {
        Event::TimingComplete { peer: 2, packet } => Some(packet),
        _ => None,
    })
    .await?;

    assert_eq!(packet.radio_src_sent, t0 + 1_000);
    assert_eq!(packet.radio_dest_received, t0 + 2_000);
    assert_eq!(packet.radio_dest_sent, t0 + 3_000);
    assert_eq!(packet.radio_src_received, t0 + 4_000);
    assert_eq!(packet.radio_round_trip(), Some(2_000));
    assert_eq!(packet.app_dest_sent - packet.app_dest_received, 200);
    Ok(())
}

fn snoop_config(path: &Path) -> SnoopConfig {
    let mut snoop = SnoopConfig::new(path);
    snoop.poll_interval = Duration::from_millis(10);
    snoop
}

/// Drain what is queued and return the rejections among it.
fn rejections(receiver: &mut Receiver<Event>) -> Vec<CorrelationError> {
    let mut rejected = Vec::new();
    while let Some(event) = receiver.try_recv() {
        if let Event::Rejected { error, .. } = event {
            rejected.push(error);
        }
    }
    rejected
}

#[tokio::test]
async fn ranging_continues_when_the_trace_is_unreadable() -> Result<()> {
    let directory = tempfile::tempdir()?;
    let path = directory.path().join("btsnoop_hci.log");
    std::fs::write(&path, b"this is not a btsnoop capture")?;

    let mut pair = connected_pair(Config {
        snoop: Some(snoop_config(&path)),
        ..config()
    })
    .await?;

    for round in 0..3u8 {
        pair.a.send(2, vec![round]).await?;
    }

    for _ in 0..3 {
        let packet = wait_for(&mut pair.a_events, |event| match event {
            Event::TimingComplete { peer: 2, packet } => Some(packet),
            _ => None,
        })
        .await?;
        assert!(packet.is_application_complete());
        assert_eq!(packet.radio_round_trip(), None);
    }
    Ok(())
}

/// Both ends of a link plus the traces their controllers write.
struct Traces {
    sent: PathBuf,
    received: PathBuf,
}

/// A memory link whose writes show up in the sender's trace as sent and in
/// the receiver's trace as received, stamped with one shared time.
struct TracedStream {
    inner: DuplexStream,
    traces: Traces,
}

fn trace(path: &Path, payload: &[u8], direction: Direction, time: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&writer::record(payload, payload.len(), direction, 0, time))
}

impl AsyncRead for TracedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TracedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            let payload = &buf[..*written];
            let time = now_nanos() / 1_000 * 1_000;
            let traced = trace(&self.traces.sent, payload, Direction::Sent, time)
                .and_then(|()| trace(&self.traces.received, payload, Direction::Received, time));
            if let Err(err) = traced {
                return Poll::Ready(Err(err));
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct TracedTransport {
    local: PeerId,
    inner: MemoryTransport,
    traces: Arc<HashMap<PeerId, PathBuf>>,
}

impl TracedTransport {
    fn traces(&self, peer: PeerId) -> Traces {
        Traces {
            sent: self.traces[&self.local].clone(),
            received: self.traces[&peer].clone(),
        }
    }
}

impl Transport for TracedTransport {
    type Stream = TracedStream;

    fn connect(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<TracedStream>> {
        let traces = self.traces(peer);
        self.inner
            .connect(peer, channel)
            .map(move |result| result.map(|inner| TracedStream { inner, traces }))
            .boxed()
    }

    fn accept(
        &self,
        peer: PeerId,
        channel: ChannelId,
    ) -> BoxFuture<'static, io::Result<TracedStream>> {
        let traces = self.traces(peer);
        self.inner
            .accept(peer, channel)
            .map(move |result| result.map(|inner| TracedStream { inner, traces }))
            .boxed()
    }

    fn bonded_peers(&self) -> Vec<PeerId> {
        self.inner.bonded_peers()
    }
}

#[tokio::test]
async fn both_devices_take_radio_timestamps_from_their_traces() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let directory = tempfile::tempdir()?;
    let mut paths = HashMap::new();
    for peer in &[1u8, 2] {
        let path = directory.path().join(format!("btsnoop_{}.log", peer));
        std::fs::write(&path, writer::file_header())?;
        paths.insert(*peer, path);
    }
    let paths = Arc::new(paths);

    let hub = MemoryHub::new();
    let spawn = |local: PeerId| {
        let transport = TracedTransport {
            local,
            inner: hub.transport(local),
            traces: paths.clone(),
        };
        let config = Config {
            snoop: Some(snoop_config(&paths[&local])),
            ..config()
        };
        let (sender, receiver, task) = Manager::new(local, transport, config);
        tokio::spawn(task);
        (sender, receiver)
    };
    let (a, mut a_events) = spawn(1);
    let (b, mut b_events) = spawn(2);

    let (left, right) = tokio::join!(a.connect(2), b.connect(1));
    left?;
    right?;
    wait_for_state(&mut a_events, 2, ConnectionState::Connected).await?;
    wait_for_state(&mut b_events, 1, ConnectionState::Connected).await?;

    a.send(2, b"ping".to_vec()).await?;

    let packet = wait_for(&mut a_events, |event| match event {
        Event::TimingComplete { peer: 2, packet } => Some(Ok(packet)),
        Event::Rejected { error, .. } => Some(Err(error)),
        _ => None,
    })
    .await??;

    assert!(packet.is_fully_complete());
    // Only B's AckTime carries the radio send time of its Ack.
    assert!(packet.radio_dest_sent >= packet.radio_dest_received);
    assert!(packet.radio_src_received >= packet.radio_src_sent);
    // Both traces stamp a frame with the same time on either end.
    assert_eq!(packet.radio_round_trip(), Some(0));

    // Late trace sightings of the AckTime must not be reported.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(rejections(&mut a_events), vec![]);
    assert_eq!(rejections(&mut b_events), vec![]);
    Ok(())
}

