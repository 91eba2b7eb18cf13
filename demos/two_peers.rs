use std::{collections::HashMap, net::SocketAddr};

use anyhow::Result;
use tokio::time::{sleep, Duration};

use peerrange::{
    packet::distance_meters, Config, Event, Manager, PeerId, Receiver, Sender, TcpTransport,
};

const ROUNDS: usize = 5;

fn device(
    local: PeerId,
    address: SocketAddr,
    peer: PeerId,
    peer_address: SocketAddr,
) -> (Sender, Receiver<Event>) {
    let mut peers = HashMap::new();
    peers.insert(peer, peer_address);

    let (sender, receiver, task) = Manager::new(
        local,
        TcpTransport::new(local, address, peers),
        Config::default(),
    );
    tokio::spawn(task);

    (sender, receiver)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);

    builder.init();

    let address1: SocketAddr = "127.0.0.1:47000".parse()?;
    let address2: SocketAddr = "127.0.0.1:47100".parse()?;

    let (sender1, mut receiver1) = device(1, address1, 2, address2);
    let (sender2, mut receiver2) = device(2, address2, 1, address1);

    tokio::try_join!(sender1.connect(2), sender2.connect(1))?;

    let echo = tokio::spawn(async move {
        while let Some(event) = receiver2.recv().await {
            match event {
                Event::Received { peer, message } => {
                    println!(
                        "PEER 2 - Received from {}: {}",
                        peer,
                        String::from_utf8_lossy(&message)
                    );
                }
                Event::StateChanged { peer, old, new } => {
                    println!("PEER 2 - Peer {}: {:?} -> {:?}", peer, old, new);
                }
                _ => {}
            }
        }
    });

    let mut completed = 0;
    while let Some(event) = receiver1.recv().await {
        match event {
            Event::Established { peer, channel, role } => {
                println!("PEER 1 - Linked to {} on channel {} as {:?}.", peer, channel, role);

                let sender = sender1.clone();
                tokio::spawn(async move {
                    for round in 0..ROUNDS {
                        let message = format!("Ping #{}", round).into_bytes();
                        if let Err(err) = sender.send(peer, message).await {
                            eprintln!("Send failed: {}", err);
                            break;
                        }
                        sleep(Duration::from_millis(200)).await;
                    }
                });
            }
            Event::TimingComplete { peer, packet } => {
                if let Some(round_trip) = packet.application_round_trip() {
                    println!(
                        "PEER 1 - Packet {} to {}: {} ns, {:.1} m",
                        packet.header.packet_index,
                        peer,
                        round_trip,
                        distance_meters(round_trip)
                    );
                }

                completed += 1;
                if completed == ROUNDS {
                    break;
                }
            }
            Event::Rejected { peer, error } => {
                println!("PEER 1 - Rejected observation for {}: {}", peer, error);
            }
            _ => {}
        }
    }

    sender1.disconnect_all()?;
    sender2.disconnect_all()?;
    drop(sender1);
    drop(sender2);
    echo.await?;

    Ok(())
}
