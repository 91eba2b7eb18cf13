//! Matches application and radio observations of a Data packet and its
//! replies until both sides of the exchange hold every timestamp.
//!
//! Exchange for a Data packet sent by A to B:
//!
//! 1. A writes Data: `app_src_sent`; A's controller logs it: `radio_src_sent`.
//! 2. B's controller logs it: `radio_dest_received`; B reads it: `app_dest_received`.
//! 3. B answers with an Ack (`app_dest_sent` stamped at encode time).
//! 4. B's controller logs the Ack leaving: `radio_dest_sent`, which B can only
//!    learn afterwards and forwards in an AckTime.
//! 5. A reads the Ack: `app_src_received`; A's controller logs it: `radio_src_received`.
//! 6. A reads the AckTime and the packet is complete.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::{
    packet::{
        AckPacket, AckTimePacket, CorrelationKey, DataPacket, Header, PacketKind, PeerId,
    },
    snoop::Direction,
};

/// Keys of completed packets remembered to recognise late replies.
const COMPLETED_MEMORY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Duplicate observation of packet {0:?}.")]
    Duplicate(CorrelationKey),
    #[error("Acknowledgement without matching data for packet {0:?}.")]
    AckWithoutData(CorrelationKey),
    #[error("Packet {0:?} has already completed.")]
    AlreadyComplete(CorrelationKey),
    #[error("Device {local} is not an endpoint of packet {key:?}.")]
    NotParticipant { local: PeerId, key: CorrelationKey },
    #[error("Packet {key:?} cannot be {direction:?} by this device.")]
    UnexpectedDirection {
        key: CorrelationKey,
        direction: Direction,
    },
}

/// Where an observation was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// The ranging stream itself, timed by the wall clock.
    Application,
    /// The radio controller trace.
    Radio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub layer: Layer,
    pub direction: Direction,
    pub time: u64,
}

impl Observation {
    pub fn application(direction: Direction, time: u64) -> Self {
        Self {
            layer: Layer::Application,
            direction,
            time,
        }
    }

    pub fn radio(direction: Direction, time: u64) -> Self {
        Self {
            layer: Layer::Radio,
            direction,
            time,
        }
    }
}

/// Work for the connection owner after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Everything needed to acknowledge a received Data packet is known.
    AckReady(AckPacket),
    /// The radio send time of our Ack is known and must be forwarded.
    AckTimeReady(AckTimePacket),
    /// A packet sent by this device has all timestamps. Payload is not retained.
    TimingComplete(DataPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dest,
}

#[derive(Debug)]
struct Entry {
    packet: DataPacket,
    app_send_seen: bool,
    ack_signalled: bool,
}

#[derive(Debug)]
pub struct Correlator {
    local: PeerId,
    radio: bool,
    capacity: usize,
    in_flight: HashMap<CorrelationKey, Entry>,
    order: VecDeque<CorrelationKey>,
    completed: VecDeque<CorrelationKey>,
}

impl Correlator {
    /// `radio` selects whether completion also waits for the controller timestamps.
    pub fn new(local: PeerId, radio: bool, capacity: usize) -> Self {
        Self {
            local,
            radio,
            capacity: capacity.max(1),
            in_flight: HashMap::new(),
            order: VecDeque::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&DataPacket> {
        self.in_flight.get(key).map(|entry| &entry.packet)
    }

    /// Drop every in-flight packet, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.in_flight.len();
        self.in_flight.clear();
        self.order.clear();
        count
    }

    /// A Data packet was written or read on the stream (application layer)
    /// or seen in the controller trace (radio layer).
    pub fn on_data_observed(
        &mut self,
        header: &Header,
        observation: Observation,
    ) -> Result<Option<Signal>, CorrelationError> {
        let key = header.key(PacketKind::Data);
        let side = self.side(&key)?;
        self.check_not_completed(&key)?;

        match (side, observation.direction) {
            (Side::Src, Direction::Sent) | (Side::Dest, Direction::Received) => {}
            (_, direction) => return Err(CorrelationError::UnexpectedDirection { key, direction }),
        }

        let seen = self.in_flight.get(&key).map_or(false, |entry| {
            let packet = &entry.packet;
            match (side, observation.layer) {
                (Side::Src, Layer::Application) => entry.app_send_seen,
                (Side::Src, Layer::Radio) => packet.radio_src_sent != 0,
                (Side::Dest, Layer::Application) => packet.app_dest_received != 0,
                (Side::Dest, Layer::Radio) => packet.radio_dest_received != 0,
            }
        });
        if seen {
            return Err(CorrelationError::Duplicate(key));
        }

        let entry = self.insert(key, header);
        match (side, observation.layer) {
            (Side::Src, Layer::Application) => entry.app_send_seen = true,
            (Side::Src, Layer::Radio) => entry.packet.radio_src_sent = observation.time,
            (Side::Dest, Layer::Application) => entry.packet.app_dest_received = observation.time,
            (Side::Dest, Layer::Radio) => entry.packet.radio_dest_received = observation.time,
        }

        match side {
            Side::Src => Ok(None),
            Side::Dest => Ok(self.ack_ready(&key)),
        }
    }

    /// An Ack was written or read on the stream, or seen in the controller trace.
    pub fn on_ack_observed(
        &mut self,
        ack: &AckPacket,
        observation: Observation,
    ) -> Result<Option<Signal>, CorrelationError> {
        let key = ack.key();
        let side = self.side(&key)?;
        self.check_not_completed(&key)?;

        let radio = self.radio;
        let entry = self
            .in_flight
            .get_mut(&key)
            .ok_or(CorrelationError::AckWithoutData(key))?;
        let packet = &mut entry.packet;

        let mut signal = None;
        match (side, observation.direction, observation.layer) {
            (Side::Dest, Direction::Sent, Layer::Application) => {
                if packet.app_dest_sent != 0 {
                    return Err(CorrelationError::Duplicate(key));
                }
                packet.app_dest_sent = nonzero(ack.dest_sent, observation.time);
            }
            (Side::Dest, Direction::Sent, Layer::Radio) => {
                if packet.radio_dest_sent != 0 {
                    return Err(CorrelationError::Duplicate(key));
                }
                packet.radio_dest_sent = observation.time;
                signal = Some(Signal::AckTimeReady(AckTimePacket::for_data(packet)));
            }
            (Side::Src, Direction::Received, Layer::Application) => {
                if packet.app_src_received != 0 {
                    return Err(CorrelationError::Duplicate(key));
                }
                set_once(&mut packet.app_dest_received, ack.dest_received);
                set_once(&mut packet.app_dest_sent, ack.dest_sent);
                if radio {
                    set_once(&mut packet.radio_dest_received, ack.radio_dest_received);
                }
                packet.app_src_received = observation.time;
            }
            (Side::Src, Direction::Received, Layer::Radio) => {
                if packet.radio_src_received != 0 {
                    return Err(CorrelationError::Duplicate(key));
                }
                packet.radio_src_received = observation.time;
            }
            (_, direction, _) => {
                return Err(CorrelationError::UnexpectedDirection { key, direction })
            }
        }

        match side {
            Side::Dest => self.retire_if_answered(&key),
            Side::Src => {
                if let Some(complete) = self.complete_if_done(&key) {
                    signal = Some(complete);
                }
            }
        }

        Ok(signal)
    }

    /// An AckTime was written or read on the stream, or seen in the controller trace.
    pub fn on_ack_time_observed(
        &mut self,
        ack_time: &AckTimePacket,
        observation: Observation,
    ) -> Result<Option<Signal>, CorrelationError> {
        let key = ack_time.key();
        let side = self.side(&key)?;

        // Only the timestamp carried inside matters. Sightings of the AckTime
        // itself usually come after the entry is done with.
        match (side, observation.direction, observation.layer) {
            (Side::Src, Direction::Received, Layer::Application) => {}
            (_, _, Layer::Radio) | (Side::Dest, Direction::Sent, Layer::Application) => {
                return Ok(None)
            }
            (_, direction, _) => {
                return Err(CorrelationError::UnexpectedDirection { key, direction })
            }
        }
        self.check_not_completed(&key)?;

        let entry = self
            .in_flight
            .get_mut(&key)
            .ok_or(CorrelationError::AckWithoutData(key))?;
        if entry.packet.radio_dest_sent != 0 {
            return Err(CorrelationError::Duplicate(key));
        }
        entry.packet.radio_dest_sent = ack_time.radio_dest_sent;

        Ok(self.complete_if_done(&key))
    }

    /// Stop waiting for controller timestamps, for when the trace is gone.
    ///
    /// Returns the signals that became due: Acks held back for a radio
    /// receipt and sent packets that are now application-complete.
    pub fn disable_radio(&mut self) -> Vec<Signal> {
        if !self.radio {
            return Vec::new();
        }
        self.radio = false;

        let keys: Vec<CorrelationKey> = self.order.iter().copied().collect();
        let mut signals = Vec::new();
        for key in keys {
            match self.side(&key) {
                Ok(Side::Dest) => {
                    signals.extend(self.ack_ready(&key));
                    self.retire_if_answered(&key);
                }
                Ok(Side::Src) => signals.extend(self.complete_if_done(&key)),
                Err(_) => {}
            }
        }
        signals
    }

    fn side(&self, key: &CorrelationKey) -> Result<Side, CorrelationError> {
        if key.src == self.local {
            Ok(Side::Src)
        } else if key.dest == self.local {
            Ok(Side::Dest)
        } else {
            Err(CorrelationError::NotParticipant {
                local: self.local,
                key: *key,
            })
        }
    }

    fn check_not_completed(&self, key: &CorrelationKey) -> Result<(), CorrelationError> {
        if self.completed.contains(key) {
            Err(CorrelationError::AlreadyComplete(*key))
        } else {
            Ok(())
        }
    }

    fn insert(&mut self, key: CorrelationKey, header: &Header) -> &mut Entry {
        if !self.in_flight.contains_key(&key) {
            while self.in_flight.len() >= self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        if self.in_flight.remove(&oldest).is_some() {
                            log::warn!("In-flight table full, evicted packet {:?}.", oldest);
                        }
                    }
                    None => break,
                }
            }
            self.order.push_back(key);
        }

        self.in_flight.entry(key).or_insert_with(|| Entry {
            packet: DataPacket::new(header.clone(), Vec::new()),
            app_send_seen: false,
            ack_signalled: false,
        })
    }

    fn ack_ready(&mut self, key: &CorrelationKey) -> Option<Signal> {
        let radio = self.radio;
        let entry = self.in_flight.get_mut(key)?;
        let packet = &entry.packet;

        let ready = packet.app_dest_received != 0 && (!radio || packet.radio_dest_received != 0);
        if ready && !entry.ack_signalled {
            entry.ack_signalled = true;
            Some(Signal::AckReady(AckPacket::for_data(packet)))
        } else {
            None
        }
    }

    /// The receiving side is done once its Ack (and AckTime) went out.
    fn retire_if_answered(&mut self, key: &CorrelationKey) {
        let answered = self.in_flight.get(key).map_or(false, |entry| {
            entry.packet.app_dest_sent != 0 && (!self.radio || entry.packet.radio_dest_sent != 0)
        });
        if answered {
            self.remove(key);
            log::trace!("Answered packet {:?}.", key);
        }
    }

    fn complete_if_done(&mut self, key: &CorrelationKey) -> Option<Signal> {
        let done = self.in_flight.get(key).map_or(false, |entry| {
            if self.radio {
                entry.packet.is_fully_complete()
            } else {
                entry.packet.is_application_complete()
            }
        });

        if done {
            self.remove(key).map(Signal::TimingComplete)
        } else {
            None
        }
    }

    fn remove(&mut self, key: &CorrelationKey) -> Option<DataPacket> {
        let entry = self.in_flight.remove(key)?;
        self.order.retain(|candidate| candidate != key);

        if self.completed.len() >= COMPLETED_MEMORY {
            self.completed.pop_front();
        }
        self.completed.push_back(*key);

        Some(entry.packet)
    }
}

fn set_once(slot: &mut u64, value: u64) {
    if *slot == 0 {
        *slot = value;
    }
}

fn nonzero(value: u64, fallback: u64) -> u64 {
    if value != 0 {
        value
    } else {
        fallback
    }
}
