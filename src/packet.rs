//! Binary framing for the three ranging messages.
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//! offset  bytes  field
//!      0      6  marker
//!      6      2  size
//!      8      1  kind
//!      9      1  src
//!     10      1  dest
//!     11      4  packet_index
//!     15      4  message_index
//!     19      1  part
//!     20      1  parts
//!     21      1  attempt
//!     22      8  app_src_sent
//! ```
//!
//! The 30 byte header is followed by the kind-specific fields:
//!
//! * Data: seven timestamps (56 bytes) and the payload.
//! * Ack: `dest_received`, `dest_sent`, `radio_dest_received` (24 bytes).
//! * AckTime: `radio_dest_sent` (8 bytes).
//!
//! `size` covers the whole frame, marker included.

use std::convert::{TryFrom, TryInto};

use thiserror::Error;

/// Identifier of a device taking part in ranging.
pub type PeerId = u8;

/// Every frame starts with this marker. The snoop reader searches radio records for it.
pub const MARKER: &[u8; 6] = b"PRANGE";

/// Length of the fixed header, marker included.
pub const HEADER_LEN: usize = 30;

pub const DATA_FIELDS_LEN: usize = 7 * 8;
pub const ACK_FIELDS_LEN: usize = 3 * 8;
pub const ACK_TIME_FIELDS_LEN: usize = 8;

/// Bytes a Data frame spends before its payload.
pub const DATA_OVERHEAD: usize = HEADER_LEN + DATA_FIELDS_LEN;

/// Largest frame the 16-bit size field can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Propagation speed of the radio signal in metres per second.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

const OFF_SIZE: usize = 6;
const OFF_KIND: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("frame does not start with the packet marker")]
    BadMarker,
    #[error("declared frame size {declared} does not match the {expected} bytes its kind requires")]
    SizeMismatch { declared: usize, expected: usize },
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("frame of {0} bytes does not fit the 16-bit size field")]
    TooLarge(usize),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Data = 1,
    Ack = 2,
    AckTime = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::Ack),
            3 => Ok(PacketKind::AckTime),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl PacketKind {
    fn fields_len(self) -> usize {
        match self {
            PacketKind::Data => DATA_FIELDS_LEN,
            PacketKind::Ack => ACK_FIELDS_LEN,
            PacketKind::AckTime => ACK_TIME_FIELDS_LEN,
        }
    }
}

/// How a packet is being serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// The frame is about to leave the device: the send timestamp is set to `now`.
    Transmit { now: u64 },
    /// Re-serializing for storage or logging; every field is kept as is.
    Store,
}

/// Identifies one Data packet for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub src: PeerId,
    pub dest: PeerId,
    pub packet_index: u32,
    pub app_src_sent: u64,
}

/// Fields shared by every packet kind.
///
/// On Ack and AckTime packets `src`/`dest` describe the reply itself while
/// `packet_index` and `app_src_sent` are copied from the acknowledged Data
/// packet so the reply can be matched to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub src: PeerId,
    pub dest: PeerId,
    pub packet_index: u32,
    pub message_index: u32,
    pub message_part: u8,
    pub message_parts: u8,
    pub attempt: u8,
    pub app_src_sent: u64,
}

impl Header {
    /// Key of the Data packet this header belongs to (or replies to).
    pub fn key(&self, kind: PacketKind) -> CorrelationKey {
        match kind {
            PacketKind::Data => CorrelationKey {
                src: self.src,
                dest: self.dest,
                packet_index: self.packet_index,
                app_src_sent: self.app_src_sent,
            },
            PacketKind::Ack | PacketKind::AckTime => CorrelationKey {
                src: self.dest,
                dest: self.src,
                packet_index: self.packet_index,
                app_src_sent: self.app_src_sent,
            },
        }
    }

    /// Header of a reply travelling back to the sender of `self`.
    pub fn reply(&self) -> Header {
        Header {
            src: self.dest,
            dest: self.src,
            ..self.clone()
        }
    }
}

/// Header of a frame together with its kind and declared size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: PacketKind,
    pub size: usize,
    pub header: Header,
}

impl FrameHeader {
    pub fn key(&self) -> CorrelationKey {
        self.header.key(self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataPacket {
    pub header: Header,
    pub app_dest_received: u64,
    pub app_dest_sent: u64,
    pub app_src_received: u64,
    pub radio_src_sent: u64,
    pub radio_dest_received: u64,
    pub radio_dest_sent: u64,
    pub radio_src_received: u64,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            ..Default::default()
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.header.key(PacketKind::Data)
    }

    pub fn app_src_sent(&self) -> u64 {
        self.header.app_src_sent
    }

    pub fn is_application_complete(&self) -> bool {
        self.header.app_src_sent != 0
            && self.app_dest_received != 0
            && self.app_dest_sent != 0
            && self.app_src_received != 0
    }

    pub fn is_radio_complete(&self) -> bool {
        self.radio_src_sent != 0
            && self.radio_dest_received != 0
            && self.radio_dest_sent != 0
            && self.radio_src_received != 0
    }

    pub fn is_fully_complete(&self) -> bool {
        self.is_application_complete() && self.is_radio_complete()
    }

    /// Round trip in nanoseconds measured by the application timestamps.
    pub fn application_round_trip(&self) -> Option<i64> {
        if self.is_application_complete() {
            Some(round_trip(
                self.header.app_src_sent,
                self.app_dest_received,
                self.app_dest_sent,
                self.app_src_received,
            ))
        } else {
            None
        }
    }

    /// Round trip in nanoseconds measured by the radio controller timestamps.
    pub fn radio_round_trip(&self) -> Option<i64> {
        if self.is_radio_complete() {
            Some(round_trip(
                self.radio_src_sent,
                self.radio_dest_received,
                self.radio_dest_sent,
                self.radio_src_received,
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckPacket {
    pub header: Header,
    pub dest_received: u64,
    pub dest_sent: u64,
    pub radio_dest_received: u64,
}

impl AckPacket {
    /// Acknowledgement for `data`, carrying what the receiving side knows so far.
    pub fn for_data(data: &DataPacket) -> Self {
        Self {
            header: data.header.reply(),
            dest_received: data.app_dest_received,
            dest_sent: 0,
            radio_dest_received: data.radio_dest_received,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.header.key(PacketKind::Ack)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckTimePacket {
    pub header: Header,
    pub radio_dest_sent: u64,
}

impl AckTimePacket {
    pub fn for_data(data: &DataPacket) -> Self {
        Self {
            header: data.header.reply(),
            radio_dest_sent: data.radio_dest_sent,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.header.key(PacketKind::AckTime)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Ack(AckPacket),
    AckTime(AckTimePacket),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Data(_) => PacketKind::Data,
            Packet::Ack(_) => PacketKind::Ack,
            Packet::AckTime(_) => PacketKind::AckTime,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Packet::Data(packet) => &packet.header,
            Packet::Ack(packet) => &packet.header,
            Packet::AckTime(packet) => &packet.header,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.header().key(self.kind())
    }

    /// Serialize into a complete frame.
    ///
    /// With [`Encoding::Transmit`] the packet's send timestamp is overwritten
    /// first, so the caller sees the value that went on the wire.
    pub fn encode(&mut self, encoding: Encoding) -> Result<Vec<u8>, FrameError> {
        if let Encoding::Transmit { now } = encoding {
            match self {
                Packet::Data(packet) => packet.header.app_src_sent = now,
                Packet::Ack(packet) => packet.dest_sent = now,
                Packet::AckTime(_) => {}
            }
        }

        let kind = self.kind();
        let payload_len = match self {
            Packet::Data(packet) => packet.payload.len(),
            _ => 0,
        };
        let size = HEADER_LEN + kind.fields_len() + payload_len;
        if size > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(size));
        }

        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(MARKER);
        buf.extend_from_slice(&(size as u16).to_be_bytes());
        buf.push(kind as u8);

        let header = self.header();
        buf.push(header.src);
        buf.push(header.dest);
        buf.extend_from_slice(&header.packet_index.to_be_bytes());
        buf.extend_from_slice(&header.message_index.to_be_bytes());
        buf.push(header.message_part);
        buf.push(header.message_parts);
        buf.push(header.attempt);
        buf.extend_from_slice(&header.app_src_sent.to_be_bytes());

        match self {
            Packet::Data(packet) => {
                for timestamp in &[
                    packet.app_dest_received,
                    packet.app_dest_sent,
                    packet.app_src_received,
                    packet.radio_src_sent,
                    packet.radio_dest_received,
                    packet.radio_dest_sent,
                    packet.radio_src_received,
                ] {
                    buf.extend_from_slice(&timestamp.to_be_bytes());
                }
                buf.extend_from_slice(&packet.payload);
            }
            Packet::Ack(packet) => {
                buf.extend_from_slice(&packet.dest_received.to_be_bytes());
                buf.extend_from_slice(&packet.dest_sent.to_be_bytes());
                buf.extend_from_slice(&packet.radio_dest_received.to_be_bytes());
            }
            Packet::AckTime(packet) => {
                buf.extend_from_slice(&packet.radio_dest_sent.to_be_bytes());
            }
        }

        debug_assert_eq!(buf.len(), size);
        Ok(buf)
    }

    /// Decode the frame at the start of `buf`. Bytes after the declared size are ignored.
    pub fn decode(buf: &[u8]) -> Result<Packet, FrameError> {
        let frame = decode_header(buf)?;
        let required = HEADER_LEN + frame.kind.fields_len();

        if buf.len() < frame.size {
            return Err(FrameError::Truncated {
                expected: frame.size,
                actual: buf.len(),
            });
        }
        let size_matches = match frame.kind {
            PacketKind::Data => frame.size >= required,
            PacketKind::Ack | PacketKind::AckTime => frame.size == required,
        };
        if !size_matches {
            return Err(FrameError::SizeMismatch {
                declared: frame.size,
                expected: required,
            });
        }

        let mut fields = Cursor::new(&buf[HEADER_LEN..frame.size]);
        let header = frame.header;

        Ok(match frame.kind {
            PacketKind::Data => Packet::Data(DataPacket {
                header,
                app_dest_received: fields.u64(),
                app_dest_sent: fields.u64(),
                app_src_received: fields.u64(),
                radio_src_sent: fields.u64(),
                radio_dest_received: fields.u64(),
                radio_dest_sent: fields.u64(),
                radio_src_received: fields.u64(),
                payload: fields.rest().to_vec(),
            }),
            PacketKind::Ack => Packet::Ack(AckPacket {
                header,
                dest_received: fields.u64(),
                dest_sent: fields.u64(),
                radio_dest_received: fields.u64(),
            }),
            PacketKind::AckTime => Packet::AckTime(AckTimePacket {
                header,
                radio_dest_sent: fields.u64(),
            }),
        })
    }
}

/// Decode only the fixed header of the frame at the start of `buf`.
///
/// Radio records may hold just the first fragment of a long frame, so the
/// kind fields and payload are not required to be present.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            actual: buf.len(),
        });
    }
    if &buf[..MARKER.len()] != MARKER {
        return Err(FrameError::BadMarker);
    }

    let size = frame_size(buf)?;
    let kind = PacketKind::try_from(buf[OFF_KIND])?;
    if size < HEADER_LEN + kind.fields_len() {
        return Err(FrameError::SizeMismatch {
            declared: size,
            expected: HEADER_LEN + kind.fields_len(),
        });
    }

    let mut cursor = Cursor::new(&buf[OFF_KIND + 1..HEADER_LEN]);
    let header = Header {
        src: cursor.u8(),
        dest: cursor.u8(),
        packet_index: cursor.u32(),
        message_index: cursor.u32(),
        message_part: cursor.u8(),
        message_parts: cursor.u8(),
        attempt: cursor.u8(),
        app_src_sent: cursor.u64(),
    };

    Ok(FrameHeader { kind, size, header })
}

/// Read the declared size of the frame starting at `buf`.
pub fn frame_size(buf: &[u8]) -> Result<usize, FrameError> {
    let bytes: [u8; 2] = buf
        .get(OFF_SIZE..OFF_SIZE + 2)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(FrameError::Truncated {
            expected: OFF_SIZE + 2,
            actual: buf.len(),
        })?;

    Ok(u16::from_be_bytes(bytes) as usize)
}

/// `(received_back - sent) - (peer_sent - peer_received)`.
///
/// Each side only subtracts its own timestamps, so a constant offset between
/// the two clocks cancels out.
pub fn round_trip(sent: u64, peer_received: u64, peer_sent: u64, received_back: u64) -> i64 {
    (received_back as i64 - sent as i64) - (peer_sent as i64 - peer_received as i64)
}

/// One-way distance in metres for a round trip of `round_trip_ns` nanoseconds.
pub fn distance_meters(round_trip_ns: i64) -> f64 {
    (round_trip_ns as f64 / 1e9) * SPEED_OF_LIGHT / 2.0
}

/// Reads fixed-width integers from a slice whose length was checked up front.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        bytes
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            src: 1,
            dest: 2,
            packet_index: 7,
            message_index: 3,
            message_part: 0,
            message_parts: 2,
            attempt: 0,
            app_src_sent: 1_000,
        }
    }

    fn data() -> DataPacket {
        DataPacket {
            header: header(),
            app_dest_received: 1_200,
            app_dest_sent: 1_250,
            app_src_received: 1_500,
            radio_src_sent: 10,
            radio_dest_received: 20,
            radio_dest_sent: 30,
            radio_src_received: 40,
            payload: b"hello radio".to_vec(),
        }
    }

    #[test]
    fn data_survives_store_encoding() {
        let original = Packet::Data(data());
        let bytes = original.clone().encode(Encoding::Store).unwrap();

        assert_eq!(bytes.len(), DATA_OVERHEAD + 11);
        assert_eq!(Packet::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn ack_and_ack_time_survive_store_encoding() {
        let ack = Packet::Ack(AckPacket {
            header: header().reply(),
            dest_received: 1_200,
            dest_sent: 1_250,
            radio_dest_received: 20,
        });
        let ack_time = Packet::AckTime(AckTimePacket {
            header: header().reply(),
            radio_dest_sent: 30,
        });

        for packet in vec![ack, ack_time] {
            let bytes = packet.clone().encode(Encoding::Store).unwrap();
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn transmit_stamps_send_time() {
        let mut packet = Packet::Data(data());
        let bytes = packet.encode(Encoding::Transmit { now: 99 }).unwrap();

        assert_eq!(packet.header().app_src_sent, 99);
        assert_eq!(Packet::decode(&bytes).unwrap().header().app_src_sent, 99);

        let mut ack = Packet::Ack(AckPacket::for_data(&data()));
        ack.encode(Encoding::Transmit { now: 77 }).unwrap();
        match ack {
            Packet::Ack(ack) => {
                assert_eq!(ack.dest_sent, 77);
                // The correlation key is left untouched.
                assert_eq!(ack.header.app_src_sent, 1_000);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn ack_key_matches_data_key() {
        let data = data();
        assert_eq!(AckPacket::for_data(&data).key(), data.key());
        assert_eq!(AckTimePacket::for_data(&data).key(), data.key());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = Packet::Data(data()).encode(Encoding::Store).unwrap();

        for len in &[0, 5, HEADER_LEN - 1, HEADER_LEN + 3, bytes.len() - 1] {
            match Packet::decode(&bytes[..*len]) {
                Err(FrameError::Truncated { .. }) => {}
                other => panic!("length {}: unexpected {:?}", len, other),
            }
        }
    }

    #[test]
    fn size_field_must_match_kind() {
        let mut bytes = Packet::AckTime(AckTimePacket::for_data(&data()))
            .encode(Encoding::Store)
            .unwrap();
        bytes.push(0);
        let len = bytes.len();
        bytes[OFF_SIZE..OFF_SIZE + 2].copy_from_slice(&(len as u16).to_be_bytes());

        assert!(matches!(
            Packet::decode(&bytes),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn bad_marker_and_kind_are_rejected() {
        let mut bytes = Packet::Data(data()).encode(Encoding::Store).unwrap();
        bytes[OFF_KIND] = 9;
        assert_eq!(Packet::decode(&bytes), Err(FrameError::UnknownKind(9)));

        bytes[0] = b'X';
        assert_eq!(Packet::decode(&bytes), Err(FrameError::BadMarker));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut packet = Packet::Data(DataPacket::new(header(), vec![0; MAX_FRAME_LEN]));
        assert!(matches!(
            packet.encode(Encoding::Store),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn header_decodes_without_payload() {
        let bytes = Packet::Data(data()).encode(Encoding::Store).unwrap();
        let frame = decode_header(&bytes[..HEADER_LEN]).unwrap();

        assert_eq!(frame.kind, PacketKind::Data);
        assert_eq!(frame.size, bytes.len());
        assert_eq!(frame.key(), data().key());
    }

    #[test]
    fn round_trip_cancels_clock_offset() {
        assert_eq!(round_trip(1_000, 1_200, 1_250, 1_500), 450);

        // Shift the peer clock by an arbitrary offset.
        let offset = 123_456_789;
        assert_eq!(
            round_trip(1_000, 1_200 + offset, 1_250 + offset, 1_500),
            450
        );

        assert_eq!(data().application_round_trip(), Some(450));
        assert_eq!(data().radio_round_trip(), Some(20));
    }

    #[test]
    fn completeness_flags() {
        let mut packet = DataPacket::new(header(), vec![]);
        assert!(!packet.is_application_complete());

        packet.app_dest_received = 1;
        packet.app_dest_sent = 2;
        packet.app_src_received = 3;
        assert!(packet.is_application_complete());
        assert!(!packet.is_fully_complete());

        assert!(data().is_fully_complete());
    }

    #[test]
    fn distance_is_half_the_round_trip_path() {
        let metres = distance_meters(2_000);
        assert!((metres - 299.792458).abs() < 1e-6);
    }
}
