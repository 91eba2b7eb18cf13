//! Tails the radio controller's BTSnoop trace and extracts ranging frames.
//!
//! ```text
//! file header:   "btsnoop\0" | version u32 | datalink u32
//! record header: original_len u32 | included_len u32 | flags u32 | drops u32 | timestamp i64
//! ```
//!
//! The timestamp counts microseconds since midnight, January 1st, 0 AD.
//! Bit 0 of `flags` is clear for records sent by this device and set for
//! records it received.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    fs::File,
    io,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
    time::sleep,
};

use crate::{packet::HEADER_LEN, utils::CancelToken};

pub const FILE_MAGIC: &[u8; 8] = b"btsnoop\0";
pub const FILE_HEADER_LEN: u64 = 16;
pub const RECORD_HEADER_LEN: usize = 24;

/// Records longer than this mean the framing is lost.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Most bytes pulled from the file in one read.
const READ_CHUNK: usize = 4 * MAX_RECORD_LEN;

/// Microseconds between 0 AD and the Unix epoch.
const EPOCH_DELTA_MICROS: i64 = 0x00dc_ddb3_0f2f_8000;

const FLAG_RECEIVED: u32 = 0x01;

#[derive(Debug, Error)]
pub enum SnoopError {
    #[error("Unable to read snoop log.")]
    Io(#[from] io::Error),
    #[error("Snoop log does not start with a BTSnoop header.")]
    BadFileHeader,
    #[error("Record at offset {offset} declares {length} bytes, framing is lost.")]
    Corrupt { offset: u64, length: usize },
}

/// Whether this device sent or received a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

/// A ranging frame found inside the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnoopRecord {
    /// Controller timestamp in nanoseconds since the Unix epoch.
    pub radio_time: u64,
    /// Record payload starting at the packet marker.
    pub frame: Vec<u8>,
    /// Length of the record as it was on the air.
    pub original_len: usize,
    pub direction: Direction,
    /// File offset of the record header.
    pub offset: u64,
}

#[derive(Debug)]
enum Parsed {
    Record(SnoopRecord),
    Skipped,
    Incomplete,
}

pub struct SnoopReader {
    path: PathBuf,
    marker: Vec<u8>,
    file: Option<File>,
    /// Offset of the first byte in `buffer`.
    offset: u64,
    buffer: Vec<u8>,
    drops: u32,
}

impl SnoopReader {
    pub fn new<P: AsRef<Path>>(path: P, marker: &[u8]) -> Self {
        Self::from_offset(path, marker, 0)
    }

    /// Resume reading at a record offset previously returned by [`SnoopReader::offset`].
    pub fn from_offset<P: AsRef<Path>>(path: P, marker: &[u8], offset: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            marker: marker.to_vec(),
            file: None,
            offset,
            buffer: Vec::new(),
            drops: 0,
        }
    }

    /// Offset of the next record that has not been consumed yet.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever the file has gained since the last call and return the
    /// ranging frames it contained. A missing file yields no records.
    pub async fn poll(&mut self) -> Result<Vec<SnoopRecord>, SnoopError> {
        let mut records = Vec::new();
        loop {
            let read = match self.fill().await? {
                Some(read) => read,
                None => return Ok(records),
            };

            if self.offset == 0 {
                if (self.buffer.len() as u64) < FILE_HEADER_LEN {
                    return Ok(records);
                }
                if &self.buffer[..FILE_MAGIC.len()] != FILE_MAGIC {
                    return Err(SnoopError::BadFileHeader);
                }
                self.buffer.drain(..FILE_HEADER_LEN as usize);
                self.offset = FILE_HEADER_LEN;
            }

            self.parse_buffered(&mut records)?;

            if read < READ_CHUNK {
                return Ok(records);
            }
        }
    }

    fn parse_buffered(&mut self, records: &mut Vec<SnoopRecord>) -> Result<(), SnoopError> {
        let mut consumed = 0;
        loop {
            let offset = self.offset + consumed as u64;
            let (parsed, length) = parse_record(
                &self.buffer[consumed..],
                &self.marker,
                &mut self.drops,
                offset,
            )?;
            match parsed {
                Parsed::Incomplete => break,
                Parsed::Skipped => {}
                Parsed::Record(record) => records.push(record),
            }
            consumed += length;
        }

        self.buffer.drain(..consumed);
        self.offset += consumed as u64;
        Ok(())
    }

    /// Tail the trace until cancelled, forwarding every ranging frame to `sender`.
    pub async fn run(
        mut self,
        sender: mpsc::UnboundedSender<SnoopRecord>,
        poll_interval: Duration,
        cancel: CancelToken,
    ) -> Result<(), SnoopError> {
        log::debug!("Tailing snoop log {:?} from offset {}.", self.path, self.offset);

        while !cancel.is_cancelled() {
            for record in self.poll().await? {
                if sender.send(record).is_err() {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(poll_interval) => {}
            }
        }

        log::debug!("Stopped tailing snoop log at offset {}.", self.offset);
        Ok(())
    }

    /// Append up to [`READ_CHUNK`] bytes of new file content to the buffer.
    /// Returns how many bytes were read, `None` while the file does not exist.
    async fn fill(&mut self) -> Result<Option<usize>, SnoopError> {
        if self.file.is_none() {
            match File::open(&self.path).await {
                Ok(file) => self.file = Some(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        let read_position = self.offset + self.buffer.len() as u64;
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };

        if file.metadata().await?.len() < read_position {
            log::warn!(
                "Snoop log {:?} shrank below offset {}, starting over.",
                self.path,
                read_position
            );
            self.offset = 0;
            self.buffer.clear();
            self.drops = 0;
        }

        let read_position = self.offset + self.buffer.len() as u64;
        file.seek(SeekFrom::Start(read_position)).await?;
        let read = file
            .take(READ_CHUNK as u64)
            .read_to_end(&mut self.buffer)
            .await?;

        Ok(Some(read))
    }
}

fn parse_record(
    buf: &[u8],
    marker: &[u8],
    last_drops: &mut u32,
    offset: u64,
) -> Result<(Parsed, usize), SnoopError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok((Parsed::Incomplete, 0));
    }

    let word = |index: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[index * 4..index * 4 + 4]);
        u32::from_be_bytes(bytes)
    };
    let original_len = word(0) as usize;
    let included_len = word(1) as usize;
    let flags = word(2);
    let drops = word(3);
    let timestamp = {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[16..24]);
        i64::from_be_bytes(bytes)
    };

    if included_len > MAX_RECORD_LEN {
        return Err(SnoopError::Corrupt {
            offset,
            length: included_len,
        });
    }
    let length = RECORD_HEADER_LEN + included_len;
    if buf.len() < length {
        return Ok((Parsed::Incomplete, 0));
    }

    if drops > *last_drops {
        log::warn!(
            "Radio controller dropped {} records before offset {}.",
            drops - *last_drops,
            offset
        );
        *last_drops = drops;
    }

    let payload = &buf[RECORD_HEADER_LEN..length];
    let start = match find(payload, marker) {
        Some(start) => start,
        None => return Ok((Parsed::Skipped, length)),
    };

    if original_len > included_len {
        log::warn!(
            "Skipping record at offset {}: declares {} bytes but holds {}.",
            offset,
            original_len,
            included_len
        );
        return Ok((Parsed::Skipped, length));
    }
    if payload.len() - start < HEADER_LEN {
        log::warn!(
            "Skipping record at offset {}: frame header cut short after {} bytes.",
            offset,
            payload.len() - start
        );
        return Ok((Parsed::Skipped, length));
    }

    let direction = if flags & FLAG_RECEIVED != 0 {
        Direction::Received
    } else {
        Direction::Sent
    };

    Ok((
        Parsed::Record(SnoopRecord {
            radio_time: unix_nanos(timestamp),
            frame: payload[start..].to_vec(),
            original_len,
            direction,
            offset,
        }),
        length,
    ))
}

/// Convert a BTSnoop timestamp to nanoseconds since the Unix epoch.
pub fn unix_nanos(timestamp: i64) -> u64 {
    (timestamp.saturating_sub(EPOCH_DELTA_MICROS).max(0) as u64).saturating_mul(1_000)
}

/// Inverse of [`unix_nanos`], truncated to microseconds.
pub fn snoop_timestamp(unix_nanos: u64) -> i64 {
    (unix_nanos / 1_000) as i64 + EPOCH_DELTA_MICROS
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serialize records in BTSnoop format. Used to produce traces for replay and tests.
pub mod writer {
    use super::*;

    /// File header for an HCI UART (H4) capture.
    pub fn file_header() -> Vec<u8> {
        let mut bytes = FILE_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1002u32.to_be_bytes());
        bytes
    }

    pub fn record(
        payload: &[u8],
        original_len: usize,
        direction: Direction,
        drops: u32,
        unix_nanos: u64,
    ) -> Vec<u8> {
        let flags = match direction {
            Direction::Sent => 0u32,
            Direction::Received => FLAG_RECEIVED,
        };

        let mut bytes = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&(original_len as u32).to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&flags.to_be_bytes());
        bytes.extend_from_slice(&drops.to_be_bytes());
        bytes.extend_from_slice(&snoop_timestamp(unix_nanos).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}
