use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{
    io,
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
};

use crate::packet::{HEADER_LEN, MARKER};

/// Wall clock in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

/// Read one packet frame from a byte stream.
///
/// Bytes preceding the marker are discarded, which lets a reader recover
/// from garbage on the stream. The returned buffer starts with the marker.
pub async fn read_frame<R: AsyncRead + Unpin>(
    read_stream: &mut R,
    max_frame_size: usize,
) -> io::Result<Vec<u8>> {
    let mut matched = 0;
    let mut skipped = 0usize;
    while matched < MARKER.len() {
        let byte = read_stream.read_u8().await?;
        if byte == MARKER[matched] {
            matched += 1;
        } else {
            skipped += matched + 1;
            matched = if byte == MARKER[0] {
                skipped -= 1;
                1
            } else {
                0
            };
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} bytes while searching for a frame marker.", skipped);
    }

    let frame_size = read_stream.read_u16().await? as usize;
    if frame_size < HEADER_LEN || frame_size > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid frame size {}.", frame_size),
        ));
    }

    let mut buffer = vec![0u8; frame_size];
    buffer[..MARKER.len()].copy_from_slice(MARKER);
    buffer[MARKER.len()..MARKER.len() + 2].copy_from_slice(&(frame_size as u16).to_be_bytes());
    read_stream
        .read_exact(&mut buffer[MARKER.len() + 2..])
        .await?;

    Ok(buffer)
}

/// Cooperative cancellation shared between a task and whoever owns it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{AckTimePacket, Encoding, Header, Packet};

    fn frame() -> Vec<u8> {
        Packet::AckTime(AckTimePacket {
            header: Header {
                src: 3,
                dest: 4,
                ..Default::default()
            },
            radio_dest_sent: 5,
        })
        .encode(Encoding::Store)
        .unwrap()
    }

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let mut stream = frame();
        stream.extend(frame());
        let mut reader = &stream[..];

        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), frame());
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), frame());
        assert!(read_frame(&mut reader, 1024).await.is_err());
    }

    #[tokio::test]
    async fn resynchronises_on_marker() {
        let mut stream = b"xxPRAPR".to_vec();
        stream.extend(frame());
        let mut reader = &stream[..];

        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), frame());
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let mut reader = &frame()[..];
        let err = read_frame(&mut reader, HEADER_LEN).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        assert!(!token.is_cancelled());
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
