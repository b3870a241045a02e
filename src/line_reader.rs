// src/line_reader.rs
//
// Frames `< ... >` messages out of a byte stream: accumulate into a fixed
// buffer, scan for a matching close bracket, slide unconsumed bytes to the
// front when more data is needed. Exposed as a pull-based `next_frame()`
// rather than a push loop.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::AdapterError;

/// Default buffer capacity, comfortably larger than any one socketcand
/// message.
pub const DEFAULT_CAPACITY: usize = 256;
pub const MIN_CAPACITY: usize = 64;

/// Reads one `< ... >` delimited message at a time from an `AsyncRead`.
///
/// Once a read overflows the buffer without finding a closing `>`, or a
/// message's first non-whitespace byte isn't `<`, the reader is poisoned:
/// every subsequent call returns the same error without touching the stream
/// again.
pub struct LineReader {
    buf: Vec<u8>,
    /// Start of unconsumed bytes.
    l: usize,
    /// End of valid bytes (read cursor).
    r: usize,
    poisoned: Option<AdapterError>,
}

impl LineReader {
    pub fn new(capacity: usize) -> Result<Self, AdapterError> {
        if capacity < MIN_CAPACITY {
            return Err(AdapterError::InvalidArgument(format!(
                "line reader capacity {capacity} below minimum {MIN_CAPACITY}"
            )));
        }
        Ok(Self {
            buf: vec![0u8; capacity],
            l: 0,
            r: 0,
            poisoned: None,
        })
    }

    /// Reads and returns the next complete `< ... >` message, including its
    /// delimiters, as an owned byte vector.
    pub async fn next_frame<R>(&mut self, stream: &mut R) -> Result<Vec<u8>, AdapterError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        loop {
            // Compact: drop leading whitespace so a message always starts at buf[l].
            while self.l < self.r && self.buf[self.l].is_ascii_whitespace() {
                self.l += 1;
            }

            if self.l < self.r {
                if self.buf[self.l] != b'<' {
                    let err = AdapterError::Desync;
                    self.poisoned = Some(err.clone());
                    return Err(err);
                }
                if let Some(end) = self.buf[self.l..self.r].iter().position(|&b| b == b'>') {
                    let frame_end = self.l + end + 1;
                    let frame = self.buf[self.l..frame_end].to_vec();
                    self.l = frame_end;
                    if self.l == self.r {
                        self.l = 0;
                        self.r = 0;
                    }
                    return Ok(frame);
                }
            }

            // Need more bytes. Slide unconsumed data to the front first.
            if self.l > 0 {
                self.buf.copy_within(self.l..self.r, 0);
                self.r -= self.l;
                self.l = 0;
            }

            if self.r == self.buf.len() {
                let err = AdapterError::FrameTooLarge;
                self.poisoned = Some(err.clone());
                return Err(err);
            }

            let n = stream
                .read(&mut self.buf[self.r..])
                .await
                .map_err(|e| AdapterError::io("socketcand-client", e))?;
            if n == 0 {
                let err = AdapterError::Disconnected;
                self.poisoned = Some(err.clone());
                return Err(err);
            }
            self.r += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_single_frame() {
        let mut stream = Cursor::new(b"< hi >".to_vec());
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        let frame = reader.next_frame(&mut stream).await.unwrap();
        assert_eq!(frame, b"< hi >");
    }

    #[tokio::test]
    async fn reads_sequential_frames_from_one_stream() {
        let mut stream = Cursor::new(b"< hi >< open can0 >".to_vec());
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        assert_eq!(reader.next_frame(&mut stream).await.unwrap(), b"< hi >");
        assert_eq!(
            reader.next_frame(&mut stream).await.unwrap(),
            b"< open can0 >"
        );
    }

    #[tokio::test]
    async fn reads_frame_split_across_many_small_reads() {
        struct Choppy(Vec<u8>, usize);
        impl AsyncRead for Choppy {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if self.1 >= self.0.len() {
                    return std::task::Poll::Ready(Ok(()));
                }
                let byte = self.0[self.1];
                self.1 += 1;
                buf.put_slice(&[byte]);
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut stream = Choppy(b"< frame 1 0.0 AA >".to_vec(), 0);
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        let frame = reader.next_frame(&mut stream).await.unwrap();
        assert_eq!(frame, b"< frame 1 0.0 AA >");
    }

    #[tokio::test]
    async fn desync_when_first_byte_not_bracket() {
        let mut stream = Cursor::new(b"garbage < hi >".to_vec());
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        assert_eq!(
            reader.next_frame(&mut stream).await,
            Err(AdapterError::Desync)
        );
        // Reader stays poisoned.
        assert_eq!(
            reader.next_frame(&mut stream).await,
            Err(AdapterError::Desync)
        );
    }

    #[tokio::test]
    async fn frame_too_large_poisons_reader() {
        let long = format!("< {} >", "x".repeat(MIN_CAPACITY * 2));
        let mut stream = Cursor::new(long.into_bytes());
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        assert_eq!(
            reader.next_frame(&mut stream).await,
            Err(AdapterError::FrameTooLarge)
        );
        assert_eq!(
            reader.next_frame(&mut stream).await,
            Err(AdapterError::FrameTooLarge)
        );
    }

    #[tokio::test]
    async fn disconnected_on_eof() {
        let mut stream = Cursor::new(b"< hi".to_vec());
        let mut reader = LineReader::new(MIN_CAPACITY).unwrap();
        assert_eq!(
            reader.next_frame(&mut stream).await,
            Err(AdapterError::Disconnected)
        );
    }

    #[test]
    fn rejects_capacity_below_minimum() {
        assert!(LineReader::new(8).is_err());
    }
}
