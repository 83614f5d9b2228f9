//! Line framing.
//!
//! Wire format: each message is an opaque byte payload followed by a single
//! `\n`. The terminator is matched as a raw byte, so multi-byte text
//! encodings pass through untouched.
//!
//! ```text
//! hello\n
//! second message\n
//! ```
//!
//! `LineCodec` is the synchronous splitter working on a `BytesMut`;
//! `FrameReader` drives it from any `AsyncRead`, buffering across reads.

use crate::error::RelayError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Byte that ends every frame.
pub const TERMINATOR: u8 = b'\n';

/// Read buffer size
const BUFFER_SIZE: usize = 8 * 1024;

/// Framing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A frame grew past the configured limit and was discarded.
    Oversized { limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized { limit } => {
                write!(f, "frame exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Splits a byte buffer into terminator-delimited frames.
#[derive(Debug)]
pub struct LineCodec {
    max_frame_len: usize,
    /// Bytes of the buffer already known not to contain a terminator.
    scanned: usize,
    /// Dropping input until the next terminator after an oversized frame.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            scanned: 0,
            discarding: false,
        }
    }

    /// Take the next complete frame out of `buf`.
    ///
    /// Returns `Ok(None)` when more input is needed. An oversized frame is
    /// reported once, then skipped through its terminator.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let found = find_terminator(&buf[self.scanned..]).map(|pos| self.scanned + pos);

            if self.discarding {
                match found {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.scanned = 0;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        self.scanned = 0;
                        return Ok(None);
                    }
                }
            }

            return match found {
                Some(pos) => {
                    let mut frame = buf.split_to(pos + 1);
                    self.scanned = 0;
                    if pos > self.max_frame_len {
                        return Err(FrameError::Oversized {
                            limit: self.max_frame_len,
                        });
                    }
                    frame.truncate(pos);
                    Ok(Some(frame.freeze()))
                }
                None if buf.len() > self.max_frame_len => {
                    buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    Err(FrameError::Oversized {
                        limit: self.max_frame_len,
                    })
                }
                None => {
                    self.scanned = buf.len();
                    Ok(None)
                }
            };
        }
    }

    /// Flush whatever is left once the stream has ended.
    ///
    /// A trailing fragment without a terminator is still a message.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.scanned = 0;
        if self.discarding || buf.is_empty() {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        Ok(Some(buf.split().freeze()))
    }
}

/// Append the terminator to a payload.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[TERMINATOR]);
    frame.freeze()
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == TERMINATOR)
}

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: LineCodec,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            codec: LineCodec::new(max_frame_len),
            eof: false,
        }
    }

    /// Next frame, `Ok(None)` at end of stream.
    ///
    /// `RelayError::Framing` is recoverable: calling again resumes after the
    /// discarded frame. Cancel safe: buffered bytes survive a dropped call.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, RelayError> {
        loop {
            if self.eof {
                return Ok(self.codec.decode_eof(&mut self.buffer)?);
            }

            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Result<Bytes, FrameError>> {
        let mut out = Vec::new();
        loop {
            match codec.decode(buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => return out,
                Err(e) => out.push(Err(e)),
            }
        }
    }

    #[test]
    fn test_decode_single() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"hello\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_in_one_buffer() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"one\ntwo\n\nthree"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(
            frames,
            vec![
                Ok(Bytes::from_static(b"one")),
                Ok(Bytes::from_static(b"two")),
                Ok(Bytes::new()),
            ]
        );
        assert_eq!(&buf[..], b"three");
    }

    #[test]
    fn test_decode_incremental() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"par"[..]);
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"tial\nrest");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "partial");
        assert_eq!(codec.decode(&mut buf), Ok(None));
    }

    #[test]
    fn test_multibyte_payload_is_opaque() {
        let mut codec = LineCodec::new(64);
        let text = "zażółć gęślą jaźń\n";
        let mut buf = BytesMut::from(text.as_bytes());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], text.trim_end().as_bytes());
    }

    #[test]
    fn test_oversized_with_terminator_resyncs() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"toolong\nok\n"[..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FrameError::Oversized { limit: 4 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_oversized_without_terminator_discards_until_next() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FrameError::Oversized { limit: 4 })
        );
        assert!(buf.is_empty());

        // Tail of the oversized frame, then a good one
        buf.extend_from_slice(b"ijk\nfine\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "fine");
    }

    #[test]
    fn test_frame_at_limit_is_accepted() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcd\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "abcd");
    }

    #[test]
    fn test_decode_eof_flushes_fragment() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"tail"[..]);
        assert_eq!(codec.decode(&mut buf), Ok(None));
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), "tail");
        assert_eq!(codec.decode_eof(&mut buf), Ok(None));
    }

    #[test]
    fn test_encode() {
        assert_eq!(&encode(b"hi")[..], b"hi\n");
        assert_eq!(&encode(b"")[..], b"\n");
    }

    #[tokio::test]
    async fn test_split_read_matches_single_read() {
        let split = Builder::new().read(b"hel").read(b"lo wor").read(b"ld\n").build();
        let whole = Builder::new().read(b"hello world\n").build();

        let mut split = FrameReader::new(split, 64);
        let mut whole = FrameReader::new(whole, 64);

        let a = split.read_frame().await.unwrap().unwrap();
        let b = whole.read_frame().await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "hello world");
        assert!(split.read_frame().await.unwrap().is_none());
        assert!(whole.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminator_split_across_reads() {
        let mock = Builder::new().read(b"first").read(b"\nsec").read(b"ond\n").build();
        let mut reader = FrameReader::new(mock, 64);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "first");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "second");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_recovers_after_oversized() {
        let mock = Builder::new().read(b"0123456789").read(b"abc\nok\n").build();
        let mut reader = FrameReader::new(mock, 4);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Framing(FrameError::Oversized { limit: 4 })
        ));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "ok");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_propagates_io_error() {
        let mock = Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        let mut reader = FrameReader::new(mock, 64);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
