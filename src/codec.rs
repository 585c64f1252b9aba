use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::frame::{self, Error, FrameScanner};

/// 512 MiB, the largest bulk string a Redis server accepts.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Splits a byte stream into raw RESP frames.
///
/// Each decoded item is the exact span of one top-level frame, nested elements included. Bytes
/// following the frame stay in the buffer for the next call, so frame boundaries are never lost
/// no matter how the peer's writes are chunked.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    scanner: FrameScanner,
    // Length of the buffer prefix already fed to the scanner.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize, max_depth: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            scanner: FrameScanner::new(max_depth),
            scanned: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE, frame::DEFAULT_MAX_DEPTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() <= self.scanned {
            return Ok(None);
        }

        // Only bytes that arrived since the last call are scanned.
        let end = match self.scanner.scan(&src[self.scanned..])? {
            Some(n) => self.scanned + n,
            None => {
                self.scanned = src.len();
                // Check if the frame size exceeds a certain limit to prevent DoS attacks.
                if src.len() > self.max_frame_size {
                    return Err(Error::FrameTooLarge(self.max_frame_size));
                }
                return Ok(None);
            }
        };
        self.scanned = 0;

        if end > self.max_frame_size {
            return Err(Error::FrameTooLarge(self.max_frame_size));
        }

        // Remove the parsed frame from the buffer.
        Ok(Some(src.split_to(end).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::UnexpectedEof),
        }
    }
}

/// Reads whole RESP frames from an async byte source.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader::with_codec(reader, FrameCodec::default())
    }

    pub fn with_codec(reader: R, codec: FrameCodec) -> FrameReader<R> {
        FrameReader {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Reads the next frame and returns its raw bytes.
    ///
    /// `Ok(None)` means the peer closed the stream on a frame boundary. A stream that ends in
    /// the middle of a frame yields [`Error::UnexpectedEof`] instead, so callers can tell a clean
    /// close apart from truncated input.
    ///
    /// Cancel safe: partially received frames stay buffered when the future is dropped.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, Error> {
        self.inner.next().await.transpose()
    }

    /// Bytes received from the source but not yet returned as a frame.
    pub fn buffered(&self) -> &[u8] {
        self.inner.read_buffer()
    }
}
