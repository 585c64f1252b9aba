use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::codec::{FrameCodec, FrameReader};
use crate::frame;

/// A client connection. Input is delimited into whole frames, output is written as raw bytes.
pub struct Connection<S = TcpStream> {
    pub id: Uuid,
    pub address: SocketAddr,
    pub reader: FrameReader<ReadHalf<S>>,
    pub writer: WriteHalf<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, address: SocketAddr) -> Connection<S> {
        Connection::with_codec(stream, address, FrameCodec::default())
    }

    pub fn with_codec(stream: S, address: SocketAddr, codec: FrameCodec) -> Connection<S> {
        let (reader, writer) = io::split(stream);

        Connection {
            id: Uuid::new_v4(),
            address,
            reader: FrameReader::with_codec(reader, codec),
            writer,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, frame::Error> {
        self.reader.read_frame().await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Closes the write side, signalling end-of-stream to the client.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
