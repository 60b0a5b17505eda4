//! Async client side of the chunk protocol.
//!
//! The protocol is strictly request-then-response per connection, so
//! the client is a thin wrapper: write one encoded chunk, then read
//! exactly one back (8-byte header, then the declared payload).

use crate::chunk::{self, Chunk, HEADER_LEN};
use bytes::BytesMut;
use std::io;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub struct ChunkClient {
    stream: UnixStream,
}

impl ChunkClient {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(ChunkClient { stream })
    }

    /// Send one chunk.
    pub async fn send(&mut self, request: &Chunk) -> io::Result<()> {
        self.stream.write_all(&request.encode()).await
    }

    /// Receive one chunk. Fails with `UnexpectedEof` if the server
    /// closes the connection mid-message or before replying.
    pub async fn receive(&mut self) -> io::Result<Chunk> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let (id, length) = chunk::decode_header(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut payload = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut payload[..]).await?;
        Ok(Chunk {
            id,
            payload: payload.freeze(),
        })
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &Chunk) -> io::Result<Chunk> {
        self.send(request).await?;
        self.receive().await
    }
}
