//! Per-connection state machine.
//!
//! A connection cycles `Header → Body → Dispatch → Write → Header`;
//! removal from the server's registry is the terminal closed state.
//! [`Connection::fill`] and [`Connection::flush`] are the incremental
//! transport steps: each drives the socket until the current buffer is
//! complete or the kernel would block, retrying `Interrupted`. The
//! event loop keeps exactly one readiness registration per connection
//! (read interest while receiving, write interest while sending, none
//! while a dispatch is outstanding), which is what serializes requests:
//! no bytes are read off the socket while a response is pending.

use crate::chunk::{Chunk, ChunkId, HEADER_LEN};
use bytes::Bytes;
use mio::net::UnixStream;
use std::io::{self, Read, Write};
use std::time::Instant;

/// Read/write phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accumulating the 8-byte chunk header.
    Header,
    /// Accumulating the declared payload of request `id`.
    Body { id: ChunkId },
    /// A handler owns the request; nothing is registered with the poll.
    Dispatch,
    /// Sending the queued response.
    Write,
}

/// Outcome of one fill/flush step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The current buffer is fully transferred.
    Complete,
    /// The socket would block; wait for the next readiness event.
    Blocked,
    /// The peer closed the stream (reads only).
    Eof,
}

/// One accepted connection and its buffers.
#[derive(Debug)]
pub struct Connection {
    pub stream: UnixStream,
    /// Monotonic identity, used for logging and to invalidate timers
    /// and tasks that outlive the connection.
    pub gen: u64,
    pub phase: Phase,
    /// Read buffer, sized to the bytes the current phase needs.
    buf: Vec<u8>,
    filled: usize,
    /// Encoded response being written.
    out: Bytes,
    written: usize,
    /// Idle deadline; `None` while a dispatch is outstanding.
    pub idle_deadline: Option<Instant>,
    /// Whether a heap entry for the idle deadline is outstanding.
    pub idle_timer_armed: bool,
    /// At most one pending delayed-reply task.
    pub task: Option<usize>,
}

impl Connection {
    pub fn new(stream: UnixStream, gen: u64) -> Self {
        Connection {
            stream,
            gen,
            phase: Phase::Header,
            buf: vec![0; HEADER_LEN],
            filled: 0,
            out: Bytes::new(),
            written: 0,
            idle_deadline: None,
            idle_timer_armed: false,
            task: None,
        }
    }

    /// Bytes accumulated toward the current read target.
    pub fn fill_level(&self) -> usize {
        self.filled
    }

    /// Bytes of the response written so far.
    pub fn write_level(&self) -> usize {
        self.written
    }

    /// The accumulated read buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Whether this connection currently holds a poll registration.
    pub fn registered(&self) -> bool {
        !matches!(self.phase, Phase::Dispatch)
    }

    /// Read toward the current target until complete or blocked.
    pub fn fill(&mut self) -> io::Result<Progress> {
        loop {
            if self.filled == self.buf.len() {
                return Ok(Progress::Complete);
            }
            match self.stream.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Ok(Progress::Eof),
                Ok(n) => self.filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the queued response until complete or blocked.
    pub fn flush(&mut self) -> io::Result<Progress> {
        loop {
            if self.written == self.out.len() {
                return Ok(Progress::Complete);
            }
            match self.stream.write(&self.out[self.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ))
                }
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Transition to reading the `length`-byte body of request `id`.
    pub fn begin_body(&mut self, id: ChunkId, length: usize) {
        self.phase = Phase::Body { id };
        self.buf = vec![0; length];
        self.filled = 0;
    }

    /// Take the completed read buffer.
    pub fn take_body(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.filled, self.buf.len());
        self.filled = 0;
        std::mem::take(&mut self.buf)
    }

    /// Enter the dispatch phase, releasing the read buffer.
    pub fn enter_dispatch(&mut self) {
        self.phase = Phase::Dispatch;
        self.buf = Vec::new();
        self.filled = 0;
    }

    /// Queue an encoded response and enter the write phase.
    pub fn begin_write(&mut self, reply: &Chunk) {
        self.phase = Phase::Write;
        self.out = reply.encode();
        self.written = 0;
    }

    /// Reset for the next request header.
    pub fn begin_header(&mut self) {
        self.phase = Phase::Header;
        self.buf = vec![0; HEADER_LEN];
        self.filled = 0;
        self.out = Bytes::new();
        self.written = 0;
    }
}
