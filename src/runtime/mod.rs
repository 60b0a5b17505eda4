//! Single-threaded readiness runtime for the chunk protocol.
//!
//! One poll loop multiplexes the listening socket, every live
//! connection and the timer queue. Nothing blocks: each connection is a
//! small state machine driven by readable/writable events, and delayed
//! handler replies complete through timers. All state lives on the one
//! thread, so no locking is involved.

pub mod connection;
pub mod event_loop;
pub mod timer;

pub use connection::{Connection, Phase, Progress};
pub use event_loop::Server;

use crate::chunk::{ChunkError, ChunkId};
use crate::config::Config;
use crate::handlers::{HandlerTable, ValidationError};
use std::fmt;
use std::fs;
use std::io;

/// Bind and drive a server until a graceful shutdown drains it.
///
/// The socket file is removed once the loop stops.
pub fn run(config: Config, handlers: HandlerTable) -> io::Result<()> {
    let socket = config.socket.clone();
    let mut server = Server::bind(config, handlers)?;
    let result = server.run();
    let _ = fs::remove_file(&socket);
    result
}

/// Why a connection is being closed. Every variant is isolated to the
/// one connection; none of them affects the server process.
#[derive(Debug)]
pub enum ConnError {
    /// I/O failure on the socket.
    Transport(io::Error),
    /// Clean EOF between requests.
    Disconnected,
    /// Peer closed mid-message.
    UnexpectedEof,
    /// Declared length exceeds the configured maximum.
    OversizedRequest { declared: usize, limit: usize },
    /// No handler registered for the opcode.
    UnknownOpcode(ChunkId),
    /// Handler-raised validation failure.
    Validation(String),
    /// Malformed framing, e.g. a truncated sub-chunk.
    Malformed(ChunkError),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Transport(e) => write!(f, "transport error: {e}"),
            ConnError::Disconnected => write!(f, "peer disconnected"),
            ConnError::UnexpectedEof => write!(f, "unexpected EOF mid-message"),
            ConnError::OversizedRequest { declared, limit } => {
                write!(f, "request too large: {declared} bytes (limit {limit})")
            }
            ConnError::UnknownOpcode(id) => write!(f, "bad request: unknown opcode {id}"),
            ConnError::Validation(message) => write!(f, "validation failure: {message}"),
            ConnError::Malformed(e) => write!(f, "malformed request: {e}"),
        }
    }
}

impl std::error::Error for ConnError {}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Transport(e)
    }
}

impl From<ValidationError> for ConnError {
    fn from(e: ValidationError) -> Self {
        ConnError::Validation(e.0)
    }
}

impl From<ChunkError> for ConnError {
    fn from(e: ChunkError) -> Self {
        ConnError::Malformed(e)
    }
}
