//! chunkd: a chunk-framed request/response server.
//!
//! Every message on the wire is a chunk: a 4-byte id, a 4-byte
//! little-endian length, and that many bytes of payload, optionally
//! containing one level of sub-chunks. The server speaks the protocol
//! over a local stream socket through a single-threaded readiness loop;
//! request handlers are resolved per opcode and may reply immediately
//! or after a delay.

pub mod chunk;
pub mod client;
pub mod config;
pub mod handlers;
pub mod runtime;
