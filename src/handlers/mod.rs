//! Request dispatch: opcode to handler resolution.
//!
//! Each opcode maps to a [`Handler`], either a raw-bytes handler or one
//! whose payload is pre-parsed into sub-chunk [`Fields`]. A handler
//! produces exactly one [`Outcome`] or a [`ValidationError`], which
//! closes the connection with a logged message and no response.

pub mod compute;
pub mod simple;

use crate::chunk::{self, Chunk, ChunkError, ChunkId};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Handler-raised failure carrying a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError(message.into())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// What a handler decided to do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this chunk back and re-arm for the next request.
    Reply(Chunk),
    /// Send `reply` after `after` has elapsed. The connection reads
    /// nothing further until the reply goes out.
    DelayedReply { after: Duration, reply: Chunk },
    /// Begin a graceful server shutdown, then send `reply`.
    Shutdown { reply: Chunk },
    /// Close the connection without sending a response.
    Abandon,
}

pub type RawFn = fn(&[u8]) -> Result<Outcome, ValidationError>;
pub type ParsedFn = fn(&Fields<'_>) -> Result<Outcome, ValidationError>;

/// A registered handler: raw handlers see the payload bytes verbatim,
/// parsed handlers see the payload split into sub-chunk fields.
#[derive(Clone, Copy)]
pub enum Handler {
    Raw(RawFn),
    Parsed(ParsedFn),
}

/// Opcode lookup table, resolved once at startup.
#[derive(Clone, Default)]
pub struct HandlerTable {
    map: HashMap<ChunkId, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable::default()
    }

    /// Table holding the example protocol's handlers.
    pub fn builtin() -> Self {
        let mut table = HandlerTable::new();
        table.register(chunk::ids::REQUEST_NOOP, Handler::Raw(simple::noop));
        table.register(chunk::ids::REQUEST_SHUTDOWN, Handler::Raw(simple::shutdown));
        table.register(chunk::ids::REQUEST_ECHO, Handler::Raw(simple::echo));
        table.register(chunk::ids::REQUEST_DELAY, Handler::Parsed(simple::delay));
        table.register(chunk::ids::REQUEST_COMPUTE, Handler::Parsed(compute::compute));
        table
    }

    /// Register `handler` for `id`, replacing any previous entry.
    pub fn register(&mut self, id: ChunkId, handler: Handler) {
        self.map.insert(id, handler);
    }

    pub fn get(&self, id: ChunkId) -> Option<Handler> {
        self.map.get(&id).copied()
    }
}

/// The sub-chunks of a request payload, in wire order.
///
/// Duplicate ids are preserved: single-valued fields go through
/// [`Fields::one`], which rejects duplicates, while repeatable fields
/// accumulate through [`Fields::all`].
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    entries: Vec<(ChunkId, &'a [u8])>,
}

impl<'a> Fields<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, ChunkError> {
        let mut entries = Vec::new();
        for item in chunk::subchunks(payload) {
            entries.push(item?);
        }
        Ok(Fields { entries })
    }

    /// The single occurrence of `want`. Fails validation when the field
    /// is missing or appears more than once.
    pub fn one(&self, want: ChunkId) -> Result<&'a [u8], ValidationError> {
        let mut found = None;
        for (id, body) in &self.entries {
            if *id == want {
                if found.is_some() {
                    return Err(ValidationError::new(format!("duplicate {want} field")));
                }
                found = Some(*body);
            }
        }
        found.ok_or_else(|| ValidationError::new(format!("missing {want} field")))
    }

    /// Every occurrence of `want`, in wire order.
    pub fn all(&self, want: ChunkId) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.entries
            .iter()
            .filter(move |(id, _)| *id == want)
            .map(|(_, body)| *body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{encode_fields, ids};

    #[test]
    fn test_fields_one() {
        let payload = encode_fields(&[(ids::OPERATOR, b"+"), (ids::OPERAND, b"3")]);
        let fields = Fields::parse(&payload).unwrap();
        assert_eq!(fields.one(ids::OPERATOR).unwrap(), b"+");
    }

    #[test]
    fn test_fields_one_missing() {
        let payload = encode_fields(&[(ids::OPERAND, b"3")]);
        let fields = Fields::parse(&payload).unwrap();
        let err = fields.one(ids::OPERATOR).unwrap_err();
        assert_eq!(err.0, "missing OPER field");
    }

    #[test]
    fn test_fields_one_duplicate() {
        let payload = encode_fields(&[(ids::OPERATOR, b"+"), (ids::OPERATOR, b"-")]);
        let fields = Fields::parse(&payload).unwrap();
        let err = fields.one(ids::OPERATOR).unwrap_err();
        assert_eq!(err.0, "duplicate OPER field");
    }

    #[test]
    fn test_fields_all_accumulates() {
        let payload = encode_fields(&[
            (ids::OPERAND, b"1"),
            (ids::OPERATOR, b"+"),
            (ids::OPERAND, b"2"),
            (ids::OPERAND, b"3"),
        ]);
        let fields = Fields::parse(&payload).unwrap();
        let operands: Vec<_> = fields.all(ids::OPERAND).collect();
        assert_eq!(operands, vec![&b"1"[..], &b"2"[..], &b"3"[..]]);
    }

    #[test]
    fn test_fields_parse_truncated() {
        let mut payload = encode_fields(&[(ids::OPERAND, b"1")]);
        payload.push(0x00);
        assert!(Fields::parse(&payload).is_err());
    }

    #[test]
    fn test_builtin_table_lookup() {
        let table = HandlerTable::builtin();
        assert!(table.get(ids::REQUEST_ECHO).is_some());
        assert!(table.get(ids::REQUEST_COMPUTE).is_some());
        assert!(table.get(ChunkId(*b"WHAT")).is_none());
    }
}
