//! Chunk wire codec.
//!
//! Every message on the wire is a self-delimiting chunk:
//!
//! ```text
//! +----------+-------------------+------------------------+
//! | id       | length (u32)      | payload (length bytes) |
//! | 4 bytes  | little-endian     | opaque                 |
//! +----------+-------------------+------------------------+
//!            ← fixed 8 bytes →
//! ```
//!
//! A payload may itself be a concatenation of sub-chunks in the same
//! format, at most one level deep. Whether to interpret a payload that
//! way is the consumer's decision; the codec only frames bytes.

use bytes::{Bytes, BytesMut};
use std::fmt;

/// Fixed header size in bytes: id(4) + length(4).
pub const HEADER_LEN: usize = 8;

/// A 4-byte chunk identifier. Case-sensitive, no charset restriction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(pub [u8; 4]);

impl ChunkId {
    pub const fn new(bytes: [u8; 4]) -> Self {
        ChunkId(bytes)
    }

    /// Build an id from a byte slice, which must be exactly 4 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkError> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| ChunkError::InvalidId { len: bytes.len() })?;
        Ok(ChunkId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({self})")
    }
}

/// Chunk id codes used by the example protocol.
pub mod ids {
    use super::ChunkId;

    /// No operation; reply is [`REPLY_NOOP`]. May be used to keep a
    /// connection from being closed by the inactivity timeout.
    pub const REQUEST_NOOP: ChunkId = ChunkId(*b"NOOP");
    /// Reply returned when there is nothing to return. No payload.
    pub const REPLY_NOOP: ChunkId = ChunkId(*b"NOOP");
    /// Request to shut down the server. Reply is [`REPLY_NOOP`].
    pub const REQUEST_SHUTDOWN: ChunkId = ChunkId(*b"SHUT");
    /// Request to echo the payload back.
    pub const REQUEST_ECHO: ChunkId = ChunkId(*b"ECHO");
    /// Reply to [`REQUEST_ECHO`]; payload equals the request's.
    pub const REPLY_ECHO: ChunkId = ChunkId(*b"ECHO");
    /// Request to wait for [`INTERVAL`] seconds before replying
    /// [`REPLY_NOOP`].
    pub const REQUEST_DELAY: ChunkId = ChunkId(*b"DLAY");
    /// Request to perform a computation over [`OPERATOR`] and
    /// [`OPERAND`] fields. Reply is [`REPLY_ANSWER`].
    pub const REQUEST_COMPUTE: ChunkId = ChunkId(*b"CMPU");
    /// Reply to [`REQUEST_COMPUTE`], holding [`STATUS`] and on success
    /// [`VALUE`].
    pub const REPLY_ANSWER: ChunkId = ChunkId(*b"ANSR");

    /// Decimal seconds string, fractional part allowed.
    pub const INTERVAL: ChunkId = ChunkId(*b"NTVL");
    /// Operation name: one of `+`, `-`, `*`, `/`, `%` or `**`.
    pub const OPERATOR: ChunkId = ChunkId(*b"OPER");
    /// Numeric operand string. `-`, `/`, `%` and `**` take exactly two;
    /// `+` and `*` take any number.
    pub const OPERAND: ChunkId = ChunkId(*b"OPND");
    /// Computation result string.
    pub const VALUE: ChunkId = ChunkId(*b"VALU");
    /// Decimal status code: `1` for success, `0` for failure.
    pub const STATUS: ChunkId = ChunkId(*b"STS ");
}

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(id: ChunkId, payload: impl Into<Bytes>) -> Self {
        Chunk {
            id,
            payload: payload.into(),
        }
    }

    /// Encode to wire form: 4 id bytes, u32 LE length, payload verbatim.
    pub fn encode(&self) -> Bytes {
        assert!(
            self.payload.len() <= u32::MAX as usize,
            "chunk payload exceeds u32 length field"
        );
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// An id was constructed from a slice that is not 4 bytes long.
    InvalidId { len: usize },
    /// Fewer than 8 bytes where a chunk header was expected.
    TruncatedHeader { have: usize },
    /// The buffer ends before the declared payload length.
    TruncatedPayload { need: usize, have: usize },
    /// A sub-chunk header or body overruns the enclosing payload.
    TruncatedSubchunk { need: usize, have: usize },
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::InvalidId { len } => {
                write!(f, "chunk id must be 4 bytes, got {len}")
            }
            ChunkError::TruncatedHeader { have } => {
                write!(f, "truncated chunk header: {have} of {HEADER_LEN} bytes")
            }
            ChunkError::TruncatedPayload { need, have } => {
                write!(f, "truncated chunk payload: need {need} bytes, have {have}")
            }
            ChunkError::TruncatedSubchunk { need, have } => {
                write!(f, "truncated sub-chunk: need {need} bytes, have {have}")
            }
        }
    }
}

impl std::error::Error for ChunkError {}

/// Parse a chunk header into its id and declared payload length.
///
/// The length is not validated against any bound; enforcing the maximum
/// request size is the connection's job.
pub fn decode_header(data: &[u8]) -> Result<(ChunkId, u32), ChunkError> {
    if data.len() < HEADER_LEN {
        return Err(ChunkError::TruncatedHeader { have: data.len() });
    }
    let id = ChunkId([data[0], data[1], data[2], data[3]]);
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok((id, length))
}

/// Parse a complete chunk, returning its id and payload. Bytes past the
/// declared length are ignored.
pub fn decode(data: &[u8]) -> Result<(ChunkId, &[u8]), ChunkError> {
    let (id, length) = decode_header(data)?;
    let length = length as usize;
    let payload = data
        .get(HEADER_LEN..HEADER_LEN + length)
        .ok_or(ChunkError::TruncatedPayload {
            need: length,
            have: data.len().saturating_sub(HEADER_LEN),
        })?;
    Ok((id, payload))
}

/// Iterate the sub-chunks embedded in a payload.
///
/// Each call produces an independent iterator over the same bytes, so
/// iteration is restartable. The iterator is fused after yielding an
/// error.
pub fn subchunks(payload: &[u8]) -> Subchunks<'_> {
    Subchunks { rest: payload }
}

/// Lazy sub-chunk iterator, see [`subchunks`].
#[derive(Debug, Clone)]
pub struct Subchunks<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Subchunks<'a> {
    type Item = Result<(ChunkId, &'a [u8]), ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < HEADER_LEN {
            let have = self.rest.len();
            self.rest = &[];
            return Some(Err(ChunkError::TruncatedSubchunk {
                need: HEADER_LEN,
                have,
            }));
        }
        let (id, length) = match decode_header(self.rest) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.rest = &[];
                return Some(Err(e));
            }
        };
        let length = length as usize;
        match self.rest.get(HEADER_LEN..HEADER_LEN + length) {
            Some(body) => {
                self.rest = &self.rest[HEADER_LEN + length..];
                Some(Ok((id, body)))
            }
            None => {
                let have = self.rest.len() - HEADER_LEN;
                self.rest = &[];
                Some(Err(ChunkError::TruncatedSubchunk { need: length, have }))
            }
        }
    }
}

/// Concatenate `(id, payload)` pairs into one sub-chunk sequence.
pub fn encode_fields(fields: &[(ChunkId, &[u8])]) -> Vec<u8> {
    let total: usize = fields
        .iter()
        .map(|(_, body)| HEADER_LEN + body.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for (id, body) in fields {
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let chunk = Chunk::new(ids::REQUEST_ECHO, &b"hi there!"[..]);
        let encoded = chunk.encode();
        assert_eq!(
            &encoded[..HEADER_LEN],
            &[0x45, 0x43, 0x48, 0x4F, 0x09, 0x00, 0x00, 0x00]
        );
        assert_eq!(&encoded[HEADER_LEN..], b"hi there!");
    }

    #[test]
    fn test_round_trip() {
        let chunk = Chunk::new(ChunkId(*b"ABcd"), &b"\x00\xffpayload"[..]);
        let encoded = chunk.encode();
        let (id, payload) = decode(&encoded).unwrap();
        assert_eq!(id, chunk.id);
        assert_eq!(payload, &chunk.payload[..]);
    }

    #[test]
    fn test_empty_payload() {
        let encoded = Chunk::new(ids::REQUEST_NOOP, Bytes::new()).encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let (id, payload) = decode(&encoded).unwrap();
        assert_eq!(id, ids::REQUEST_NOOP);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_header_truncation() {
        match decode_header(b"ECHO\x01") {
            Err(ChunkError::TruncatedHeader { have: 5 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_payload_truncation() {
        let mut encoded = Chunk::new(ids::REQUEST_ECHO, &b"hi"[..]).encode().to_vec();
        encoded.truncate(9);
        match decode(&encoded) {
            Err(ChunkError::TruncatedPayload { need: 2, have: 1 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut encoded = Chunk::new(ids::REQUEST_ECHO, &b"hi"[..]).encode().to_vec();
        encoded.extend_from_slice(b"junk");
        let (_, payload) = decode(&encoded).unwrap();
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn test_invalid_id() {
        match ChunkId::from_bytes(b"TOOLONG") {
            Err(ChunkError::InvalidId { len: 7 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ChunkId::from_bytes(b"OKAY").unwrap(), ChunkId(*b"OKAY"));
    }

    #[test]
    fn test_subchunks() {
        let payload = encode_fields(&[
            (ids::OPERATOR, b"+"),
            (ids::OPERAND, b"3"),
            (ids::OPERAND, b"4"),
        ]);
        let items: Vec<_> = subchunks(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            items,
            vec![
                (ids::OPERATOR, &b"+"[..]),
                (ids::OPERAND, &b"3"[..]),
                (ids::OPERAND, &b"4"[..]),
            ]
        );
    }

    #[test]
    fn test_subchunks_restartable() {
        let payload = encode_fields(&[(ids::STATUS, b"1"), (ids::VALUE, b"7")]);
        let first: Vec<_> = subchunks(&payload).collect();
        let second: Vec<_> = subchunks(&payload).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_subchunks_truncated_header() {
        let mut payload = encode_fields(&[(ids::STATUS, b"1")]);
        payload.extend_from_slice(b"xy"); // 2 stray bytes where a header should start
        let mut iter = subchunks(&payload);
        assert!(iter.next().unwrap().is_ok());
        match iter.next() {
            Some(Err(ChunkError::TruncatedSubchunk { need: 8, have: 2 })) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(iter.next().is_none()); // fused after error
    }

    #[test]
    fn test_subchunks_truncated_body() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"OPND");
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(b"123"); // 3 of the declared 10 bytes
        match subchunks(&payload).next() {
            Some(Err(ChunkError::TruncatedSubchunk { need: 10, have: 3 })) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ids::STATUS.to_string(), "STS ");
        assert_eq!(ChunkId([0x41, 0x42, 0x00, 0xff]).to_string(), "AB\\x00\\xff");
    }
}
