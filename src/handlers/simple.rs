//! The small built-in handlers: noop, echo, shutdown and delay.

use super::{Fields, Outcome, ValidationError};
use crate::chunk::{ids, Chunk};
use bytes::Bytes;
use std::time::Duration;

/// `NOOP`: reply with an empty `NOOP`. Clients use this to keep a
/// connection alive across the idle timeout.
pub fn noop(_payload: &[u8]) -> Result<Outcome, ValidationError> {
    Ok(Outcome::Reply(Chunk::new(ids::REPLY_NOOP, Bytes::new())))
}

/// `ECHO`: reply with the request payload verbatim.
pub fn echo(payload: &[u8]) -> Result<Outcome, ValidationError> {
    Ok(Outcome::Reply(Chunk::new(
        ids::REPLY_ECHO,
        Bytes::copy_from_slice(payload),
    )))
}

/// `SHUT`: begin a graceful shutdown, replying `NOOP` first.
pub fn shutdown(_payload: &[u8]) -> Result<Outcome, ValidationError> {
    Ok(Outcome::Shutdown {
        reply: Chunk::new(ids::REPLY_NOOP, Bytes::new()),
    })
}

/// `DLAY`: reply `NOOP` after the number of seconds in the `NTVL`
/// field. The interval is a decimal string, fractional part allowed.
pub fn delay(fields: &Fields<'_>) -> Result<Outcome, ValidationError> {
    let raw = fields.one(ids::INTERVAL)?;
    let text = std::str::from_utf8(raw)
        .map_err(|_| ValidationError::new("interval is not valid UTF-8"))?;
    let seconds: f64 = text
        .trim()
        .parse()
        .map_err(|_| ValidationError::new(format!("bad interval {text:?}")))?;
    let after = Duration::try_from_secs_f64(seconds)
        .map_err(|_| ValidationError::new(format!("interval {seconds} out of range")))?;
    Ok(Outcome::DelayedReply {
        after,
        reply: Chunk::new(ids::REPLY_NOOP, Bytes::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::encode_fields;

    #[test]
    fn test_noop() {
        match noop(b"").unwrap() {
            Outcome::Reply(reply) => {
                assert_eq!(reply.id, ids::REPLY_NOOP);
                assert!(reply.payload.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_echo() {
        match echo(b"hi there!").unwrap() {
            Outcome::Reply(reply) => {
                assert_eq!(reply.id, ids::REPLY_ECHO);
                assert_eq!(&reply.payload[..], b"hi there!");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_shutdown() {
        match shutdown(b"").unwrap() {
            Outcome::Shutdown { reply } => assert_eq!(reply.id, ids::REPLY_NOOP),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_delay_fractional() {
        let payload = encode_fields(&[(ids::INTERVAL, b"0.25")]);
        let fields = Fields::parse(&payload).unwrap();
        match delay(&fields).unwrap() {
            Outcome::DelayedReply { after, reply } => {
                assert_eq!(after, Duration::from_millis(250));
                assert_eq!(reply.id, ids::REPLY_NOOP);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_delay_rejects_negative() {
        let payload = encode_fields(&[(ids::INTERVAL, b"-1")]);
        let fields = Fields::parse(&payload).unwrap();
        assert!(delay(&fields).is_err());
    }

    #[test]
    fn test_delay_rejects_garbage() {
        let payload = encode_fields(&[(ids::INTERVAL, b"soon")]);
        let fields = Fields::parse(&payload).unwrap();
        assert!(delay(&fields).is_err());
    }

    #[test]
    fn test_delay_missing_interval() {
        let fields = Fields::parse(b"").unwrap();
        let err = delay(&fields).unwrap_err();
        assert_eq!(err.0, "missing NTVL field");
    }
}
