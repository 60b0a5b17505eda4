//! `CMPU`: arithmetic over sub-chunk operands.
//!
//! The reply is an `ANSR` chunk holding a `STS ` field (`"1"` success,
//! `"0"` undefined result) and, on success, a `VALU` field with the
//! result rendered through `f64`'s `Display` (integral values print
//! without a fractional part, so `3 + 4` yields `"7"`).

use super::{Fields, Outcome, ValidationError};
use crate::chunk::{encode_fields, ids, Chunk};

pub fn compute(fields: &Fields<'_>) -> Result<Outcome, ValidationError> {
    let operator = std::str::from_utf8(fields.one(ids::OPERATOR)?)
        .map_err(|_| ValidationError::new("operator is not valid UTF-8"))?;

    let mut operands = Vec::new();
    for raw in fields.all(ids::OPERAND) {
        operands.push(parse_operand(raw)?);
    }

    let result = match operator {
        // Variadic: fold from the identity, any number of operands.
        "+" => operands.iter().sum::<f64>(),
        "*" => operands.iter().product::<f64>(),
        "-" | "/" | "%" | "**" => {
            if operands.len() != 2 {
                return Err(ValidationError::new(format!(
                    "operator {operator:?} needs exactly two operands, got {}",
                    operands.len()
                )));
            }
            let (a, b) = (operands[0], operands[1]);
            match operator {
                "-" => a - b,
                "/" => a / b,
                "%" => a % b,
                _ => a.powf(b),
            }
        }
        _ => {
            return Err(ValidationError::new(format!(
                "unknown operator {operator:?}"
            )))
        }
    };

    // Division by zero and the like surface as non-finite values.
    let payload = if result.is_finite() {
        let value = format!("{result}");
        encode_fields(&[(ids::STATUS, b"1"), (ids::VALUE, value.as_bytes())])
    } else {
        encode_fields(&[(ids::STATUS, b"0")])
    };
    Ok(Outcome::Reply(Chunk::new(ids::REPLY_ANSWER, payload)))
}

fn parse_operand(raw: &[u8]) -> Result<f64, ValidationError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ValidationError::new("operand is not valid UTF-8"))?;
    text.trim()
        .parse()
        .map_err(|_| ValidationError::new(format!("bad operand {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk;

    fn run(pairs: &[(chunk::ChunkId, &[u8])]) -> Result<Outcome, ValidationError> {
        let payload = encode_fields(pairs);
        let fields = Fields::parse(&payload).unwrap();
        compute(&fields)
    }

    fn reply_fields(outcome: Outcome) -> Vec<(chunk::ChunkId, Vec<u8>)> {
        match outcome {
            Outcome::Reply(reply) => {
                assert_eq!(reply.id, ids::REPLY_ANSWER);
                chunk::subchunks(&reply.payload)
                    .map(|item| {
                        let (id, body) = item.unwrap();
                        (id, body.to_vec())
                    })
                    .collect()
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_addition() {
        let outcome = run(&[
            (ids::OPERATOR, b"+"),
            (ids::OPERAND, b"3"),
            (ids::OPERAND, b"4"),
        ])
        .unwrap();
        let fields = reply_fields(outcome);
        assert_eq!(fields[0], (ids::STATUS, b"1".to_vec()));
        assert_eq!(fields[1], (ids::VALUE, b"7".to_vec()));
    }

    #[test]
    fn test_fractional_result() {
        let outcome = run(&[
            (ids::OPERATOR, b"+"),
            (ids::OPERAND, b"3.5"),
            (ids::OPERAND, b"4"),
        ])
        .unwrap();
        assert_eq!(reply_fields(outcome)[1], (ids::VALUE, b"7.5".to_vec()));
    }

    #[test]
    fn test_variadic_product() {
        let outcome = run(&[
            (ids::OPERATOR, b"*"),
            (ids::OPERAND, b"2"),
            (ids::OPERAND, b"3"),
            (ids::OPERAND, b"4"),
        ])
        .unwrap();
        assert_eq!(reply_fields(outcome)[1], (ids::VALUE, b"24".to_vec()));
    }

    #[test]
    fn test_power() {
        let outcome = run(&[
            (ids::OPERATOR, b"**"),
            (ids::OPERAND, b"2"),
            (ids::OPERAND, b"10"),
        ])
        .unwrap();
        assert_eq!(reply_fields(outcome)[1], (ids::VALUE, b"1024".to_vec()));
    }

    #[test]
    fn test_remainder() {
        let outcome = run(&[
            (ids::OPERATOR, b"%"),
            (ids::OPERAND, b"7"),
            (ids::OPERAND, b"3"),
        ])
        .unwrap();
        assert_eq!(reply_fields(outcome)[1], (ids::VALUE, b"1".to_vec()));
    }

    #[test]
    fn test_division_by_zero_is_undefined() {
        let outcome = run(&[
            (ids::OPERATOR, b"/"),
            (ids::OPERAND, b"1"),
            (ids::OPERAND, b"0"),
        ])
        .unwrap();
        let fields = reply_fields(outcome);
        assert_eq!(fields, vec![(ids::STATUS, b"0".to_vec())]);
    }

    #[test]
    fn test_binary_arity_enforced() {
        let err = run(&[(ids::OPERATOR, b"-"), (ids::OPERAND, b"1")]).unwrap_err();
        assert!(err.0.contains("exactly two operands"));
    }

    #[test]
    fn test_unknown_operator() {
        let err = run(&[(ids::OPERATOR, b"^"), (ids::OPERAND, b"1")]).unwrap_err();
        assert!(err.0.contains("unknown operator"));
    }

    #[test]
    fn test_duplicate_operator_rejected() {
        let err = run(&[
            (ids::OPERATOR, b"+"),
            (ids::OPERATOR, b"-"),
            (ids::OPERAND, b"1"),
        ])
        .unwrap_err();
        assert_eq!(err.0, "duplicate OPER field");
    }

    #[test]
    fn test_bad_operand() {
        let err = run(&[(ids::OPERATOR, b"+"), (ids::OPERAND, b"three")]).unwrap_err();
        assert!(err.0.contains("bad operand"));
    }

    #[test]
    fn test_empty_sum_is_identity() {
        let outcome = run(&[(ids::OPERATOR, b"+")]).unwrap();
        assert_eq!(reply_fields(outcome)[1], (ids::VALUE, b"0".to_vec()));
    }
}
