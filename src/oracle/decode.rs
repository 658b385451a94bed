//! Oracle response decoder.
//!
//! Models wrap JSON in prose and markdown fencing. Every parser in the crate
//! goes through this one decoder instead of scattering ad hoc extraction at
//! call sites: strip fencing, find the first balanced JSON object or array,
//! deserialize it strictly.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON {expected} found in oracle output")]
    NotFound { expected: &'static str },
    #[error("JSON deserialize error: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Which top-level JSON shape the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

impl Shape {
    fn delimiters(self) -> (char, char) {
        match self {
            Shape::Object => ('{', '}'),
            Shape::Array => ('[', ']'),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Shape::Object => "object",
            Shape::Array => "array",
        }
    }
}

/// Decode the first JSON object in the oracle output into `T`.
pub fn decode_object<T: DeserializeOwned>(raw: &str) -> Result<T, DecodeError> {
    decode(raw, Shape::Object)
}

/// Decode the first JSON array in the oracle output into `T`.
pub fn decode_array<T: DeserializeOwned>(raw: &str) -> Result<T, DecodeError> {
    decode(raw, Shape::Array)
}

fn decode<T: DeserializeOwned>(raw: &str, shape: Shape) -> Result<T, DecodeError> {
    let slice = extract(raw, shape).ok_or(DecodeError::NotFound {
        expected: shape.name(),
    })?;
    Ok(serde_json::from_str(slice)?)
}

/// Extract the first balanced JSON value of the requested shape.
///
/// Tracks string/escape state so braces inside string literals don't
/// confuse the depth counter. Markdown fencing is plain surrounding text
/// as far as this scan is concerned, so it needs no special handling.
fn extract(raw: &str, shape: Shape) -> Option<&str> {
    let (open, close) = shape.delimiters();
    let trimmed = raw.trim();
    let start = trimmed.find(open)?;
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in remainder.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&remainder[..=i]);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        winner: String,
    }

    #[test]
    fn decodes_bare_object() {
        let v: Verdict = decode_object(r#"{"winner": "A"}"#).unwrap();
        assert_eq!(v.winner, "A");
    }

    #[test]
    fn decodes_object_with_surrounding_prose() {
        let raw = "Here is my verdict:\n{\"winner\": \"B\"}\nHope that helps.";
        let v: Verdict = decode_object(raw).unwrap();
        assert_eq!(v.winner, "B");
    }

    #[test]
    fn decodes_object_inside_markdown_fence() {
        let raw = "```json\n{\"winner\": \"tie\"}\n```";
        let v: Verdict = decode_object(raw).unwrap();
        assert_eq!(v.winner, "tie");
    }

    #[test]
    fn decodes_array() {
        let raw = "```\n[{\"winner\": \"A\"}, {\"winner\": \"B\"}]\n```";
        let v: Vec<Verdict> = decode_array(raw).unwrap();
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn brace_inside_string_does_not_end_object() {
        let raw = r#"{"winner": "A } B"}"#;
        let v: Verdict = decode_object(raw).unwrap();
        assert_eq!(v.winner, "A } B");
    }

    #[test]
    fn escaped_quote_inside_string() {
        let raw = r#"{"winner": "say \"A\""}"#;
        let v: Verdict = decode_object(raw).unwrap();
        assert_eq!(v.winner, "say \"A\"");
    }

    #[test]
    fn missing_json_is_not_found() {
        let err = decode_object::<Verdict>("no json here").unwrap_err();
        assert!(matches!(err, DecodeError::NotFound { expected: "object" }));
    }

    #[test]
    fn unterminated_object_is_not_found() {
        let err = decode_object::<Verdict>(r#"{"winner": "A""#).unwrap_err();
        assert!(matches!(err, DecodeError::NotFound { .. }));
    }

    #[test]
    fn array_requested_skips_leading_object_text() {
        // The first `[` wins, even with an object earlier in the text.
        let raw = r#"scores follow [{"winner": "A"}]"#;
        let v: Vec<Verdict> = decode_array(raw).unwrap();
        assert_eq!(v.len(), 1);
    }
}
