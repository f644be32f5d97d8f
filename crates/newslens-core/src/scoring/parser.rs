//! Tolerant extraction of a bias verdict from raw model output.
//!
//! Models are asked for a bare JSON object but routinely wrap it in fenced
//! code blocks or explanatory prose. The parser rescues, in order: a
//! `json`-tagged fence, any fence, the whole text, and finally the outermost
//! balanced `{...}` substring. Field names are matched case-insensitively
//! with common aliases; numeric strings and percentages are coerced. Pure
//! and deterministic, no I/O.

use crate::error::ParseError;
use serde_json::Value;

/// A parsed and validated verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Bias score clamped to [-1, 1].
    pub score: f64,
    /// Confidence clamped to [0, 1].
    pub confidence: f64,
    /// Free-text reasoning, possibly empty.
    pub explanation: String,
    /// True when the model omitted confidence and 0.5 was imputed.
    pub confidence_imputed: bool,
}

/// Accepted aliases per field, checked case-insensitively.
const SCORE_KEYS: &[&str] = &["score", "bias", "rating"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "conf"];
const EXPLANATION_KEYS: &[&str] = &["explanation", "reason", "rationale"];

/// Clamp tolerance: values this far out of range are clamped, not rejected.
const SCORE_TOLERANCE: (f64, f64) = (-1.5, 1.5);
const CONFIDENCE_TOLERANCE: (f64, f64) = (-0.5, 1.5);

/// Parse a raw model response into a [`Verdict`].
pub fn parse(raw: &str) -> Result<Verdict, ParseError> {
    let candidate = strip_fences(raw);
    let object = match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => map,
        _ => {
            let braced = outermost_braces(&candidate).ok_or(ParseError::NoJsonObject)?;
            match serde_json::from_str::<Value>(braced) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(ParseError::NoJsonObject),
                Err(e) => {
                    return Err(ParseError::InvalidJson {
                        message: e.to_string(),
                    });
                }
            }
        }
    };

    let score_raw = lookup(&object, SCORE_KEYS).ok_or(ParseError::MissingScore)?;
    let score = coerce_number("score", score_raw)?;
    if !(SCORE_TOLERANCE.0..=SCORE_TOLERANCE.1).contains(&score) {
        return Err(ParseError::ScoreOutOfRange { value: score });
    }
    let score = score.clamp(-1.0, 1.0);

    let (confidence, confidence_imputed) = match lookup(&object, CONFIDENCE_KEYS) {
        Some(raw) => {
            let value = coerce_number("confidence", raw)?;
            if !(CONFIDENCE_TOLERANCE.0..=CONFIDENCE_TOLERANCE.1).contains(&value) {
                return Err(ParseError::ConfidenceOutOfRange { value });
            }
            (value.clamp(0.0, 1.0), false)
        }
        None => (0.5, true),
    };

    let explanation = lookup(&object, EXPLANATION_KEYS)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(Verdict {
        score,
        confidence,
        explanation,
        confidence_imputed,
    })
}

/// Canonical serialization of a verdict, the inverse of [`parse`] for
/// valid inputs.
pub fn serialize(verdict: &Verdict) -> String {
    serde_json::json!({
        "score": verdict.score,
        "confidence": verdict.confidence,
        "explanation": verdict.explanation,
    })
    .to_string()
}

/// Pull the contents out of markdown fences, preferring a `json`-tagged one.
fn strip_fences(raw: &str) -> String {
    if let Some(inner) = fence_contents(raw, "```json") {
        return inner;
    }
    if let Some(inner) = fence_contents(raw, "```") {
        return inner;
    }
    raw.to_string()
}

/// Contents of the first fence opened by `opener`, if the fence is closed.
fn fence_contents(raw: &str, opener: &str) -> Option<String> {
    let start = raw.find(opener)? + opener.len();
    let rest = &raw[start..];
    // Skip the remainder of the opening line (e.g. a language tag).
    let body_start = rest.find('\n').map_or(0, |i| i + 1);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(body[..end].to_string())
}

/// The first outermost balanced `{...}` substring, string-literal aware.
fn outermost_braces(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Case-insensitive field lookup across a set of aliases, in alias order.
fn lookup<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        for (name, value) in object {
            if name.eq_ignore_ascii_case(key) {
                return Some(value);
            }
        }
    }
    None
}

/// Coerce a JSON value to f64, accepting numeric strings and percentages.
fn coerce_number(field: &str, value: &Value) -> Result<f64, ParseError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| ParseError::NotNumeric {
            field: field.to_string(),
            value: n.to_string(),
        }),
        Value::String(s) => {
            let trimmed = s.trim();
            let (digits, percent) = match trimmed.strip_suffix('%') {
                Some(rest) => (rest.trim(), true),
                None => (trimmed, false),
            };
            let parsed = digits.parse::<f64>().map_err(|_| ParseError::NotNumeric {
                field: field.to_string(),
                value: s.clone(),
            })?;
            Ok(if percent { parsed / 100.0 } else { parsed })
        }
        other => Err(ParseError::NotNumeric {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}
