//! Schema validation and repair of model output
//!
//! Model output is never trusted. Every schema key ends up in the result,
//! numeric values are coerced and clamped, and anything the schema does not
//! name is dropped. Nothing in here fails on malformed values; the worst case
//! is the socket default.

use crate::schema::{Params, Schema, SocketSpec, SocketType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Violation recorded for a schema key the candidate did not provide
pub const MISSING_DEFAULT: &str = "missing->default";

/// Violation recorded for a candidate key the schema does not know
pub const UNKNOWN_KEY_DROPPED: &str = "unknown-key->dropped";

/// One value that had to be coerced into its contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    #[serde(rename = "in")]
    pub input: Value,
    #[serde(rename = "out")]
    pub output: Value,
}

pub type ClipReport = BTreeMap<String, Clip>;
pub type ViolationReport = BTreeMap<String, String>;

/// Output of [`validate_and_clip`]
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// One entry per schema key
    pub params: Params,
    pub clipped: ClipReport,
    pub violations: ViolationReport,
}

/// Validate a candidate mapping against a schema.
pub fn validate_and_clip(candidate: &Map<String, Value>, schema: &Schema) -> Validation {
    let mut params = Params::new();
    let mut clipped = ClipReport::new();
    let mut violations = ViolationReport::new();

    for (key, spec) in schema.iter() {
        let Some(input) = candidate.get(key) else {
            params.insert(key.to_string(), spec.default.clone());
            violations.insert(key.to_string(), MISSING_DEFAULT.to_string());
            continue;
        };

        let output = clip_value(input, spec);
        if records_clip(spec.ty, input, &output) {
            clipped.insert(
                key.to_string(),
                Clip {
                    input: input.clone(),
                    output: output.clone(),
                },
            );
        }
        params.insert(key.to_string(), output);
    }

    for key in candidate.keys() {
        if !schema.contains_key(key) {
            violations.insert(key.clone(), UNKNOWN_KEY_DROPPED.to_string());
        }
    }

    Validation {
        params,
        clipped,
        violations,
    }
}

/// Coerce a single value into its contract.
///
/// Integers round half away from zero before clamping. Unparsable numeric
/// input falls back to the socket default, then to zero.
pub fn clip_value(value: &Value, spec: &SocketSpec) -> Value {
    match spec.ty {
        SocketType::Float => {
            let x = as_real(value)
                .or_else(|| as_real(&spec.default))
                .unwrap_or(0.0);
            let lo = spec.min.unwrap_or(x);
            let hi = spec.max.unwrap_or(x);
            Value::from(x.max(lo).min(hi))
        }
        SocketType::Integer => {
            let x = as_real(value)
                .or_else(|| as_real(&spec.default))
                .unwrap_or(0.0)
                .round();
            // non-integral bounds move inward so the result stays inside them
            let lo = spec.min.map_or(x, f64::ceil);
            let hi = spec.max.map_or(x, f64::floor);
            Value::from(x.max(lo).min(hi) as i64)
        }
        SocketType::Bool => Value::Bool(as_truthy(value)),
        SocketType::Unknown => value.clone(),
    }
}

/// Numeric view of a JSON value. Non-finite results count as unparsable.
fn as_real(value: &Value) -> Option<f64> {
    let x = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    x.is_finite().then_some(x)
}

fn as_truthy(value: &Value) -> bool {
    let text = match value {
        Value::Bool(b) => return *b,
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    matches!(text.as_str(), "true" | "1" | "yes" | "on")
}

/// Numeric keys record a clip unless the input was already a number equal to
/// the output. Bool coercion is not clipping.
fn records_clip(ty: SocketType, input: &Value, output: &Value) -> bool {
    if !ty.is_numeric() {
        return false;
    }
    !(input.is_number() && input.as_f64() == output.as_f64())
}
