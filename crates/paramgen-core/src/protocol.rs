use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Find the first balanced `{...}` span in model output.
///
/// Braces inside JSON strings are ignored. An object that never closes is
/// skipped and scanning resumes at the next `{`. Returns `None` when no
/// object closes.
pub fn extract_json_span(text: &str) -> Option<&str> {
    let mut from = 0;
    while let Some(found) = text[from..].find('{') {
        let start = from + found;
        if let Some(end) = balanced_end(&text[start..]) {
            return Some(&text[start..=start + end]);
        }
        from = start + 1;
    }
    None
}

/// Byte offset of the `}` closing the object that opens at offset 0
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Why raw model output could not be turned into a candidate mapping
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OutputError {
    #[error("empty_response")]
    Empty,
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("output is not a JSON object")]
    NotAnObject,
}

/// Parse model output into a candidate mapping
///
/// Protocol:
/// - Surrounding prose is ignored; the first balanced object is parsed
/// - If no object closes, the whole trimmed text is parsed as-is
/// - Anything other than a JSON object is rejected
pub fn parse_model_output(raw: &str) -> Result<Map<String, Value>, OutputError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(OutputError::Empty);
    }

    let span = extract_json_span(text).unwrap_or(text);
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(OutputError::NotAnObject),
        Err(e) => Err(OutputError::Json(e.to_string())),
    }
}

/// Inference runtime knobs shared by both execution strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Context window in tokens
    pub n_ctx: u32,
    pub n_threads: u32,
    /// Layers offloaded to the GPU, 0 for CPU only
    pub n_gpu_layers: u32,
    pub n_batch: u32,
    /// Reuse the KV cache for a prompt prefix shared with the previous call
    pub cache_prompt: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 8,
            n_gpu_layers: 0,
            n_batch: 512,
            cache_prompt: true,
        }
    }
}

/// The argument file handed to an isolated worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub model_path: String,
    pub schema: Schema,
    pub prompt: String,
    #[serde(flatten)]
    pub settings: RuntimeSettings,
}

/// The single JSON line a worker prints before exiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<BTreeMap<String, String>>,
}

impl WorkerReply {
    pub fn success(raw: impl Into<String>, elapsed: f64) -> Self {
        Self {
            ok: true,
            raw: Some(raw.into()),
            elapsed: Some(elapsed),
            violations: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let mut violations = BTreeMap::new();
        violations.insert("error".to_string(), reason.into());
        Self {
            ok: false,
            raw: None,
            elapsed: None,
            violations: Some(violations),
        }
    }

    /// The worker's error tag, if it reported one
    pub fn error(&self) -> Option<&str> {
        self.violations
            .as_ref()
            .and_then(|v| v.get("error"))
            .map(String::as_str)
    }
}
