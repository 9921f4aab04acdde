//! The outcome of one inference request

use crate::schema::Params;
use crate::validate::{ClipReport, ViolationReport};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MODEL_MISSING: &str = "model_missing";
pub const SCHEMA_MISSING: &str = "schema_missing";
pub const CANCELED: &str = "canceled";
pub const EMPTY_RESPONSE: &str = "empty_response";
pub const SUBPROC_NO_OUTPUT: &str = "subproc_no_output";
pub const SUBPROC_FAILED: &str = "subproc_failed";

/// Label used when no model file is known
pub const UNSET_MODEL: &str = "(unset)";

/// Key under which the error tag is stored in `violations`
pub const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub ok: bool,
    pub params: Option<Params>,
    /// Seconds spent in inference
    pub elapsed: f64,
    pub confidence: f64,
    pub raw: Option<String>,
    pub clipped: Option<ClipReport>,
    pub violations: Option<ViolationReport>,
    pub model: String,
}

impl InferenceResult {
    /// A failed result carrying `reason` as its error tag
    pub fn failure(reason: impl Into<String>, elapsed: f64, model: impl Into<String>) -> Self {
        let mut violations = ViolationReport::new();
        violations.insert(ERROR_KEY.to_string(), reason.into());
        Self {
            ok: false,
            params: None,
            elapsed,
            confidence: 0.0,
            raw: None,
            clipped: None,
            violations: Some(violations),
            model: model.into(),
        }
    }

    pub fn canceled(elapsed: f64, model: impl Into<String>) -> Self {
        Self::failure(CANCELED, elapsed, model)
    }

    /// Attach an extra diagnostic entry to `violations`
    pub fn with_violation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.violations
            .get_or_insert_with(ViolationReport::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn error_tag(&self) -> Option<&str> {
        self.violations
            .as_ref()
            .and_then(|v| v.get(ERROR_KEY))
            .map(String::as_str)
    }

    pub fn is_canceled(&self) -> bool {
        !self.ok && self.error_tag() == Some(CANCELED)
    }
}

/// File name of the model, or [`UNSET_MODEL`]
pub fn model_label(path: Option<&Path>) -> String {
    path.and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNSET_MODEL.to_string())
}
