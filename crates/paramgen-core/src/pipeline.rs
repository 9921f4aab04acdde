//! Raw text to [`InferenceResult`]
//!
//! Both execution strategies end here, so downstream validation is identical
//! no matter where the text was generated.

use crate::confidence::confidence_score;
use crate::protocol::{parse_model_output, OutputError};
use crate::result::InferenceResult;
use crate::schema::Schema;
use crate::validate::validate_and_clip;

/// Extract, parse, validate and score raw model output.
///
/// An `Err` is a transient attempt failure; the caller decides whether to
/// retry or surface it.
pub fn evaluate_raw(
    raw: &str,
    schema: &Schema,
    elapsed: f64,
    model: &str,
) -> Result<InferenceResult, OutputError> {
    let candidate = parse_model_output(raw)?;
    let validation = validate_and_clip(&candidate, schema);
    let confidence = confidence_score(&validation.params, &schema.defaults(), &validation.clipped);

    Ok(InferenceResult {
        ok: true,
        params: Some(validation.params),
        elapsed,
        confidence,
        raw: Some(raw.to_string()),
        clipped: (!validation.clipped.is_empty()).then_some(validation.clipped),
        violations: (!validation.violations.is_empty()).then_some(validation.violations),
        model: model.to_string(),
    })
}
