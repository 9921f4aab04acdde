//! # paramgen-wasm
//!
//! WASM compilation target for paramgen-core.
//!
//! Generation itself happens outside WASM. This module exposes the pure half
//! of the pipeline (grammar compilation, prompt construction and validation
//! of raw model output) so a host can run it sandboxed.

use paramgen_core::{build_messages, compile_grammar, evaluate_raw, InferenceResult, Schema};
use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;

/// Input to [`validate_output`]
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateInput {
    /// Key → socket spec, in canonical order
    pub schema: Schema,

    /// Raw model text
    pub raw: String,

    /// Label reported as the result's model
    #[serde(default)]
    pub model: Option<String>,
}

fn parse_schema(schema_json: &str) -> Result<Schema, JsValue> {
    let schema = Schema::from_json_str(schema_json).map_err(|e| JsValue::from_str(&e.to_string()))?;
    schema.check().map_err(|e| JsValue::from_str(&e.to_string()))?;
    Ok(schema)
}

/// Extract, validate and score raw model output
///
/// Unparsable output is reported as a failed result rather than an error;
/// only malformed input JSON is an error.
///
/// # Example
///
/// ```javascript
/// const input = {
///   schema: { height: { type: "float", min: 1, max: 30, default: 10 } },
///   raw: 'Sure: {"height": 45}'
/// };
/// const result = JSON.parse(validate_output(JSON.stringify(input)));
/// // result.params.height === 30, result.clipped.height is recorded
/// ```
#[wasm_bindgen]
pub fn validate_output(input_json: &str) -> Result<String, JsValue> {
    let input: ValidateInput = serde_json::from_str(input_json)
        .map_err(|e| JsValue::from_str(&format!("Invalid input JSON: {}", e)))?;
    input
        .schema
        .check()
        .map_err(|e| JsValue::from_str(&e.to_string()))?;

    let model = input.model.unwrap_or_else(|| paramgen_core::result::UNSET_MODEL.to_string());
    let result = evaluate_raw(&input.raw, &input.schema, 0.0, &model)
        .unwrap_or_else(|e| InferenceResult::failure(e.to_string(), 0.0, model.as_str()));

    serde_json::to_string(&result)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize result: {}", e)))
}

/// Compile a schema into the GBNF grammar used to constrain generation
#[wasm_bindgen]
pub fn schema_grammar(schema_json: &str) -> Result<String, JsValue> {
    Ok(compile_grammar(&parse_schema(schema_json)?))
}

/// Chat messages for a prompt, as a JSON array of `{role, content}`
#[wasm_bindgen]
pub fn prompt_messages(schema_json: &str, prompt: &str, tag: u32) -> Result<String, JsValue> {
    let messages = build_messages(&parse_schema(schema_json)?, prompt, tag);
    serde_json::to_string(&messages)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize messages: {}", e)))
}

/// The first balanced `{...}` span in `text`
#[wasm_bindgen]
pub fn extract_json(text: &str) -> Option<String> {
    paramgen_core::extract_json_span(text).map(str::to_string)
}
