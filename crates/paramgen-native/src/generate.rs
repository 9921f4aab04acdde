//! Inference engine wrapper
//!
//! Builds the prompt and grammar for one request and walks the retry schedule
//! against a [`ChatEngine`], checking the cancel token before and after every
//! engine call.

use crate::cancel::CancelToken;
use crate::llm::{ChatEngine, ChatRequest, EngineError};
use paramgen_core::result::{MODEL_MISSING, SCHEMA_MISSING, UNSET_MODEL};
use paramgen_core::{
    build_messages, compile_grammar, evaluate_raw, model_label, InferenceResult, Schema,
};
use rand::Rng;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

pub const TOP_P: f32 = 0.9;
pub const MAX_TOKENS: usize = 420;

/// Sampling settings for one attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    pub temperature: f32,
    pub grammar: bool,
}

/// Decreasing constraint strength; the last attempt runs unconstrained.
pub const RETRY_SCHEDULE: [Attempt; 3] = [
    Attempt {
        temperature: 0.4,
        grammar: true,
    },
    Attempt {
        temperature: 0.2,
        grammar: true,
    },
    Attempt {
        temperature: 0.4,
        grammar: false,
    },
];

/// Fail fast on configuration errors before any engine work.
pub fn preflight(model_path: &Path, schema: &Schema) -> Result<(), InferenceResult> {
    if !model_path.is_file() {
        return Err(InferenceResult::failure(MODEL_MISSING, 0.0, UNSET_MODEL));
    }
    if schema.is_empty() {
        return Err(InferenceResult::failure(
            SCHEMA_MISSING,
            0.0,
            model_label(Some(model_path)),
        ));
    }
    Ok(())
}

/// Random disambiguation tag for the user message
pub fn request_tag() -> u32 {
    rand::thread_rng().gen_range(100_000..=999_999)
}

/// Run `schedule` against `engine` until an attempt validates.
///
/// Failures are never returned as errors; the last failure reason ends up in
/// `violations["error"]`. A set cancel token wins over everything else.
pub fn run_attempts(
    engine: &mut dyn ChatEngine,
    schema: &Schema,
    prompt: &str,
    schedule: &[Attempt],
    cancel: &CancelToken,
    model: &str,
) -> InferenceResult {
    let started = Instant::now();
    let elapsed = || started.elapsed().as_secs_f64();

    let grammar = compile_grammar(schema);
    let messages = build_messages(schema, prompt, request_tag());
    let mut grammar_enabled = true;
    let mut last_error = String::from("unknown");

    for attempt in schedule {
        if cancel.is_canceled() {
            return InferenceResult::canceled(elapsed(), model);
        }

        let mut request = ChatRequest {
            messages: &messages,
            temperature: attempt.temperature,
            top_p: TOP_P,
            max_tokens: MAX_TOKENS,
            seed: rand::thread_rng().gen(),
            grammar: (attempt.grammar && grammar_enabled).then_some(grammar.as_str()),
        };

        let mut reply = engine.complete(&request, cancel);
        if let Err(EngineError::Grammar(reason)) = &reply {
            warn!(%reason, "grammar disabled, falling back to unconstrained generation");
            grammar_enabled = false;
            request.grammar = None;
            reply = engine.complete(&request, cancel);
        }

        if cancel.is_canceled() {
            return InferenceResult::canceled(elapsed(), model);
        }

        let failure = match reply {
            Ok(raw) => match evaluate_raw(&raw, schema, elapsed(), model) {
                Ok(result) => return result,
                Err(e) => e.to_string(),
            },
            Err(EngineError::Aborted) => return InferenceResult::canceled(elapsed(), model),
            Err(e) => e.to_string(),
        };

        debug!(
            temperature = attempt.temperature,
            grammar = request.grammar.is_some(),
            reason = %failure,
            "attempt failed"
        );
        last_error = failure;
    }

    InferenceResult::failure(last_error, elapsed(), model)
}
