//! The isolated worker: one request in, one JSON line out
//!
//! Loads the model, compiles the grammar and runs a single completion. A
//! grammar the engine rejects is dropped and the completion retried once
//! without it. Validation happens in the parent.

use crate::cancel::CancelToken;
use crate::generate::{request_tag, MAX_TOKENS, TOP_P};
use crate::llm::{ChatRequest, EngineError, EngineLoader};
use paramgen_core::{build_messages, compile_grammar, WorkerReply, WorkerRequest};
use rand::Rng;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::warn;

/// Temperature of the worker's single attempt
pub const WORKER_TEMPERATURE: f32 = 0.4;

pub fn run_worker(args_path: &Path, loader: &dyn EngineLoader) -> WorkerReply {
    let started = Instant::now();

    let request: WorkerRequest = match fs::read_to_string(args_path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(request) => request,
        Err(e) => return WorkerReply::failure(format!("bad args file: {e}")),
    };

    let mut engine = match loader.load(Path::new(&request.model_path), &request.settings) {
        Ok(engine) => engine,
        Err(e) => return WorkerReply::failure(e.to_string()),
    };

    let grammar = compile_grammar(&request.schema);
    let messages = build_messages(&request.schema, &request.prompt, request_tag());
    let mut chat = ChatRequest {
        messages: &messages,
        temperature: WORKER_TEMPERATURE,
        top_p: TOP_P,
        max_tokens: MAX_TOKENS,
        seed: rand::thread_rng().gen(),
        grammar: Some(grammar.as_str()),
    };

    // Cancellation is the parent's job: it kills this process.
    let never = CancelToken::new();
    let mut reply = engine.complete(&chat, &never);
    if let Err(EngineError::Grammar(reason)) = &reply {
        warn!(%reason, "grammar disabled, falling back to unconstrained generation");
        chat.grammar = None;
        reply = engine.complete(&chat, &never);
    }

    match reply {
        Ok(raw) => WorkerReply::success(raw.trim(), started.elapsed().as_secs_f64()),
        Err(e) => WorkerReply::failure(e.to_string()),
    }
}
