//! # paramgen-core
//!
//! Pure Rust parameter-generation logic with no dependencies on OS, FFI, or
//! specific LLM implementations.
//!
//! This crate provides:
//! - Parameter schemas and validation/repair of untrusted model output
//! - GBNF grammar compilation from a schema
//! - Prompt construction and the confidence heuristic
//! - The worker-process wire format
//!
//! This crate compiles to `wasm32-unknown-unknown` without any feature flags.

#![forbid(unsafe_code)]

pub mod confidence;
pub mod grammar;
pub mod pipeline;
pub mod prompt;
pub mod protocol;
pub mod result;
pub mod schema;
pub mod validate;

// Re-export commonly used types
pub use confidence::confidence_score;
pub use grammar::compile_grammar;
pub use pipeline::evaluate_raw;
pub use prompt::{build_messages, ChatMessage, Role};
pub use protocol::{
    extract_json_span, parse_model_output, OutputError, RuntimeSettings, WorkerReply,
    WorkerRequest,
};
pub use result::{model_label, InferenceResult};
pub use schema::{Params, Schema, SchemaError, SocketSpec, SocketType};
pub use validate::{validate_and_clip, Clip, ClipReport, Validation, ViolationReport};
