//! LLM engine abstraction
//!
//! This module defines the interface between the inference wrapper and LLM engines.
//! paramgen-core never depends on this - it only sees text input/output.

use crate::cancel::CancelToken;
use paramgen_core::{ChatMessage, RuntimeSettings};
use std::path::Path;

/// Input to a single chat completion
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub top_p: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    pub seed: u32,
    /// GBNF grammar with a `root` rule, if generation should be constrained
    pub grammar: Option<&'a str>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EngineError {
    #[error("load failed: {0}")]
    Load(String),
    /// The engine could not compile the grammar; the caller may retry without one.
    #[error("grammar rejected: {0}")]
    Grammar(String),
    #[error("gen failed: {0}")]
    Generation(String),
    /// Generation stopped because the cancel token was set
    #[error("canceled")]
    Aborted,
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// A loaded model that can answer chat requests
///
/// Implementations are not expected to be reentrant; callers serialize access.
pub trait ChatEngine: Send {
    fn complete(&mut self, request: &ChatRequest<'_>, abort: &CancelToken)
        -> Result<String, EngineError>;
}

/// Creates engines from model files
pub trait EngineLoader: Send + Sync {
    /// Whether engines from this loader poll the cancel token during generation
    fn supports_abort(&self) -> bool;

    fn load(
        &self,
        model_path: &Path,
        settings: &RuntimeSettings,
    ) -> Result<Box<dyn ChatEngine>, EngineError>;
}
