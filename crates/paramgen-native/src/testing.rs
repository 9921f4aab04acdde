//! In-memory engines for tests

use crate::cancel::CancelToken;
use crate::llm::{ChatEngine, ChatRequest, EngineError, EngineLoader};
use paramgen_core::RuntimeSettings;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// What the engine saw for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub temperature: f32,
    pub grammar: bool,
    pub user: String,
}

type Script = Arc<Mutex<VecDeque<Result<String, EngineError>>>>;

/// Loader whose engines answer from a shared queue of canned replies
pub struct ScriptedLoader {
    replies: Script,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    loads: Mutex<Vec<PathBuf>>,
    supports_abort: bool,
    block_until_canceled: bool,
}

impl ScriptedLoader {
    pub fn new(replies: Vec<Result<String, EngineError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
            loads: Mutex::new(Vec::new()),
            supports_abort: true,
            block_until_canceled: false,
        }
    }

    pub fn without_abort(mut self) -> Self {
        self.supports_abort = false;
        self
    }

    /// Every completion waits for the cancel token. Abortable engines then
    /// fail with `Aborted`; the others still return their scripted reply.
    pub fn blocking(mut self) -> Self {
        self.block_until_canceled = true;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.loads.lock().unwrap().clone()
    }
}

impl EngineLoader for ScriptedLoader {
    fn supports_abort(&self) -> bool {
        self.supports_abort
    }

    fn load(
        &self,
        model_path: &Path,
        _settings: &RuntimeSettings,
    ) -> Result<Box<dyn ChatEngine>, EngineError> {
        self.loads.lock().unwrap().push(model_path.to_path_buf());
        Ok(Box::new(ScriptedEngine {
            replies: self.replies.clone(),
            calls: self.calls.clone(),
            supports_abort: self.supports_abort,
            block_until_canceled: self.block_until_canceled,
        }))
    }
}

struct ScriptedEngine {
    replies: Script,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    supports_abort: bool,
    block_until_canceled: bool,
}

impl ChatEngine for ScriptedEngine {
    fn complete(
        &mut self,
        request: &ChatRequest<'_>,
        abort: &CancelToken,
    ) -> Result<String, EngineError> {
        self.calls.lock().unwrap().push(RecordedCall {
            temperature: request.temperature,
            grammar: request.grammar.is_some(),
            user: request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        });

        if self.block_until_canceled {
            while !abort.is_canceled() {
                thread::sleep(Duration::from_millis(5));
            }
            if self.supports_abort {
                return Err(EngineError::Aborted);
            }
        }

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::Generation("script exhausted".to_string())))
    }
}
