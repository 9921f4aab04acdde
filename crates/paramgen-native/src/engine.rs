//! The owned model handle
//!
//! [`EngineHandle`] loads a model at most once, reuses it while the path is
//! unchanged and reloads on a path change. Its mutex is the process-wide
//! inference lock: the engine is only reachable inside [`EngineHandle::with_engine`].

use crate::llm::{ChatEngine, EngineError, EngineLoader};
use paramgen_core::{model_label, RuntimeSettings};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use tracing::info;

struct LoadedEngine {
    path: PathBuf,
    engine: Box<dyn ChatEngine>,
}

pub struct EngineHandle {
    loader: Arc<dyn EngineLoader>,
    settings: RuntimeSettings,
    /// Probed once from the loader
    supports_abort: bool,
    slot: Mutex<Option<LoadedEngine>>,
}

impl EngineHandle {
    pub fn new(loader: Arc<dyn EngineLoader>, settings: RuntimeSettings) -> Self {
        let supports_abort = loader.supports_abort();
        Self {
            loader,
            settings,
            supports_abort,
            slot: Mutex::new(None),
        }
    }

    pub fn supports_abort(&self) -> bool {
        self.supports_abort
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// True while some thread holds the inference lock
    pub fn is_busy(&self) -> bool {
        matches!(self.slot.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Run `f` against the engine for `model_path` while holding the inference lock.
    ///
    /// If `f` panics the engine is dropped and the next call reloads it.
    pub fn with_engine<R>(
        &self,
        model_path: &Path,
        f: impl FnOnce(&mut dyn ChatEngine) -> R,
    ) -> Result<R, EngineError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        let mut loaded = match slot.take() {
            Some(loaded) if loaded.path == model_path => loaded,
            stale => {
                // Free the old model before loading the next one
                drop(stale);
                info!(
                    model = %model_label(Some(model_path)),
                    gpu_layers = self.settings.n_gpu_layers,
                    "loading model"
                );
                LoadedEngine {
                    path: model_path.to_path_buf(),
                    engine: self.loader.load(model_path, &self.settings)?,
                }
            }
        };

        let result = f(loaded.engine.as_mut());
        *slot = Some(loaded);
        Ok(result)
    }
}

/// Loader used when the crate is built without an inference backend
#[derive(Debug, Default)]
pub struct UnavailableLoader;

impl EngineLoader for UnavailableLoader {
    fn supports_abort(&self) -> bool {
        false
    }

    fn load(
        &self,
        _model_path: &Path,
        _settings: &RuntimeSettings,
    ) -> Result<Box<dyn ChatEngine>, EngineError> {
        Err(EngineError::Unavailable(
            "built without the `llamacpp` feature".to_string(),
        ))
    }
}

/// The loader for the backend compiled into this binary
pub fn default_loader(verbose: bool) -> Arc<dyn EngineLoader> {
    #[cfg(feature = "llamacpp")]
    {
        Arc::new(crate::llama_cpp_backend::LlamaCppLoader::new(verbose))
    }

    #[cfg(not(feature = "llamacpp"))]
    {
        let _ = verbose;
        Arc::new(UnavailableLoader)
    }
}
