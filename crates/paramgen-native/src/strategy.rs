//! Execution strategies
//!
//! Both strategies share one contract and hand raw text to the same
//! validation pipeline. The cooperative one runs on the warm in-process
//! engine and can only stop at checkpoints; the isolated one runs a worker
//! process that can always be killed.

use crate::cancel::CancelToken;
use crate::engine::EngineHandle;
use crate::generate::{preflight, run_attempts, RETRY_SCHEDULE};
use crate::isolated::WorkerSlot;
use paramgen_core::{model_label, InferenceResult, Schema};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Which strategy a caller asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Always run in-process
    #[serde(alias = "soft")]
    #[value(alias = "soft")]
    Cooperative,
    /// Always run in a worker process
    #[serde(alias = "hard")]
    #[value(alias = "hard")]
    Isolated,
    /// Isolated unless the engine can abort mid-generation
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Cooperative,
    Isolated,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cooperative => "cooperative",
            Self::Isolated => "isolated",
        }
    }
}

pub fn select_strategy(policy: CancelPolicy, supports_abort: bool) -> StrategyKind {
    match policy {
        CancelPolicy::Cooperative => StrategyKind::Cooperative,
        CancelPolicy::Isolated => StrategyKind::Isolated,
        CancelPolicy::Auto if supports_abort => StrategyKind::Cooperative,
        CancelPolicy::Auto => StrategyKind::Isolated,
    }
}

/// Produces one [`InferenceResult`] for a prompt
///
/// `worker` belongs to the calling task; strategies that spawn a process
/// park it there so the coordinator can terminate it.
pub trait InferenceStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn run(
        &self,
        prompt: &str,
        cancel: &CancelToken,
        model_path: &Path,
        schema: &Schema,
        worker: &WorkerSlot,
    ) -> InferenceResult;
}

/// In-process inference inside the engine's critical section
pub struct CooperativeStrategy {
    engine: Arc<EngineHandle>,
}

impl CooperativeStrategy {
    pub fn new(engine: Arc<EngineHandle>) -> Self {
        Self { engine }
    }
}

impl InferenceStrategy for CooperativeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Cooperative
    }

    fn run(
        &self,
        prompt: &str,
        cancel: &CancelToken,
        model_path: &Path,
        schema: &Schema,
        _worker: &WorkerSlot,
    ) -> InferenceResult {
        if let Err(result) = preflight(model_path, schema) {
            return result;
        }
        let model = model_label(Some(model_path));
        if cancel.is_canceled() {
            return InferenceResult::canceled(0.0, model);
        }

        let outcome = self.engine.with_engine(model_path, |engine| {
            run_attempts(engine, schema, prompt, &RETRY_SCHEDULE, cancel, &model)
        });

        match outcome {
            Ok(result) => result,
            Err(_) if cancel.is_canceled() => InferenceResult::canceled(0.0, model),
            Err(e) => InferenceResult::failure(e.to_string(), 0.0, model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UnavailableLoader;
    use crate::testing::ScriptedLoader;
    use paramgen_core::result::{MODEL_MISSING, SCHEMA_MISSING};
    use paramgen_core::{RuntimeSettings, SocketSpec};

    fn schema() -> Schema {
        Schema::new().with("x", SocketSpec::float(0.0, 10.0, 5.0))
    }

    #[test]
    fn test_policy_selection() {
        assert_eq!(select_strategy(CancelPolicy::Cooperative, false), StrategyKind::Cooperative);
        assert_eq!(select_strategy(CancelPolicy::Isolated, true), StrategyKind::Isolated);
        assert_eq!(select_strategy(CancelPolicy::Auto, true), StrategyKind::Cooperative);
        assert_eq!(select_strategy(CancelPolicy::Auto, false), StrategyKind::Isolated);
    }

    #[test]
    fn test_policy_aliases() {
        let soft: CancelPolicy = serde_yaml::from_str("soft").unwrap();
        let hard: CancelPolicy = serde_yaml::from_str("hard").unwrap();
        assert_eq!(soft, CancelPolicy::Cooperative);
        assert_eq!(hard, CancelPolicy::Isolated);

        use clap::ValueEnum;
        assert_eq!(CancelPolicy::from_str("hard", true), Ok(CancelPolicy::Isolated));
        assert_eq!(CancelPolicy::default(), CancelPolicy::Auto);
    }

    #[test]
    fn test_cooperative_run() {
        let loader = Arc::new(ScriptedLoader::new(vec![Ok("{\"x\": 2.5}".to_string())]));
        let engine = Arc::new(EngineHandle::new(loader, RuntimeSettings::default()));
        let strategy = CooperativeStrategy::new(engine);
        let model = tempfile::NamedTempFile::new().unwrap();

        let result = strategy.run(
            "short bush",
            &CancelToken::new(),
            model.path(),
            &schema(),
            &WorkerSlot::default(),
        );

        assert!(result.ok);
        assert_eq!(result.params.unwrap()["x"], serde_json::json!(2.5));
        assert_eq!(result.model, model_label(Some(model.path())));
    }

    #[test]
    fn test_cooperative_configuration_errors() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let engine = EngineHandle::new(loader.clone(), RuntimeSettings::default());
        let strategy = CooperativeStrategy::new(Arc::new(engine));
        let model = tempfile::NamedTempFile::new().unwrap();
        let cancel = CancelToken::new();
        let slot = WorkerSlot::default();

        let missing = strategy.run("p", &cancel, Path::new("/nope.gguf"), &schema(), &slot);
        assert_eq!(missing.error_tag(), Some(MODEL_MISSING));

        let empty = strategy.run("p", &cancel, model.path(), &Schema::new(), &slot);
        assert_eq!(empty.error_tag(), Some(SCHEMA_MISSING));

        assert!(loader.loads().is_empty());
    }

    #[test]
    fn test_cooperative_load_failure() {
        let engine = Arc::new(EngineHandle::new(
            Arc::new(UnavailableLoader),
            RuntimeSettings::default(),
        ));
        let model = tempfile::NamedTempFile::new().unwrap();

        let result = CooperativeStrategy::new(engine).run(
            "p",
            &CancelToken::new(),
            model.path(),
            &schema(),
            &WorkerSlot::default(),
        );

        assert!(!result.ok);
        assert!(result.error_tag().unwrap().starts_with("engine unavailable:"));
    }

    #[test]
    fn test_cooperative_precanceled_does_not_load() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let engine = EngineHandle::new(loader.clone(), RuntimeSettings::default());
        let strategy = CooperativeStrategy::new(Arc::new(engine));
        let model = tempfile::NamedTempFile::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = strategy.run("p", &cancel, model.path(), &schema(), &WorkerSlot::default());

        assert!(result.is_canceled());
        assert!(loader.loads().is_empty());
        assert!(loader.calls().is_empty());
    }
}
