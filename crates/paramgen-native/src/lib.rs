//! # paramgen-native
//!
//! Native runtime for paramgen: the inference engine, the cooperative and
//! isolated execution strategies, and the single-flight task coordinator.
//!
//! Everything that touches a model, a thread or a process lives here. The
//! pure text-to-parameters logic is in `paramgen-core`.

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod generate;
pub mod isolated;
#[cfg(feature = "llamacpp")]
pub mod llama_cpp_backend;
pub mod llm;
pub mod models;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use config::{load_schema, runtime_defaults, AppConfig, ConfigError, RuntimeOverrides};
pub use coordinator::{Completion, Coordinator, Outcome, Status, SubmitError, TaskHandle, Timings};
pub use engine::{default_loader, EngineHandle};
pub use isolated::{IsolatedStrategy, WorkerCommand, WorkerSlot};
pub use llm::{ChatEngine, ChatRequest, EngineError, EngineLoader};
pub use models::{ManifestError, ModelCatalog, ModelEntry, ModelStatus};
pub use strategy::{
    select_strategy, CancelPolicy, CooperativeStrategy, InferenceStrategy, StrategyKind,
};
pub use worker::run_worker;
