//! Single-flight task coordinator
//!
//! At most one task is current. `submit` spawns one background thread per
//! accepted request; `cancel`, `status` and `is_busy` never wait on that
//! thread. A result is only applied through [`Coordinator::finish`], which
//! checks the cancel token first.

use crate::cancel::CancelToken;
use crate::engine::EngineHandle;
use crate::isolated::{IsolatedStrategy, WorkerCommand, WorkerSlot};
use crate::strategy::{
    select_strategy, CancelPolicy, CooperativeStrategy, InferenceStrategy, StrategyKind,
};
use paramgen_core::{model_label, InferenceResult, Params, Schema};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SubmitError {
    #[error("engine is busy (running or stopping)")]
    Busy,
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("failed to spawn inference thread: {0}")]
    Spawn(String),
}

struct Task {
    id: u64,
    cancel: CancelToken,
    worker: WorkerSlot,
    accepted_at: Instant,
    /// Set once the background thread has delivered its result
    done: AtomicBool,
}

#[derive(Default)]
struct Shared {
    current: Mutex<Option<Arc<Task>>>,
    last_ttv: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl Shared {
    fn current(&self) -> MutexGuard<'_, Option<Arc<Task>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_if(&self, id: u64) {
        let mut current = self.current();
        if current.as_ref().is_some_and(|task| task.id == id) {
            *current = None;
        }
    }
}

/// What the background thread delivers
#[derive(Debug, Clone)]
pub struct Completion {
    pub result: InferenceResult,
    /// Wall time of the strategy run
    pub inference: Duration,
}

/// Caller's side of an accepted request
pub struct TaskHandle {
    task: Arc<Task>,
    rx: Receiver<Completion>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.task.id
    }

    /// Block until the background thread finishes.
    pub fn wait(&self) -> Completion {
        self.rx.recv().unwrap_or_else(|_| lost_completion(&self.task))
    }

    /// `None` if the task is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(lost_completion(&self.task)),
        }
    }
}

fn lost_completion(task: &Task) -> Completion {
    let elapsed = task.accepted_at.elapsed();
    Completion {
        result: InferenceResult::failure(
            "internal_error: task thread exited without a result",
            elapsed.as_secs_f64(),
            model_label(None),
        ),
        inference: elapsed,
    }
}

/// Durations recorded when a result is applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    pub llm: Duration,
    pub apply: Duration,
    /// Time to value: accept to applied
    pub ttv: Duration,
}

#[derive(Debug)]
pub enum Outcome<R> {
    Applied {
        value: R,
        result: InferenceResult,
        timings: Timings,
    },
    Failed(InferenceResult),
    Canceled,
}

pub struct Coordinator {
    engine: Arc<EngineHandle>,
    strategy: Arc<dyn InferenceStrategy>,
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(engine: Arc<EngineHandle>, strategy: Arc<dyn InferenceStrategy>) -> Self {
        Self {
            engine,
            strategy,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Pick the strategy for `policy` using the engine's cached abort capability.
    pub fn with_policy(
        engine: Arc<EngineHandle>,
        policy: CancelPolicy,
        worker: WorkerCommand,
    ) -> Self {
        let kind = select_strategy(policy, engine.supports_abort());
        info!(
            policy = ?policy,
            strategy = kind.as_str(),
            supports_abort = engine.supports_abort(),
            "strategy selected"
        );
        let strategy: Arc<dyn InferenceStrategy> = match kind {
            StrategyKind::Cooperative => Arc::new(CooperativeStrategy::new(engine.clone())),
            StrategyKind::Isolated => {
                Arc::new(IsolatedStrategy::new(worker, engine.settings().clone()))
            }
        };
        Self::new(engine, strategy)
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn status(&self) -> Status {
        match self.shared.current().as_ref() {
            None => Status::Idle,
            Some(task) if task.cancel.is_canceled() => Status::Stopping,
            Some(_) => Status::Running,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status() != Status::Idle || self.engine.is_busy()
    }

    pub fn last_ttv(&self) -> Option<Duration> {
        *self.shared.last_ttv.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a request, or reject it without side effects.
    ///
    /// The schema is copied so later caller-side edits cannot reach the task.
    pub fn submit(
        &self,
        prompt: &str,
        model_path: PathBuf,
        schema: &Schema,
    ) -> Result<TaskHandle, SubmitError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }

        let mut current = self.shared.current();
        if current.is_some() || self.engine.is_busy() {
            return Err(SubmitError::Busy);
        }

        let task = Arc::new(Task {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancelToken::new(),
            worker: WorkerSlot::default(),
            accepted_at: Instant::now(),
            done: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();

        let job = {
            let task = task.clone();
            let shared = self.shared.clone();
            let strategy = self.strategy.clone();
            let prompt = prompt.to_string();
            let schema = schema.clone();
            move || {
                let started = Instant::now();
                let run = panic::catch_unwind(AssertUnwindSafe(|| {
                    strategy.run(&prompt, &task.cancel, &model_path, &schema, &task.worker)
                }));
                let result = run.unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(task = task.id, %message, "inference panicked");
                    InferenceResult::failure(
                        format!("internal_error: {message}"),
                        started.elapsed().as_secs_f64(),
                        model_label(Some(&model_path)),
                    )
                });

                let _ = tx.send(Completion {
                    result,
                    inference: started.elapsed(),
                });
                task.done.store(true, Ordering::SeqCst);
                if task.cancel.is_canceled() {
                    shared.clear_if(task.id);
                    info!(task = task.id, "canceled task stopped");
                }
            }
        };

        thread::Builder::new()
            .name(format!("paramgen-task-{}", task.id))
            .spawn(job)
            .map_err(|e| SubmitError::Spawn(e.to_string()))?;

        info!(task = task.id, strategy = self.strategy.kind().as_str(), "task accepted");
        *current = Some(task.clone());
        Ok(TaskHandle { task, rx })
    }

    /// Request cancellation of the current task. Returns false when idle.
    pub fn cancel(&self) -> bool {
        let current = self.shared.current();
        let Some(task) = current.as_ref() else {
            return false;
        };
        task.cancel.cancel();
        task.worker.terminate();
        info!(task = task.id, "cancel requested");

        if task.done.load(Ordering::SeqCst) {
            let id = task.id;
            drop(current);
            self.shared.clear_if(id);
        }
        true
    }

    /// Consume a completion: apply it unless the task was canceled, then go idle.
    pub fn finish<R>(
        &self,
        handle: &TaskHandle,
        completion: Completion,
        apply: impl FnOnce(&Params) -> R,
    ) -> Outcome<R> {
        let task = &handle.task;
        let outcome = if task.cancel.is_canceled() {
            info!(task = task.id, "canceled, skipping apply");
            Outcome::Canceled
        } else {
            match completion.result.params.as_ref() {
                Some(params) if completion.result.ok => {
                    let apply_started = Instant::now();
                    let value = apply(params);
                    let timings = Timings {
                        llm: completion.inference,
                        apply: apply_started.elapsed(),
                        ttv: task.accepted_at.elapsed(),
                    };
                    info!(
                        "LLM: {:.2}s | Apply: {:.2}s | TTV: {:.2}s",
                        timings.llm.as_secs_f64(),
                        timings.apply.as_secs_f64(),
                        timings.ttv.as_secs_f64()
                    );
                    *self.shared.last_ttv.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(timings.ttv);
                    Outcome::Applied {
                        value,
                        result: completion.result,
                        timings,
                    }
                }
                _ => {
                    info!(task = task.id, error = ?completion.result.error_tag(), "task failed");
                    Outcome::Failed(completion.result)
                }
            }
        };

        self.shared.clear_if(task.id);
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLoader;
    use paramgen_core::{RuntimeSettings, SocketSpec};
    use serde_json::json;
    use std::path::Path;

    const WAIT: Duration = Duration::from_secs(5);

    fn schema() -> Schema {
        Schema::new()
            .with("x", SocketSpec::float(0.0, 10.0, 5.0))
            .with("flag", SocketSpec::boolean(false))
    }

    fn cooperative(loader: ScriptedLoader) -> (Coordinator, Arc<EngineHandle>) {
        let engine = Arc::new(EngineHandle::new(Arc::new(loader), RuntimeSettings::default()));
        let unused = WorkerCommand::new("unused");
        let coordinator =
            Coordinator::with_policy(engine.clone(), CancelPolicy::Cooperative, unused);
        (coordinator, engine)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    struct PanickingStrategy;

    impl InferenceStrategy for PanickingStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Cooperative
        }

        fn run(
            &self,
            _: &str,
            _: &CancelToken,
            _: &Path,
            _: &Schema,
            _: &WorkerSlot,
        ) -> InferenceResult {
            panic!("engine state corrupted");
        }
    }

    #[test]
    fn test_submit_and_apply() {
        let reply = "{\"x\": 8, \"flag\": true}".to_string();
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![Ok(reply)]));
        let model = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(coordinator.strategy_kind(), StrategyKind::Cooperative);

        let handle = coordinator
            .submit("  tall tree ", model.path().to_path_buf(), &schema())
            .unwrap();
        assert_eq!(handle.id(), 1);
        assert!(coordinator.is_busy());

        let completion = handle.wait_timeout(WAIT).unwrap();
        let outcome = coordinator.finish(&handle, completion, |params| params["x"].clone());

        match outcome {
            Outcome::Applied { value, result, timings } => {
                assert_eq!(value, json!(8.0));
                assert!(result.ok);
                assert!(timings.ttv >= timings.llm);
            }
            other => panic!("expected apply, got {other:?}"),
        }
        assert_eq!(coordinator.status(), Status::Idle);
        assert!(!coordinator.is_busy());
        assert!(coordinator.last_ttv().is_some());
    }

    #[test]
    fn test_rejections_have_no_side_effects() {
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![]).blocking());
        let model = tempfile::NamedTempFile::new().unwrap();

        assert_eq!(
            coordinator.submit("   ", model.path().to_path_buf(), &schema()).err(),
            Some(SubmitError::EmptyPrompt)
        );
        assert_eq!(coordinator.status(), Status::Idle);

        let first = coordinator.submit("a", model.path().to_path_buf(), &schema()).unwrap();
        assert_eq!(
            coordinator.submit("b", model.path().to_path_buf(), &schema()).err(),
            Some(SubmitError::Busy)
        );
        assert_eq!(coordinator.status(), Status::Running);

        assert!(coordinator.cancel());
        let completion = first.wait_timeout(WAIT).unwrap();
        assert!(completion.result.is_canceled());
        assert!(matches!(coordinator.finish(&first, completion, |_| ()), Outcome::Canceled));
        assert_eq!(coordinator.status(), Status::Idle);

        let second = coordinator.submit("c", model.path().to_path_buf(), &schema()).unwrap();
        assert_eq!(second.id(), 2);
        coordinator.cancel();
        second.wait_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_held_inference_lock_rejects_submit() {
        let (coordinator, engine) = cooperative(ScriptedLoader::new(vec![]));
        let model = tempfile::NamedTempFile::new().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let engine = engine.clone();
            let path = model.path().to_path_buf();
            thread::spawn(move || {
                engine
                    .with_engine(&path, |_| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    })
                    .unwrap();
            })
        };
        entered_rx.recv_timeout(WAIT).unwrap();

        assert!(coordinator.is_busy());
        assert_eq!(
            coordinator.submit("a", model.path().to_path_buf(), &schema()).err(),
            Some(SubmitError::Busy)
        );
        assert_eq!(coordinator.status(), Status::Idle);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!coordinator.is_busy());
    }

    #[test]
    fn test_canceled_task_returns_to_idle_on_its_own() {
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![]).blocking());
        let model = tempfile::NamedTempFile::new().unwrap();

        let handle = coordinator.submit("a", model.path().to_path_buf(), &schema()).unwrap();
        coordinator.cancel();
        assert_ne!(coordinator.status(), Status::Running);

        wait_until(|| coordinator.status() == Status::Idle);
        assert!(handle.wait_timeout(WAIT).unwrap().result.is_canceled());
    }

    #[test]
    fn test_cancel_after_completion_skips_apply() {
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![Ok("{\"x\": 1}".to_string())]));
        let model = tempfile::NamedTempFile::new().unwrap();

        let handle = coordinator.submit("a", model.path().to_path_buf(), &schema()).unwrap();
        let completion = handle.wait_timeout(WAIT).unwrap();
        assert!(completion.result.ok);

        assert!(coordinator.cancel());
        let mut applied = false;
        let outcome = coordinator.finish(&handle, completion, |_| applied = true);

        assert!(matches!(outcome, Outcome::Canceled));
        assert!(!applied);
        assert_eq!(coordinator.status(), Status::Idle);
        assert!(!coordinator.cancel());
    }

    #[test]
    fn test_failed_result_is_not_applied() {
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![]));

        let handle = coordinator
            .submit("a", PathBuf::from("/missing/model.gguf"), &schema())
            .unwrap();
        let completion = handle.wait_timeout(WAIT).unwrap();

        match coordinator.finish(&handle, completion, |_| ()) {
            Outcome::Failed(result) => assert_eq!(result.error_tag(), Some("model_missing")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(coordinator.status(), Status::Idle);
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let engine = Arc::new(EngineHandle::new(
            Arc::new(ScriptedLoader::new(vec![])),
            RuntimeSettings::default(),
        ));
        let coordinator = Coordinator::new(engine, Arc::new(PanickingStrategy));

        let handle = coordinator.submit("a", PathBuf::from("/m.gguf"), &schema()).unwrap();
        let completion = handle.wait_timeout(WAIT).unwrap();

        let tag = completion.result.error_tag().unwrap().to_string();
        assert_eq!(tag, "internal_error: engine state corrupted");
        assert!(matches!(coordinator.finish(&handle, completion, |_| ()), Outcome::Failed(_)));
        assert_eq!(coordinator.status(), Status::Idle);
    }

    #[test]
    fn test_schema_is_copied_at_submit() {
        let (coordinator, _) = cooperative(ScriptedLoader::new(vec![Ok("{}".to_string())]));
        let model = tempfile::NamedTempFile::new().unwrap();
        let mut schema = schema();

        let handle = coordinator.submit("a", model.path().to_path_buf(), &schema).unwrap();
        schema.insert("late", SocketSpec::boolean(true));

        let completion = handle.wait_timeout(WAIT).unwrap();
        let params = completion.result.params.clone().unwrap();
        assert!(!params.contains_key("late"));
        coordinator.finish(&handle, completion, |_| ());
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_terminates_isolated_worker() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("got-term");
        let script = dir.path().join("worker.sh");
        let body = format!(
            "#!/bin/sh\ntrap 'echo term > \"{}\"; exit 0' TERM\n{}\n",
            marker.display(),
            "while true; do sleep 0.05; done"
        );
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let engine = Arc::new(EngineHandle::new(
            Arc::new(ScriptedLoader::new(vec![])),
            RuntimeSettings::default(),
        ));
        let coordinator =
            Coordinator::with_policy(engine, CancelPolicy::Isolated, WorkerCommand::new(&script));
        assert_eq!(coordinator.strategy_kind(), StrategyKind::Isolated);
        let model = tempfile::NamedTempFile::new().unwrap();

        let handle = coordinator.submit("a", model.path().to_path_buf(), &schema()).unwrap();
        wait_until(|| handle.task.worker.is_active());

        let started = Instant::now();
        assert!(coordinator.cancel());
        assert_ne!(coordinator.status(), Status::Running);

        let completion = handle.wait_timeout(WAIT).unwrap();
        assert!(completion.result.is_canceled(), "{:?}", completion.result);
        assert!(started.elapsed() < WAIT);
        assert!(marker.exists());
        assert!(!handle.task.worker.is_active());

        wait_until(|| coordinator.status() == Status::Idle);
        assert!(matches!(coordinator.finish(&handle, completion, |_| ()), Outcome::Canceled));
    }
}
