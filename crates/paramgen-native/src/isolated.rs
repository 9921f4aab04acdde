//! Worker-process strategy
//!
//! The request is written to a temporary JSON file whose path is the worker's
//! last argument. The parent polls the child and, on cancel, sends SIGTERM,
//! waits a short grace period and then kills it. The worker's last stdout
//! line is a [`WorkerReply`].

use crate::cancel::CancelToken;
use crate::generate::preflight;
use crate::strategy::{InferenceStrategy, StrategyKind};
use paramgen_core::result::{EMPTY_RESPONSE, SUBPROC_FAILED, SUBPROC_NO_OUTPUT};
use paramgen_core::{
    evaluate_raw, model_label, InferenceResult, OutputError, RuntimeSettings, Schema, WorkerReply,
    WorkerRequest,
};
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_millis(250);
/// How long to wait for the pipes to drain after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Characters of worker stderr kept for diagnostics
const STDERR_TAIL: usize = 512;

/// Program and leading arguments used to start a worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// This binary's hidden `worker` subcommand
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

#[derive(Default)]
struct SlotState {
    child: Option<Child>,
    /// Set once the child has been reaped; its pid must not be signalled after that
    exited: bool,
}

/// The worker process owned by a task
///
/// All signalling and reaping happens under one lock, so a pid is never
/// signalled after it was reaped.
#[derive(Default)]
pub struct WorkerSlot {
    state: Mutex<SlotState>,
}

impl WorkerSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, child: Child) {
        *self.lock() = SlotState {
            child: Some(child),
            exited: false,
        };
    }

    pub fn is_active(&self) -> bool {
        let state = self.lock();
        state.child.is_some() && !state.exited
    }

    fn poll(&self) -> io::Result<Option<ExitStatus>> {
        let mut state = self.lock();
        let status = match state.child.as_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        if status.is_some() {
            state.exited = true;
        }
        Ok(status)
    }

    /// Ask the worker to stop. Never blocks: if the slot is busy the owning
    /// thread is already handling the child.
    pub fn terminate(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        if state.exited {
            return;
        }
        if let Some(child) = state.child.as_mut() {
            send_terminate(child);
        }
    }

    /// SIGTERM, grace period, then SIGKILL; always reaps the child.
    fn stop(&self, grace: Duration) {
        let mut state = self.lock();
        let exited = state.exited;
        let Some(child) = state.child.as_mut() else {
            return;
        };
        if !exited {
            send_terminate(child);
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            if !matches!(child.try_wait(), Ok(Some(_))) {
                warn!(pid = child.id(), "worker ignored terminate, killing");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        state.exited = true;
        state.child = None;
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    // SAFETY: the pid belongs to a child that has not been reaped yet
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Read a pipe to the end on a helper thread.
///
/// The thread is never joined: a grandchild holding the pipe open must not
/// stall the caller.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
        });
    }
    rx
}

fn tail(text: &str, max_chars: usize) -> String {
    let skip = text.chars().count().saturating_sub(max_chars);
    text.chars().skip(skip).collect()
}

/// Runs every request in a fresh worker process
pub struct IsolatedStrategy {
    command: WorkerCommand,
    settings: RuntimeSettings,
    grace: Duration,
}

impl IsolatedStrategy {
    pub fn new(command: WorkerCommand, settings: RuntimeSettings) -> Self {
        Self {
            command,
            settings,
            grace: TERMINATE_GRACE,
        }
    }

    fn run_worker(
        &self,
        prompt: &str,
        cancel: &CancelToken,
        model_path: &Path,
        schema: &Schema,
        worker: &WorkerSlot,
        model: &str,
    ) -> io::Result<InferenceResult> {
        let started = Instant::now();
        let request = WorkerRequest {
            model_path: model_path.to_string_lossy().into_owned(),
            schema: schema.clone(),
            prompt: prompt.to_string(),
            settings: self.settings.clone(),
        };

        // Removed on drop, whichever way this function returns
        let mut args_file = tempfile::Builder::new()
            .prefix("paramgen-args-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut args_file, &request)?;
        args_file.flush()?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(args_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        info!(pid = child.id(), "worker spawned");
        worker.install(child);

        let status = loop {
            if cancel.is_canceled() {
                worker.stop(self.grace);
                info!("worker terminated on cancel");
                return Ok(InferenceResult::canceled(started.elapsed().as_secs_f64(), model));
            }
            match worker.poll() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    worker.stop(self.grace);
                    return Err(e);
                }
            }
        };
        if status.success() {
            debug!(%status, "worker exited");
        } else {
            warn!(%status, "worker exited abnormally");
        }

        let out = stdout.recv_timeout(DRAIN_TIMEOUT).unwrap_or_default();
        let err = stderr.recv_timeout(DRAIN_TIMEOUT).unwrap_or_default();
        worker.stop(self.grace);

        let elapsed = started.elapsed().as_secs_f64();
        if cancel.is_canceled() {
            return Ok(InferenceResult::canceled(elapsed, model));
        }
        Ok(interpret_output(&out, &err, status, schema, elapsed, model))
    }
}

/// Turn worker output and exit status into a result through the shared pipeline.
///
/// A worker that died without leaving a reply line is reported with its exit
/// status and the tail of its stderr, even if it printed something first.
pub fn interpret_output(
    stdout: &str,
    stderr: &str,
    status: ExitStatus,
    schema: &Schema,
    elapsed: f64,
    model: &str,
) -> InferenceResult {
    let Some(line) = stdout.lines().rev().find(|line| !line.trim().is_empty()) else {
        return InferenceResult::failure(SUBPROC_NO_OUTPUT, elapsed, model)
            .with_violation("stderr", tail(stderr, STDERR_TAIL));
    };

    let reply: WorkerReply = match serde_json::from_str(line) {
        Ok(reply) => reply,
        Err(_) if !status.success() => {
            let tag = format!("{SUBPROC_FAILED}: {status}");
            return InferenceResult::failure(tag, elapsed, model)
                .with_violation("stderr", tail(stderr, STDERR_TAIL));
        }
        Err(e) => return InferenceResult::failure(format!("subproc_error: {e}"), elapsed, model),
    };

    if !reply.ok {
        let mut result = InferenceResult::failure(SUBPROC_FAILED, elapsed, model);
        if let Some(violations) = reply.violations.filter(|v| !v.is_empty()) {
            result.violations = Some(violations);
        }
        return result;
    }

    let raw = reply.raw.unwrap_or_default();
    let elapsed = reply.elapsed.unwrap_or(elapsed);
    match evaluate_raw(raw.trim(), schema, elapsed, model) {
        Ok(result) => result,
        Err(OutputError::Empty) => InferenceResult::failure(EMPTY_RESPONSE, elapsed, model),
        Err(e) => InferenceResult::failure(format!("subproc_error: {e}"), elapsed, model),
    }
}

impl InferenceStrategy for IsolatedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Isolated
    }

    fn run(
        &self,
        prompt: &str,
        cancel: &CancelToken,
        model_path: &Path,
        schema: &Schema,
        worker: &WorkerSlot,
    ) -> InferenceResult {
        if let Err(result) = preflight(model_path, schema) {
            return result;
        }
        let model = model_label(Some(model_path));
        if cancel.is_canceled() {
            return InferenceResult::canceled(0.0, model);
        }

        let started = Instant::now();
        self.run_worker(prompt, cancel, model_path, schema, worker, &model)
            .unwrap_or_else(|e| {
                InferenceResult::failure(
                    format!("subproc_error: {e}"),
                    started.elapsed().as_secs_f64(),
                    &model,
                )
            })
    }
}
