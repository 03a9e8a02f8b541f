//! Bounded parallel execution of independent work items.
//!
//! Each [`WorkItem`] runs in its own worker thread once a permit from the
//! [`BoundedSemaphore`] is available. Workers report exactly one
//! [`ExecutionOutcome`] over a dedicated channel; errors and panics are turned
//! into [`Fault`] values at the worker boundary. Outcomes are collected in
//! submission order. The first fault stops the batch: every other worker is
//! asked to terminate and no partial results are returned.

mod semaphore;

pub use semaphore::{BoundedSemaphore, Permit};

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{BatchWorkerFailedDetails, Error, ErrorCode, Result};
use crate::executor::ChildTracker;
use crate::interrupt::{Interrupt, SigintGuard};

/// Exit status used when a batch is aborted because a worker failed.
pub const EXIT_WORKER_FAILED: i32 = 42;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Named parameters handed to a work item's target.
pub type Args = Map<String, Value>;

type Target<T> = Arc<dyn Fn(&WorkerContext, &Args) -> Result<T> + Send + Sync>;

/// What a running target knows about itself.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    index: usize,
    key: Option<String>,
    tracker: Arc<ChildTracker>,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Pass this to command execution so batch termination reaches children.
    pub fn tracker(&self) -> &ChildTracker {
        &self.tracker
    }

    /// True once the orchestrator asked this worker to stop.
    pub fn is_terminated(&self) -> bool {
        self.tracker.is_terminated()
    }
}

/// One unit of work: a target, its arguments and an optional correlation key.
pub struct WorkItem<T> {
    target: Target<T>,
    pub args: Args,
    pub key: Option<String>,
}

impl<T> WorkItem<T> {
    pub fn new<F>(target: F) -> Self
    where
        F: Fn(&WorkerContext, &Args) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            target: Arc::new(target),
            args: Args::new(),
            key: None,
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A failure captured inside a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn from_error(err: &Error) -> Self {
        Self::new(err.code.as_str(), err.message.clone())
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        Self::new("panic", message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The transportable result of one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ExecutionOutcome<T> {
    Success(T),
    Fault(Fault),
}

/// How outcomes are handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchShape {
    /// Values in submission order.
    #[default]
    Sequence,
    /// Values by work item key. Every item must carry a key.
    Keyed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResult<T> {
    Sequence(Vec<T>),
    Keyed(BTreeMap<String, T>),
}

impl<T> BatchResult<T> {
    pub fn into_sequence(self) -> Option<Vec<T>> {
        match self {
            BatchResult::Sequence(values) => Some(values),
            BatchResult::Keyed(_) => None,
        }
    }

    pub fn into_keyed(self) -> Option<BTreeMap<String, T>> {
        match self {
            BatchResult::Keyed(values) => Some(values),
            BatchResult::Sequence(_) => None,
        }
    }
}

struct Running<T> {
    index: usize,
    key: Option<String>,
    tracker: Arc<ChildTracker>,
    outcome: Receiver<ExecutionOutcome<T>>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Batch runner configuration.
#[derive(Debug, Clone)]
pub struct Batch {
    maxthreads: usize,
    shape: BatchShape,
    interrupt: Interrupt,
}

impl Batch {
    pub fn new(maxthreads: usize) -> Self {
        Self {
            maxthreads,
            shape: BatchShape::Sequence,
            interrupt: Interrupt::Signal,
        }
    }

    pub fn keyed(mut self) -> Self {
        self.shape = BatchShape::Keyed;
        self
    }

    pub fn shape(mut self, shape: BatchShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run every item, at most `maxthreads` at a time.
    ///
    /// Fails with `batch.worker_failed` on the first fault and with
    /// `batch.interrupted` on user interruption; both after asking all other
    /// workers to terminate.
    pub fn run<T: Send + 'static>(&self, items: Vec<WorkItem<T>>) -> Result<BatchResult<T>> {
        if self.maxthreads == 0 {
            return Err(Error::validation_invalid_argument(
                "maxthreads",
                "maxthreads must be at least 1",
                None,
                None,
            ));
        }

        if self.shape == BatchShape::Keyed {
            let missing: Vec<String> = items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.key.is_none())
                .map(|(index, _)| index.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(Error::validation_invalid_argument(
                    "key",
                    "keyed batch requires a key on every work item",
                    None,
                    Some(missing),
                ));
            }
        }

        let _sigint = matches!(self.interrupt, Interrupt::Signal).then(SigintGuard::install);

        let mut running = self.admit(items)?;
        let values = self.collect(&mut running)?;

        Ok(match self.shape {
            BatchShape::Sequence => {
                BatchResult::Sequence(values.into_iter().map(|(_, value)| value).collect())
            }
            BatchShape::Keyed => BatchResult::Keyed(
                values
                    .into_iter()
                    .filter_map(|(key, value)| key.map(|key| (key, value)))
                    .collect(),
            ),
        })
    }

    /// Like [`Batch::run`], but a worker fault ends the whole process with
    /// [`EXIT_WORKER_FAILED`]; no partial results are reported.
    pub fn run_or_exit<T: Send + 'static>(&self, items: Vec<WorkItem<T>>) -> Result<BatchResult<T>> {
        match self.run(items) {
            Err(err) if err.code == ErrorCode::BatchWorkerFailed => {
                tracing::error!(details = %err.details, "{}, exiting", err.message);
                std::process::exit(EXIT_WORKER_FAILED);
            }
            other => other,
        }
    }

    fn admit<T: Send + 'static>(&self, items: Vec<WorkItem<T>>) -> Result<Vec<Running<T>>> {
        let semaphore = Arc::new(BoundedSemaphore::new(self.maxthreads));
        let mut running: Vec<Running<T>> = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            while !semaphore.acquire_timeout(POLL_INTERVAL) {
                if self.interrupt.is_requested() {
                    let terminated = terminate_all(&running, None);
                    return Err(Error::batch_interrupted(terminated));
                }
            }

            let tracker = ChildTracker::new();
            let ctx = WorkerContext {
                index,
                key: item.key.clone(),
                tracker: Arc::clone(&tracker),
            };
            let (tx, rx) = mpsc::sync_channel(1);
            let permit = Permit::adopt(Arc::clone(&semaphore));
            let WorkItem { target, args, key } = item;

            let spawned = thread::Builder::new()
                .name(format!("batch-worker-{}", index))
                .spawn(move || {
                    let _permit = permit;
                    let outcome = execute(&target, &ctx, &args);
                    if let ExecutionOutcome::Fault(fault) = &outcome {
                        tracing::error!(index = ctx.index, key = ?ctx.key, %fault, "worker failed");
                    }
                    let _ = tx.send(outcome);
                    tracing::debug!(index = ctx.index, "finished call, semaphore released");
                });

            match spawned {
                Ok(handle) => running.push(Running {
                    index,
                    key,
                    tracker,
                    outcome: rx,
                    handle: Some(handle),
                }),
                Err(err) => {
                    terminate_all(&running, None);
                    return Err(Error::internal_unexpected(format!(
                        "failed to spawn batch worker {}: {}",
                        index, err
                    )));
                }
            }
        }

        Ok(running)
    }

    fn collect<T>(&self, running: &mut [Running<T>]) -> Result<Vec<(Option<String>, T)>> {
        let mut values = Vec::with_capacity(running.len());

        for position in 0..running.len() {
            let outcome = loop {
                if self.interrupt.is_requested() {
                    tracing::warn!("Interrupted, exiting.");
                    let terminated = terminate_all(running, None);
                    return Err(Error::batch_interrupted(terminated));
                }
                match running[position].outcome.recv_timeout(POLL_INTERVAL) {
                    Ok(outcome) => break outcome,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        break ExecutionOutcome::Fault(Fault::new(
                            "disconnected",
                            "worker exited without reporting an outcome",
                        ))
                    }
                }
            };

            let item = &mut running[position];
            match outcome {
                ExecutionOutcome::Success(value) => {
                    if let Some(handle) = item.handle.take() {
                        let _ = handle.join();
                    }
                    values.push((item.key.clone(), value));
                }
                ExecutionOutcome::Fault(fault) => {
                    tracing::error!("{}, exiting", fault);
                    let (index, key) = (item.index, item.key.clone());
                    let terminated = terminate_all(running, Some(position));
                    return Err(Error::batch_worker_failed(BatchWorkerFailedDetails {
                        index,
                        key,
                        kind: fault.kind,
                        message: fault.message,
                        terminated,
                    }));
                }
            }
        }

        Ok(values)
    }
}

fn execute<T>(target: &Target<T>, ctx: &WorkerContext, args: &Args) -> ExecutionOutcome<T> {
    match panic::catch_unwind(AssertUnwindSafe(|| target(ctx, args))) {
        Ok(Ok(value)) => ExecutionOutcome::Success(value),
        Ok(Err(err)) => ExecutionOutcome::Fault(Fault::from_error(&err)),
        Err(payload) => ExecutionOutcome::Fault(Fault::from_panic(payload)),
    }
}

/// Ask every worker except `skip` to terminate. Returns how many were asked.
fn terminate_all<T>(running: &[Running<T>], skip: Option<usize>) -> usize {
    tracing::debug!("cleanup workers");
    let mut requested = 0;
    for (position, worker) in running.iter().enumerate() {
        if Some(position) == skip {
            continue;
        }
        let signalled = worker.tracker.terminate();
        tracing::debug!(index = worker.index, signalled, "termination requested");
        requested += 1;
    }
    requested
}

/// Run `items` with at most `maxthreads` concurrent workers.
pub fn run_batch<T: Send + 'static>(
    items: Vec<WorkItem<T>>,
    maxthreads: usize,
    shape: BatchShape,
) -> Result<BatchResult<T>> {
    Batch::new(maxthreads).shape(shape).run(items)
}

/// Like [`run_batch`], but a worker fault ends the whole process with
/// [`EXIT_WORKER_FAILED`].
pub fn run_batch_or_exit<T: Send + 'static>(
    items: Vec<WorkItem<T>>,
    maxthreads: usize,
    shape: BatchShape,
) -> Result<BatchResult<T>> {
    Batch::new(maxthreads).shape(shape).run_or_exit(items)
}
