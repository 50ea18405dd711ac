//! Fixed-size worker pool.
//!
//! Each worker loops `Idle -> BuildingTheme -> Requesting -> Validating ->
//! Submitting -> Idle` until it is cancelled, the shared target is reached,
//! or it fails too many tasks in a row. Workers only share the target
//! counter, the statistics and the store handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::completion::{AttemptObserver, CompletionClient, GenerateError};
use crate::config::ConfigError;
use crate::stats::{FailureKind, RunStats};
use crate::store::{DialogStore, StoreError};
use crate::theme::ThemeBuilder;

// =============================================================================
// TARGET COUNTER
// =============================================================================

/// Shared record budget.
///
/// A worker claims a slot before it starts a task and keeps it until the task
/// yields a stored record, so failures never consume the budget and the pool
/// never overshoots.
#[derive(Debug)]
pub struct TargetCounter {
    target: Option<u64>,
    claimed: AtomicU64,
    completed: AtomicU64,
}

impl TargetCounter {
    pub fn new(target: Option<u64>) -> Self {
        Self {
            target,
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn target(&self) -> Option<u64> {
        self.target
    }

    /// Reserve one slot. Always succeeds without a target.
    pub fn try_claim(&self) -> bool {
        let Some(target) = self.target else {
            self.claimed.fetch_add(1, Ordering::AcqRel);
            return true;
        };
        self.claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |claimed| {
                (claimed < target).then_some(claimed + 1)
            })
            .is_ok()
    }

    /// Give back a slot that will not produce a record.
    pub fn release(&self) {
        let _ = self
            .claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Mark a claimed slot as fulfilled. Returns the completed count.
    pub fn complete(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_reached(&self) -> bool {
        self.target.is_some_and(|t| self.completed() >= t)
    }
}

// =============================================================================
// WORKER STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    BuildingTheme = 1,
    Requesting = 2,
    Validating = 3,
    Submitting = 4,
    Finished = 5,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::BuildingTheme,
            2 => WorkerState::Requesting,
            3 => WorkerState::Validating,
            4 => WorkerState::Submitting,
            5 => WorkerState::Finished,
            _ => WorkerState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::BuildingTheme => "building_theme",
            WorkerState::Requesting => "requesting",
            WorkerState::Validating => "validating",
            WorkerState::Submitting => "submitting",
            WorkerState::Finished => "finished",
        }
    }
}

/// Per-worker state cells, readable by the controller at any time.
#[derive(Debug)]
pub struct WorkerStates {
    cells: Vec<AtomicU8>,
}

impl WorkerStates {
    pub fn new(workers: usize) -> Self {
        Self {
            cells: (0..workers)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
        }
    }

    pub fn set(&self, worker: usize, state: WorkerState) {
        if let Some(cell) = self.cells.get(worker) {
            cell.store(state as u8, Ordering::Relaxed);
        }
    }

    pub fn get(&self, worker: usize) -> Option<WorkerState> {
        self.cells
            .get(worker)
            .map(|c| WorkerState::from_u8(c.load(Ordering::Relaxed)))
    }

    /// Number of workers in each state.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for cell in &self.cells {
            let state = WorkerState::from_u8(cell.load(Ordering::Relaxed));
            *counts.entry(state.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn probe(&self, worker: usize) -> WorkerProbe<'_> {
        WorkerProbe {
            states: self,
            worker,
        }
    }
}

struct WorkerProbe<'a> {
    states: &'a WorkerStates,
    worker: usize,
}

impl AttemptObserver for WorkerProbe<'_> {
    fn on_request(&self, _attempt: u32) {
        self.states.set(self.worker, WorkerState::Requesting);
    }

    fn on_validate(&self, _attempt: u32) {
        self.states.set(self.worker, WorkerState::Validating);
    }
}

// =============================================================================
// WORKER LOOP
// =============================================================================

/// Everything a worker needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub themes: Arc<ThemeBuilder>,
    pub client: Arc<CompletionClient>,
    pub store: DialogStore,
    pub stats: Arc<RunStats>,
    pub target: Arc<TargetCounter>,
    pub states: Arc<WorkerStates>,
    pub cancel: Arc<AtomicBool>,
    pub max_consecutive_errors: u32,
    /// Pause between two tasks of the same worker.
    pub task_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    TargetReached,
    TooManyErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub exit: WorkerExit,
    pub records: u64,
}

/// Failures that end a worker and must stop the run.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// How often a worker without a slot checks whether one was released.
const CLAIM_POLL: Duration = Duration::from_millis(25);

pub async fn run_worker(worker: usize, ctx: WorkerContext) -> Result<WorkerReport, WorkerError> {
    let result = worker_loop(worker, &ctx).await;
    ctx.states.set(worker, WorkerState::Finished);
    if result.is_err() {
        ctx.cancel.store(true, Ordering::Release);
    }
    result
}

async fn worker_loop(worker: usize, ctx: &WorkerContext) -> Result<WorkerReport, WorkerError> {
    let mut rng = StdRng::from_entropy();
    let mut consecutive_errors = 0u32;
    let mut records = 0u64;
    let cancelled = || ctx.cancel.load(Ordering::Acquire);

    let exit = 'tasks: loop {
        ctx.states.set(worker, WorkerState::Idle);
        if cancelled() {
            break WorkerExit::Cancelled;
        }
        if !ctx.target.try_claim() {
            if ctx.target.is_reached() {
                break WorkerExit::TargetReached;
            }
            // Every open slot is held by another worker, which may still give it back.
            sleep(CLAIM_POLL).await;
            continue;
        }

        // The claimed slot is held across failed tasks until one succeeds.
        loop {
            if cancelled() {
                ctx.target.release();
                break 'tasks WorkerExit::Cancelled;
            }
            ctx.states.set(worker, WorkerState::BuildingTheme);
            ctx.stats.task_started();

            let prompt = match ctx.themes.build(&mut rng) {
                Ok(prompt) => prompt,
                Err(err) => {
                    ctx.target.release();
                    error!(worker, error = %err, "Theme sampling failed");
                    return Err(err.into());
                }
            };

            let probe = ctx.states.probe(worker);
            let outcome = ctx
                .client
                .generate(
                    &prompt,
                    Some(ctx.cancel.as_ref()),
                    Some(&probe as &dyn AttemptObserver),
                )
                .await;

            match outcome {
                Ok(record) => {
                    ctx.states.set(worker, WorkerState::Submitting);
                    match ctx.store.append(&record).await {
                        Ok(receipt) => {
                            let completed = ctx.target.complete();
                            ctx.stats.record_written(&record.language);
                            consecutive_errors = 0;
                            records += 1;
                            debug!(
                                worker,
                                language = %record.language,
                                lines = record.dialog.len(),
                                rotated = receipt.rotated,
                                completed,
                                "Record stored"
                            );
                            break;
                        }
                        Err(err) => {
                            ctx.stats.task_failed(FailureKind::Store);
                            ctx.target.release();
                            let line = serde_json::to_string(&record).unwrap_or_default();
                            error!(
                                worker,
                                error = %err,
                                record = %line,
                                "Store append failed; record not persisted"
                            );
                            return Err(err.into());
                        }
                    }
                }
                Err(GenerateError::Cancelled { .. }) => {
                    ctx.target.release();
                    break 'tasks WorkerExit::Cancelled;
                }
                Err(err) => {
                    if let Some(kind) = err.kind() {
                        ctx.stats.task_failed(kind);
                    }
                    consecutive_errors += 1;
                    warn!(
                        worker,
                        theme = %prompt.theme_text,
                        language = %prompt.language_code,
                        kind = err.kind().map_or("cancelled", |k| k.as_str()),
                        attempts = err.attempts(),
                        consecutive_errors,
                        error = %err,
                        "Task failed"
                    );
                    if consecutive_errors >= ctx.max_consecutive_errors {
                        ctx.target.release();
                        error!(
                            worker,
                            consecutive_errors, "Too many consecutive failures; worker stopping"
                        );
                        break 'tasks WorkerExit::TooManyErrors;
                    }
                    ctx.states.set(worker, WorkerState::Idle);
                    pause(ctx.task_delay).await;
                }
            }
        }

        pause(ctx.task_delay).await;
    };

    debug!(worker, exit = ?exit, records, "Worker finished");
    Ok(WorkerReport {
        worker,
        exit,
        records,
    })
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

// =============================================================================
// POOL
// =============================================================================

pub type WorkerOutcome = Result<Result<WorkerReport, WorkerError>, JoinError>;

/// Owns the worker tasks.
pub struct WorkerPool {
    tasks: JoinSet<Result<WorkerReport, WorkerError>>,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `workers` workers sharing `ctx`.
    pub fn spawn(ctx: WorkerContext, workers: usize) -> Self {
        let cancel = ctx.cancel.clone();
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            tasks.spawn(run_worker(worker, ctx.clone()));
        }
        Self { tasks, cancel }
    }

    /// Ask every worker to stop at its next task boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub async fn join_next(&mut self) -> Option<WorkerOutcome> {
        self.tasks.join_next().await
    }

    pub fn active_workers(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
