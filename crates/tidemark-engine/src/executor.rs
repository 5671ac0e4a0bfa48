//! Retry-until-complete executor.
//!
//! Drives a list of work units to completion despite unreliable fetch
//! backends: units are batched (one heavyweight session per worker, units
//! within a batch run sequentially), outcomes are tracked across passes,
//! and still-pending units are retried with a linearly growing backoff
//! until everything settles or the attempt budget runs out.
//!
//! No unit is ever lost: every unit ends the run in exactly one of
//! Success, PermanentFailure or exhausted-Pending, and the report lists
//! them all.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use tidemark_core::{EngineConfig, FetchError, FetchRequest, FetchSession, SessionFactory, StoreError};

/// Per-unit terminal (or per-pass) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Pending,
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One schedulable fetch task: series x partition x span.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Stable id used for cache keys, ledger notes and log correlation.
    pub id: String,
    pub request: FetchRequest,
    /// Constraint violations on persist count as already-present rows.
    pub duplicate_is_success: bool,
    pub attempts: u32,
    pub outcome: UnitOutcome,
}

impl WorkUnit {
    pub fn new(request: FetchRequest, duplicate_is_success: bool) -> Self {
        Self {
            id: request.unit_id(),
            request,
            duplicate_is_success,
            attempts: 0,
            outcome: UnitOutcome::Pending,
        }
    }
}

/// What went wrong while running one unit.
#[derive(Debug)]
pub enum UnitError {
    Fetch(FetchError),
    Store(StoreError),
}

impl From<FetchError> for UnitError {
    fn from(err: FetchError) -> Self {
        UnitError::Fetch(err)
    }
}

impl From<StoreError> for UnitError {
    fn from(err: StoreError) -> Self {
        UnitError::Store(err)
    }
}

/// Performs the actual work of one unit against a live session: fetch,
/// classify, persist. Implemented by the synchronizer; kept as a trait so
/// the executor can be exercised with scripted fakes.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run(&self, session: &mut dyn FetchSession, unit: &WorkUnit) -> Result<(), UnitError>;
}

/// Final, exhaustive accounting of one executor run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub passes: u32,
    /// Units that completed, including idempotent duplicate writes.
    pub succeeded: Vec<String>,
    /// Units that failed permanently; retrying would not help.
    pub failed: Vec<String>,
    /// Units still pending when the attempt budget ran out (or the run
    /// aborted).
    pub exhausted: Vec<String>,
    /// Attempts actually made, per unit.
    pub attempts: BTreeMap<String, u32>,
    /// True when the backend went unavailable and the run stopped early.
    pub aborted: bool,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.failed.is_empty() && self.exhausted.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.exhausted.len()
    }
}

pub struct Executor {
    factory: Arc<dyn SessionFactory>,
    cfg: EngineConfig,
}

impl Executor {
    pub fn new(factory: Arc<dyn SessionFactory>, cfg: EngineConfig) -> Self {
        Self { factory, cfg }
    }

    /// Drive `units` to completion. Terminates after at most
    /// `max_attempts` passes; aborts early when the backend reports
    /// itself unavailable.
    pub async fn run(&self, mut units: Vec<WorkUnit>, runner: Arc<dyn UnitRunner>) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let abort = Arc::new(AtomicBool::new(false));
        let mut passes = 0u32;

        for pass in 1..=self.cfg.max_attempts {
            let pending = units.iter().filter(|u| u.outcome == UnitOutcome::Pending).count();
            if pending == 0 || abort.load(Ordering::SeqCst) {
                break;
            }
            passes = pass;
            info!(run_id = %run_id, pass, pending, "executor pass starting");

            units = self.run_pass(units, runner.clone(), abort.clone()).await;

            let still_pending =
                units.iter().filter(|u| u.outcome == UnitOutcome::Pending).count();
            if still_pending > 0 && pass < self.cfg.max_attempts && !abort.load(Ordering::SeqCst) {
                // Linear backoff between passes.
                let delay = Duration::from_secs(self.cfg.backoff_base_secs * pass as u64);
                tokio::time::sleep(delay).await;
            }
        }

        let mut report = RunReport {
            run_id,
            passes,
            succeeded: Vec::new(),
            failed: Vec::new(),
            exhausted: Vec::new(),
            attempts: BTreeMap::new(),
            aborted: abort.load(Ordering::SeqCst),
        };
        for unit in &units {
            report.attempts.insert(unit.id.clone(), unit.attempts);
            match unit.outcome {
                UnitOutcome::Success => report.succeeded.push(unit.id.clone()),
                UnitOutcome::PermanentFailure => report.failed.push(unit.id.clone()),
                UnitOutcome::Pending | UnitOutcome::TransientFailure => {
                    report.exhausted.push(unit.id.clone())
                }
            }
        }
        report.succeeded.sort();
        report.failed.sort();
        report.exhausted.sort();
        info!(
            run_id = %report.run_id,
            passes = report.passes,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            exhausted = report.exhausted.len(),
            aborted = report.aborted,
            "executor run finished"
        );
        report
    }

    /// One pass: batch the pending units and run the batches on a bounded
    /// worker pool. Returns the full unit list with updated outcomes.
    async fn run_pass(
        &self,
        units: Vec<WorkUnit>,
        runner: Arc<dyn UnitRunner>,
        abort: Arc<AtomicBool>,
    ) -> Vec<WorkUnit> {
        let (pending, mut settled): (Vec<_>, Vec<_>) = units
            .into_iter()
            .partition(|u| u.outcome == UnitOutcome::Pending);

        let batch_size = self.cfg.batch_size.max(1);
        let mut queue: VecDeque<Vec<WorkUnit>> = VecDeque::new();
        let mut batch = Vec::with_capacity(batch_size);
        for unit in pending {
            batch.push(unit);
            if batch.len() == batch_size {
                queue.push_back(std::mem::take(&mut batch));
            }
        }
        if !batch.is_empty() {
            queue.push_back(batch);
        }

        let n_batches = queue.len();
        let queue = Arc::new(Mutex::new(queue));
        let workers = self.cfg.effective_workers().min(n_batches.max(1));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = queue.clone();
            let factory = self.factory.clone();
            let runner = runner.clone();
            let abort = abort.clone();
            handles.push(tokio::spawn(worker_loop(queue, factory, runner, abort)));
        }

        for handle in handles {
            match handle.await {
                Ok(done) => settled.extend(done),
                Err(err) => warn!(error = %err, "executor worker panicked"),
            }
        }
        // Batches nobody picked up (abort, or a worker that lost its
        // session) stay pending for the next pass.
        let mut leftover = queue.lock().await;
        for batch in leftover.drain(..) {
            settled.extend(batch);
        }
        settled
    }
}

/// One worker: hold a single session, drain batches off the shared queue,
/// run each batch sequentially. Recycles the session after every transient
/// failure; flips the abort flag when the backend is gone.
async fn worker_loop(
    queue: Arc<Mutex<VecDeque<Vec<WorkUnit>>>>,
    factory: Arc<dyn SessionFactory>,
    runner: Arc<dyn UnitRunner>,
    abort: Arc<AtomicBool>,
) -> Vec<WorkUnit> {
    let mut done: Vec<WorkUnit> = Vec::new();
    let mut session = match open_session(&factory, &abort).await {
        Some(s) => s,
        None => return done,
    };

    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let Some(mut batch) = queue.lock().await.pop_front() else {
            break;
        };
        let mut idx = 0;
        while idx < batch.len() {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            let unit = &mut batch[idx];
            unit.attempts += 1;
            match runner.run(session.as_mut(), unit).await {
                Ok(()) => unit.outcome = UnitOutcome::Success,
                Err(UnitError::Fetch(FetchError::Transient(msg))) => {
                    warn!(unit = %unit.id, error = %msg, "transient failure; recycling session");
                    unit.outcome = UnitOutcome::Pending;
                    session.close().await;
                    match open_session(&factory, &abort).await {
                        Some(s) => session = s,
                        None => {
                            done.extend(batch);
                            return done;
                        }
                    }
                }
                Err(UnitError::Fetch(FetchError::Permanent(msg))) => {
                    warn!(unit = %unit.id, error = %msg, "permanent failure");
                    unit.outcome = UnitOutcome::PermanentFailure;
                }
                Err(UnitError::Fetch(FetchError::Unavailable(msg))) => {
                    warn!(unit = %unit.id, error = %msg, "backend unavailable; aborting run");
                    unit.outcome = UnitOutcome::Pending;
                    abort.store(true, Ordering::SeqCst);
                }
                Err(UnitError::Store(StoreError::Duplicate(msg))) => {
                    if unit.duplicate_is_success {
                        unit.outcome = UnitOutcome::Success;
                    } else {
                        warn!(unit = %unit.id, error = %msg, "duplicate rows rejected");
                        unit.outcome = UnitOutcome::PermanentFailure;
                    }
                }
                Err(UnitError::Store(StoreError::Other(err))) => {
                    warn!(unit = %unit.id, error = %err, "store failure; will retry");
                    unit.outcome = UnitOutcome::Pending;
                }
            }
            // A session that stopped responding poisons every later unit;
            // stop trusting it for this run.
            if !session.is_available() {
                abort.store(true, Ordering::SeqCst);
            }
            idx += 1;
        }
        done.extend(batch);
    }
    session.close().await;
    done
}

async fn open_session(
    factory: &Arc<dyn SessionFactory>,
    abort: &Arc<AtomicBool>,
) -> Option<Box<dyn FetchSession>> {
    match factory.open().await {
        Ok(session) => Some(session),
        Err(FetchError::Unavailable(msg)) => {
            warn!(error = %msg, "session open failed: backend unavailable");
            abort.store(true, Ordering::SeqCst);
            None
        }
        Err(err) => {
            warn!(error = %err, "session open failed; units stay pending");
            None
        }
    }
}
