//! One full synchronization cycle per series: ledger freshness gate,
//! window calculation from durable marks, unit construction, execution,
//! ledger update. Idempotent when upstream has nothing new.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use async_trait::async_trait;

use tidemark_cache::{CacheKey, DataCache};
use tidemark_core::{
    refresh_window, EngineConfig, FetchRequest, FetchSession, FetchWindow, Partition, PersistMode,
    Periodicity, PublishSchedule, RowStore, Rows, SeriesCatalog, SessionFactory,
};
use tidemark_ledger::{LedgerError, LedgerRecord, RunLedger};

use crate::executor::{Executor, RunReport, UnitError, UnitRunner, WorkUnit};

/// Supplies the sub-partitions (security codes, code batches) a
/// partitioned series is fetched by. Unpartitioned series use
/// [`Partition::Whole`].
#[async_trait]
pub trait PartitionSource: Send + Sync {
    async fn partitions(&self, series_id: &str) -> anyhow::Result<Vec<Partition>>;
}

/// Partition source for series fetched whole.
pub struct WholeSeries;

#[async_trait]
impl PartitionSource for WholeSeries {
    async fn partitions(&self, _series_id: &str) -> anyhow::Result<Vec<Partition>> {
        Ok(vec![Partition::Whole])
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown series: {0}")]
    UnknownSeries(String),
    /// Without the ledger, freshness cannot be decided safely.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("reading persisted marks: {0}")]
    Marks(#[source] anyhow::Error),
    #[error("listing partitions: {0}")]
    Partitions(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Ledger says a recent run completed; nothing was done.
    SkippedFresh,
    /// Windows were empty: local data already covers now.
    UpToDate,
    /// All units settled successfully.
    Completed,
    /// Permanent failures, exhausted retries, or an aborted backend.
    Failed,
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub series_id: String,
    pub outcome: SyncOutcome,
    /// Executor accounting; absent when no units ran.
    pub run: Option<RunReport>,
}

pub struct Synchronizer {
    catalog: SeriesCatalog,
    cfg: EngineConfig,
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn RowStore>,
    partitions: Arc<dyn PartitionSource>,
    cache: Arc<DataCache>,
    ledger: RunLedger,
}

impl Synchronizer {
    pub fn new(
        catalog: SeriesCatalog,
        cfg: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn RowStore>,
        partitions: Arc<dyn PartitionSource>,
        cache: Arc<DataCache>,
        ledger: RunLedger,
    ) -> Self {
        Self {
            catalog,
            cfg,
            factory,
            store,
            partitions,
            cache,
            ledger,
        }
    }

    /// Run one cycle for `series_id` at the current wall clock.
    pub async fn synchronize(&self, series_id: &str) -> Result<SyncReport, SyncError> {
        self.synchronize_at(series_id, Local::now().naive_local()).await
    }

    /// Run one cycle with an explicit `now` (callers that replay history,
    /// tests).
    pub async fn synchronize_at(
        &self,
        series_id: &str,
        now: NaiveDateTime,
    ) -> Result<SyncReport, SyncError> {
        let entry = self
            .catalog
            .get(series_id)
            .ok_or_else(|| SyncError::UnknownSeries(series_id.to_string()))?;

        // Freshness gate. A ledger we cannot read is fatal: skipping work
        // on a guess is worse than failing loudly.
        let record = self.ledger.load(series_id)?;
        let threshold = Duration::from_secs(self.cfg.ledger_freshness_hours.max(0) as u64 * 3600);
        if record.is_fresh(now, threshold) {
            info!(series = series_id, "ledger record is fresh; skipping");
            return Ok(SyncReport {
                series_id: series_id.to_string(),
                outcome: SyncOutcome::SkippedFresh,
                run: None,
            });
        }

        let spec = entry.spec();
        let partitions = if entry.partitioned {
            self.partitions
                .partitions(series_id)
                .await
                .map_err(SyncError::Partitions)?
        } else {
            vec![Partition::Whole]
        };

        // Windows are recomputed from storage marks every cycle; a crash
        // re-derives identical units on the next run.
        let mut units: Vec<WorkUnit> = Vec::new();
        for partition in partitions {
            let mark = self
                .store
                .max_persisted_mark(series_id, &partition)
                .await
                .map_err(SyncError::Marks)?;
            let Some(window) = refresh_window(&spec, mark, now.date(), None) else {
                debug!(series = series_id, partition = %partition, "no refresh needed");
                continue;
            };
            for span in window.spans() {
                units.push(WorkUnit::new(
                    FetchRequest {
                        series_id: series_id.to_string(),
                        partition: partition.clone(),
                        span,
                    },
                    entry.duplicate_is_success,
                ));
            }
            if matches!(window, FetchWindow::Full) {
                debug!(series = series_id, partition = %partition, "static series first fetch");
            }
        }

        if units.is_empty() {
            self.ledger
                .save(series_id, &LedgerRecord::completed(0, now))?;
            return Ok(SyncReport {
                series_id: series_id.to_string(),
                outcome: SyncOutcome::UpToDate,
                run: None,
            });
        }

        info!(series = series_id, units = units.len(), "synchronize cycle starting");
        let runner = Arc::new(SyncUnitRunner {
            store: self.store.clone(),
            cache: self.cache.clone(),
            schedule: entry.schedule(),
            mode: if entry.periodicity == Periodicity::Static {
                PersistMode::Replace
            } else {
                PersistMode::Append
            },
            now,
        });
        let executor = Executor::new(self.factory.clone(), self.cfg.clone());
        let run = executor.run(units, runner).await;

        let outcome = if run.is_complete() {
            SyncOutcome::Completed
        } else {
            SyncOutcome::Failed
        };
        let record = if run.is_complete() {
            LedgerRecord::completed(run.passes, now)
        } else {
            LedgerRecord::failed(run.passes, now, failure_note(&run))
        };
        self.ledger.save(series_id, &record)?;

        Ok(SyncReport {
            series_id: series_id.to_string(),
            outcome,
            run: Some(run),
        })
    }
}

/// Diagnostic note for the ledger: which units did not make it.
fn failure_note(run: &RunReport) -> String {
    const MAX_LISTED: usize = 20;
    let mut parts: Vec<String> = Vec::new();
    if run.aborted {
        parts.push("aborted: backend unavailable".to_string());
    }
    let mut failing: Vec<&str> = run
        .failed
        .iter()
        .chain(run.exhausted.iter())
        .map(String::as_str)
        .collect();
    failing.sort_unstable();
    let shown = failing.len().min(MAX_LISTED);
    if shown > 0 {
        let mut listed = failing[..shown].join(", ");
        if failing.len() > shown {
            listed.push_str(&format!(" (+{} more)", failing.len() - shown));
        }
        parts.push(format!("failing units: {listed}"));
    }
    parts.join("; ")
}

/// Fetch-and-persist for one unit, with cache read-through: an unexpired
/// entry replays cached rows without touching the backend; fresh fetches
/// overwrite the entry.
struct SyncUnitRunner {
    store: Arc<dyn RowStore>,
    cache: Arc<DataCache>,
    schedule: PublishSchedule,
    mode: PersistMode,
    now: NaiveDateTime,
}

impl SyncUnitRunner {
    fn cache_key(req: &FetchRequest) -> CacheKey {
        CacheKey::new("fetch")
            .arg("series", &req.series_id)
            .arg("partition", &req.partition)
            .arg("span", &req.span)
    }
}

#[async_trait]
impl UnitRunner for SyncUnitRunner {
    async fn run(&self, session: &mut dyn FetchSession, unit: &WorkUnit) -> Result<(), UnitError> {
        let key = Self::cache_key(&unit.request);
        let cached: Option<Rows> = if self.cache.is_expired(&key, self.now, &self.schedule) {
            None
        } else {
            self.cache.get_json(&key)
        };
        let rows = match cached {
            Some(rows) => {
                debug!(unit = %unit.id, "cache hit; skipping fetch");
                rows
            }
            None => {
                let rows = session.fetch(&unit.request).await?;
                // Cache write failures cost a refetch later, nothing more.
                if let Err(err) = self.cache.put_json(&key, &rows) {
                    tracing::warn!(unit = %unit.id, error = %err, "cache write failed");
                }
                rows
            }
        };
        if rows.is_empty() {
            return Ok(());
        }
        let n = self
            .store
            .persist(&unit.request.series_id, rows, self.mode)
            .await?;
        debug!(unit = %unit.id, rows = n, "rows persisted");
        Ok(())
    }
}
