//! Collaborator traits consumed by the engine.
//!
//! The scraping layer (site navigation, browser lifecycle) and the storage
//! layer (SQL schemas, column normalization) live outside this workspace;
//! the engine drives them through these object-safe async traits.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, StoreError};
use crate::window::FetchSpan;

/// Opaque row set handed between fetcher and store. Column-level
/// normalization is the collaborators' business.
pub type Rows = Vec<serde_json::Value>;

/// Sub-division of a series the collaborator fetches independently:
/// the whole table, one security code, or a batch of codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    Whole,
    Code(String),
    Codes(Vec<String>),
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Whole => f.write_str("*"),
            Partition::Code(code) => f.write_str(code),
            Partition::Codes(codes) => write!(f, "{}+{}", codes.first().map(String::as_str).unwrap_or(""), codes.len()),
        }
    }
}

/// Arguments for one fetch call: series, partition and span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub series_id: String,
    pub partition: Partition,
    pub span: FetchSpan,
}

impl FetchRequest {
    /// Stable identifier used for cache keys, ledger notes and log
    /// correlation.
    pub fn unit_id(&self) -> String {
        format!("{}:{}:{}", self.series_id, self.partition, self.span)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    Append,
    Replace,
}

/// One heavyweight fetch handle (typically a browser session). Not
/// internally parallel-safe; a worker owns exactly one at a time and
/// calls it sequentially.
#[async_trait]
pub trait FetchSession: Send {
    async fn fetch(&mut self, req: &FetchRequest) -> Result<Rows, FetchError>;

    /// Release the underlying resource. Called on every exit path,
    /// including before a transient-failure recycle.
    async fn close(&mut self);

    /// Backend health probe; `false` aborts the remainder of the run.
    fn is_available(&self) -> bool {
        true
    }
}

/// Acquires fetch sessions, one per worker batch.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError>;
}

/// Durable row storage collaborator. The engine never owns marks; it
/// re-reads them each cycle, which keeps window calculation idempotent.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn max_persisted_mark(
        &self,
        series_id: &str,
        partition: &Partition,
    ) -> anyhow::Result<Option<NaiveDate>>;

    async fn persist(
        &self,
        series_id: &str,
        rows: Rows,
        mode: PersistMode,
    ) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn unit_ids_compose_series_partition_span() {
        let req = FetchRequest {
            series_id: "quotes".into(),
            partition: Partition::Code("000001".into()),
            span: FetchSpan::Dates {
                start: NaiveDate::from_ymd_opt(2023, 8, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2023, 8, 15).unwrap(),
            },
        };
        assert_eq!(req.unit_id(), "quotes:000001:20230801..20230815");

        let req = FetchRequest {
            series_id: "indicators".into(),
            partition: Partition::Whole,
            span: FetchSpan::Quarter { year: 2023, quarter: 2 },
        };
        assert_eq!(req.unit_id(), "indicators:*:2023q2");
    }
}
