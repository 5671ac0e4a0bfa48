//! Series catalog: the data-driven replacement for one refresher class per
//! data source.
//!
//! Each entry carries everything the engine needs to schedule a series:
//! periodicity, default start, lookback, publish time, partitioning and
//! duplicate-write policy. Sources differ only by catalog data, never by
//! subclassing.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::period::{Periodicity, PublishSchedule, DEFAULT_PUBLISH_TIME};
use crate::window::SeriesSpec;

/// Market epoch used when a series does not declare its own lower bound.
pub const MARKET_START: (i32, u32, u32) = (1990, 12, 19);

fn default_start() -> NaiveDate {
    let (y, m, d) = MARKET_START;
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn default_publish_time() -> NaiveTime {
    let (h, m, s) = DEFAULT_PUBLISH_TIME;
    NaiveTime::from_hms_opt(h, m, s).expect("valid time")
}

fn default_lookback() -> u32 {
    2
}

fn default_duplicate_is_success() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub id: String,
    pub periodicity: Periodicity,
    #[serde(default = "default_start")]
    pub default_start: NaiveDate,
    #[serde(default = "default_lookback")]
    pub lookback_periods: u32,
    /// Local time-of-day the upstream source publishes.
    #[serde(default = "default_publish_time")]
    pub publish_time: NaiveTime,
    /// Whether the series is fetched per security code rather than whole.
    #[serde(default)]
    pub partitioned: bool,
    /// Constraint violations on persist count as already-present rows.
    /// True for period-end report series without natural-key uniqueness.
    #[serde(default = "default_duplicate_is_success")]
    pub duplicate_is_success: bool,
}

impl SeriesEntry {
    pub fn spec(&self) -> SeriesSpec {
        SeriesSpec {
            series_id: self.id.clone(),
            periodicity: self.periodicity,
            default_start: self.default_start,
            lookback_periods: self.lookback_periods,
        }
    }

    pub fn schedule(&self) -> PublishSchedule {
        PublishSchedule::new(self.periodicity, self.publish_time)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    series: Vec<SeriesEntry>,
}

/// All series known to this deployment, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SeriesCatalog {
    entries: BTreeMap<String, SeriesEntry>,
}

impl SeriesCatalog {
    pub fn from_entries(entries: impl IntoIterator<Item = SeriesEntry>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            if entry.id.is_empty() {
                bail!("series entry with empty id");
            }
            if let Some(prev) = map.insert(entry.id.clone(), entry) {
                bail!("duplicate series id: {}", prev.id);
            }
        }
        Ok(Self { entries: map })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading series catalog at {}", path.display()))?;
        let file: CatalogFile = toml::from_str(&contents)
            .with_context(|| format!("parsing series catalog at {}", path.display()))?;
        Self::from_entries(file.series)
    }

    pub fn get(&self, series_id: &str) -> Option<&SeriesEntry> {
        self.entries.get(series_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
