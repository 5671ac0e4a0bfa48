//! Engine configuration: TOML file with environment overrides.
//!
//! Defaults mirror the tuning the upstream jobs converged on: twenty
//! retry passes, workers sized to half the cores (each worker holds a
//! whole browser session), a three-second backoff base and a twelve-hour
//! ledger freshness threshold.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::env_parse;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum retry passes over still-pending work units.
    pub max_attempts: u32,
    /// Work units per batch; one batch runs sequentially on one session.
    pub batch_size: usize,
    /// Worker cap. `0` means `max(1, cores / 2)`.
    pub max_workers: usize,
    /// Linear backoff base between passes, in seconds.
    pub backoff_base_secs: u64,
    /// A Completed ledger record younger than this skips the cycle.
    pub ledger_freshness_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            batch_size: 8,
            max_workers: 0,
            backoff_base_secs: 3,
            ledger_freshness_hours: 12,
        }
    }
}

impl EngineConfig {
    /// Resolved worker count: each worker holds a heavyweight session, so
    /// the default stays well under the core count.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cores / 2).max(1)
    }

    /// Apply `TIDEMARK_*` environment overrides on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("TIDEMARK_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("TIDEMARK_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("TIDEMARK_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = env_parse("TIDEMARK_BACKOFF_BASE_SECS") {
            self.backoff_base_secs = v;
        }
        if let Some(v) = env_parse("TIDEMARK_LEDGER_FRESHNESS_HOURS") {
            self.ledger_freshness_hours = v;
        }
        self
    }
}

/// Load engine configuration from a TOML file, then apply env overrides.
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine config at {path}"))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parsing engine config at {path}"))?;
    Ok(cfg.with_env_overrides())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_attempts, 20);
        assert_eq!(cfg.ledger_freshness_hours, 12);
        assert!(cfg.effective_workers() >= 1);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str("max_attempts = 3\nbatch_size = 2\n").unwrap();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.batch_size, 2);
        assert_eq!(cfg.backoff_base_secs, 3);
    }

    #[test]
    fn env_overrides_win() {
        std::env::set_var("TIDEMARK_MAX_ATTEMPTS", "5");
        let cfg = EngineConfig::default().with_env_overrides();
        assert_eq!(cfg.max_attempts, 5);
        std::env::remove_var("TIDEMARK_MAX_ATTEMPTS");
    }
}
