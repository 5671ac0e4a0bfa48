//! Error taxonomy shared across the engine.
//!
//! Fetch failures must be classifiable by the executor: transient
//! conditions are retried locally up to the attempt budget, permanent ones
//! surface in the final report, and an unavailable backend aborts the
//! remainder of the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network timeout, stale session, temporary backend overload.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Malformed request or unsupported series/partition combination.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
    /// The backend as a whole is dead (consistent auth/session failure).
    /// Burning further attempts against it is pointless.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        FetchError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        FetchError::Permanent(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        FetchError::Unavailable(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Natural-key constraint violation: the rows are already present.
    /// Period-end report series treat this as an idempotent no-op.
    #[error("duplicate rows: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FetchError::transient("timeout").is_transient());
        assert!(!FetchError::permanent("bad series").is_transient());
        assert!(!FetchError::unavailable("login wall").is_transient());
    }
}
