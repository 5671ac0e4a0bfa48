//! The tidemark engine: a retry-until-complete executor over batched
//! fetch units, and the synchronizer that runs one full refresh cycle per
//! series (ledger gate, window calculation, execution, ledger update).

pub mod executor;
pub mod sync;

pub use executor::{Executor, RunReport, UnitError, UnitOutcome, UnitRunner, WorkUnit};
pub use sync::{
    PartitionSource, SyncError, SyncOutcome, SyncReport, Synchronizer, WholeSeries,
};
