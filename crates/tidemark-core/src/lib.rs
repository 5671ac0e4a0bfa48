//! Core types for the tidemark synchronization engine: periodicity model,
//! refresh-window calculation, series catalog and the collaborator traits
//! the engine drives (fetch sessions and row stores).

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod period;
pub mod util;
pub mod window;

pub use catalog::{SeriesCatalog, SeriesEntry};
pub use config::{load_config, EngineConfig};
pub use error::{FetchError, StoreError};
pub use fetch::{
    FetchRequest, FetchSession, Partition, PersistMode, RowStore, Rows, SessionFactory,
};
pub use period::{Periodicity, PublishSchedule};
pub use window::{refresh_window, FetchSpan, FetchWindow, SeriesSpec};
