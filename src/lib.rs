//! Catalog Merge Library
//!
//! Streams records out of a persisted market-data catalog and merges any number
//! of sorted sources into size-bounded, time-ordered batches for replay.

pub mod catalog;
pub mod clock;
pub mod error;
pub mod persistence;
pub mod records;
pub mod replay;

pub use catalog::{CatalogIndex, CatalogLocation, CatalogRegistry, DataSourceConfig, DateRange};
pub use clock::{Nanos, SimClock};
pub use error::{CatalogError, CatalogResult, ErrorKind};
pub use persistence::{Batch, BatchMerger, MergeConfig};
pub use records::{DataClass, Record};
