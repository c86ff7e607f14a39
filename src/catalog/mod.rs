//! Persisted Data Catalog
//!
//! A catalog is a directory holding an instrument registry and one SQLite file
//! per partition:
//!
//! ```text
//! <root>/
//!   instruments.json
//!   data/
//!     <data_class>/
//!       <instrument_id>/part-00000.sqlite   # instrument-bound partitions
//!       part-00000.sqlite                   # class-wide partitions (no instrument)
//! ```
//!
//! Partitions are written pre-sorted by `ts_init`, and file names are assigned in
//! time order, so reading them in name order yields one ascending stream per source.

pub mod index;
pub mod instruments;
pub mod registry;
pub mod schema;
pub mod writer;

pub use index::CatalogIndex;
pub use instruments::{Instrument, InstrumentRegistry};
pub use registry::CatalogRegistry;
pub use writer::CatalogWriter;

use crate::clock::Nanos;
use crate::records::{DataClass, InstrumentId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Location of a catalog root. Used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogLocation(PathBuf);

impl CatalogLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CatalogLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for CatalogLocation {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for CatalogLocation {
    fn from(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl From<&str> for CatalogLocation {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

impl From<String> for CatalogLocation {
    fn from(path: String) -> Self {
        Self(PathBuf::from(path))
    }
}

/// Inclusive `ts_init` bounds. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<Nanos>,
    #[serde(default)]
    pub end: Option<Nanos>,
}

impl DateRange {
    pub fn new(start: Option<Nanos>, end: Option<Nanos>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    #[inline]
    pub fn contains(&self, ts: Nanos) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }

    /// True when `[min_ts, max_ts]` lies entirely inside the range.
    pub fn covers(&self, min_ts: Nanos, max_ts: Nanos) -> bool {
        self.contains(min_ts) && self.contains(max_ts)
    }

    /// True when `[min_ts, max_ts]` shares at least one instant with the range.
    pub fn overlaps(&self, min_ts: Nanos, max_ts: Nanos) -> bool {
        self.start.map_or(true, |s| max_ts >= s) && self.end.map_or(true, |e| min_ts <= e)
    }

    /// SQL bounds with open sides widened to the full i64 range.
    pub(crate) fn sql_bounds(&self) -> (i64, i64) {
        (self.start.unwrap_or(i64::MIN), self.end.unwrap_or(i64::MAX))
    }
}

/// Descriptor of one logical stream. Identity is every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub catalog_location: CatalogLocation,
    /// Record kind name, e.g. `quote_tick`. Validated at resolve time.
    pub data_class: String,
    #[serde(default)]
    pub instrument_id: Option<InstrumentId>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

impl DataSourceConfig {
    pub fn new(catalog_location: impl Into<CatalogLocation>, data_class: DataClass) -> Self {
        Self {
            catalog_location: catalog_location.into(),
            data_class: data_class.as_str().to_string(),
            instrument_id: None,
            client_id: None,
            date_range: None,
        }
    }

    pub fn with_instrument(mut self, instrument_id: impl Into<InstrumentId>) -> Self {
        self.instrument_id = Some(instrument_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Short human-readable label for logs and errors.
    pub fn label(&self) -> String {
        match (&self.instrument_id, &self.client_id) {
            (Some(instrument), _) => format!("{}[{}]", self.data_class, instrument),
            (None, Some(client)) => format!("{}@{}", self.data_class, client),
            (None, None) => self.data_class.clone(),
        }
    }
}

/// One partition file, narrowed to the rows a source reads from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    pub data_class: DataClass,
    pub instrument_id: Option<InstrumentId>,
    /// First row id to read (inclusive).
    pub first_row: i64,
    /// Last row id to read (inclusive).
    pub last_row: i64,
    /// `ts_init` bounds the reader applies while reading.
    pub filter: DateRange,
}

impl Partition {
    pub fn row_span(&self) -> u64 {
        (self.last_row - self.first_row + 1).max(0) as u64
    }
}

/// Directory name used for an instrument inside a data class directory.
///
/// Path separators and `%` are percent-escaped, so distinct ids never share a
/// directory.
pub fn instrument_dir_name(instrument_id: &str) -> String {
    let mut name = String::with_capacity(instrument_id.len());
    for c in instrument_id.chars() {
        match c {
            '%' | '/' | '\\' | ':' => name.push_str(&format!("%{:02X}", c as u32)),
            _ => name.push(c),
        }
    }
    name
}
