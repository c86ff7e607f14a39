//! Catalog and merge errors.

use crate::clock::Nanos;
use std::path::PathBuf;

/// Coarse classification used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected while resolving a source, before any merge work for it begins.
    Resolution,
    /// Raised while reading partitions; fatal to the merge.
    Read,
    /// Programming errors; never recoverable.
    Usage,
    /// Consumer-side contract violations detected by the replay driver.
    Replay,
}

/// Errors raised by the catalog, the readers and the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    /// The catalog root does not exist or is not a catalog.
    CatalogNotFound { location: PathBuf },
    /// The data class is not a known record kind.
    UnknownDataClass { name: String },
    /// The instrument is not in the catalog's instrument registry.
    UnknownInstrument {
        instrument_id: String,
        location: PathBuf,
    },
    /// A partition file vanished between resolve and open.
    PartitionNotFound { path: PathBuf },
    /// A partition file or row could not be decoded.
    CorruptPartition { path: PathBuf, reason: String },
    /// A source yielded a record older than its predecessor (only with order validation).
    UnsortedSource {
        source: String,
        previous_ts: Nanos,
        ts: Nanos,
    },
    /// Underlying I/O failure.
    Io { path: PathBuf, reason: String },
    /// `advance()` was called on an exhausted cursor.
    EmptyCursor { source: String },
    /// A configuration value is out of range.
    InvalidConfig { field: String, reason: String },
    /// A batch did not move time forward.
    ForwardProgressViolation {
        batch_seq: u64,
        previous_max: Nanos,
        batch_max: Nanos,
    },
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CatalogNotFound { .. }
            | Self::UnknownDataClass { .. }
            | Self::UnknownInstrument { .. } => ErrorKind::Resolution,
            Self::PartitionNotFound { .. }
            | Self::CorruptPartition { .. }
            | Self::UnsortedSource { .. }
            | Self::Io { .. } => ErrorKind::Read,
            Self::EmptyCursor { .. } | Self::InvalidConfig { .. } => ErrorKind::Usage,
            Self::ForwardProgressViolation { .. } => ErrorKind::Replay,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptPartition {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn invalid_config(field: &str, reason: impl ToString) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CatalogNotFound { location } => {
                write!(f, "Catalog not found at '{}'", location.display())
            }
            Self::UnknownDataClass { name } => write!(f, "Unknown data class: {}", name),
            Self::UnknownInstrument {
                instrument_id,
                location,
            } => write!(
                f,
                "Unknown instrument '{}' in catalog '{}'",
                instrument_id,
                location.display()
            ),
            Self::PartitionNotFound { path } => {
                write!(f, "Partition not found: {}", path.display())
            }
            Self::CorruptPartition { path, reason } => {
                write!(f, "Corrupt partition '{}': {}", path.display(), reason)
            }
            Self::UnsortedSource {
                source,
                previous_ts,
                ts,
            } => write!(
                f,
                "Source '{}' is not sorted: ts_init {} follows {}",
                source, ts, previous_ts
            ),
            Self::Io { path, reason } => write!(f, "I/O error at '{}': {}", path.display(), reason),
            Self::EmptyCursor { source } => {
                write!(f, "advance() called on exhausted cursor for '{}'", source)
            }
            Self::InvalidConfig { field, reason } => {
                write!(f, "Invalid config '{}': {}", field, reason)
            }
            Self::ForwardProgressViolation {
                batch_seq,
                previous_max,
                batch_max,
            } => write!(
                f,
                "Batch {} max ts {} does not exceed previous max {}",
                batch_seq, batch_max, previous_max
            ),
        }
    }
}

impl std::error::Error for CatalogError {}

pub type CatalogResult<T> = Result<T, CatalogError>;
