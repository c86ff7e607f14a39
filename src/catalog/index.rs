//! Catalog Index
//!
//! Resolves a [`DataSourceConfig`] to the ordered partitions that make up its
//! stream. Resolution is read-only; the instrument registry is loaded once at
//! open and partition listings are memoized per `(data_class, instrument)` for the
//! lifetime of the index.

use crate::catalog::instruments::InstrumentRegistry;
use crate::catalog::schema::{
    parse_partition_number, DATA_DIR, META_DATA_CLASS, META_INSTRUMENT_ID, META_SCHEMA_VERSION,
    SCHEMA_VERSION,
};
use crate::catalog::{instrument_dir_name, CatalogLocation, DataSourceConfig, DateRange, Partition};
use crate::clock::Nanos;
use crate::error::{CatalogError, CatalogResult};
use crate::records::{DataClass, InstrumentId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whole-file facts gathered once per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub path: PathBuf,
    pub first_row: i64,
    pub last_row: i64,
    pub min_ts: Nanos,
    pub max_ts: Nanos,
    pub row_count: u64,
}

type ListingKey = (DataClass, Option<InstrumentId>);

/// Read-only view of one catalog root.
pub struct CatalogIndex {
    location: CatalogLocation,
    instruments: InstrumentRegistry,
    listings: Mutex<HashMap<ListingKey, Arc<Vec<PartitionMeta>>>>,
}

impl CatalogIndex {
    /// Open a catalog root. Fails with `CatalogNotFound` if it is not a catalog.
    pub fn open(location: impl Into<CatalogLocation>) -> CatalogResult<Self> {
        let location = location.into();
        if !location.path().is_dir() {
            return Err(CatalogError::CatalogNotFound {
                location: location.path().to_path_buf(),
            });
        }
        let instruments = InstrumentRegistry::load(location.path())?;

        info!(
            location = %location,
            instruments = instruments.len(),
            "Catalog opened"
        );

        Ok(Self {
            location,
            instruments,
            listings: Mutex::new(HashMap::new()),
        })
    }

    pub fn location(&self) -> &CatalogLocation {
        &self.location
    }

    pub fn instruments(&self) -> &InstrumentRegistry {
        &self.instruments
    }

    /// Resolve a source to its partitions, in read order.
    ///
    /// With a date range, row ranges are narrowed to the matching rows and
    /// partitions without any are dropped. Partitions are never re-sorted.
    pub fn resolve(&self, config: &DataSourceConfig) -> CatalogResult<Vec<Partition>> {
        let data_class: DataClass = config.data_class.parse()?;

        if let Some(instrument_id) = &config.instrument_id {
            if !self.instruments.contains(instrument_id) {
                return Err(CatalogError::UnknownInstrument {
                    instrument_id: instrument_id.clone(),
                    location: self.location.path().to_path_buf(),
                });
            }
        }

        let listing = self.listing(data_class, config.instrument_id.as_ref())?;
        let range = config.date_range.unwrap_or_default();

        let mut partitions = Vec::with_capacity(listing.len());
        for meta in listing.iter() {
            if let Some((first_row, last_row)) = narrow_rows(meta, &range)? {
                partitions.push(Partition {
                    path: meta.path.clone(),
                    data_class,
                    instrument_id: config.instrument_id.clone(),
                    first_row,
                    last_row,
                    filter: range,
                });
            }
        }

        debug!(
            source = %config.label(),
            listed = listing.len(),
            resolved = partitions.len(),
            "Source resolved"
        );

        Ok(partitions)
    }

    /// Memoized partition listing for one `(data_class, instrument)` pair.
    pub fn listing(
        &self,
        data_class: DataClass,
        instrument_id: Option<&InstrumentId>,
    ) -> CatalogResult<Arc<Vec<PartitionMeta>>> {
        let key = (data_class, instrument_id.cloned());
        if let Some(cached) = self.listings.lock().get(&key) {
            return Ok(Arc::clone(cached));
        }

        let dir = self.partition_dir(data_class, instrument_id.map(|s| s.as_str()));
        let instrument_id = instrument_id.map(|s| s.as_str());
        let mut metas = Vec::new();
        for path in list_partition_files(&dir)? {
            if let Some(meta) = scan_partition(&path, data_class, instrument_id)? {
                metas.push(meta);
            }
        }

        if instrument_id.is_none() && metas.is_empty() {
            let instrument_dirs = count_subdirs(&dir)?;
            if instrument_dirs > 0 {
                warn!(
                    dir = %dir.display(),
                    instrument_dirs,
                    "Class-wide source has no partitions; per-instrument data needs an instrument_id"
                );
            }
        }

        debug!(
            dir = %dir.display(),
            partitions = metas.len(),
            "Partition listing cached"
        );

        let metas = Arc::new(metas);
        self.listings.lock().insert(key, Arc::clone(&metas));
        Ok(metas)
    }

    /// Directory holding the partitions of one stream.
    pub fn partition_dir(&self, data_class: DataClass, instrument_id: Option<&str>) -> PathBuf {
        let class_dir = self
            .location
            .path()
            .join(DATA_DIR)
            .join(data_class.as_str());
        match instrument_id {
            Some(id) => class_dir.join(instrument_dir_name(id)),
            None => class_dir,
        }
    }
}

/// Open a partition read-only, distinguishing a vanished file from a corrupt one.
pub(crate) fn open_read_only(path: &Path) -> CatalogResult<Connection> {
    if !path.is_file() {
        return Err(CatalogError::PartitionNotFound {
            path: path.to_path_buf(),
        });
    }
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| CatalogError::corrupt(path, e))
}

/// Partition files in a directory, ordered by partition number.
fn list_partition_files(dir: &Path) -> CatalogResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| CatalogError::io(dir, e))?;

    let mut numbered = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CatalogError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_partition_number);
        if let Some(n) = number {
            numbered.push((n, path));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

fn count_subdirs(dir: &Path) -> CatalogResult<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = std::fs::read_dir(dir).map_err(|e| CatalogError::io(dir, e))?;
    let mut count = 0;
    for entry in entries {
        if entry.map_err(|e| CatalogError::io(dir, e))?.path().is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

fn read_meta(conn: &Connection, path: &Path, key: &str) -> CatalogResult<Option<String>> {
    conn.query_row(
        "SELECT value FROM partition_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| CatalogError::corrupt(path, e))
}

/// Read the partition's declared class, instrument and row/time bounds.
/// Empty partitions yield `None`.
fn scan_partition(
    path: &Path,
    data_class: DataClass,
    instrument_id: Option<&str>,
) -> CatalogResult<Option<PartitionMeta>> {
    let conn = open_read_only(path)?;

    match read_meta(&conn, path, META_DATA_CLASS)? {
        Some(ref declared) if declared == data_class.as_str() => {}
        Some(declared) => {
            return Err(CatalogError::corrupt(
                path,
                format!("declares data class '{}', expected '{}'", declared, data_class),
            ))
        }
        None => return Err(CatalogError::corrupt(path, "missing data_class metadata")),
    }

    let declared_instrument = read_meta(&conn, path, META_INSTRUMENT_ID)?;
    if declared_instrument.as_deref() != instrument_id {
        return Err(CatalogError::corrupt(
            path,
            format!(
                "declares instrument {:?}, expected {:?}",
                declared_instrument, instrument_id
            ),
        ));
    }

    if let Some(version) = read_meta(&conn, path, META_SCHEMA_VERSION)? {
        if version != SCHEMA_VERSION {
            return Err(CatalogError::corrupt(
                path,
                format!("unsupported schema version '{}'", version),
            ));
        }
    }

    let (first_row, last_row, min_ts, max_ts, count): (
        Option<i64>,
        Option<i64>,
        Option<i64>,
        Option<i64>,
        i64,
    ) = conn
        .query_row(
            "SELECT MIN(row_id), MAX(row_id), MIN(ts_init), MAX(ts_init), COUNT(*) FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .map_err(|e| CatalogError::corrupt(path, e))?;

    match (first_row, last_row, min_ts, max_ts) {
        (Some(first_row), Some(last_row), Some(min_ts), Some(max_ts)) if count > 0 => {
            Ok(Some(PartitionMeta {
                path: path.to_path_buf(),
                first_row,
                last_row,
                min_ts,
                max_ts,
                row_count: count as u64,
            }))
        }
        _ => Ok(None),
    }
}

/// Row bounds of a partition restricted to a date range.
fn narrow_rows(meta: &PartitionMeta, range: &DateRange) -> CatalogResult<Option<(i64, i64)>> {
    if range.covers(meta.min_ts, meta.max_ts) {
        return Ok(Some((meta.first_row, meta.last_row)));
    }
    if !range.overlaps(meta.min_ts, meta.max_ts) {
        return Ok(None);
    }

    let conn = open_read_only(&meta.path)?;
    let (lo, hi) = range.sql_bounds();
    let bounds: (Option<i64>, Option<i64>) = conn
        .query_row(
            "SELECT MIN(row_id), MAX(row_id) FROM records WHERE ts_init >= ?1 AND ts_init <= ?2",
            params![lo, hi],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| CatalogError::corrupt(&meta.path, e))?;

    Ok(match bounds {
        (Some(first), Some(last)) => Some((first, last)),
        _ => None,
    })
}
