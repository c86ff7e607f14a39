//! Partition Reader
//!
//! Lazy chunked reads over the resolved partitions of one source. Chunks span
//! partition boundaries transparently; at most one partition file is open at a
//! time and it is closed as soon as it is drained.

use crate::catalog::index::open_read_only;
use crate::catalog::schema::META_DATA_CLASS;
use crate::catalog::Partition;
use crate::clock::Nanos;
use crate::error::{CatalogError, CatalogResult};
use crate::records::Record;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Up to `read_num_rows` records of one source, ascending by `ts_init`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordChunk {
    records: VecDeque<Record>,
}

impl RecordChunk {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn front(&self) -> Option<&Record> {
        self.records.front()
    }

    pub fn pop_front(&mut self) -> Option<Record> {
        self.records.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn first_ts(&self) -> Option<Nanos> {
        self.records.front().map(Record::ts_init)
    }

    pub fn last_ts(&self) -> Option<Nanos> {
        self.records.back().map(Record::ts_init)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Pull interface producing the chunks of one source.
///
/// Sources are finite and restartable. A returned chunk is never empty;
/// `Ok(None)` marks the end of the source.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>>;

    /// Restart from the first record.
    fn reset(&mut self) -> CatalogResult<()>;

    /// Label used in logs and errors.
    fn name(&self) -> &str;
}

// =============================================================================
// SQLITE PARTITIONS
// =============================================================================

pub struct PartitionReader {
    name: String,
    partitions: Vec<Partition>,
    read_num_rows: usize,
    /// Index of the partition being read.
    current: usize,
    /// Next row id to read in the current partition.
    next_row: i64,
    conn: Option<Connection>,
    rows_read: u64,
}

impl PartitionReader {
    pub fn new(name: impl Into<String>, partitions: Vec<Partition>, read_num_rows: usize) -> Self {
        Self {
            name: name.into(),
            partitions,
            read_num_rows: read_num_rows.max(1),
            current: 0,
            next_row: 0,
            conn: None,
            rows_read: 0,
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// True while a partition file handle is held.
    pub fn has_open_partition(&self) -> bool {
        self.conn.is_some()
    }

    fn close_current(&mut self) {
        if self.conn.take().is_some() {
            trace!(source = %self.name, partition = self.current, "Partition closed");
        }
    }
}

impl ChunkSource for PartitionReader {
    fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>> {
        let mut records = Vec::with_capacity(self.read_num_rows);

        while records.len() < self.read_num_rows {
            let Some(partition) = self.partitions.get(self.current) else {
                break;
            };

            if self.conn.is_none() {
                let conn = open_read_only(&partition.path)?;
                check_data_class(&conn, partition)?;
                self.conn = Some(conn);
                self.next_row = partition.first_row;
                debug!(
                    source = %self.name,
                    path = %partition.path.display(),
                    rows = partition.row_span(),
                    "Partition opened"
                );
            }
            let Some(conn) = self.conn.as_ref() else {
                break;
            };

            let wanted = self.read_num_rows - records.len();
            let before = records.len();
            let last_row = read_rows(conn, partition, self.next_row, wanted, &mut records)?;
            let read = records.len() - before;

            match last_row {
                Some(row) if read == wanted && row < partition.last_row => {
                    self.next_row = row + 1;
                }
                _ => {
                    self.close_current();
                    self.current += 1;
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        self.rows_read += records.len() as u64;
        trace!(source = %self.name, rows = records.len(), "Chunk read");
        Ok(Some(RecordChunk::new(records)))
    }

    fn reset(&mut self) -> CatalogResult<()> {
        self.close_current();
        self.current = 0;
        self.next_row = 0;
        self.rows_read = 0;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn check_data_class(conn: &Connection, partition: &Partition) -> CatalogResult<()> {
    let declared: Option<String> = conn
        .query_row(
            "SELECT value FROM partition_meta WHERE key = ?1",
            params![META_DATA_CLASS],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CatalogError::corrupt(&partition.path, e))?;

    match declared {
        Some(declared) if declared == partition.data_class.as_str() => Ok(()),
        Some(declared) => Err(CatalogError::corrupt(
            &partition.path,
            format!(
                "declares data class '{}', expected '{}'",
                declared, partition.data_class
            ),
        )),
        None => Err(CatalogError::corrupt(&partition.path, "missing data_class metadata")),
    }
}

/// Append up to `limit` rows starting at `from_row`. Returns the last row id read.
fn read_rows(
    conn: &Connection,
    partition: &Partition,
    from_row: i64,
    limit: usize,
    out: &mut Vec<Record>,
) -> CatalogResult<Option<i64>> {
    let corrupt = |e: rusqlite::Error| CatalogError::corrupt(&partition.path, e);
    let (lo, hi) = partition.filter.sql_bounds();

    let mut stmt = conn
        .prepare_cached(
            "SELECT row_id, ts_init, payload FROM records \
             WHERE row_id >= ?1 AND row_id <= ?2 AND ts_init >= ?3 AND ts_init <= ?4 \
             ORDER BY row_id LIMIT ?5",
        )
        .map_err(corrupt)?;
    let mut rows = stmt
        .query(params![from_row, partition.last_row, lo, hi, limit as i64])
        .map_err(corrupt)?;

    let mut last_row = None;
    while let Some(row) = rows.next().map_err(corrupt)? {
        let row_id: i64 = row.get(0).map_err(corrupt)?;
        let ts_init: i64 = row.get(1).map_err(corrupt)?;
        let payload: String = row.get(2).map_err(corrupt)?;

        let record = partition.data_class.decode(&payload).map_err(|e| {
            CatalogError::corrupt(&partition.path, format!("row {}: {}", row_id, e))
        })?;
        if record.ts_init() != ts_init {
            return Err(CatalogError::corrupt(
                &partition.path,
                format!(
                    "row {}: ts_init column {} disagrees with payload {}",
                    row_id,
                    ts_init,
                    record.ts_init()
                ),
            ));
        }

        out.push(record);
        last_row = Some(row_id);
    }

    Ok(last_row)
}

// =============================================================================
// IN-MEMORY SOURCES
// =============================================================================

/// Chunk source over records already in memory.
#[derive(Debug, Clone)]
pub struct VecChunkSource {
    name: String,
    records: Vec<Record>,
    read_num_rows: usize,
    position: usize,
}

impl VecChunkSource {
    pub fn new(name: impl Into<String>, records: Vec<Record>, read_num_rows: usize) -> Self {
        Self {
            name: name.into(),
            records,
            read_num_rows: read_num_rows.max(1),
            position: 0,
        }
    }
}

impl ChunkSource for VecChunkSource {
    fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>> {
        if self.position >= self.records.len() {
            return Ok(None);
        }
        let end = (self.position + self.read_num_rows).min(self.records.len());
        let chunk = self.records[self.position..end].to_vec();
        self.position = end;
        Ok(Some(RecordChunk::new(chunk)))
    }

    fn reset(&mut self) -> CatalogResult<()> {
        self.position = 0;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
