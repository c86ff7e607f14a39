//! Catalog Writer
//!
//! Ingestion-side helper that lays records down as pre-sorted partitions. Each
//! call appends new partition files after the existing ones, so callers must
//! write a stream in time order across calls.

use crate::catalog::instruments::{Instrument, InstrumentRegistry};
use crate::catalog::schema::{
    parse_partition_number, partition_file_name, DATA_DIR, INSTRUMENTS_FILE, META_DATA_CLASS,
    META_INSTRUMENT_ID, META_SCHEMA_VERSION, PARTITION_SCHEMA, SCHEMA_VERSION,
};
use crate::catalog::instrument_dir_name;
use crate::clock::Nanos;
use crate::error::{CatalogError, CatalogResult};
use crate::records::{DataClass, Record};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct CatalogWriter {
    root: PathBuf,
    instruments: InstrumentRegistry,
    max_rows_per_partition: Option<usize>,
}

impl CatalogWriter {
    /// Open a catalog for writing, creating the root and registry if needed.
    pub fn create(root: impl AsRef<Path>) -> CatalogResult<Self> {
        let root = root.as_ref().to_path_buf();
        let data_dir = root.join(DATA_DIR);
        std::fs::create_dir_all(&data_dir).map_err(|e| CatalogError::io(&data_dir, e))?;

        let instruments = if root.join(INSTRUMENTS_FILE).is_file() {
            InstrumentRegistry::load(&root)?
        } else {
            let registry = InstrumentRegistry::default();
            registry.save(&root)?;
            registry
        };

        Ok(Self {
            root,
            instruments,
            max_rows_per_partition: None,
        })
    }

    /// Split writes into files of at most `rows` records.
    pub fn with_max_rows_per_partition(mut self, rows: usize) -> Self {
        self.max_rows_per_partition = Some(rows.max(1));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instruments(&self) -> &InstrumentRegistry {
        &self.instruments
    }

    /// Register an instrument and persist the registry.
    pub fn add_instrument(&mut self, instrument: Instrument) -> CatalogResult<()> {
        self.instruments.insert(instrument);
        self.instruments.save(&self.root)
    }

    /// Append `records` as one or more new partitions of a stream.
    ///
    /// Records are stably sorted by `ts_init` before writing. Returns the paths
    /// of the files written; an empty input writes nothing.
    pub fn write_partition(
        &mut self,
        data_class: DataClass,
        instrument_id: Option<&str>,
        records: &[Record],
    ) -> CatalogResult<Vec<PathBuf>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(id) = instrument_id {
            if !self.instruments.contains(id) {
                return Err(CatalogError::UnknownInstrument {
                    instrument_id: id.to_string(),
                    location: self.root.clone(),
                });
            }
        }
        if let Some(other) = records.iter().find(|r| r.data_class() != data_class) {
            return Err(CatalogError::invalid_config(
                "records",
                format!("{} record in a {} partition", other.data_class(), data_class),
            ));
        }

        let mut sorted: Vec<&Record> = records.iter().collect();
        sorted.sort_by_key(|r| r.ts_init());

        let dir = self.stream_dir(data_class, instrument_id);
        std::fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;

        let (mut next_number, previous_max) = last_partition(&dir)?;
        if let Some(previous_max) = previous_max {
            if sorted[0].ts_init() < previous_max {
                warn!(
                    dir = %dir.display(),
                    previous_max,
                    first_ts = sorted[0].ts_init(),
                    "New partition overlaps previous partition; stream will not be globally sorted"
                );
            }
        }

        let chunk_rows = self.max_rows_per_partition.unwrap_or(sorted.len());
        let mut written = Vec::new();
        for chunk in sorted.chunks(chunk_rows) {
            let path = dir.join(partition_file_name(next_number));
            write_file(&path, data_class, instrument_id, chunk)?;
            written.push(path);
            next_number += 1;
        }

        info!(
            data_class = %data_class,
            instrument = instrument_id.unwrap_or("-"),
            records = sorted.len(),
            files = written.len(),
            "Partitions written"
        );

        Ok(written)
    }

    fn stream_dir(&self, data_class: DataClass, instrument_id: Option<&str>) -> PathBuf {
        let class_dir = self.root.join(DATA_DIR).join(data_class.as_str());
        match instrument_id {
            Some(id) => class_dir.join(instrument_dir_name(id)),
            None => class_dir,
        }
    }
}

/// Next free partition number and the max `ts_init` of the last existing partition.
fn last_partition(dir: &Path) -> CatalogResult<(u32, Option<Nanos>)> {
    let entries = std::fs::read_dir(dir).map_err(|e| CatalogError::io(dir, e))?;
    let mut last: Option<(u32, PathBuf)> = None;
    for entry in entries {
        let path = entry.map_err(|e| CatalogError::io(dir, e))?.path();
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_partition_number);
        if let Some(n) = number {
            if last.as_ref().map_or(true, |(m, _)| n > *m) {
                last = Some((n, path));
            }
        }
    }

    match last {
        None => Ok((0, None)),
        Some((n, path)) => {
            let conn = Connection::open(&path).map_err(|e| CatalogError::io(&path, e))?;
            let max_ts: Option<i64> = conn
                .query_row("SELECT MAX(ts_init) FROM records", [], |row| row.get(0))
                .map_err(|e| CatalogError::io(&path, e))?;
            Ok((n + 1, max_ts))
        }
    }
}

fn write_file(
    path: &Path,
    data_class: DataClass,
    instrument_id: Option<&str>,
    records: &[&Record],
) -> CatalogResult<()> {
    let io = |e: rusqlite::Error| CatalogError::io(path, e);

    let mut conn = Connection::open(path).map_err(io)?;
    conn.execute_batch(PARTITION_SCHEMA).map_err(io)?;

    let tx = conn.transaction().map_err(io)?;
    {
        let mut meta = tx
            .prepare("INSERT OR REPLACE INTO partition_meta (key, value) VALUES (?1, ?2)")
            .map_err(io)?;
        meta.execute(params![META_DATA_CLASS, data_class.as_str()])
            .map_err(io)?;
        meta.execute(params![META_SCHEMA_VERSION, SCHEMA_VERSION])
            .map_err(io)?;
        if let Some(id) = instrument_id {
            meta.execute(params![META_INSTRUMENT_ID, id]).map_err(io)?;
        }

        let mut insert = tx
            .prepare("INSERT INTO records (ts_event, ts_init, payload) VALUES (?1, ?2, ?3)")
            .map_err(io)?;
        for record in records {
            let payload = record
                .encode_payload()
                .map_err(|e| CatalogError::io(path, e))?;
            insert
                .execute(params![record.ts_event(), record.ts_init(), payload])
                .map_err(io)?;
        }
    }
    tx.commit().map_err(io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{NewsEvent, QuoteTick};

    fn news(ts: Nanos) -> Record {
        Record::NewsEvent(NewsEvent {
            name: format!("event-{}", ts),
            impact: "LOW".to_string(),
            currency: "USD".to_string(),
            ts_event: ts,
            ts_init: ts,
        })
    }

    #[test]
    fn test_write_splits_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CatalogWriter::create(dir.path())
            .unwrap()
            .with_max_rows_per_partition(2);

        let records = vec![news(30), news(10), news(20), news(40), news(50)];
        let files = writer
            .write_partition(DataClass::NewsEvent, None, &records)
            .unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("data/news_event/part-00000.sqlite"));

        let conn = Connection::open(&files[0]).unwrap();
        let ts: Vec<i64> = conn
            .prepare("SELECT ts_init FROM records ORDER BY row_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ts, vec![10, 20]);
    }

    #[test]
    fn test_append_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CatalogWriter::create(dir.path()).unwrap();
        writer
            .write_partition(DataClass::NewsEvent, None, &[news(1)])
            .unwrap();
        let files = writer
            .write_partition(DataClass::NewsEvent, None, &[news(2)])
            .unwrap();
        assert!(files[0].ends_with("part-00001.sqlite"));
    }

    #[test]
    fn test_rejects_unregistered_instrument_and_mixed_classes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CatalogWriter::create(dir.path()).unwrap();
        let quote = Record::QuoteTick(QuoteTick {
            instrument_id: "A.SIM".to_string(),
            bid: 1.0,
            ask: 1.0,
            bid_size: 1.0,
            ask_size: 1.0,
            ts_event: 1,
            ts_init: 1,
        });

        let err = writer
            .write_partition(DataClass::QuoteTick, Some("A.SIM"), &[quote.clone()])
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnknownInstrument { .. }));

        writer.add_instrument(Instrument::new("A.SIM", "SIM")).unwrap();
        let err = writer
            .write_partition(DataClass::QuoteTick, Some("A.SIM"), &[quote, news(2)])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidConfig { .. }));
    }

    #[test]
    fn test_reopen_keeps_instruments() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = CatalogWriter::create(dir.path()).unwrap();
            writer.add_instrument(Instrument::new("A.SIM", "SIM")).unwrap();
        }
        let writer = CatalogWriter::create(dir.path()).unwrap();
        assert!(writer.instruments().contains("A.SIM"));
    }
}
