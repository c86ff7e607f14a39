//! Batch Merge
//!
//! K-way merge of independently sorted sources into size-bounded batches.
//!
//! # Ordering Key
//!
//! Records are ordered by `(ts_init, source_index)`, where `source_index` is the
//! position of the source in the configured list. The key is a total order, so the
//! output depends only on partition contents and declaration order, never on
//! `read_num_rows` or prefetching.
//!
//! # Batch Cutting
//!
//! Estimated record sizes accumulate per batch. Once the target is reached the
//! batch is closed, except that records sharing the last appended timestamp are
//! kept in the same batch. Every batch therefore ends strictly later than the one
//! before it. The target is a soft cap: a record is never split, and a single
//! oversized record forms its own batch.
//!
//! # Failure
//!
//! A read error discards the batch in progress, is returned once, and finishes
//! the merger until [`BatchMerger::reset`]. Batches emitted before the error
//! remain valid.

use crate::catalog::CatalogRegistry;
use crate::clock::Nanos;
use crate::error::CatalogResult;
use crate::persistence::config::{MergeConfig, OnSourceError};
use crate::persistence::cursor::SourceCursor;
use crate::persistence::prefetch::PrefetchReader;
use crate::persistence::reader::{ChunkSource, PartitionReader};
use crate::records::Record;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use tracing::{debug, info, warn};

// =============================================================================
// BATCH
// =============================================================================

/// Records emitted together, ascending by `ts_init`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Zero-based emission sequence number.
    pub seq: u64,
    pub records: Vec<Record>,
    /// Sum of the records' estimated sizes.
    pub estimated_bytes: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn min_ts(&self) -> Option<Nanos> {
        self.records.iter().map(Record::ts_init).min()
    }

    pub fn max_ts(&self) -> Option<Nanos> {
        self.records.iter().map(Record::ts_init).max()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// =============================================================================
// HEAP ENTRY
// =============================================================================

/// Peeked head of one cursor.
#[derive(Debug, Clone, Copy)]
struct MergeEntry {
    ts: Nanos,
    source_index: usize,
    /// Position of the cursor in the merger.
    slot: usize,
}

impl MergeEntry {
    #[inline]
    fn key(&self) -> (Nanos, usize) {
        (self.ts, self.source_index)
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior
        other.key().cmp(&self.key())
    }
}

// =============================================================================
// STATS AND FINGERPRINT
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub records_emitted: u64,
    pub batches_emitted: u64,
    pub bytes_emitted: u64,
    /// Records emitted per merged source, in merger order.
    pub records_per_source: Vec<u64>,
    pub refills: u64,
    pub max_heap_depth: usize,
    /// Records kept past the size target because they tied the batch's last timestamp.
    pub ties_absorbed: u64,
    pub sources_skipped: u64,
}

/// Hash of the full emitted sequence, including batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFingerprint {
    pub sequence_hash: u64,
    pub records: u64,
    pub batches: u64,
}

impl fmt::Display for MergeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x} ({} records, {} batches)",
            self.sequence_hash, self.records, self.batches
        )
    }
}

#[derive(Debug, Clone)]
struct RunHashState {
    hasher: u64,
}

impl Default for RunHashState {
    fn default() -> Self {
        Self {
            hasher: 0xcbf29ce484222325, // FNV-1a offset basis
        }
    }
}

impl RunHashState {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.hasher ^= byte as u64;
            self.hasher = self.hasher.wrapping_mul(0x100000001b3);
        }
    }

    fn record(&mut self, ts: Nanos, source_index: usize) {
        self.write(&ts.to_le_bytes());
        self.write(&(source_index as u64).to_le_bytes());
    }

    fn boundary(&mut self, seq: u64) {
        self.write(&[0xff]);
        self.write(&seq.to_le_bytes());
    }
}

// =============================================================================
// MERGER
// =============================================================================

/// Lazy, finite, forward-only sequence of batches. Consumed through [`Iterator`]
/// or [`BatchMerger::next_batch`].
pub struct BatchMerger {
    cursors: Vec<SourceCursor>,
    heap: BinaryHeap<MergeEntry>,
    target_batch_size_bytes: u64,
    primed: bool,
    finished: bool,
    next_seq: u64,
    stats: MergeStats,
    hash: RunHashState,
}

impl BatchMerger {
    /// Resolve every configured source and build the merger.
    ///
    /// Resolution failures abort, or drop the source under
    /// [`OnSourceError::Skip`]. Surviving sources keep their declaration index
    /// as tie-breaker. No records are read until the first batch is pulled.
    pub fn open(registry: &mut CatalogRegistry, config: &MergeConfig) -> CatalogResult<Self> {
        config.validate()?;

        let mut sources: Vec<(usize, Box<dyn ChunkSource>)> = Vec::with_capacity(config.sources.len());
        let mut skipped = 0;
        for (index, source) in config.sources.iter().enumerate() {
            let label = source.label();
            match registry.resolve(source) {
                Ok(partitions) => {
                    let reader: Box<dyn ChunkSource> =
                        Box::new(PartitionReader::new(label, partitions, config.read_num_rows));
                    sources.push((index, reader));
                }
                Err(e) if config.on_source_error == OnSourceError::Skip => {
                    warn!(source = %label, index, error = %e, "Skipping unresolvable source");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut merger = Self::build(sources, config);
        merger.stats.sources_skipped = skipped;
        info!(
            sources = merger.cursors.len(),
            skipped,
            target_batch_size_bytes = config.target_batch_size_bytes,
            read_num_rows = config.read_num_rows,
            "Batch merger opened"
        );
        Ok(merger)
    }

    /// Build a merger over already constructed chunk sources, in declaration order.
    ///
    /// Only the sizing, validation and prefetch settings of `config` apply.
    pub fn from_sources(sources: Vec<Box<dyn ChunkSource>>, config: &MergeConfig) -> CatalogResult<Self> {
        config.validate()?;
        Ok(Self::build(sources.into_iter().enumerate().collect(), config))
    }

    fn build(sources: Vec<(usize, Box<dyn ChunkSource>)>, config: &MergeConfig) -> Self {
        let cursors: Vec<SourceCursor> = sources
            .into_iter()
            .map(|(index, source)| {
                let source: Box<dyn ChunkSource> = if config.prefetch {
                    Box::new(PrefetchReader::new(source))
                } else {
                    source
                };
                SourceCursor::new(index, source).with_validate_order(config.validate_order)
            })
            .collect();

        let stats = MergeStats {
            records_per_source: vec![0; cursors.len()],
            ..MergeStats::default()
        };

        Self {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
            target_batch_size_bytes: config.target_batch_size_bytes,
            primed: false,
            finished: false,
            next_seq: 0,
            stats,
            hash: RunHashState::default(),
        }
    }

    pub fn source_count(&self) -> usize {
        self.cursors.len()
    }

    /// Names of the merged sources, in declaration order.
    pub fn source_names(&self) -> Vec<&str> {
        self.cursors.iter().map(SourceCursor::name).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> MergeStats {
        let mut stats = self.stats.clone();
        stats.refills = self.cursors.iter().map(SourceCursor::refills).sum();
        stats
    }

    pub fn fingerprint(&self) -> MergeFingerprint {
        MergeFingerprint {
            sequence_hash: self.hash.hasher,
            records: self.stats.records_emitted,
            batches: self.stats.batches_emitted,
        }
    }

    /// Restart every source from its first record.
    pub fn reset(&mut self) -> CatalogResult<()> {
        for cursor in &mut self.cursors {
            cursor.reset()?;
        }
        self.heap.clear();
        self.primed = false;
        self.finished = false;
        self.next_seq = 0;
        self.stats = MergeStats {
            records_per_source: vec![0; self.cursors.len()],
            sources_skipped: self.stats.sources_skipped,
            ..MergeStats::default()
        };
        self.hash = RunHashState::default();
        Ok(())
    }

    /// Load the first chunk of every source and seed the heap.
    fn prime(&mut self) -> CatalogResult<()> {
        let heads: Vec<CatalogResult<Option<Nanos>>> = self
            .cursors
            .par_iter_mut()
            .map(SourceCursor::peek_ts)
            .collect();

        for (slot, head) in heads.into_iter().enumerate() {
            if let Some(ts) = head? {
                self.heap.push(MergeEntry {
                    ts,
                    source_index: self.cursors[slot].index(),
                    slot,
                });
            }
        }
        self.stats.max_heap_depth = self.heap.len();
        self.primed = true;
        debug!(active = self.heap.len(), "Merge primed");
        Ok(())
    }

    /// Pull the next batch. `Ok(None)` once every source is exhausted.
    ///
    /// An error finishes the merger: every later call returns `Ok(None)`.
    pub fn next_batch(&mut self) -> CatalogResult<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }
        match self.cut_batch() {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => {
                self.finished = true;
                info!(
                    batches = self.stats.batches_emitted,
                    records = self.stats.records_emitted,
                    bytes = self.stats.bytes_emitted,
                    fingerprint = %self.fingerprint(),
                    "Merge complete"
                );
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                self.heap.clear();
                warn!(
                    error = %e,
                    batches = self.stats.batches_emitted,
                    "Merge aborted"
                );
                Err(e)
            }
        }
    }

    fn cut_batch(&mut self) -> CatalogResult<Option<Batch>> {
        if !self.primed {
            self.prime()?;
        }

        let mut records = Vec::new();
        let mut bytes: u64 = 0;

        while let Some(entry) = self.heap.pop() {
            let cursor = &mut self.cursors[entry.slot];
            let record = cursor.advance()?;
            if let Some(ts) = cursor.peek_ts()? {
                self.heap.push(MergeEntry { ts, ..entry });
                self.stats.max_heap_depth = self.stats.max_heap_depth.max(self.heap.len());
            }

            let ts = record.ts_init();
            bytes += record.estimated_size() as u64;
            self.hash.record(ts, entry.source_index);
            self.stats.records_per_source[entry.slot] += 1;
            records.push(record);

            if bytes >= self.target_batch_size_bytes {
                match self.heap.peek() {
                    Some(next) if next.ts <= ts => {
                        self.stats.ties_absorbed += 1;
                    }
                    _ => break,
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.hash.boundary(seq);
        self.stats.records_emitted += records.len() as u64;
        self.stats.batches_emitted += 1;
        self.stats.bytes_emitted += bytes;

        metrics::counter!("catalog_merge_batches_total", 1);
        metrics::counter!("catalog_merge_records_total", records.len() as u64);
        metrics::histogram!("catalog_merge_batch_bytes", bytes as f64);

        let batch = Batch {
            seq,
            records,
            estimated_bytes: bytes,
        };
        debug!(
            seq,
            records = batch.len(),
            bytes,
            max_ts = batch.max_ts().unwrap_or_default(),
            "Batch cut"
        );
        Ok(Some(batch))
    }
}

impl Iterator for BatchMerger {
    type Item = CatalogResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

impl std::iter::FusedIterator for BatchMerger {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use crate::persistence::reader::{RecordChunk, VecChunkSource};
    use crate::records::NewsEvent;

    fn news(ts: Nanos) -> Record {
        Record::NewsEvent(NewsEvent {
            name: "x".to_string(),
            impact: "LOW".to_string(),
            currency: "JPY".to_string(),
            ts_event: ts,
            ts_init: ts,
        })
    }

    fn record_size() -> u64 {
        news(0).estimated_size() as u64
    }

    fn source(name: &str, ts: &[Nanos], read_num_rows: usize) -> Box<dyn ChunkSource> {
        Box::new(VecChunkSource::new(
            name,
            ts.iter().copied().map(news).collect(),
            read_num_rows,
        ))
    }

    fn run(merger: BatchMerger) -> Vec<Vec<Nanos>> {
        merger
            .map(|b| b.unwrap().iter().map(Record::ts_init).collect())
            .collect()
    }

    #[test]
    fn test_interleaves_and_cuts_by_size() {
        let config = MergeConfig::new(record_size() * 3, 2);
        let merger = BatchMerger::from_sources(
            vec![source("a", &[1, 3, 5, 7], 2), source("b", &[2, 4, 6], 2)],
            &config,
        )
        .unwrap();
        assert_eq!(run(merger), vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[test]
    fn test_empty_source_list() {
        let merger = BatchMerger::from_sources(Vec::new(), &MergeConfig::new(100, 10)).unwrap();
        assert!(run(merger).is_empty());
    }

    #[test]
    fn test_oversized_record_forms_own_batch() {
        let config = MergeConfig::new(1, 10);
        let merger =
            BatchMerger::from_sources(vec![source("a", &[10, 20], 10)], &config).unwrap();
        assert_eq!(run(merger), vec![vec![10], vec![20]]);
    }

    #[test]
    fn test_ties_follow_declaration_order_and_stay_together() {
        let config = MergeConfig::new(record_size(), 10);
        let merger = BatchMerger::from_sources(
            vec![source("first", &[5, 9], 10), source("second", &[5], 10)],
            &config,
        )
        .unwrap();

        let batches: Vec<Batch> = merger.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        match (&batches[0].records[0], &batches[0].records[1]) {
            (Record::NewsEvent(a), Record::NewsEvent(b)) => {
                assert_eq!(a.ts_init, b.ts_init);
            }
            _ => unreachable!(),
        }
        assert_eq!(batches[1].max_ts(), Some(9));
    }

    #[test]
    fn test_stats_and_fingerprint() {
        let config = MergeConfig::new(record_size() * 2, 1);
        let build = || {
            BatchMerger::from_sources(
                vec![source("a", &[1, 2, 3], 1), source("b", &[2, 2], 1)],
                &config,
            )
            .unwrap()
        };

        let mut merger = build();
        let batches: Vec<Batch> = merger.by_ref().map(|b| b.unwrap()).collect();
        let stats = merger.stats();
        assert_eq!(stats.records_emitted, 5);
        assert_eq!(stats.batches_emitted, batches.len() as u64);
        assert_eq!(stats.records_per_source, vec![3, 2]);
        assert_eq!(stats.bytes_emitted, record_size() * 5);
        assert!(stats.ties_absorbed > 0);

        let mut again = build();
        again.by_ref().for_each(|b| {
            b.unwrap();
        });
        assert_eq!(merger.fingerprint(), again.fingerprint());

        merger.reset().unwrap();
        let replayed: Vec<Batch> = merger.by_ref().map(|b| b.unwrap()).collect();
        assert_eq!(replayed, batches);
        assert_eq!(merger.fingerprint(), again.fingerprint());
    }

    struct FailingSource {
        served: bool,
    }

    impl ChunkSource for FailingSource {
        fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>> {
            if self.served {
                return Err(CatalogError::corrupt("/tmp/bad.sqlite", "bad row"));
            }
            self.served = true;
            Ok(Some(RecordChunk::new(vec![news(1), news(2)])))
        }

        fn reset(&mut self) -> CatalogResult<()> {
            self.served = false;
            Ok(())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_error_fuses_iterator() {
        let config = MergeConfig::new(record_size(), 2);
        let failing: Box<dyn ChunkSource> = Box::new(FailingSource { served: false });
        let mut merger =
            BatchMerger::from_sources(vec![failing, source("ok", &[1, 2, 3], 2)], &config).unwrap();

        let first = merger.next().unwrap().unwrap();
        assert_eq!(first.max_ts(), Some(1));
        let err = merger.next().unwrap().unwrap_err();
        assert!(matches!(err, CatalogError::CorruptPartition { .. }));
        assert!(merger.next().is_none());
        assert!(merger.is_finished());
    }

    /// Serves `[1, 2]`, fails once, then serves `[3]`.
    struct FlakySource {
        calls: usize,
    }

    impl ChunkSource for FlakySource {
        fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>> {
            self.calls += 1;
            match self.calls {
                1 => Ok(Some(RecordChunk::new(vec![news(1), news(2)]))),
                2 => Err(CatalogError::io("/tmp/flaky.sqlite", "interrupted")),
                3 => Ok(Some(RecordChunk::new(vec![news(3)]))),
                _ => Ok(None),
            }
        }

        fn reset(&mut self) -> CatalogResult<()> {
            self.calls = 0;
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn test_next_batch_stops_after_read_error() {
        let config = MergeConfig::new(record_size() * 100, 2);
        let flaky: Box<dyn ChunkSource> = Box::new(FlakySource { calls: 0 });
        let mut merger = BatchMerger::from_sources(
            vec![flaky, source("ok", &[1, 2, 3, 4, 5, 6], 6)],
            &config,
        )
        .unwrap();

        let err = merger.next_batch().unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
        assert!(merger.is_finished());
        assert_eq!(merger.next_batch().unwrap(), None);
        assert_eq!(merger.next_batch().unwrap(), None);
        assert_eq!(merger.stats().records_emitted, 0);
    }

    #[test]
    fn test_next_batch_stops_after_prime_error() {
        let config = MergeConfig::new(record_size(), 2);
        let failing: Box<dyn ChunkSource> = Box::new(FailingSource { served: true });
        let mut merger =
            BatchMerger::from_sources(vec![source("ok", &[1, 2], 2), failing], &config).unwrap();

        assert!(merger.next_batch().is_err());
        assert_eq!(merger.next_batch().unwrap(), None);
        assert!(merger.next().is_none());
    }

    #[test]
    fn test_reset_after_error_replays_from_start() {
        let config = MergeConfig::new(record_size(), 2);
        let flaky: Box<dyn ChunkSource> = Box::new(FlakySource { calls: 1 });
        let mut merger = BatchMerger::from_sources(vec![flaky], &config).unwrap();

        assert!(merger.next_batch().is_err());
        merger.reset().unwrap();
        let batch = merger.next_batch().unwrap().unwrap();
        assert_eq!(batch.max_ts(), Some(1));
        assert!(merger.next_batch().is_err());
        assert_eq!(merger.next_batch().unwrap(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            BatchMerger::from_sources(Vec::new(), &MergeConfig::new(0, 1)),
            Err(CatalogError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_heap_entry_is_min_first() {
        let mut heap = BinaryHeap::new();
        heap.push(MergeEntry { ts: 5, source_index: 0, slot: 0 });
        heap.push(MergeEntry { ts: 3, source_index: 1, slot: 1 });
        heap.push(MergeEntry { ts: 3, source_index: 0, slot: 2 });
        let order: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|e| e.slot)).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
