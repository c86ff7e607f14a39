//! Source Cursor
//!
//! One-record lookahead over a [`ChunkSource`]. Holds at most one chunk; a
//! refill is exactly one `next_chunk` call and happens only when the buffered
//! chunk is fully consumed.

use crate::clock::Nanos;
use crate::error::{CatalogError, CatalogResult};
use crate::persistence::reader::{ChunkSource, RecordChunk};
use crate::records::Record;
use tracing::trace;

pub struct SourceCursor {
    /// Declaration index of the source; the merge tie-breaker.
    index: usize,
    reader: Box<dyn ChunkSource>,
    chunk: RecordChunk,
    reader_done: bool,
    validate_order: bool,
    /// Last `ts_init` pulled from the reader, for order validation.
    last_read_ts: Option<Nanos>,
    max_ts: Option<Nanos>,
    emitted: u64,
    refills: u64,
}

impl SourceCursor {
    pub fn new(index: usize, reader: Box<dyn ChunkSource>) -> Self {
        Self {
            index,
            reader,
            chunk: RecordChunk::default(),
            reader_done: false,
            validate_order: false,
            last_read_ts: None,
            max_ts: None,
            emitted: 0,
            refills: 0,
        }
    }

    pub fn with_validate_order(mut self, enabled: bool) -> Self {
        self.validate_order = enabled;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    /// Next record without consuming it. Refills from the reader when needed.
    pub fn peek(&mut self) -> CatalogResult<Option<&Record>> {
        if self.chunk.is_empty() && !self.reader_done {
            self.refill()?;
        }
        Ok(self.chunk.front())
    }

    #[inline]
    pub fn peek_ts(&mut self) -> CatalogResult<Option<Nanos>> {
        Ok(self.peek()?.map(Record::ts_init))
    }

    /// Consume the next record. Fails with `EmptyCursor` once exhausted.
    pub fn advance(&mut self) -> CatalogResult<Record> {
        if self.peek()?.is_none() {
            return Err(CatalogError::EmptyCursor {
                source: self.name().to_string(),
            });
        }
        let record = self
            .chunk
            .pop_front()
            .ok_or_else(|| CatalogError::EmptyCursor {
                source: self.reader.name().to_string(),
            })?;

        let ts = record.ts_init();
        self.max_ts = Some(self.max_ts.map_or(ts, |m| m.max(ts)));
        self.emitted += 1;
        Ok(record)
    }

    /// True once the reader is drained and the buffered chunk consumed.
    pub fn is_exhausted(&self) -> bool {
        self.reader_done && self.chunk.is_empty()
    }

    /// Highest `ts_init` emitted so far.
    pub fn max_ts(&self) -> Option<Nanos> {
        self.max_ts
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn refills(&self) -> u64 {
        self.refills
    }

    /// Restart the underlying source and clear all progress.
    pub fn reset(&mut self) -> CatalogResult<()> {
        self.reader.reset()?;
        self.chunk.clear();
        self.reader_done = false;
        self.last_read_ts = None;
        self.max_ts = None;
        self.emitted = 0;
        self.refills = 0;
        Ok(())
    }

    fn refill(&mut self) -> CatalogResult<()> {
        self.refills += 1;
        match self.reader.next_chunk()? {
            Some(chunk) if !chunk.is_empty() => {
                if self.validate_order {
                    self.check_order(&chunk)?;
                }
                self.last_read_ts = chunk.last_ts();
                trace!(
                    source = %self.reader.name(),
                    rows = chunk.len(),
                    refill = self.refills,
                    "Cursor refilled"
                );
                self.chunk = chunk;
            }
            _ => {
                self.reader_done = true;
                trace!(source = %self.reader.name(), emitted = self.emitted, "Source exhausted");
            }
        }
        Ok(())
    }

    fn check_order(&self, chunk: &RecordChunk) -> CatalogResult<()> {
        let mut previous = self.last_read_ts;
        for record in chunk.iter() {
            let ts = record.ts_init();
            if let Some(prev) = previous {
                if ts < prev {
                    return Err(CatalogError::UnsortedSource {
                        source: self.reader.name().to_string(),
                        previous_ts: prev,
                        ts,
                    });
                }
            }
            previous = Some(ts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::reader::VecChunkSource;
    use crate::records::{NewsEvent, Record};

    fn news(ts: Nanos) -> Record {
        Record::NewsEvent(NewsEvent {
            name: "nfp".to_string(),
            impact: "HIGH".to_string(),
            currency: "USD".to_string(),
            ts_event: ts,
            ts_init: ts,
        })
    }

    fn cursor(ts: &[Nanos], read_num_rows: usize) -> SourceCursor {
        let records = ts.iter().copied().map(news).collect();
        SourceCursor::new(0, Box::new(VecChunkSource::new("news", records, read_num_rows)))
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut c = cursor(&[1, 2, 3], 2);
        assert_eq!(c.peek_ts().unwrap(), Some(1));
        assert_eq!(c.peek_ts().unwrap(), Some(1));
        assert_eq!(c.refills(), 1);
        assert_eq!(c.advance().unwrap().ts_init(), 1);
        assert_eq!(c.emitted(), 1);
    }

    #[test]
    fn test_refill_only_when_chunk_drained() {
        let mut c = cursor(&[1, 2, 3, 4, 5], 2);
        let mut seen = Vec::new();
        while c.peek().unwrap().is_some() {
            seen.push(c.advance().unwrap().ts_init());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        // three data chunks plus the call that reported the end
        assert_eq!(c.refills(), 4);
        assert!(c.is_exhausted());
        assert_eq!(c.max_ts(), Some(5));
    }

    #[test]
    fn test_advance_on_exhausted_cursor() {
        let mut c = cursor(&[7], 4);
        c.advance().unwrap();
        assert!(matches!(c.advance(), Err(CatalogError::EmptyCursor { .. })));
        // Exhaustion is terminal and does not poll the reader again
        let refills = c.refills();
        assert!(c.peek().unwrap().is_none());
        assert_eq!(c.refills(), refills);
    }

    #[test]
    fn test_empty_source() {
        let mut c = cursor(&[], 4);
        assert!(c.peek().unwrap().is_none());
        assert!(c.is_exhausted());
        assert_eq!(c.max_ts(), None);
    }

    #[test]
    fn test_order_validation() {
        let mut lenient = cursor(&[1, 3, 2], 2);
        while lenient.peek().unwrap().is_some() {
            lenient.advance().unwrap();
        }
        assert_eq!(lenient.max_ts(), Some(3));

        // Regression spans a chunk boundary
        let mut strict = cursor(&[1, 3, 2], 2).with_validate_order(true);
        strict.advance().unwrap();
        strict.advance().unwrap();
        assert!(matches!(
            strict.peek(),
            Err(CatalogError::UnsortedSource {
                previous_ts: 3,
                ts: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_reset() {
        let mut c = cursor(&[1, 2], 1);
        c.advance().unwrap();
        c.advance().unwrap();
        c.reset().unwrap();
        assert_eq!(c.emitted(), 0);
        assert_eq!(c.peek_ts().unwrap(), Some(1));
    }
}
