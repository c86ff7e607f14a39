//! Replay Driver
//!
//! Reference consumer of the batch stream. Pulls one batch at a time, advances a
//! [`SimClock`] through every record, and hands the records to a
//! [`RecordHandler`]. The clock finishes each batch at the batch maximum before
//! the next batch is pulled.

use crate::clock::{Nanos, SimClock};
use crate::error::{CatalogError, CatalogResult};
use crate::persistence::Batch;
use crate::records::{DataClass, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Receives records in replay order.
pub trait RecordHandler {
    fn on_record(&mut self, record: &Record, now: Nanos);

    fn on_batch_end(&mut self, _batch: &Batch, _now: Nanos) {}
}

/// Handler that only counts.
#[derive(Debug, Default)]
pub struct CountingHandler {
    pub records: u64,
}

impl RecordHandler for CountingHandler {
    fn on_record(&mut self, _record: &Record, _now: Nanos) {
        self.records += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub batches: u64,
    pub records: u64,
    pub first_ts: Option<Nanos>,
    pub last_ts: Option<Nanos>,
    pub records_by_class: BTreeMap<DataClass, u64>,
}

pub struct ReplayDriver<H: RecordHandler> {
    clock: SimClock,
    handler: H,
    last_batch_max: Option<Nanos>,
    summary: ReplaySummary,
}

impl<H: RecordHandler> ReplayDriver<H> {
    pub fn new(handler: H) -> Self {
        Self::with_clock(SimClock::new(Nanos::MIN), handler)
    }

    pub fn with_clock(clock: SimClock, handler: H) -> Self {
        Self {
            clock,
            handler,
            last_batch_max: None,
            summary: ReplaySummary::default(),
        }
    }

    pub fn now(&self) -> Nanos {
        self.clock.now()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Replay every batch until the stream ends or yields an error.
    pub fn run<I>(&mut self, batches: I) -> CatalogResult<ReplaySummary>
    where
        I: IntoIterator<Item = CatalogResult<Batch>>,
    {
        for batch in batches {
            self.process_batch(&batch?)?;
        }
        info!(
            batches = self.summary.batches,
            records = self.summary.records,
            clock = %self.clock,
            "Replay complete"
        );
        Ok(self.summary.clone())
    }

    /// Process one batch fully, leaving the clock at the batch maximum.
    pub fn process_batch(&mut self, batch: &Batch) -> CatalogResult<()> {
        let Some(batch_max) = batch.max_ts() else {
            return Ok(());
        };
        if let Some(previous_max) = self.last_batch_max {
            if batch_max <= previous_max {
                return Err(CatalogError::ForwardProgressViolation {
                    batch_seq: batch.seq,
                    previous_max,
                    batch_max,
                });
            }
        }

        for record in batch {
            let ts = record.ts_init();
            self.clock
                .try_advance_to(ts)
                .map_err(|now| CatalogError::ForwardProgressViolation {
                    batch_seq: batch.seq,
                    previous_max: now,
                    batch_max: ts,
                })?;
            self.handler.on_record(record, ts);
            *self
                .summary
                .records_by_class
                .entry(record.data_class())
                .or_default() += 1;
        }

        self.handler.on_batch_end(batch, self.clock.now());

        self.last_batch_max = Some(batch_max);
        self.summary.batches += 1;
        self.summary.records += batch.len() as u64;
        if self.summary.first_ts.is_none() {
            self.summary.first_ts = batch.min_ts();
        }
        self.summary.last_ts = Some(batch_max);

        debug!(seq = batch.seq, records = batch.len(), now = self.clock.now(), "Batch replayed");
        Ok(())
    }
}
