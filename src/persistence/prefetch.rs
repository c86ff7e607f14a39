//! Background chunk prefetch.
//!
//! Wraps a [`ChunkSource`] and reads its next chunk on a dedicated thread while
//! the consumer works through the current one. The channel holds a single chunk,
//! so at most two chunks of a source exist at once. Chunks arrive in source order.

use crate::error::{CatalogError, CatalogResult};
use crate::persistence::reader::{ChunkSource, RecordChunk};
use crossbeam::channel::{bounded, Receiver};
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{debug, warn};

type ChunkResult = CatalogResult<Option<RecordChunk>>;

pub struct PrefetchReader {
    name: String,
    /// Source while no worker is running.
    idle: Option<Box<dyn ChunkSource>>,
    rx: Option<Receiver<ChunkResult>>,
    worker: Option<JoinHandle<Box<dyn ChunkSource>>>,
    /// The worker delivered its last item.
    finished: bool,
}

impl PrefetchReader {
    pub fn new(source: Box<dyn ChunkSource>) -> Self {
        Self {
            name: source.name().to_string(),
            idle: Some(source),
            rx: None,
            worker: None,
            finished: false,
        }
    }

    fn spawn(&mut self) -> CatalogResult<()> {
        let Some(mut source) = self.idle.take() else {
            return Ok(());
        };
        let (tx, rx) = bounded::<ChunkResult>(1);

        let handle = std::thread::Builder::new()
            .name(format!("prefetch-{}", self.name))
            .spawn(move || {
                loop {
                    let item = source.next_chunk();
                    let last = !matches!(item, Ok(Some(_)));
                    // Consumer went away
                    if tx.send(item).is_err() || last {
                        break;
                    }
                }
                source
            })
            .map_err(|e| self.worker_error(e))?;

        debug!(source = %self.name, "Prefetch worker started");
        self.rx = Some(rx);
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and take the source back.
    fn stop(&mut self) -> CatalogResult<()> {
        // Dropping the receiver unblocks a worker waiting on a full channel
        self.rx = None;
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(source) => self.idle = Some(source),
                Err(_) => {
                    warn!(source = %self.name, "Prefetch worker panicked");
                    return Err(self.worker_error("prefetch worker panicked"));
                }
            }
        }
        Ok(())
    }

    fn worker_error(&self, reason: impl ToString) -> CatalogError {
        CatalogError::io(PathBuf::from(&self.name), reason)
    }
}

impl ChunkSource for PrefetchReader {
    fn next_chunk(&mut self) -> CatalogResult<Option<RecordChunk>> {
        if self.finished {
            return Ok(None);
        }
        if self.rx.is_none() {
            self.spawn()?;
        }
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };

        match rx.recv() {
            Ok(Ok(Some(chunk))) => Ok(Some(chunk)),
            Ok(other) => {
                self.finished = true;
                other
            }
            Err(_) => {
                self.finished = true;
                Err(self.worker_error("prefetch worker exited early"))
            }
        }
    }

    fn reset(&mut self) -> CatalogResult<()> {
        self.stop()?;
        self.finished = false;
        match self.idle.as_mut() {
            Some(source) => source.reset(),
            None => Err(self.worker_error("source lost")),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        if self.worker.is_some() && self.stop().is_ok() {
            debug!(source = %self.name, "Prefetch worker stopped");
        }
    }
}
