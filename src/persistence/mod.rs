//! Persistence Layer
//!
//! Reads catalog partitions and merges many sources into one stream of
//! size-bounded, time-ordered batches.
//!
//! ```text
//! CatalogIndex -> PartitionReader -> SourceCursor -> BatchMerger -> batches
//! ```

pub mod config;
pub mod cursor;
pub mod merge;
pub mod prefetch;
pub mod reader;

pub use config::{parse_bytes, MergeConfig, OnSourceError};
pub use cursor::SourceCursor;
pub use merge::{Batch, BatchMerger, MergeFingerprint, MergeStats};
pub use prefetch::PrefetchReader;
pub use reader::{ChunkSource, PartitionReader, RecordChunk, VecChunkSource};
