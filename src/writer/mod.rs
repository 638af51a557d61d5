//! The write and commit path.
//!
//! This module implements the concurrent document-ingestion pipeline:
//! callers hand documents and delete/update operations to the
//! [`IndexWriter`], which buffers them per indexing thread, flushes buffers
//! into immutable segments under flush-control pressure, and publishes the
//! results in flush-initiation order with exact delete attribution.

pub mod buffer;
pub mod buffered_updates;
pub mod config;
pub mod delete_queue;
pub mod flush_control;
pub mod index_writer;
pub mod indexing_chain;
pub mod registry;
pub mod sequence;
pub mod ticket_queue;
pub mod updates_stream;

pub use buffer::{DocCounters, UpdateOutcome, WriterBuffer};
pub use buffered_updates::{
    APPLY_TO_ALL_DOCS, BufferedUpdates, FrozenUpdates, NumericDocValuesUpdate,
};
pub use config::WriterConfig;
pub use delete_queue::{DeleteItem, DeleteQueue, DeleteSlice, SliceAdvance};
pub use flush_control::{FlushByRamOrCounts, FlushControl, FlushPolicy, StallControl};
pub use index_writer::{
    FlushNotifications, IndexWriter, MergePolicy, MergeScheduler, MergeSpec, NoMergePolicy,
    NoopMergeScheduler, StorageCleanup, WriterComponents, WriterStats,
};
pub use indexing_chain::{
    ChainFlushContext, ChainOutput, DefaultChainFactory, IndexingChain, IndexingChainFactory,
    InMemoryIndexingChain,
};
pub use registry::{PublishedSegment, SegmentRegistry};
pub use sequence::{OpReceipt, SequenceSource};
pub use ticket_queue::{FlushTicket, TicketQueue};
pub use updates_stream::UpdatesStream;
