//! Per-thread write buffers.
//!
//! A [`WriterBuffer`] owns one in-progress segment: it feeds documents
//! through the indexing chain, tracks its private pending deletes through a
//! slice of the shared delete queue, and on flush turns the accumulated
//! state into an immutable [`FlushedSegment`] plus a frozen private-deletes
//! packet. A buffer is used by exactly one indexing thread at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::document::Document;
use crate::error::{KontosError, Result};
use crate::segment::{DeletionBitmap, FlushedSegment, SegmentInfo};
use crate::storage::Storage;
use crate::writer::buffered_updates::{BufferedUpdates, FrozenUpdates};
use crate::writer::delete_queue::{DeleteItem, DeleteQueue, DeleteSlice, SliceAdvance};
use crate::writer::indexing_chain::{ChainFlushContext, IndexingChain};

/// Index-wide document reservation state, shared by all buffers.
///
/// `pending` counts every document that is buffered in RAM or durably
/// flushed; only aborting a buffer or dropping a segment gives
/// reservations back.
#[derive(Debug)]
pub struct DocCounters {
    pending: AtomicU64,
    limit: u64,
}

impl DocCounters {
    /// Create counters with the given hard ceiling.
    pub fn new(limit: u64) -> Self {
        DocCounters {
            pending: AtomicU64::new(0),
            limit,
        }
    }

    /// Reserve `count` documents, rolling back if the ceiling would be
    /// exceeded.
    pub fn reserve(&self, count: u64) -> Result<()> {
        let reserved = self.pending.fetch_add(count, Ordering::SeqCst) + count;
        if reserved > self.limit {
            self.pending.fetch_sub(count, Ordering::SeqCst);
            return Err(KontosError::TooManyDocs {
                pending: reserved,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Give back `count` reservations.
    pub fn release(&self, count: u64) {
        let previous = self.pending.fetch_sub(count, Ordering::SeqCst);
        debug_assert!(previous >= count, "document reservations went negative");
    }

    /// Documents currently reserved.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// The hard ceiling.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Outcome of feeding a batch of documents into a buffer.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// Sequence number consumed by the batch.
    pub seq_no: u64,

    /// Whether newly visible deletes were folded into the buffer's private
    /// pending updates.
    pub applied_deletes: bool,

    /// A non-aborting failure for one of the documents. The buffer stays
    /// usable and the failed document is flagged deleted.
    pub doc_error: Option<KontosError>,
}

/// One in-progress segment owned by a single indexing thread at a time.
#[derive(Debug)]
pub struct WriterBuffer {
    /// Segment name; also the file prefix once flushed.
    segment_id: String,

    /// The indexing chain accumulating this segment.
    chain: Box<dyn IndexingChain>,

    /// The delete queue this buffer was created against.
    delete_queue: Arc<DeleteQueue>,

    /// Private cursor into the delete queue.
    slice: DeleteSlice,

    /// Private pending deletes/updates for this segment.
    pending_updates: BufferedUpdates,

    /// Documents fed to the chain, including ones flagged deleted.
    num_docs_in_ram: u32,

    /// Reservations taken against the shared counters.
    reserved_docs: u64,

    /// Ordinals flagged deleted by non-aborting document failures.
    deleted_doc_ids: Vec<u32>,

    /// Set once the buffer is discarded.
    aborted: bool,

    /// Set by flush control when the buffer is queued for flush.
    flush_pending: bool,

    counters: Arc<DocCounters>,
    storage: Arc<dyn Storage>,
}

impl WriterBuffer {
    /// Create a buffer against the given delete queue.
    pub fn new(
        segment_id: String,
        chain: Box<dyn IndexingChain>,
        delete_queue: Arc<DeleteQueue>,
        counters: Arc<DocCounters>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let slice = delete_queue.new_slice();
        WriterBuffer {
            segment_id,
            chain,
            delete_queue,
            slice,
            pending_updates: BufferedUpdates::new(),
            num_docs_in_ram: 0,
            reserved_docs: 0,
            deleted_doc_ids: Vec::new(),
            aborted: false,
            flush_pending: false,
            counters,
            storage,
        }
    }

    /// Segment name.
    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    /// Generation of the delete queue this buffer belongs to.
    pub fn queue_generation(&self) -> u64 {
        self.delete_queue.generation()
    }

    /// Documents currently buffered, including flagged-deleted ones.
    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram
    }

    /// Whether the buffer was discarded.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether the buffer is queued for flush.
    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Mark the buffer as queued for flush.
    pub fn set_flush_pending(&mut self) {
        self.flush_pending = true;
    }

    /// Rough heap footprint: chain state plus private pending updates.
    pub fn ram_bytes_used(&self) -> usize {
        self.chain.ram_bytes_used() + self.pending_updates.ram_bytes_used()
    }

    /// Reserve capacity for one document against the index-wide ceiling.
    fn reserve_one_doc(&mut self) -> Result<()> {
        self.counters.reserve(1)?;
        self.reserved_docs += 1;
        Ok(())
    }

    /// Feed a batch of documents, then link/apply the batch's delete item.
    ///
    /// Fails with [`KontosError::TooManyDocs`] when the ceiling is hit;
    /// the failed document never reaches the chain and any earlier part of
    /// the batch is flagged deleted, keeping the batch all-or-nothing.
    /// Fails with an aborting error when the chain's state may be corrupt
    /// (the caller must then discard the buffer). A non-aborting document
    /// failure is reported through [`UpdateOutcome::doc_error`]: the
    /// document keeps its ordinal and is flagged deleted, and the rest of
    /// the batch is still processed.
    pub fn update_documents(
        &mut self,
        docs: &[Document],
        delete_item: Option<DeleteItem>,
    ) -> Result<UpdateOutcome> {
        if self.aborted {
            return Err(KontosError::invalid_operation("buffer is aborted"));
        }

        // Deletes issued with this batch bound at the count before the
        // batch: the replacement documents themselves are exempt.
        let doc_id_upto = self.num_docs_in_ram;

        let mut doc_error: Option<KontosError> = None;
        for doc in docs {
            if let Err(error) = self.reserve_one_doc() {
                // The batch is all-or-nothing: flag whatever part of it
                // already reached the chain as deleted.
                for doc_ord in doc_id_upto..self.num_docs_in_ram {
                    if !self.deleted_doc_ids.contains(&doc_ord) {
                        self.deleted_doc_ids.push(doc_ord);
                    }
                }
                return Err(error);
            }
            let doc_ord = self.num_docs_in_ram;
            match self.chain.process_document(doc_ord, doc) {
                Ok(()) => {
                    self.num_docs_in_ram += 1;
                }
                Err(e) if e.is_aborting() => {
                    return Err(e);
                }
                Err(e) => {
                    self.num_docs_in_ram += 1;
                    self.deleted_doc_ids.push(doc_ord);
                    if doc_error.is_none() {
                        doc_error = Some(e);
                    }
                }
            }
        }

        let (seq_no, applied_deletes) = self.finish_documents(delete_item, doc_id_upto)?;
        Ok(UpdateOutcome {
            seq_no,
            applied_deletes,
            doc_error,
        })
    }

    /// Complete a batch: link the delete item (update case) or catch the
    /// slice up (plain add).
    ///
    /// For updates, the item is linked via `add_with_slice` and applied to
    /// the private buffer immediately, so the delete is visible to this
    /// buffer before any later document could be mistaken as exempt from
    /// it. For plain adds, an `Advanced` slice must be applied before
    /// proceeding while `Unchanged` just resets the cursor.
    fn finish_documents(
        &mut self,
        delete_item: Option<DeleteItem>,
        doc_id_upto: u32,
    ) -> Result<(u64, bool)> {
        match delete_item {
            Some(item) => {
                let seq = self.delete_queue.add_with_slice(item, &mut self.slice)?;
                self.slice.apply(&mut self.pending_updates, doc_id_upto);
                Ok((seq, true))
            }
            None => match self.delete_queue.update_slice(&mut self.slice) {
                SliceAdvance::Advanced(seq) => {
                    self.slice.apply(&mut self.pending_updates, doc_id_upto);
                    Ok((seq, true))
                }
                SliceAdvance::Unchanged(seq) => {
                    self.slice.reset();
                    Ok((seq, false))
                }
            },
        }
    }

    /// Snapshot the global delete buffer at flush initiation.
    ///
    /// Catches this buffer's slice up to the same point so its private
    /// pending updates observe exactly the deletes the snapshot covers.
    /// Must be called under the ticket queue's lock so tickets order by
    /// flush initiation.
    pub fn prepare_flush(&mut self) -> Option<FrozenUpdates> {
        let frozen = self.delete_queue.freeze_global_buffer(Some(&mut self.slice));
        self.slice
            .apply(&mut self.pending_updates, self.num_docs_in_ram);
        frozen
    }

    /// Materialize the buffered documents as an immutable segment.
    ///
    /// Private term deletes are applied to this segment's own documents,
    /// bounded by their recorded ordinals; whatever remains is frozen into
    /// a packet for segments flushed earlier. The buffer is spent after a
    /// successful flush.
    pub fn flush(&mut self) -> Result<Option<FlushedSegment>> {
        if self.aborted {
            return Err(KontosError::invalid_operation("buffer is aborted"));
        }
        if self.num_docs_in_ram == 0 {
            return Ok(None);
        }

        let output = self.chain.flush(ChainFlushContext {
            segment_id: &self.segment_id,
            max_doc: self.num_docs_in_ram,
            storage: &self.storage,
        })?;

        let mut deletes = DeletionBitmap::new(self.num_docs_in_ram);
        for &doc_ord in &self.deleted_doc_ids {
            deletes.delete_document(doc_ord)?;
        }

        // Private deletes, bounded by the ordinal each was recorded at.
        for (term, doc_id_upto) in self.pending_updates.terms() {
            for doc_ord in output.term_docs.docs_for_term(term) {
                if doc_ord < doc_id_upto {
                    deletes.delete_document(doc_ord)?;
                }
            }
        }

        let mut doc_values = AHashMap::new();
        for (update, doc_id_upto) in self.pending_updates.doc_values_updates() {
            for doc_ord in output.term_docs.docs_for_term(&update.term) {
                if doc_ord < doc_id_upto && !deletes.is_deleted(doc_ord) {
                    doc_values.insert((update.field.clone(), doc_ord), update.value);
                }
            }
        }

        let frozen_updates = if self.pending_updates.any() {
            Some(self.pending_updates.freeze())
        } else {
            None
        };

        let info = SegmentInfo::new(&self.segment_id, self.num_docs_in_ram, output.files);
        Ok(Some(FlushedSegment {
            info,
            deletes,
            term_docs: output.term_docs,
            doc_values,
            frozen_updates,
        }))
    }

    /// Discard the buffer, giving every reservation back.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.chain.abort();
        self.pending_updates.clear();
        self.counters.release(self.reserved_docs);
        self.reserved_docs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Term;
    use crate::storage::{MemoryStorage, StorageConfig};
    use crate::writer::indexing_chain::InMemoryIndexingChain;
    use crate::writer::sequence::SequenceSource;

    fn make_buffer(limit: u64) -> (WriterBuffer, Arc<DeleteQueue>, Arc<DocCounters>) {
        let queue = Arc::new(DeleteQueue::new(1, Arc::new(SequenceSource::default())));
        let counters = Arc::new(DocCounters::new(limit));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(StorageConfig::default()));
        let buffer = WriterBuffer::new(
            "seg_test".to_string(),
            Box::new(InMemoryIndexingChain::new()),
            Arc::clone(&queue),
            Arc::clone(&counters),
            storage,
        );
        (buffer, queue, counters)
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::builder()
            .add_text("id", id)
            .add_text("body", body)
            .build()
    }

    /// A chain that fails on configured ordinals.
    #[derive(Debug)]
    struct FailingChain {
        inner: InMemoryIndexingChain,
        fail_ord: u32,
        aborting: bool,
    }

    impl IndexingChain for FailingChain {
        fn process_document(&mut self, doc_ord: u32, doc: &Document) -> Result<()> {
            if doc_ord == self.fail_ord {
                if self.aborting {
                    return Err(KontosError::aborting("posting state corrupt"));
                }
                return Err(KontosError::document("bad field"));
            }
            self.inner.process_document(doc_ord, doc)
        }

        fn flush(&mut self, ctx: ChainFlushContext<'_>) -> Result<crate::writer::indexing_chain::ChainOutput> {
            self.inner.flush(ctx)
        }

        fn abort(&mut self) {
            self.inner.abort();
        }

        fn ram_bytes_used(&self) -> usize {
            self.inner.ram_bytes_used()
        }
    }

    #[test]
    fn test_add_documents_reserves_and_counts() {
        let (mut buffer, _queue, counters) = make_buffer(100);

        let outcome = buffer
            .update_documents(&[doc("1", "alpha"), doc("2", "beta")], None)
            .unwrap();
        assert_eq!(outcome.seq_no, 1);
        assert!(outcome.doc_error.is_none());
        assert_eq!(buffer.num_docs_in_ram(), 2);
        assert_eq!(counters.pending(), 2);
    }

    #[test]
    fn test_too_many_docs_rolls_back_reservation() {
        let (mut buffer, _queue, counters) = make_buffer(1);

        buffer.update_documents(&[doc("1", "alpha")], None).unwrap();
        let err = buffer
            .update_documents(&[doc("2", "beta")], None)
            .unwrap_err();
        assert!(matches!(err, KontosError::TooManyDocs { .. }));

        // The failed reservation was rolled back; the first doc stays.
        assert_eq!(counters.pending(), 1);
        assert_eq!(buffer.num_docs_in_ram(), 1);
    }

    #[test]
    fn test_capacity_failure_mid_batch_flags_partial_docs() {
        let (mut buffer, _queue, counters) = make_buffer(2);

        let err = buffer
            .update_documents(&[doc("1", "a"), doc("2", "b"), doc("3", "c")], None)
            .unwrap_err();
        assert!(matches!(err, KontosError::TooManyDocs { .. }));

        // The two processed documents stay reserved but are flagged
        // deleted, so the batch never partially appears.
        assert_eq!(counters.pending(), 2);
        let segment = buffer.flush().unwrap().unwrap();
        assert_eq!(segment.info.max_doc, 2);
        assert_eq!(segment.deletes.live_count(), 0);
    }

    #[test]
    fn test_non_aborting_failure_flags_document_deleted() {
        let queue = Arc::new(DeleteQueue::new(1, Arc::new(SequenceSource::default())));
        let counters = Arc::new(DocCounters::new(100));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(StorageConfig::default()));
        let mut buffer = WriterBuffer::new(
            "seg_test".to_string(),
            Box::new(FailingChain {
                inner: InMemoryIndexingChain::new(),
                fail_ord: 1,
                aborting: false,
            }),
            queue,
            Arc::clone(&counters),
            storage,
        );

        let outcome = buffer
            .update_documents(&[doc("1", "a"), doc("2", "b"), doc("3", "c")], None)
            .unwrap();

        // All three documents hold ordinals; the failed one is flagged.
        assert!(outcome.doc_error.is_some());
        assert_eq!(buffer.num_docs_in_ram(), 3);
        assert_eq!(counters.pending(), 3);

        let segment = buffer.flush().unwrap().unwrap();
        assert_eq!(segment.info.max_doc, 3);
        assert_eq!(segment.deletes.deleted_count(), 1);
        assert!(segment.deletes.is_deleted(1));
    }

    #[test]
    fn test_aborting_failure_surfaces_typed_error() {
        let counters = Arc::new(DocCounters::new(100));
        let queue = Arc::new(DeleteQueue::new(1, Arc::new(SequenceSource::default())));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(StorageConfig::default()));
        let mut buffer = WriterBuffer::new(
            "seg_test".to_string(),
            Box::new(FailingChain {
                inner: InMemoryIndexingChain::new(),
                fail_ord: 0,
                aborting: true,
            }),
            queue,
            Arc::clone(&counters),
            storage,
        );

        let err = buffer.update_documents(&[doc("1", "a")], None).unwrap_err();
        assert!(err.is_aborting());

        // The reservation is handed back when the buffer is discarded.
        assert_eq!(counters.pending(), 1);
        buffer.abort();
        assert_eq!(counters.pending(), 0);
        assert!(buffer.is_aborted());
    }

    #[test]
    fn test_update_deletes_own_earlier_document() {
        let (mut buffer, _queue, _counters) = make_buffer(100);

        // First version of the document.
        buffer
            .update_documents(
                &[doc("1", "old body")],
                Some(DeleteItem::Term(Term::new("id", "1"))),
            )
            .unwrap();
        // Replacement: deletes the earlier doc, exempts itself.
        buffer
            .update_documents(
                &[doc("1", "new body")],
                Some(DeleteItem::Term(Term::new("id", "1"))),
            )
            .unwrap();

        let segment = buffer.flush().unwrap().unwrap();
        assert_eq!(segment.info.max_doc, 2);
        assert!(segment.deletes.is_deleted(0));
        assert!(!segment.deletes.is_deleted(1));
        assert_eq!(segment.deletes.live_count(), 1);
    }

    #[test]
    fn test_plain_add_applies_foreign_deletes() {
        let (mut buffer, queue, _counters) = make_buffer(100);

        buffer.update_documents(&[doc("1", "first")], None).unwrap();

        // A delete from another consumer lands on the queue.
        queue
            .add(DeleteItem::Term(Term::new("id", "1")))
            .unwrap();

        // The next plain add observes the delete, bounded before itself.
        buffer.update_documents(&[doc("2", "second")], None).unwrap();

        let segment = buffer.flush().unwrap().unwrap();
        assert!(segment.deletes.is_deleted(0));
        assert!(!segment.deletes.is_deleted(1));
    }

    #[test]
    fn test_prepare_flush_freezes_global_and_catches_up_slice() {
        let (mut buffer, queue, _counters) = make_buffer(100);

        buffer.update_documents(&[doc("1", "first")], None).unwrap();
        queue
            .add(DeleteItem::Term(Term::new("id", "1")))
            .unwrap();
        queue.try_apply_global_slice();

        let frozen = buffer.prepare_flush().expect("global deletes expected");
        assert_eq!(frozen.terms(), &[Term::new("id", "1")]);

        // The caught-up private slice deletes the matching buffered doc.
        let segment = buffer.flush().unwrap().unwrap();
        assert!(segment.deletes.is_deleted(0));
    }

    #[test]
    fn test_flush_empty_buffer_produces_nothing() {
        let (mut buffer, _queue, _counters) = make_buffer(100);
        assert!(buffer.flush().unwrap().is_none());
    }
}
