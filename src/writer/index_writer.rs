//! The index writer: flush, commit, and publication orchestration.
//!
//! Routes concurrent add/update/delete calls to write buffers, drives
//! per-buffer and full flushes, publishes flush tickets in initiation
//! order, resolves frozen update packets against published segments, and
//! persists the segment list on commit. All methods take `&self`; the
//! writer is shared across indexing threads behind an `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;

use crate::document::{Document, Term};
use crate::error::{KontosError, Result};
use crate::segment::SegmentInfo;
use crate::storage::Storage;
use crate::writer::buffer::{DocCounters, WriterBuffer};
use crate::writer::buffered_updates::{FrozenUpdates, NumericDocValuesUpdate};
use crate::writer::config::WriterConfig;
use crate::writer::delete_queue::DeleteItem;
use crate::writer::flush_control::{FlushByRamOrCounts, FlushControl, FlushPolicy};
use crate::writer::indexing_chain::{DefaultChainFactory, IndexingChainFactory};
use crate::writer::registry::{PublishedSegment, SegmentRegistry};
use crate::writer::sequence::{OpReceipt, SequenceSource};
use crate::writer::ticket_queue::{FlushTicket, TicketQueue};
use crate::writer::updates_stream::UpdatesStream;

/// Callbacks the writer invokes on its host for directory I/O and
/// scheduling concerns it does not own itself.
pub trait FlushNotifications: Send + Sync + std::fmt::Debug {
    /// Files are no longer referenced and may be removed.
    fn delete_unused_files(&self, files: &[String]);

    /// A segment flush failed; its partial files should be cleaned up.
    fn flush_failed(&self, segment_id: &str);

    /// Segments were published from the ticket queue.
    fn after_segments_flushed(&self) -> Result<()> {
        Ok(())
    }

    /// A frozen update packet finished resolving.
    fn on_updates_applied(&self) {}

    /// The ticket queue is backing up behind slow flushes.
    fn on_ticket_backlog(&self, _queued: u32) {}
}

/// Default host: cleans files up directly through storage.
#[derive(Debug)]
pub struct StorageCleanup {
    storage: Arc<dyn Storage>,
}

impl StorageCleanup {
    /// Create a cleanup host over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        StorageCleanup { storage }
    }
}

impl FlushNotifications for StorageCleanup {
    fn delete_unused_files(&self, files: &[String]) {
        for file in files {
            let _ = self.storage.delete_file(file);
        }
    }

    fn flush_failed(&self, segment_id: &str) {
        if let Ok(files) = self.storage.list_files() {
            for file in files {
                if file.starts_with(segment_id) {
                    let _ = self.storage.delete_file(&file);
                }
            }
        }
    }
}

/// A merge requested at commit time.
#[derive(Debug, Clone)]
pub struct MergeSpec {
    /// Segments to merge together.
    pub segment_ids: Vec<String>,
}

/// Merge selection seam. Only the full-flush interaction is part of the
/// write path; selection heuristics live outside.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Merges worth running while a commit waits.
    fn find_full_flush_merges(&self, segments: &[SegmentInfo]) -> Vec<MergeSpec>;
}

/// Policy that never requests merges.
#[derive(Debug, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_full_flush_merges(&self, _segments: &[SegmentInfo]) -> Vec<MergeSpec> {
        Vec::new()
    }
}

/// Executes commit-time merges. The committing thread waits on the
/// returned channel for at most the configured bound.
pub trait MergeScheduler: Send + Sync + std::fmt::Debug {
    /// Start the merges and return a channel that closes when they finish.
    fn merge_on_commit(&self, specs: Vec<MergeSpec>) -> Receiver<()>;
}

/// Scheduler that runs nothing; its channel closes immediately.
#[derive(Debug, Default)]
pub struct NoopMergeScheduler;

impl MergeScheduler for NoopMergeScheduler {
    fn merge_on_commit(&self, _specs: Vec<MergeSpec>) -> Receiver<()> {
        let (sender, receiver) = bounded(0);
        drop(sender);
        receiver
    }
}

/// Deferred work produced while publishing tickets, drained after every
/// public call.
#[derive(Debug)]
enum WriterEvent {
    /// Resolve a stamped update packet against published segments.
    ApplyUpdates(Arc<FrozenUpdates>),

    /// Hand files to the host for removal.
    DeleteFiles(Vec<String>),
}

/// Pluggable collaborators for the writer.
#[derive(Debug)]
pub struct WriterComponents {
    /// Creates one indexing chain per write buffer.
    pub chain_factory: Arc<dyn IndexingChainFactory>,

    /// Flush decision policy; defaults to [`FlushByRamOrCounts`].
    pub flush_policy: Option<Arc<dyn FlushPolicy>>,

    /// Host callbacks; defaults to [`StorageCleanup`].
    pub notifications: Option<Arc<dyn FlushNotifications>>,

    /// Commit-time merge selection.
    pub merge_policy: Arc<dyn MergePolicy>,

    /// Commit-time merge execution.
    pub merge_scheduler: Arc<dyn MergeScheduler>,
}

impl Default for WriterComponents {
    fn default() -> Self {
        WriterComponents {
            chain_factory: Arc::new(DefaultChainFactory),
            flush_policy: None,
            notifications: None,
            merge_policy: Arc::new(NoMergePolicy),
            merge_scheduler: Arc::new(NoopMergeScheduler),
        }
    }
}

/// Counters describing the writer's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Documents fed to buffers.
    pub docs_added: u64,

    /// Delete/update operations issued.
    pub delete_ops: u64,

    /// Segments published into the registry.
    pub segments_published: u64,

    /// Frozen update packets fully resolved.
    pub update_packets_applied: u64,

    /// Full flushes performed.
    pub full_flushes: u64,

    /// Commits completed.
    pub commits: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    docs_added: AtomicU64,
    delete_ops: AtomicU64,
    segments_published: AtomicU64,
    update_packets_applied: AtomicU64,
    full_flushes: AtomicU64,
    commits: AtomicU64,
}

/// The user entry point for changing an index.
#[derive(Debug)]
pub struct IndexWriter {
    config: WriterConfig,
    storage: Arc<dyn Storage>,
    sequence: Arc<SequenceSource>,
    counters: Arc<DocCounters>,
    flush_policy: Arc<dyn FlushPolicy>,
    flush_control: FlushControl,
    ticket_queue: TicketQueue,
    updates_stream: UpdatesStream,
    registry: SegmentRegistry,
    notifications: Arc<dyn FlushNotifications>,
    merge_policy: Arc<dyn MergePolicy>,
    merge_scheduler: Arc<dyn MergeScheduler>,

    events_tx: Sender<WriterEvent>,
    events_rx: Receiver<WriterEvent>,

    /// Serializes full flush, commit, and teardown sequencing.
    commit_lock: Mutex<()>,

    /// Sequence number of a prepared-but-unfinished commit.
    pending_commit: Mutex<Option<u64>>,

    closed: AtomicBool,
    last_commit_seq: AtomicU64,
    stats: StatsCells,
}

impl IndexWriter {
    /// Open a writer over the given storage with default collaborators.
    ///
    /// Recovers the committed segment list from the newest manifest when
    /// one exists.
    pub fn new(storage: Arc<dyn Storage>, config: WriterConfig) -> Result<Self> {
        Self::with_components(storage, config, WriterComponents::default())
    }

    /// Open a writer with explicit collaborators.
    pub fn with_components(
        storage: Arc<dyn Storage>,
        config: WriterConfig,
        components: WriterComponents,
    ) -> Result<Self> {
        config.validate()?;

        let registry = SegmentRegistry::load(Arc::clone(&storage))?;
        let counters = Arc::new(DocCounters::new(config.max_docs));
        // Durably flushed documents keep their reservations.
        counters.reserve(registry.total_max_doc())?;

        let sequence = Arc::new(SequenceSource::default());
        let flush_policy = components
            .flush_policy
            .unwrap_or_else(|| Arc::new(FlushByRamOrCounts::from_config(&config)));
        let notifications = components
            .notifications
            .unwrap_or_else(|| Arc::new(StorageCleanup::new(Arc::clone(&storage))));
        let flush_control = FlushControl::new(
            config.clone(),
            Arc::clone(&flush_policy),
            components.chain_factory,
            Arc::clone(&counters),
            Arc::clone(&storage),
            Arc::clone(&sequence),
        );
        let (events_tx, events_rx) = unbounded();

        Ok(IndexWriter {
            config,
            storage,
            sequence,
            counters,
            flush_policy,
            flush_control,
            ticket_queue: TicketQueue::new(),
            updates_stream: UpdatesStream::new(),
            registry,
            notifications,
            merge_policy: components.merge_policy,
            merge_scheduler: components.merge_scheduler,
            events_tx,
            events_rx,
            commit_lock: Mutex::new(()),
            pending_commit: Mutex::new(None),
            closed: AtomicBool::new(false),
            last_commit_seq: AtomicU64::new(0),
            stats: StatsCells::default(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KontosError::index("Writer is closed"));
        }
        Ok(())
    }

    /// Add one document.
    pub fn add_document(&self, doc: Document) -> Result<OpReceipt> {
        self.run_update(None, &[doc])
    }

    /// Add a batch of documents under one sequence number.
    pub fn add_documents(&self, docs: &[Document]) -> Result<OpReceipt> {
        self.run_update(None, docs)
    }

    /// Atomically delete every document matching `term`, then add `doc`.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<OpReceipt> {
        self.run_update(Some(DeleteItem::Term(term)), &[doc])
    }

    /// Atomically delete every document matching `term`, then add a batch.
    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<OpReceipt> {
        self.run_update(Some(DeleteItem::Term(term)), docs)
    }

    fn run_update(&self, delete_item: Option<DeleteItem>, docs: &[Document]) -> Result<OpReceipt> {
        self.ensure_open()?;

        let mut buffer = self.flush_control.obtain()?;
        let outcome = match buffer.update_documents(docs, delete_item) {
            Ok(outcome) => outcome,
            Err(error) => {
                if error.is_aborting() {
                    let segment_id = buffer.segment_id().to_string();
                    buffer.abort();
                    self.flush_control.checkin(buffer);
                    self.notifications.flush_failed(&segment_id);
                } else {
                    // Capacity errors leave the buffer consistent.
                    self.flush_control.checkin(buffer);
                }
                return Err(error);
            }
        };
        self.stats
            .docs_added
            .fetch_add(docs.len() as u64, Ordering::Relaxed);

        let flush_pending = self.flush_control.checkin(buffer);
        let mut triggered = false;
        if flush_pending {
            triggered = true;
            self.flush_pending_buffers()?;
        }
        if self.process_events()? {
            triggered = true;
        }

        if let Some(doc_error) = outcome.doc_error {
            return Err(doc_error);
        }
        Ok(OpReceipt {
            seq_no: outcome.seq_no,
            triggered,
        })
    }

    /// Delete every document matching `term`.
    pub fn delete_term(&self, term: Term) -> Result<OpReceipt> {
        self.run_delete(DeleteItem::Term(term))
    }

    /// Delete every document matching any of `terms`.
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<OpReceipt> {
        self.run_delete(DeleteItem::Terms(terms))
    }

    /// Write a numeric doc-values entry for every document matching the
    /// update's term.
    pub fn update_numeric_doc_value(
        &self,
        term: Term,
        field: &str,
        value: i64,
    ) -> Result<OpReceipt> {
        self.run_delete(DeleteItem::DocValues(vec![NumericDocValuesUpdate::new(
            term, field, value,
        )]))
    }

    fn run_delete(&self, item: DeleteItem) -> Result<OpReceipt> {
        self.ensure_open()?;

        let queue = self.flush_control.current_queue();
        let seq_no = queue.add(item)?;
        queue.try_apply_global_slice();
        self.stats.delete_ops.fetch_add(1, Ordering::Relaxed);

        let mut triggered = false;
        // Bound delete pressure without flushing any segment.
        if self
            .flush_policy
            .should_flush_deletes(queue.buffered_delete_terms())
            && let Some(frozen) = queue.freeze_global_buffer(None)
        {
            self.ticket_queue.add_deletes_ticket(frozen);
            self.purge_tickets(false)?;
            triggered = true;
        }
        if self.process_events()? {
            triggered = true;
        }
        Ok(OpReceipt { seq_no, triggered })
    }

    /// Flush queued buffers, then publish whatever became ready.
    fn flush_pending_buffers(&self) -> Result<()> {
        while let Some(buffer) = self.flush_control.next_pending_flush() {
            self.flush_one(buffer)?;
        }
        let backlog = self.ticket_queue.ticket_count();
        if backlog as usize > self.config.max_queued_flushes {
            self.notifications.on_ticket_backlog(backlog);
        }
        self.purge_tickets(false)?;
        Ok(())
    }

    /// Run one buffer's flush. The ticket is created before the flush I/O
    /// starts so publication keeps initiation order.
    fn flush_one(&self, mut buffer: WriterBuffer) -> Result<()> {
        let ticket = self.ticket_queue.add_segment_ticket(&mut buffer);
        let segment_id = buffer.segment_id().to_string();
        match buffer.flush() {
            Ok(Some(segment)) => {
                ticket.set_segment(segment);
                self.flush_control.after_flush();
                Ok(())
            }
            Ok(None) => {
                ticket.set_dropped();
                self.flush_control.after_flush();
                Ok(())
            }
            Err(error) => {
                // The failed ticket stays publishable so it cannot block
                // the queue behind it.
                ticket.set_failed();
                buffer.abort();
                self.flush_control.after_flush();
                self.notifications.flush_failed(&segment_id);
                Err(KontosError::flush_failed(format!(
                    "segment {segment_id}: {error}"
                )))
            }
        }
    }

    fn purge_tickets(&self, forced: bool) -> Result<u32> {
        let mut consumer = |ticket: &FlushTicket| self.publish_ticket(ticket);
        let published = if forced {
            self.ticket_queue.force_purge(&mut consumer)?
        } else {
            self.ticket_queue.try_purge(&mut consumer)?
        };
        if published > 0 {
            self.notifications.after_segments_flushed()?;
        }
        Ok(published)
    }

    /// Publish one ticket: stamp its packets with generations, register
    /// the segment, and defer packet resolution to the event queue.
    fn publish_ticket(&self, ticket: &FlushTicket) -> Result<()> {
        // The global snapshot survives even a failed flush; the deletes it
        // carries are real operations that must not be lost.
        if let Some(frozen) = ticket.take_frozen()
            && frozen.any()
        {
            let r#gen = self.updates_stream.next_generation();
            frozen.set_del_gen(r#gen);
            let _ = self.events_tx.send(WriterEvent::ApplyUpdates(Arc::new(frozen)));
        }

        if let Some(mut segment) = ticket.take_segment() {
            let del_gen = match segment.frozen_updates.take() {
                Some(private) if private.any() => {
                    let r#gen = self.updates_stream.next_generation();
                    private.set_del_gen(r#gen);
                    let _ = self
                        .events_tx
                        .send(WriterEvent::ApplyUpdates(Arc::new(private)));
                    r#gen
                }
                _ => {
                    // No packet will resolve under this generation; it is
                    // finished the moment it is allocated.
                    let r#gen = self.updates_stream.next_generation();
                    self.updates_stream.finish(r#gen);
                    r#gen
                }
            };
            self.registry.publish(segment, del_gen);
            self.stats.segments_published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drain deferred work. Returns whether anything ran.
    fn process_events(&self) -> Result<bool> {
        let mut any = false;
        while let Ok(event) = self.events_rx.try_recv() {
            any = true;
            match event {
                WriterEvent::ApplyUpdates(packet) => {
                    self.registry.apply_updates(&packet)?;
                    self.updates_stream.finish(packet.del_gen());
                    self.stats
                        .update_packets_applied
                        .fetch_add(1, Ordering::Relaxed);
                    self.notifications.on_updates_applied();

                    let watermark = self.updates_stream.completed_del_gen();
                    for info in self.registry.drop_fully_deleted(watermark) {
                        self.counters.release(info.max_doc as u64);
                        let _ = self.events_tx.send(WriterEvent::DeleteFiles(info.files));
                    }
                }
                WriterEvent::DeleteFiles(files) => {
                    self.notifications.delete_unused_files(&files);
                }
            }
        }
        Ok(any)
    }

    /// Flush every buffer to disk and publish, without committing.
    /// Returns the sequence number of the cutover.
    pub fn flush(&self) -> Result<u64> {
        self.ensure_open()?;
        let _guard = self.commit_lock.lock();
        self.do_full_flush()
    }

    fn do_full_flush(&self) -> Result<u64> {
        let (seq, old_queue) = self.flush_control.mark_for_full_flush()?;
        self.stats.full_flushes.fetch_add(1, Ordering::Relaxed);

        let flushed: Result<()> = (|| {
            while let Some(buffer) = self.flush_control.next_pending_flush() {
                self.flush_one(buffer)?;
            }
            // Deletes appended to the retired queue after the last segment
            // ticket was cut still need a ride out.
            if let Some(frozen) = old_queue.freeze_global_buffer(None) {
                self.ticket_queue.add_deletes_ticket(frozen);
            }
            self.purge_tickets(true)?;
            Ok(())
        })();

        match flushed {
            Ok(()) => {
                self.flush_control.finish_full_flush(true);
                self.process_events()?;
                Ok(seq)
            }
            Err(error) => {
                self.flush_control.finish_full_flush(false);
                Err(error)
            }
        }
    }

    /// Full flush, apply all pending updates, and stage the commit.
    pub fn prepare_commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let _guard = self.commit_lock.lock();
        self.prepare_commit_locked()
    }

    fn prepare_commit_locked(&self) -> Result<u64> {
        if self.pending_commit.lock().is_some() {
            return Err(KontosError::invalid_operation(
                "a commit is already prepared",
            ));
        }
        let seq = self.do_full_flush()?;
        // Everything the flush deferred must be resolved before the
        // manifest is cut.
        self.process_events()?;

        let specs = self
            .merge_policy
            .find_full_flush_merges(&self.registry.segment_infos());
        if !specs.is_empty() {
            let done = self.merge_scheduler.merge_on_commit(specs);
            let _ = done.recv_timeout(Duration::from_millis(self.config.commit_merge_wait_millis));
        }

        *self.pending_commit.lock() = Some(seq);
        Ok(seq)
    }

    /// Commit pending changes durably. Runs `prepare_commit` first when no
    /// commit is staged. Returns the commit's sequence number; any reader
    /// opened after it is durable sees every change at or below it.
    pub fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let _guard = self.commit_lock.lock();
        if self.pending_commit.lock().is_none() {
            self.prepare_commit_locked()?;
        }
        let seq = self
            .pending_commit
            .lock()
            .take()
            .expect("commit was just prepared");
        self.registry.commit()?;
        self.last_commit_seq.store(seq, Ordering::SeqCst);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Discard all uncommitted state and close the writer.
    pub fn rollback(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush_control.close();
        self.flush_control.abort_all();
        self.ticket_queue.clear();
        while self.events_rx.try_recv().is_ok() {}
        *self.pending_commit.lock() = None;
        Ok(())
    }

    /// Close the writer, committing first when configured to.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.config.commit_on_close {
            self.commit()?;
        }
        self.rollback()
    }

    /// Whether the writer is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Documents reserved across buffers and flushed segments.
    pub fn pending_docs(&self) -> u64 {
        self.counters.pending()
    }

    /// Live documents across published segments.
    pub fn num_live_docs(&self) -> u64 {
        self.registry.num_live_docs()
    }

    /// Number of published segments.
    pub fn num_segments(&self) -> usize {
        self.registry.num_segments()
    }

    /// Published segment metadata, in publish order.
    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        self.registry.segment_infos()
    }

    /// One published segment by id.
    pub fn segment(&self, segment_id: &str) -> Option<Arc<PublishedSegment>> {
        self.registry.segment(segment_id)
    }

    /// The delete-generation watermark: every generation at or below it is
    /// fully resolved.
    pub fn completed_del_gen(&self) -> u64 {
        self.updates_stream.completed_del_gen()
    }

    /// The most recently handed-out sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.last()
    }

    /// Sequence number of the last finished commit.
    pub fn last_commit_sequence(&self) -> u64 {
        self.last_commit_seq.load(Ordering::SeqCst)
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            docs_added: self.stats.docs_added.load(Ordering::Relaxed),
            delete_ops: self.stats.delete_ops.load(Ordering::Relaxed),
            segments_published: self.stats.segments_published.load(Ordering::Relaxed),
            update_packets_applied: self.stats.update_packets_applied.load(Ordering::Relaxed),
            full_flushes: self.stats.full_flushes.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
