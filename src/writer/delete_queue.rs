//! The shared delete/update queue.
//!
//! A monotonically growing, append-only list of pending delete/update items
//! shared by all indexing threads. Each consumer tracks its own position
//! with a [`DeleteSlice`] cursor; the queue additionally maintains a global
//! slice feeding the global [`BufferedUpdates`] for already-flushed
//! segments. Nodes are reference counted, so a node lives exactly as long
//! as some slice can still reach it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::document::Term;
use crate::error::{KontosError, Result};
use crate::writer::buffered_updates::{
    APPLY_TO_ALL_DOCS, BufferedUpdates, FrozenUpdates, NumericDocValuesUpdate,
};
use crate::writer::sequence::SequenceSource;

/// A pending delete or update operation.
#[derive(Debug, Clone)]
pub enum DeleteItem {
    /// Delete all documents matching one term.
    Term(Term),

    /// Delete all documents matching any of the terms.
    Terms(Vec<Term>),

    /// Patch numeric doc-values for matching documents.
    DocValues(Vec<NumericDocValuesUpdate>),
}

impl DeleteItem {
    /// Fold this item into an accumulator, bounded by `doc_id_upto`.
    pub fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        match self {
            DeleteItem::Term(term) => updates.add_term(term.clone(), doc_id_upto),
            DeleteItem::Terms(terms) => {
                for term in terms {
                    updates.add_term(term.clone(), doc_id_upto);
                }
            }
            DeleteItem::DocValues(dv_updates) => {
                for update in dv_updates {
                    updates.add_doc_values_update(update.clone(), doc_id_upto);
                }
            }
        }
    }
}

/// One link in the queue. The sentinel head carries no item; the `next`
/// pointer is set exactly once, under the append lock.
#[derive(Debug)]
struct Node {
    item: Option<DeleteItem>,
    next: OnceLock<Arc<Node>>,
}

impl Node {
    fn sentinel() -> Arc<Node> {
        Arc::new(Node {
            item: None,
            next: OnceLock::new(),
        })
    }

    fn with_item(item: DeleteItem) -> Arc<Node> {
        Arc::new(Node {
            item: Some(item),
            next: OnceLock::new(),
        })
    }
}

/// A consumer's cursor into the queue: the half-open range `(head, tail]`
/// holds the items this consumer has not folded into its accumulator yet.
#[derive(Debug)]
pub struct DeleteSlice {
    head: Arc<Node>,
    tail: Arc<Node>,
}

impl DeleteSlice {
    fn new(node: Arc<Node>) -> Self {
        DeleteSlice {
            head: Arc::clone(&node),
            tail: node,
        }
    }

    /// Whether the slice covers no items.
    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.tail)
    }

    /// Fold every item in `(head, tail]` into `updates`, bounded by
    /// `doc_id_upto`, then advance `head` to `tail`.
    pub fn apply(&mut self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        if self.is_empty() {
            return;
        }
        let mut current = Arc::clone(&self.head);
        loop {
            let next = Arc::clone(
                current
                    .next
                    .get()
                    .expect("slice tail is unreachable from its head"),
            );
            if let Some(item) = &next.item {
                item.apply(updates, doc_id_upto);
            }
            if Arc::ptr_eq(&next, &self.tail) {
                break;
            }
            current = next;
        }
        self.head = Arc::clone(&self.tail);
    }

    /// Drop the covered range without applying it.
    pub fn reset(&mut self) {
        self.head = Arc::clone(&self.tail);
    }
}

/// Outcome of [`DeleteQueue::update_slice`].
///
/// `Advanced` tells the caller new deletes became visible and must be
/// applied before it may proceed; `Unchanged` tells it the slice may simply
/// be reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceAdvance {
    /// The slice tail moved; the covered items must be applied.
    Advanced(u64),

    /// No new items since the slice was last caught up.
    Unchanged(u64),
}

impl SliceAdvance {
    /// The sequence number consumed by the operation.
    pub fn seq_no(&self) -> u64 {
        match self {
            SliceAdvance::Advanced(seq) | SliceAdvance::Unchanged(seq) => *seq,
        }
    }
}

/// Global-slice state, guarded by one dedicated lock so folding nodes into
/// the global buffer never blocks per-thread appends.
#[derive(Debug)]
struct GlobalBuffer {
    slice: DeleteSlice,
    updates: BufferedUpdates,
}

/// The shared, append-only delete queue.
#[derive(Debug)]
pub struct DeleteQueue {
    /// Shared sequence source; survives queue swaps.
    sequence: Arc<SequenceSource>,

    /// Current tail. Write-locked only for the brief append exchange.
    tail: RwLock<Arc<Node>>,

    /// Global slice and buffer for already-flushed segments.
    global: Mutex<GlobalBuffer>,

    /// Queue generation; bumped on every full-flush swap.
    generation: u64,

    /// Closed queues reject further appends but keep their nodes alive for
    /// any slices still referencing them.
    closed: AtomicBool,
}

impl DeleteQueue {
    /// Create a queue for the given generation sharing `sequence`.
    pub fn new(generation: u64, sequence: Arc<SequenceSource>) -> Self {
        let sentinel = Node::sentinel();
        DeleteQueue {
            sequence,
            tail: RwLock::new(Arc::clone(&sentinel)),
            global: Mutex::new(GlobalBuffer {
                slice: DeleteSlice::new(sentinel),
                updates: BufferedUpdates::new(),
            }),
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A fresh slice positioned at the current tail.
    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(Arc::clone(&self.tail.read()))
    }

    /// Append an item. Returns the consumed sequence number.
    pub fn add(&self, item: DeleteItem) -> Result<u64> {
        self.append(item, None)
    }

    /// Append an item and move `slice.tail` onto it, atomically with
    /// respect to queue order. This ties the delete to the caller's cursor
    /// even under concurrent appends from other threads.
    pub fn add_with_slice(&self, item: DeleteItem, slice: &mut DeleteSlice) -> Result<u64> {
        self.append(item, Some(slice))
    }

    fn append(&self, item: DeleteItem, slice: Option<&mut DeleteSlice>) -> Result<u64> {
        let node = Node::with_item(item);
        let mut tail = self.tail.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(KontosError::invalid_operation("delete queue is closed"));
        }
        tail.next
            .set(Arc::clone(&node))
            .unwrap_or_else(|_| unreachable!("append raced past the tail lock"));
        *tail = Arc::clone(&node);
        if let Some(slice) = slice {
            slice.tail = node;
        }
        Ok(self.sequence.next())
    }

    /// Catch a slice up to the current tail.
    ///
    /// Always consumes a sequence number: the caller's operation takes its
    /// place in the total order whether or not new deletes exist.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> SliceAdvance {
        let tail = self.tail.read();
        let seq = self.sequence.next();
        if Arc::ptr_eq(&slice.tail, &tail) {
            SliceAdvance::Unchanged(seq)
        } else {
            slice.tail = Arc::clone(&tail);
            SliceAdvance::Advanced(seq)
        }
    }

    /// Best-effort fold of newly visible items into the global buffer.
    ///
    /// Skips silently when another thread holds the global lock; the items
    /// stay reachable through the global slice and are picked up by the
    /// next holder.
    pub fn try_apply_global_slice(&self) {
        if let Some(mut global) = self.global.try_lock() {
            let tail = Arc::clone(&self.tail.read());
            let GlobalBuffer { slice, updates } = &mut *global;
            slice.tail = tail;
            slice.apply(updates, APPLY_TO_ALL_DOCS);
        }
    }

    /// Catch the global slice fully up and, if the global buffer holds
    /// anything, snapshot and clear it.
    ///
    /// When `caller_slice` is given it is advanced to the same tail, so the
    /// caller's private buffer will observe exactly the items this snapshot
    /// covers.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Option<FrozenUpdates> {
        let mut global = self.global.lock();
        let tail = Arc::clone(&self.tail.read());
        if let Some(slice) = caller_slice {
            slice.tail = Arc::clone(&tail);
        }
        let GlobalBuffer { slice, updates } = &mut *global;
        slice.tail = tail;
        slice.apply(updates, APPLY_TO_ALL_DOCS);
        if updates.any() {
            Some(updates.freeze())
        } else {
            None
        }
    }

    /// Number of distinct delete terms currently in the global buffer.
    pub fn buffered_delete_terms(&self) -> usize {
        self.global.lock().updates.num_term_deletes()
    }

    /// Stop accepting appends. Nodes stay alive for outstanding slices.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DeleteQueue {
    fn drop(&mut self) {
        // Unlink the chain iteratively; a long queue dropped recursively
        // through nested Arc<Node> would overflow the stack.
        let mut current = {
            let global = self.global.get_mut();
            std::mem::replace(&mut global.slice, DeleteSlice::new(Node::sentinel())).head
        };
        loop {
            let Some(next) = current.next.get().map(Arc::clone) else {
                break;
            };
            if Arc::strong_count(&current) > 1 {
                // Another slice still references this node; it will free
                // the remainder of the chain.
                break;
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn queue() -> DeleteQueue {
        DeleteQueue::new(1, Arc::new(SequenceSource::default()))
    }

    fn term_item(text: &str) -> DeleteItem {
        DeleteItem::Term(Term::new("id", text))
    }

    #[test]
    fn test_add_and_slice_apply() {
        let queue = queue();
        let mut slice = queue.new_slice();

        queue.add(term_item("1")).unwrap();
        queue.add(term_item("2")).unwrap();

        match queue.update_slice(&mut slice) {
            SliceAdvance::Advanced(seq) => assert_eq!(seq, 3),
            other => panic!("expected advance, got {other:?}"),
        }

        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, 10);
        assert_eq!(updates.num_term_deletes(), 2);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(10));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_update_slice_unchanged_when_caught_up() {
        let queue = queue();
        let mut slice = queue.new_slice();

        match queue.update_slice(&mut slice) {
            SliceAdvance::Unchanged(seq) => assert_eq!(seq, 1),
            other => panic!("expected unchanged, got {other:?}"),
        }
    }

    #[test]
    fn test_add_with_slice_covers_exactly_the_added_item() {
        let queue = queue();
        let mut slice = queue.new_slice();

        // Another consumer appends concurrently-ordered items.
        queue.add(term_item("other")).unwrap();

        // Catch up and drop what other threads appended.
        queue.update_slice(&mut slice);
        slice.reset();

        queue
            .add_with_slice(term_item("mine"), &mut slice)
            .unwrap();

        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, 5);
        assert_eq!(updates.num_term_deletes(), 1);
        assert_eq!(updates.term_bound(&Term::new("id", "mine")), Some(5));
        assert_eq!(updates.term_bound(&Term::new("id", "other")), None);
    }

    #[test]
    fn test_freeze_global_buffer() {
        let queue = queue();

        queue.add(term_item("1")).unwrap();
        queue.add(term_item("2")).unwrap();
        queue.try_apply_global_slice();
        assert_eq!(queue.buffered_delete_terms(), 2);

        let frozen = queue.freeze_global_buffer(None).unwrap();
        assert_eq!(frozen.terms().len(), 2);

        // The buffer was cleared by the freeze.
        assert_eq!(queue.buffered_delete_terms(), 0);
        assert!(queue.freeze_global_buffer(None).is_none());
    }

    #[test]
    fn test_freeze_advances_caller_slice() {
        let queue = queue();
        let mut caller = queue.new_slice();

        queue.add(term_item("1")).unwrap();
        let frozen = queue.freeze_global_buffer(Some(&mut caller));
        assert!(frozen.is_some());

        // The caller's slice now covers the same item.
        let mut updates = BufferedUpdates::new();
        caller.apply(&mut updates, 3);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(3));
    }

    #[test]
    fn test_closed_queue_rejects_appends() {
        let queue = queue();
        queue.close();
        assert!(queue.is_closed());
        assert!(queue.add(term_item("1")).is_err());
    }

    #[test]
    fn test_concurrent_appends_are_all_visible() {
        let queue = Arc::new(queue());
        let mut handles = Vec::new();

        for t in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    queue
                        .add(DeleteItem::Term(Term::new("id", format!("{t}-{i}"))))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        queue.try_apply_global_slice();
        assert_eq!(queue.buffered_delete_terms(), 1000);

        let frozen = queue.freeze_global_buffer(None).unwrap();
        assert_eq!(frozen.terms().len(), 1000);
    }

    #[test]
    fn test_long_queue_drops_without_overflow() {
        let queue = queue();
        for i in 0..50_000 {
            queue
                .add(DeleteItem::Term(Term::new("id", i.to_string())))
                .unwrap();
        }
        drop(queue);
    }
}
