//! Ordered publication of in-flight flushes.
//!
//! A ticket is created synchronously when a flush is initiated and filled
//! asynchronously when the flush I/O completes. Tickets publish strictly in
//! creation order, so segments become visible in the order their flushes
//! started even when the I/O finishes out of order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::segment::FlushedSegment;
use crate::writer::buffer::WriterBuffer;
use crate::writer::buffered_updates::FrozenUpdates;

/// Lifecycle of a segment ticket's payload.
#[derive(Debug)]
enum SegmentSlot {
    /// Flush I/O still running.
    Pending,

    /// Flush completed; segment waiting to publish.
    Ready(FlushedSegment),

    /// Flush produced no segment (empty buffer).
    Dropped,

    /// Flush failed; the ticket publishes nothing.
    Failed,
}

/// One in-flight flush: the global-deletes snapshot taken at initiation
/// plus the segment filled in at completion. Deletes-only tickets carry no
/// segment slot.
#[derive(Debug)]
pub struct FlushTicket {
    /// Global-deletes snapshot captured when the flush was initiated.
    frozen: Mutex<Option<FrozenUpdates>>,

    /// The segment payload; `None` for deletes-only tickets.
    segment: Option<Mutex<SegmentSlot>>,

    published: AtomicBool,
}

impl FlushTicket {
    fn for_segment(frozen: Option<FrozenUpdates>) -> Self {
        FlushTicket {
            frozen: Mutex::new(frozen),
            segment: Some(Mutex::new(SegmentSlot::Pending)),
            published: AtomicBool::new(false),
        }
    }

    fn for_deletes(frozen: FrozenUpdates) -> Self {
        FlushTicket {
            frozen: Mutex::new(Some(frozen)),
            segment: None,
            published: AtomicBool::new(false),
        }
    }

    /// Whether the ticket can be handed to the publish consumer.
    pub fn can_publish(&self) -> bool {
        match &self.segment {
            None => true,
            Some(slot) => !matches!(*slot.lock(), SegmentSlot::Pending),
        }
    }

    /// Fill in the flushed segment. Filling a ticket twice, or a
    /// deletes-only ticket at all, is a logic error.
    pub fn set_segment(&self, segment: FlushedSegment) {
        let slot = self.segment.as_ref().expect("deletes-only ticket");
        let mut slot = slot.lock();
        assert!(
            matches!(*slot, SegmentSlot::Pending),
            "ticket segment set twice"
        );
        *slot = SegmentSlot::Ready(segment);
    }

    /// Record that the flush produced no segment.
    pub fn set_dropped(&self) {
        let slot = self.segment.as_ref().expect("deletes-only ticket");
        let mut slot = slot.lock();
        assert!(
            matches!(*slot, SegmentSlot::Pending),
            "ticket segment set twice"
        );
        *slot = SegmentSlot::Dropped;
    }

    /// Mark the flush failed, making the ticket publishable without a
    /// segment so it cannot block the queue.
    pub fn set_failed(&self) {
        if let Some(slot) = &self.segment {
            *slot.lock() = SegmentSlot::Failed;
        }
    }

    /// Whether the underlying flush failed.
    pub fn is_failed(&self) -> bool {
        match &self.segment {
            None => false,
            Some(slot) => matches!(*slot.lock(), SegmentSlot::Failed),
        }
    }

    /// Take the global-deletes snapshot, if any.
    pub fn take_frozen(&self) -> Option<FrozenUpdates> {
        self.frozen.lock().take()
    }

    /// Take the flushed segment, if the flush produced one.
    pub fn take_segment(&self) -> Option<FlushedSegment> {
        let slot = self.segment.as_ref()?;
        let mut slot = slot.lock();
        match std::mem::replace(&mut *slot, SegmentSlot::Dropped) {
            SegmentSlot::Ready(segment) => Some(segment),
            other => {
                *slot = other;
                None
            }
        }
    }

    fn mark_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    /// Whether the ticket went through the publish consumer.
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }
}

/// FIFO of in-flight flush tickets.
#[derive(Debug, Default)]
pub struct TicketQueue {
    /// Tickets in flush-initiation order. One lock orders creation.
    queue: Mutex<VecDeque<Arc<FlushTicket>>>,

    /// Tickets created but not yet published.
    in_flight: AtomicU32,

    /// Serializes purges so consumers observe strict FIFO order.
    purge_lock: Mutex<()>,
}

impl TicketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tickets created but not yet published.
    pub fn ticket_count(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Create the ticket for a segment flush that is about to start.
    ///
    /// The buffer's `prepare_flush` runs under the queue lock, so the
    /// global-deletes snapshot and the ticket's position agree on one
    /// flush-initiation order.
    pub fn add_segment_ticket(&self, buffer: &mut WriterBuffer) -> Arc<FlushTicket> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut queue = self.queue.lock();
        let frozen = buffer.prepare_flush();
        let ticket = Arc::new(FlushTicket::for_segment(frozen));
        queue.push_back(Arc::clone(&ticket));
        ticket
    }

    /// Enqueue a deletes-only ticket carrying a frozen global snapshot.
    pub fn add_deletes_ticket(&self, frozen: FrozenUpdates) -> Arc<FlushTicket> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut queue = self.queue.lock();
        let ticket = Arc::new(FlushTicket::for_deletes(frozen));
        queue.push_back(Arc::clone(&ticket));
        ticket
    }

    /// Publish every ready ticket from the head, blocking for the purge
    /// lock. Stops at the first ticket whose flush has not completed.
    pub fn force_purge(
        &self,
        consumer: &mut dyn FnMut(&FlushTicket) -> Result<()>,
    ) -> Result<u32> {
        let _guard = self.purge_lock.lock();
        self.inner_purge(consumer)
    }

    /// Best-effort purge: publishes only if no other purge is running.
    pub fn try_purge(&self, consumer: &mut dyn FnMut(&FlushTicket) -> Result<()>) -> Result<u32> {
        match self.purge_lock.try_lock() {
            Some(_guard) => self.inner_purge(consumer),
            None => Ok(0),
        }
    }

    fn inner_purge(&self, consumer: &mut dyn FnMut(&FlushTicket) -> Result<()>) -> Result<u32> {
        let mut published = 0;
        loop {
            // Pop under the queue lock, publish outside it.
            let ticket = {
                let mut queue = self.queue.lock();
                if !queue.front().is_some_and(|t| t.can_publish()) {
                    break;
                }
                queue.pop_front().unwrap()
            };
            let result = consumer(&ticket);
            // Keep the bookkeeping sane even when the consumer fails.
            ticket.mark_published();
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            result?;
            published += 1;
        }
        Ok(published)
    }

    /// Drop every ticket without publishing. Used by rollback.
    pub fn clear(&self) {
        let _guard = self.purge_lock.lock();
        let mut queue = self.queue.lock();
        let dropped = queue.len() as u32;
        queue.clear();
        self.in_flight.fetch_sub(dropped, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::buffered_updates::{APPLY_TO_ALL_DOCS, BufferedUpdates};
    use crate::document::Term;

    fn frozen(text: &str) -> FrozenUpdates {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", text), APPLY_TO_ALL_DOCS);
        updates.freeze()
    }

    #[test]
    fn test_deletes_ticket_publishes_immediately() {
        let queue = TicketQueue::new();
        let ticket = queue.add_deletes_ticket(frozen("1"));
        assert!(ticket.can_publish());
        assert_eq!(queue.ticket_count(), 1);

        let mut seen = 0;
        queue
            .force_purge(&mut |t| {
                assert!(t.take_frozen().is_some());
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(queue.ticket_count(), 0);
        assert!(ticket.is_published());
    }

    #[test]
    fn test_purge_stops_at_pending_ticket() {
        let queue = TicketQueue::new();

        // Two deletes-only tickets around one pending segment ticket,
        // created directly to model an unfinished flush.
        queue.add_deletes_ticket(frozen("1"));
        {
            let mut inner = queue.queue.lock();
            inner.push_back(Arc::new(FlushTicket::for_segment(None)));
            queue.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        queue.add_deletes_ticket(frozen("2"));

        let mut order = Vec::new();
        queue
            .force_purge(&mut |t| {
                order.push(t.take_frozen().unwrap().terms()[0].text.clone());
                Ok(())
            })
            .unwrap();

        // Only the head published; the pending ticket blocks the rest.
        assert_eq!(order, vec!["1"]);
        assert_eq!(queue.ticket_count(), 2);

        // Completing the pending ticket unblocks strict FIFO publication.
        {
            let inner = queue.queue.lock();
            inner.front().unwrap().set_dropped();
        }
        queue
            .force_purge(&mut |t| {
                if let Some(f) = t.take_frozen() {
                    order.push(f.terms()[0].text.clone());
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(order, vec!["1", "2"]);
        assert_eq!(queue.ticket_count(), 0);
    }

    #[test]
    fn test_failed_ticket_unblocks_queue() {
        let queue = TicketQueue::new();
        let ticket = {
            let mut inner = queue.queue.lock();
            let ticket = Arc::new(FlushTicket::for_segment(None));
            inner.push_back(Arc::clone(&ticket));
            queue.in_flight.fetch_add(1, Ordering::AcqRel);
            ticket
        };
        queue.add_deletes_ticket(frozen("after"));

        ticket.set_failed();
        assert!(ticket.is_failed());
        assert!(ticket.can_publish());
        assert!(ticket.take_segment().is_none());

        let mut published = 0;
        queue
            .force_purge(&mut |_| {
                published += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(published, 2);
    }

    #[test]
    fn test_clear_discards_everything() {
        let queue = TicketQueue::new();
        queue.add_deletes_ticket(frozen("1"));
        queue.add_deletes_ticket(frozen("2"));
        assert_eq!(queue.ticket_count(), 2);

        queue.clear();
        assert_eq!(queue.ticket_count(), 0);
        queue.force_purge(&mut |_| panic!("nothing to publish")).unwrap();
    }
}
