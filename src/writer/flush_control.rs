//! Flush control: buffer checkout, flush policy, and backpressure.
//!
//! Tracks every write buffer's pressure, decides which buffer must flush
//! next, swaps the delete queue for full flushes, and stalls incoming
//! document calls when flushing cannot keep up. Buffers are checked out to
//! one indexing thread at a time; all heavy lifting happens outside the
//! control lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::{KontosError, Result};
use crate::storage::Storage;
use crate::writer::buffer::{DocCounters, WriterBuffer};
use crate::writer::config::WriterConfig;
use crate::writer::delete_queue::DeleteQueue;
use crate::writer::indexing_chain::IndexingChainFactory;
use crate::writer::sequence::SequenceSource;

/// Decides when buffers and buffered deletes must flush.
pub trait FlushPolicy: Send + Sync + std::fmt::Debug {
    /// Whether this buffer crossed its flush threshold.
    fn should_flush_buffer(&self, buffer: &WriterBuffer) -> bool;

    /// Whether the global delete buffer crossed its flush threshold.
    fn should_flush_deletes(&self, buffered_delete_terms: usize) -> bool;
}

/// Default policy: flush a buffer once it holds too many documents or too
/// much RAM, and flush deletes once too many distinct terms are buffered.
#[derive(Debug)]
pub struct FlushByRamOrCounts {
    /// RAM budget per buffer (in bytes).
    pub ram_budget_per_buffer: usize,

    /// Document-count budget per buffer.
    pub max_buffered_docs: u32,

    /// Distinct-term budget for the global delete buffer.
    pub max_buffered_delete_terms: usize,
}

impl FlushByRamOrCounts {
    /// Build the policy from a writer configuration.
    pub fn from_config(config: &WriterConfig) -> Self {
        FlushByRamOrCounts {
            ram_budget_per_buffer: config.ram_budget_per_buffer,
            max_buffered_docs: config.max_buffered_docs,
            max_buffered_delete_terms: config.max_buffered_delete_terms,
        }
    }
}

impl FlushPolicy for FlushByRamOrCounts {
    fn should_flush_buffer(&self, buffer: &WriterBuffer) -> bool {
        buffer.num_docs_in_ram() >= self.max_buffered_docs
            || buffer.ram_bytes_used() >= self.ram_budget_per_buffer
    }

    fn should_flush_deletes(&self, buffered_delete_terms: usize) -> bool {
        buffered_delete_terms >= self.max_buffered_delete_terms
    }
}

/// Backpressure gate for document-adding threads.
///
/// The gate is an explicit wait/notify latch. Threads performing flushes
/// never wait on it (the flush path simply does not call
/// [`StallControl::wait_if_stalled`]), which rules out self-deadlock. Waits
/// are chunked so a closing writer can always get through.
#[derive(Debug)]
pub struct StallControl {
    state: Mutex<StallState>,
    cond: Condvar,
}

#[derive(Debug)]
struct StallState {
    stalled: bool,
    closed: bool,
}

impl StallControl {
    fn new() -> Self {
        StallControl {
            state: Mutex::new(StallState {
                stalled: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn update(&self, stalled: bool) {
        let mut state = self.state.lock();
        if state.stalled != stalled {
            state.stalled = stalled;
            self.cond.notify_all();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Whether adders are currently held back.
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    /// Block while the gate is closed to adders.
    pub fn wait_if_stalled(&self, wait_millis: u64) -> Result<()> {
        let mut state = self.state.lock();
        while state.stalled && !state.closed {
            self.cond
                .wait_for(&mut state, Duration::from_millis(wait_millis));
        }
        if state.closed {
            return Err(KontosError::cancelled("writer is closing"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ControlState {
    /// The active delete queue; swapped on full flush.
    delete_queue: Arc<DeleteQueue>,

    /// Idle buffers available for checkout.
    free: Vec<WriterBuffer>,

    /// Buffers waiting to flush, in the order they became pending.
    flush_queue: VecDeque<WriterBuffer>,

    /// Checked-out buffer counts per delete-queue generation.
    checked_out: AHashMap<u64, usize>,

    /// Flushes currently executing.
    flushing: usize,

    full_flush: bool,
    closed: bool,
}

/// Tracks flush pressure and hands buffers to indexing threads.
#[derive(Debug)]
pub struct FlushControl {
    config: WriterConfig,
    policy: Arc<dyn FlushPolicy>,
    chain_factory: Arc<dyn IndexingChainFactory>,
    counters: Arc<DocCounters>,
    storage: Arc<dyn Storage>,
    sequence: Arc<SequenceSource>,
    state: Mutex<ControlState>,

    /// Signaled whenever a checked-out buffer comes back.
    returned: Condvar,

    stall: StallControl,
}

impl FlushControl {
    /// Create flush control with a fresh generation-1 delete queue.
    pub fn new(
        config: WriterConfig,
        policy: Arc<dyn FlushPolicy>,
        chain_factory: Arc<dyn IndexingChainFactory>,
        counters: Arc<DocCounters>,
        storage: Arc<dyn Storage>,
        sequence: Arc<SequenceSource>,
    ) -> Self {
        let delete_queue = Arc::new(DeleteQueue::new(1, Arc::clone(&sequence)));
        FlushControl {
            config,
            policy,
            chain_factory,
            counters,
            storage,
            sequence,
            state: Mutex::new(ControlState {
                delete_queue,
                free: Vec::new(),
                flush_queue: VecDeque::new(),
                checked_out: AHashMap::new(),
                flushing: 0,
                full_flush: false,
                closed: false,
            }),
            returned: Condvar::new(),
            stall: StallControl::new(),
        }
    }

    /// The delete queue new operations must append to.
    pub fn current_queue(&self) -> Arc<DeleteQueue> {
        Arc::clone(&self.state.lock().delete_queue)
    }

    /// The stall gate, for observability.
    pub fn stall(&self) -> &StallControl {
        &self.stall
    }

    /// Check a buffer out for exclusive use by the calling thread.
    ///
    /// Blocks at the stall gate under flush backpressure.
    pub fn obtain(&self) -> Result<WriterBuffer> {
        self.stall.wait_if_stalled(self.config.stall_wait_millis)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(KontosError::index("writer is closed"));
        }
        let current_gen = state.delete_queue.generation();
        let buffer = loop {
            match state.free.pop() {
                Some(buffer) if buffer.queue_generation() == current_gen => break buffer,
                Some(mut stale) => {
                    // Left over from before a queue swap; it must flush,
                    // never serve new documents.
                    if stale.num_docs_in_ram() > 0 {
                        stale.set_flush_pending();
                        state.flush_queue.push_back(stale);
                    }
                }
                None => {
                    let queue = Arc::clone(&state.delete_queue);
                    break self.new_buffer(queue);
                }
            }
        };
        *state.checked_out.entry(current_gen).or_insert(0) += 1;
        self.update_stall_locked(&state);
        Ok(buffer)
    }

    fn new_buffer(&self, queue: Arc<DeleteQueue>) -> WriterBuffer {
        let segment_id = format!(
            "{}_{}",
            self.config.segment_prefix,
            Uuid::new_v4().simple()
        );
        WriterBuffer::new(
            segment_id,
            self.chain_factory.create(),
            queue,
            Arc::clone(&self.counters),
            Arc::clone(&self.storage),
        )
    }

    /// Return a checked-out buffer. Reports whether flush work is pending.
    pub fn checkin(&self, mut buffer: WriterBuffer) -> bool {
        let mut state = self.state.lock();
        let generation = buffer.queue_generation();
        if let Some(count) = state.checked_out.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                state.checked_out.remove(&generation);
            }
        }

        if buffer.is_aborted() {
            // Reservations were already given back by the abort.
        } else if state.closed {
            buffer.abort();
        } else {
            let stale = generation != state.delete_queue.generation();
            if (stale || self.policy.should_flush_buffer(&buffer)) && buffer.num_docs_in_ram() > 0
            {
                buffer.set_flush_pending();
                state.flush_queue.push_back(buffer);
            } else if !stale {
                state.free.push(buffer);
            }
        }

        let pending = !state.flush_queue.is_empty();
        self.update_stall_locked(&state);
        drop(state);
        self.returned.notify_all();
        pending
    }

    /// Pop the next buffer ready to flush, respecting the concurrency cap.
    pub fn next_pending_flush(&self) -> Option<WriterBuffer> {
        let mut state = self.state.lock();
        if state.flushing >= self.config.max_concurrent_flushes {
            return None;
        }
        let buffer = state.flush_queue.pop_front()?;
        state.flushing += 1;
        self.update_stall_locked(&state);
        Some(buffer)
    }

    /// Bookkeeping after one flush finished, successfully or not.
    pub fn after_flush(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.flushing > 0);
        state.flushing -= 1;
        self.update_stall_locked(&state);
        drop(state);
        self.returned.notify_all();
    }

    /// Cut over to a fresh delete queue and queue every buffer holding
    /// documents for flush, regardless of individual thresholds.
    ///
    /// Returns the sequence number consumed by the cutover and the retired
    /// queue, whose straggler deletes the caller must freeze once all
    /// segment flushes are ticketed.
    pub fn mark_for_full_flush(&self) -> Result<(u64, Arc<DeleteQueue>)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(KontosError::index("writer is closed"));
        }
        if state.full_flush {
            return Err(KontosError::invalid_operation(
                "full flush already in progress",
            ));
        }
        state.full_flush = true;

        let old_queue = Arc::clone(&state.delete_queue);
        let old_gen = old_queue.generation();
        // The cutover itself takes a place in the total operation order.
        let seq = self.sequence.next();
        state.delete_queue = Arc::new(DeleteQueue::new(old_gen + 1, Arc::clone(&self.sequence)));

        // Wait for in-flight calls still holding old-generation buffers.
        while state.checked_out.get(&old_gen).copied().unwrap_or(0) > 0 {
            self.returned.wait_for(
                &mut state,
                Duration::from_millis(self.config.stall_wait_millis),
            );
            if state.closed {
                state.full_flush = false;
                return Err(KontosError::cancelled("writer closed during full flush"));
            }
        }

        let free = std::mem::take(&mut state.free);
        for mut buffer in free {
            if buffer.queue_generation() == old_gen {
                if buffer.num_docs_in_ram() > 0 {
                    buffer.set_flush_pending();
                    state.flush_queue.push_back(buffer);
                }
            } else {
                state.free.push(buffer);
            }
        }
        self.update_stall_locked(&state);
        Ok((seq, old_queue))
    }

    /// Release the full-flush state. On failure, aborts everything still
    /// queued so the writer returns to a consistent pre-flush state.
    pub fn finish_full_flush(&self, success: bool) {
        let mut state = self.state.lock();
        debug_assert!(state.full_flush);
        if !success {
            while let Some(mut buffer) = state.flush_queue.pop_front() {
                buffer.abort();
            }
        } else {
            let current_gen = state.delete_queue.generation();
            debug_assert!(
                state
                    .flush_queue
                    .iter()
                    .all(|b| b.queue_generation() == current_gen),
                "full flush finished with stale buffers still queued"
            );
        }
        state.full_flush = false;
        self.update_stall_locked(&state);
        drop(state);
        self.returned.notify_all();
    }

    /// Abort every idle and queued buffer. Checked-out buffers are aborted
    /// as they come back.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        for mut buffer in state.free.drain(..) {
            buffer.abort();
        }
        while let Some(mut buffer) = state.flush_queue.pop_front() {
            buffer.abort();
        }
        self.update_stall_locked(&state);
    }

    /// Stop handing out buffers and wake every waiting thread.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.stall.close();
        self.returned.notify_all();
    }

    /// Buffers queued for flush but not yet flushing.
    pub fn num_queued_flushes(&self) -> usize {
        self.state.lock().flush_queue.len()
    }

    /// Flushes currently executing.
    pub fn num_flushing(&self) -> usize {
        self.state.lock().flushing
    }

    fn update_stall_locked(&self, state: &ControlState) {
        let stalled = state.flush_queue.len() >= self.config.max_queued_flushes;
        self.stall.update(stalled);
    }
}
