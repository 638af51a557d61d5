//! Delete-generation tracking across segments.
//!
//! Every published update packet (and every published segment) is stamped
//! with a generation from a monotonic counter. Packets resolve against
//! segments concurrently and can finish out of order; the stream records
//! finished generations and advances a watermark over the contiguous
//! finished prefix. Everything at or below the watermark is fully resolved.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Out-of-order generation completion bookkeeping.
#[derive(Debug, Default)]
struct FinishedGenerations {
    /// Largest generation such that every generation up to and including
    /// it has finished.
    completed: u64,

    /// Generations that finished ahead of the contiguous prefix.
    holes: BTreeSet<u64>,
}

impl FinishedGenerations {
    fn finish(&mut self, r#gen: u64) {
        if r#gen <= self.completed {
            debug_assert!(false, "generation {gen} finished twice");
            return;
        }
        if r#gen == self.completed + 1 {
            self.completed = r#gen;
            // Drain any holes that became contiguous.
            while self.holes.remove(&(self.completed + 1)) {
                self.completed += 1;
            }
        } else {
            self.holes.insert(r#gen);
        }
    }
}

/// Assigns delete generations and tracks which have fully resolved.
#[derive(Debug)]
pub struct UpdatesStream {
    /// Next generation to hand out.
    next_gen: AtomicU64,

    finished: Mutex<FinishedGenerations>,
}

impl UpdatesStream {
    /// Create a stream whose first generation is 1.
    pub fn new() -> Self {
        UpdatesStream {
            next_gen: AtomicU64::new(1),
            finished: Mutex::new(FinishedGenerations::default()),
        }
    }

    /// Take the next generation.
    pub fn next_generation(&self) -> u64 {
        self.next_gen.fetch_add(1, Ordering::SeqCst)
    }

    /// Record that a generation's deletes have fully resolved.
    pub fn finish(&self, r#gen: u64) {
        self.finished.lock().finish(r#gen);
    }

    /// The watermark: every generation at or below it is fully resolved.
    /// Only ever moves forward.
    pub fn completed_del_gen(&self) -> u64 {
        self.finished.lock().completed
    }
}

impl Default for UpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_generations_are_monotonic() {
        let stream = UpdatesStream::new();
        assert_eq!(stream.next_generation(), 1);
        assert_eq!(stream.next_generation(), 2);
        assert_eq!(stream.completed_del_gen(), 0);
    }

    #[test]
    fn test_in_order_finishing_advances_watermark() {
        let stream = UpdatesStream::new();
        for r#gen in 1..=3 {
            stream.next_generation();
            stream.finish(r#gen);
            assert_eq!(stream.completed_del_gen(), r#gen);
        }
    }

    #[test]
    fn test_out_of_order_finishing_fills_holes() {
        let stream = UpdatesStream::new();
        for _ in 0..5 {
            stream.next_generation();
        }

        stream.finish(5);
        assert_eq!(stream.completed_del_gen(), 0);
        stream.finish(2);
        assert_eq!(stream.completed_del_gen(), 0);
        stream.finish(1);
        assert_eq!(stream.completed_del_gen(), 2);
        stream.finish(3);
        assert_eq!(stream.completed_del_gen(), 3);
        stream.finish(4);
        assert_eq!(stream.completed_del_gen(), 5);
    }

    #[test]
    fn test_concurrent_finishing_converges() {
        let stream = Arc::new(UpdatesStream::new());
        let generations: Vec<u64> = (0..64).map(|_| stream.next_generation()).collect();

        let mut handles = Vec::new();
        for chunk in generations.chunks(16) {
            let stream = Arc::clone(&stream);
            let chunk: Vec<u64> = chunk.to_vec();
            handles.push(thread::spawn(move || {
                for r#gen in chunk.into_iter().rev() {
                    stream.finish(r#gen);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stream.completed_del_gen(), 64);
    }
}
