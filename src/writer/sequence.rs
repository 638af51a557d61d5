//! Sequence numbers for index-mutating operations.
//!
//! Every call that changes the index consumes exactly one sequence number
//! from a process-wide monotonic source, establishing a total order over all
//! completed mutations. The source is shared across delete-queue swaps so
//! the numbering never restarts or gaps.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide monotonic counter handing out sequence numbers.
#[derive(Debug)]
pub struct SequenceSource {
    counter: AtomicU64,
}

impl SequenceSource {
    /// Create a new source whose first handed-out number is `start + 1`.
    pub fn new(start: u64) -> Self {
        SequenceSource {
            counter: AtomicU64::new(start),
        }
    }

    /// Take the next sequence number.
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently handed-out sequence number.
    pub fn last(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for SequenceSource {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The result handed back to callers of index-mutating operations.
///
/// `triggered` reports that the call also processed pending side effects
/// (flushes, delete application); this replaces the historical trick of
/// negating the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpReceipt {
    /// Position of this operation in the total order of mutations.
    pub seq_no: u64,

    /// Whether the call also triggered processing of pending events.
    pub triggered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_is_monotonic() {
        let source = SequenceSource::default();
        assert_eq!(source.next(), 1);
        assert_eq!(source.next(), 2);
        assert_eq!(source.last(), 2);
    }

    #[test]
    fn test_concurrent_sequence_has_no_gaps_or_duplicates() {
        let source = Arc::new(SequenceSource::default());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let source = Arc::clone(&source);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| source.next()).collect::<Vec<u64>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u64> = (1..=4000).collect();
        assert_eq!(all, expected);
    }
}
