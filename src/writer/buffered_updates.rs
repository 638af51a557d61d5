//! Accumulators for pending delete and update operations.
//!
//! A [`BufferedUpdates`] collects deletes/updates either privately for one
//! write buffer or globally for the already-flushed segments. Freezing turns
//! the accumulated state into an immutable [`FrozenUpdates`] packet that is
//! later stamped with a delete generation and resolved against segments.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::document::Term;

/// Sentinel `doc_id_upto` meaning the delete applies to every document of
/// the target segment.
pub const APPLY_TO_ALL_DOCS: u32 = u32::MAX;

/// An update writing a new numeric doc-values entry for every document
/// matching a term. This is the building block for soft deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericDocValuesUpdate {
    /// Term selecting the documents to patch.
    pub term: Term,

    /// Doc-values field to write.
    pub field: String,

    /// New value.
    pub value: i64,
}

impl NumericDocValuesUpdate {
    /// Create a new numeric doc-values update.
    pub fn new<F: Into<String>>(term: Term, field: F, value: i64) -> Self {
        NumericDocValuesUpdate {
            term,
            field: field.into(),
            value,
        }
    }

    fn ram_bytes_used(&self) -> usize {
        std::mem::size_of::<Self>() + self.term.ram_bytes_used() + self.field.capacity()
    }
}

/// Mutable accumulator of pending deletes and updates.
///
/// Mutated only by its owning write buffer (private) or by the holder of the
/// delete queue's global lock (global).
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    /// Deleted terms mapped to the highest document ordinal they apply to.
    terms: AHashMap<Term, u32>,

    /// Pending doc-values updates with their document ordinal bounds.
    doc_values: Vec<(NumericDocValuesUpdate, u32)>,

    /// Rough heap footprint, for flush-policy accounting.
    ram_bytes: usize,
}

impl BufferedUpdates {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a term delete bounded by `doc_id_upto`.
    ///
    /// A recorded bound is only replaced by a greater-or-equal one; a lower
    /// bound would shrink the delete's reach and under-delete when two
    /// threads race on the same term.
    pub fn add_term(&mut self, term: Term, doc_id_upto: u32) {
        match self.terms.get_mut(&term) {
            Some(current) => {
                if doc_id_upto >= *current {
                    *current = doc_id_upto;
                }
            }
            None => {
                self.ram_bytes += term.ram_bytes_used() + std::mem::size_of::<u32>();
                self.terms.insert(term, doc_id_upto);
            }
        }
    }

    /// Record a doc-values update bounded by `doc_id_upto`.
    pub fn add_doc_values_update(&mut self, update: NumericDocValuesUpdate, doc_id_upto: u32) {
        self.ram_bytes += update.ram_bytes_used() + std::mem::size_of::<u32>();
        self.doc_values.push((update, doc_id_upto));
    }

    /// Whether anything is buffered.
    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.doc_values.is_empty()
    }

    /// Number of distinct buffered delete terms.
    pub fn num_term_deletes(&self) -> usize {
        self.terms.len()
    }

    /// Number of buffered doc-values updates.
    pub fn num_doc_values_updates(&self) -> usize {
        self.doc_values.len()
    }

    /// Recorded bound for a term, if present.
    pub fn term_bound(&self, term: &Term) -> Option<u32> {
        self.terms.get(term).copied()
    }

    /// Iterate buffered terms with their bounds.
    pub fn terms(&self) -> impl Iterator<Item = (&Term, u32)> {
        self.terms.iter().map(|(t, upto)| (t, *upto))
    }

    /// Iterate buffered doc-values updates with their bounds.
    pub fn doc_values_updates(&self) -> impl Iterator<Item = (&NumericDocValuesUpdate, u32)> {
        self.doc_values.iter().map(|(u, upto)| (u, *upto))
    }

    /// Rough heap footprint of the buffered state.
    pub fn ram_bytes_used(&self) -> usize {
        self.ram_bytes
    }

    /// Discard all buffered state.
    pub fn clear(&mut self) {
        self.terms.clear();
        self.doc_values.clear();
        self.ram_bytes = 0;
    }

    /// Snapshot the buffered state into an immutable packet and clear.
    ///
    /// Document ordinal bounds are dropped: a frozen packet is resolved
    /// against segments flushed *before* it, where every document predates
    /// the delete.
    pub fn freeze(&mut self) -> FrozenUpdates {
        let mut terms: Vec<Term> = self.terms.drain().map(|(t, _)| t).collect();
        terms.sort_unstable();
        let doc_values: Vec<NumericDocValuesUpdate> =
            self.doc_values.drain(..).map(|(u, _)| u).collect();
        self.ram_bytes = 0;
        FrozenUpdates {
            terms,
            doc_values,
            del_gen: AtomicU64::new(0),
        }
    }
}

/// An immutable, write-once snapshot of buffered updates.
///
/// Stamped with its delete generation at publish time; the generation is set
/// exactly once.
#[derive(Debug)]
pub struct FrozenUpdates {
    terms: Vec<Term>,
    doc_values: Vec<NumericDocValuesUpdate>,
    del_gen: AtomicU64, // 0 = not yet assigned
}

impl FrozenUpdates {
    /// Whether the packet carries any deletes or updates.
    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.doc_values.is_empty()
    }

    /// Deleted terms, sorted.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Doc-values updates in arrival order.
    pub fn doc_values(&self) -> &[NumericDocValuesUpdate] {
        &self.doc_values
    }

    /// Assign the delete generation. Assigning twice is a logic error.
    pub fn set_del_gen(&self, r#gen: u64) {
        let previous = self.del_gen.swap(r#gen, Ordering::SeqCst);
        assert_eq!(previous, 0, "delete generation assigned twice");
    }

    /// The assigned delete generation. Reading before assignment is a logic
    /// error.
    pub fn del_gen(&self) -> u64 {
        let r#gen = self.del_gen.load(Ordering::SeqCst);
        assert_ne!(r#gen, 0, "delete generation not yet assigned");
        r#gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_term_keeps_most_permissive_bound() {
        let mut updates = BufferedUpdates::new();

        updates.add_term(Term::new("id", "1"), 5);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(5));

        // Equal bound is accepted (idempotent re-record).
        updates.add_term(Term::new("id", "1"), 5);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(5));

        // Greater bound wins.
        updates.add_term(Term::new("id", "1"), 9);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(9));

        // Lower bound is rejected.
        updates.add_term(Term::new("id", "1"), 3);
        assert_eq!(updates.term_bound(&Term::new("id", "1")), Some(9));

        assert_eq!(updates.num_term_deletes(), 1);
    }

    #[test]
    fn test_freeze_clears_and_sorts() {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "2"), APPLY_TO_ALL_DOCS);
        updates.add_term(Term::new("id", "1"), APPLY_TO_ALL_DOCS);
        updates.add_doc_values_update(
            NumericDocValuesUpdate::new(Term::new("id", "1"), "soft_delete", 1),
            APPLY_TO_ALL_DOCS,
        );

        let frozen = updates.freeze();
        assert!(frozen.any());
        assert_eq!(
            frozen.terms(),
            &[Term::new("id", "1"), Term::new("id", "2")]
        );
        assert_eq!(frozen.doc_values().len(), 1);

        assert!(!updates.any());
        assert_eq!(updates.ram_bytes_used(), 0);
    }

    #[test]
    fn test_del_gen_assigned_once() {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "1"), APPLY_TO_ALL_DOCS);
        let frozen = updates.freeze();

        frozen.set_del_gen(7);
        assert_eq!(frozen.del_gen(), 7);
    }

    #[test]
    #[should_panic(expected = "delete generation assigned twice")]
    fn test_double_del_gen_panics() {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "1"), APPLY_TO_ALL_DOCS);
        let frozen = updates.freeze();

        frozen.set_del_gen(1);
        frozen.set_del_gen(2);
    }

    #[test]
    fn test_ram_accounting_grows_and_clears() {
        let mut updates = BufferedUpdates::new();
        assert_eq!(updates.ram_bytes_used(), 0);

        updates.add_term(Term::new("body", "alpha"), 1);
        let after_one = updates.ram_bytes_used();
        assert!(after_one > 0);

        // Re-recording the same term does not grow the footprint.
        updates.add_term(Term::new("body", "alpha"), 2);
        assert_eq!(updates.ram_bytes_used(), after_one);

        updates.clear();
        assert_eq!(updates.ram_bytes_used(), 0);
    }
}
