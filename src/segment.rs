//! Segment metadata and per-segment deletion state.
//!
//! A segment is an immutable unit of the index produced by a flush. The
//! write path tracks, per segment, which documents have been deleted and
//! which delete generation the segment was published under.

use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::document::Term;
use crate::error::{KontosError, Result};
use crate::writer::buffered_updates::FrozenUpdates;

/// Core metadata for one segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentInfo {
    /// Unique segment identifier, also the prefix of its file names.
    pub segment_id: String,

    /// Number of documents in the segment, including deleted ones.
    pub max_doc: u32,

    /// Delete generation assigned when the segment was published.
    pub del_gen: u64,

    /// Files belonging to this segment.
    pub files: Vec<String>,
}

impl SegmentInfo {
    /// Create metadata for a freshly flushed segment.
    pub fn new<S: Into<String>>(segment_id: S, max_doc: u32, files: Vec<String>) -> Self {
        SegmentInfo {
            segment_id: segment_id.into(),
            max_doc,
            del_gen: 0,
            files,
        }
    }
}

/// A bitmap of deleted documents for one segment (bit set = deleted).
#[derive(Debug, Clone)]
pub struct DeletionBitmap {
    /// Bitmap of deleted documents.
    deleted_docs: BitVec,

    /// Total number of documents covered.
    max_doc: u32,

    /// Number of deleted documents.
    deleted_count: u32,
}

impl DeletionBitmap {
    /// Create a new bitmap with no deletions.
    pub fn new(max_doc: u32) -> Self {
        DeletionBitmap {
            deleted_docs: BitVec::from_elem(max_doc as usize, false),
            max_doc,
            deleted_count: 0,
        }
    }

    /// Mark a document as deleted. Returns true if it was live before.
    pub fn delete_document(&mut self, doc_id: u32) -> Result<bool> {
        if doc_id >= self.max_doc {
            return Err(KontosError::index(format!(
                "Document ID {doc_id} out of range (max_doc {})",
                self.max_doc
            )));
        }

        let was_deleted = self.deleted_docs.get(doc_id as usize).unwrap_or(false);
        if !was_deleted {
            self.deleted_docs.set(doc_id as usize, true);
            self.deleted_count += 1;
        }
        Ok(!was_deleted)
    }

    /// Check if a document is deleted.
    pub fn is_deleted(&self, doc_id: u32) -> bool {
        self.deleted_docs.get(doc_id as usize).unwrap_or(false)
    }

    /// Number of documents covered, including deleted ones.
    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    /// Number of deleted documents.
    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    /// Number of live (non-deleted) documents.
    pub fn live_count(&self) -> u32 {
        self.max_doc - self.deleted_count
    }

    /// Whether every document in the segment is deleted.
    pub fn is_fully_deleted(&self) -> bool {
        self.max_doc > 0 && self.deleted_count == self.max_doc
    }
}

/// Lookup seam used to resolve term deletes against a flushed segment.
///
/// The default indexing chain provides an in-memory implementation; a real
/// codec-backed reader is an external collaborator.
pub trait TermDocs: Send + Sync + std::fmt::Debug {
    /// All document ordinals in the segment containing the exact term.
    fn docs_for_term(&self, term: &Term) -> Vec<u32>;
}

/// The product of flushing one write buffer.
#[derive(Debug)]
pub struct FlushedSegment {
    /// Segment metadata; `del_gen` is still unset here.
    pub info: SegmentInfo,

    /// Deletions already applied during the flush (non-aborting failures
    /// plus the buffer's private deletes bounded by their doc id limits).
    pub deletes: DeletionBitmap,

    /// Term lookup for resolving later delete packets against this segment.
    pub term_docs: Arc<dyn TermDocs>,

    /// Numeric doc-values patches applied during the flush, keyed by
    /// (field, doc ordinal).
    pub doc_values: AHashMap<(String, u32), i64>,

    /// The buffer's private deletes, frozen for application to segments
    /// flushed earlier. None when the buffer held no private deletes.
    pub frozen_updates: Option<FrozenUpdates>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_bitmap_operations() {
        let mut bitmap = DeletionBitmap::new(100);

        assert!(bitmap.delete_document(5).unwrap());
        assert!(bitmap.delete_document(10).unwrap());

        assert!(bitmap.is_deleted(5));
        assert!(!bitmap.is_deleted(6));
        assert_eq!(bitmap.deleted_count(), 2);
        assert_eq!(bitmap.live_count(), 98);

        // Deleting again reports the document was already gone.
        assert!(!bitmap.delete_document(5).unwrap());
        assert_eq!(bitmap.deleted_count(), 2);
    }

    #[test]
    fn test_deletion_bitmap_out_of_range() {
        let mut bitmap = DeletionBitmap::new(10);
        assert!(bitmap.delete_document(10).is_err());
        assert!(!bitmap.is_deleted(10));
    }

    #[test]
    fn test_fully_deleted() {
        let mut bitmap = DeletionBitmap::new(2);
        assert!(!bitmap.is_fully_deleted());

        bitmap.delete_document(0).unwrap();
        bitmap.delete_document(1).unwrap();
        assert!(bitmap.is_fully_deleted());
        assert_eq!(bitmap.live_count(), 0);
    }
}
