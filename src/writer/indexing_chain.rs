//! The indexing chain seam.
//!
//! Document-to-postings conversion is an external collaborator: the write
//! path only drives it through the [`IndexingChain`] trait. The crate ships
//! [`InMemoryIndexingChain`], a small default that accumulates postings and
//! stored fields in RAM and materializes them as `.trm`/`.docs` files, which
//! is enough to exercise the write path end to end. Analysis is out of
//! scope; the default chain only lowercases and splits on whitespace.

use std::sync::Arc;

use ahash::AHashMap;

use crate::document::{Document, FieldValue, Term};
use crate::error::Result;
use crate::segment::TermDocs;
use crate::storage::{Storage, StructWriter};

/// Magic number for term files ("KTRM").
const TERMS_MAGIC: u32 = 0x4B54524D;

/// Magic number for stored-document files ("KDOC").
const DOCS_MAGIC: u32 = 0x4B444F43;

/// Format version for both files.
const FORMAT_VERSION: u32 = 1;

/// Everything a chain needs to materialize one segment.
pub struct ChainFlushContext<'a> {
    /// Segment identifier; also the file name prefix.
    pub segment_id: &'a str,

    /// Number of documents handed to the chain.
    pub max_doc: u32,

    /// Storage to write segment files into.
    pub storage: &'a Arc<dyn Storage>,
}

/// The chain's output for one flushed segment.
pub struct ChainOutput {
    /// Files written for the segment.
    pub files: Vec<String>,

    /// Term lookup over the flushed postings, used to resolve deletes.
    pub term_docs: Arc<dyn TermDocs>,
}

/// Converts documents into an in-progress segment and materializes it on
/// flush.
///
/// Errors returned from `process_document` are classified by the caller:
/// [`crate::error::KontosError::Aborting`] means the chain's in-memory state
/// may be corrupt and the whole buffer must be discarded; any other error is
/// isolated to the current document.
pub trait IndexingChain: Send + std::fmt::Debug {
    /// Feed one document into the chain under the given segment ordinal.
    fn process_document(&mut self, doc_ord: u32, doc: &Document) -> Result<()>;

    /// Materialize the accumulated state as segment files. The chain is
    /// spent afterwards.
    fn flush(&mut self, ctx: ChainFlushContext<'_>) -> Result<ChainOutput>;

    /// Discard all accumulated state.
    fn abort(&mut self);

    /// Rough heap footprint of the accumulated state.
    fn ram_bytes_used(&self) -> usize;
}

/// Creates one chain per write buffer.
pub trait IndexingChainFactory: Send + Sync + std::fmt::Debug {
    /// Create a fresh chain.
    fn create(&self) -> Box<dyn IndexingChain>;
}

/// Factory for [`InMemoryIndexingChain`].
#[derive(Debug, Default)]
pub struct DefaultChainFactory;

impl IndexingChainFactory for DefaultChainFactory {
    fn create(&self) -> Box<dyn IndexingChain> {
        Box::new(InMemoryIndexingChain::new())
    }
}

/// Default in-memory indexing chain.
#[derive(Debug, Default)]
pub struct InMemoryIndexingChain {
    /// Postings: term to ascending document ordinals.
    postings: AHashMap<Term, Vec<u32>>,

    /// Stored field values per document, in ordinal order.
    stored: Vec<Vec<(String, String)>>,

    /// Rough heap footprint.
    ram_bytes: usize,
}

impl InMemoryIndexingChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_posting(&mut self, term: Term, doc_ord: u32) {
        let entry = self.postings.entry(term).or_insert_with(|| {
            self.ram_bytes += 64; // rough per-term overhead
            Vec::new()
        });
        if entry.last() != Some(&doc_ord) {
            entry.push(doc_ord);
            self.ram_bytes += std::mem::size_of::<u32>();
        }
    }
}

impl IndexingChain for InMemoryIndexingChain {
    fn process_document(&mut self, doc_ord: u32, doc: &Document) -> Result<()> {
        debug_assert_eq!(doc_ord as usize, self.stored.len());

        let mut stored_fields = Vec::with_capacity(doc.len());
        for (field_name, field_value) in doc.fields() {
            let text = field_value.as_text();
            match field_value {
                FieldValue::Text(content) => {
                    for token in content.split_whitespace() {
                        let token = token.to_lowercase();
                        if !token.is_empty() {
                            self.add_posting(Term::new(field_name.clone(), token), doc_ord);
                        }
                    }
                }
                _ => {
                    self.add_posting(Term::new(field_name.clone(), text.clone()), doc_ord);
                }
            }
            self.ram_bytes += field_name.len() + text.len();
            stored_fields.push((field_name.clone(), text));
        }
        self.stored.push(stored_fields);
        Ok(())
    }

    fn flush(&mut self, ctx: ChainFlushContext<'_>) -> Result<ChainOutput> {
        let terms_file = format!("{}.trm", ctx.segment_id);
        let docs_file = format!("{}.docs", ctx.segment_id);

        // Term postings, sorted for deterministic output.
        let output = ctx.storage.create_output(&terms_file)?;
        let mut writer = StructWriter::new(output);
        writer.write_u32(TERMS_MAGIC)?;
        writer.write_u32(FORMAT_VERSION)?;

        let mut terms: Vec<&Term> = self.postings.keys().collect();
        terms.sort();
        writer.write_varint(terms.len() as u64)?;
        for term in terms {
            writer.write_string(&term.field)?;
            writer.write_string(&term.text)?;
            let docs = &self.postings[term];
            writer.write_varint(docs.len() as u64)?;
            let mut previous = 0u32;
            for &doc in docs {
                writer.write_varint((doc - previous) as u64)?;
                previous = doc;
            }
        }
        writer.close()?;

        // Stored documents.
        let output = ctx.storage.create_output(&docs_file)?;
        let mut writer = StructWriter::new(output);
        writer.write_u32(DOCS_MAGIC)?;
        writer.write_u32(FORMAT_VERSION)?;
        writer.write_varint(ctx.max_doc as u64)?;
        for fields in &self.stored {
            writer.write_varint(fields.len() as u64)?;
            for (name, value) in fields {
                writer.write_string(name)?;
                writer.write_string(value)?;
            }
        }
        writer.close()?;

        let term_docs = Arc::new(InMemoryTermDocs {
            postings: std::mem::take(&mut self.postings),
        });
        self.stored.clear();
        self.ram_bytes = 0;

        Ok(ChainOutput {
            files: vec![terms_file, docs_file],
            term_docs,
        })
    }

    fn abort(&mut self) {
        self.postings.clear();
        self.stored.clear();
        self.ram_bytes = 0;
    }

    fn ram_bytes_used(&self) -> usize {
        self.ram_bytes
    }
}

/// Term lookup over the postings of one flushed segment.
#[derive(Debug)]
struct InMemoryTermDocs {
    postings: AHashMap<Term, Vec<u32>>,
}

impl TermDocs for InMemoryTermDocs {
    fn docs_for_term(&self, term: &Term) -> Vec<u32> {
        self.postings.get(term).cloned().unwrap_or_default()
    }
}
