//! The committed-segment registry.
//!
//! Holds every published segment, resolves frozen update packets against
//! them, drops segments that become fully deleted, and persists the segment
//! list as a generation-numbered `segments_N` manifest on commit.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{KontosError, Result};
use crate::segment::{DeletionBitmap, FlushedSegment, SegmentInfo, TermDocs};
use crate::storage::{Storage, StructReader, StructWriter};
use crate::writer::buffered_updates::FrozenUpdates;

/// Magic number for segment manifests ("KSEG").
const MANIFEST_MAGIC: u32 = 0x4B534547;

/// Manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// Prefix of manifest file names.
const MANIFEST_PREFIX: &str = "segments_";

/// One published segment with its mutable deletion state.
#[derive(Debug)]
pub struct PublishedSegment {
    /// Immutable metadata, including the publish-time delete generation.
    pub info: SegmentInfo,

    /// Deleted documents.
    deletes: Mutex<DeletionBitmap>,

    /// Term lookup for resolving update packets. `None` for segments
    /// recovered from a manifest; resolution for those belongs to the
    /// external reader.
    term_docs: Option<Arc<dyn TermDocs>>,

    /// Numeric doc-values patches keyed by (field, doc ordinal), each
    /// stamped with the generation that wrote it so later generations win
    /// regardless of application order.
    doc_values: Mutex<AHashMap<(String, u32), (u64, i64)>>,
}

impl PublishedSegment {
    /// Whether a document is deleted.
    pub fn is_deleted(&self, doc_ord: u32) -> bool {
        self.deletes.lock().is_deleted(doc_ord)
    }

    /// Number of deleted documents.
    pub fn deleted_count(&self) -> u32 {
        self.deletes.lock().deleted_count()
    }

    /// Number of live documents.
    pub fn live_count(&self) -> u32 {
        self.deletes.lock().live_count()
    }

    /// Current numeric doc-values patch for one document, if any.
    pub fn doc_value(&self, field: &str, doc_ord: u32) -> Option<i64> {
        self.doc_values
            .lock()
            .get(&(field.to_string(), doc_ord))
            .map(|(_, value)| *value)
    }
}

#[derive(Debug)]
struct RegistryState {
    /// Published segments in publish order.
    segments: Vec<Arc<PublishedSegment>>,

    /// Generation of the last committed manifest.
    generation: u64,

    /// Bumped on every visible change.
    changes: u64,

    /// `changes` as of the last commit.
    committed_changes: u64,
}

/// Registry of committed segments.
#[derive(Debug)]
pub struct SegmentRegistry {
    storage: Arc<dyn Storage>,
    state: RwLock<RegistryState>,
}

impl SegmentRegistry {
    /// Create an empty registry.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        SegmentRegistry {
            storage,
            state: RwLock::new(RegistryState {
                segments: Vec::new(),
                generation: 0,
                changes: 0,
                committed_changes: 0,
            }),
        }
    }

    /// Load the registry from the newest manifest in storage, or start
    /// empty when none exists.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let registry = Self::new(Arc::clone(&storage));
        let Some(generation) = Self::latest_generation(&storage)? else {
            return Ok(registry);
        };

        let input = storage.open_input(&manifest_name(generation))?;
        let mut reader = StructReader::new(input)?;
        let magic = reader.read_u32()?;
        if magic != MANIFEST_MAGIC {
            return Err(KontosError::index("Invalid segment manifest format"));
        }
        let version = reader.read_u32()?;
        if version != MANIFEST_VERSION {
            return Err(KontosError::index(format!(
                "Unsupported manifest version: {version}"
            )));
        }

        let segment_count = reader.read_varint()? as usize;
        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let segment_id = reader.read_string()?;
            let max_doc = reader.read_varint()? as u32;
            let del_gen = reader.read_varint()?;

            let file_count = reader.read_varint()? as usize;
            let mut files = Vec::with_capacity(file_count);
            for _ in 0..file_count {
                files.push(reader.read_string()?);
            }

            let mut deletes = DeletionBitmap::new(max_doc);
            let deleted_count = reader.read_varint()? as usize;
            let mut doc_ord = 0u32;
            for _ in 0..deleted_count {
                doc_ord += reader.read_varint()? as u32;
                deletes.delete_document(doc_ord)?;
            }

            let mut info = SegmentInfo::new(segment_id, max_doc, files);
            info.del_gen = del_gen;
            segments.push(Arc::new(PublishedSegment {
                info,
                deletes: Mutex::new(deletes),
                term_docs: None,
                doc_values: Mutex::new(AHashMap::new()),
            }));
        }
        reader.verify_checksum()?;

        let mut state = registry.state.write();
        state.segments = segments;
        state.generation = generation;
        drop(state);
        Ok(registry)
    }

    fn latest_generation(storage: &Arc<dyn Storage>) -> Result<Option<u64>> {
        let mut latest = None;
        for name in storage.list_files()? {
            if let Some(generation) = parse_generation(&name) {
                latest = latest.max(Some(generation));
            }
        }
        Ok(latest)
    }

    /// Publish a flushed segment under the given delete generation.
    pub fn publish(&self, segment: FlushedSegment, del_gen: u64) {
        let FlushedSegment {
            mut info,
            deletes,
            term_docs,
            doc_values,
            frozen_updates: _,
        } = segment;
        info.del_gen = del_gen;
        let doc_values = doc_values
            .into_iter()
            .map(|(key, value)| (key, (del_gen, value)))
            .collect();

        let mut state = self.state.write();
        state.segments.push(Arc::new(PublishedSegment {
            info,
            deletes: Mutex::new(deletes),
            term_docs: Some(term_docs),
            doc_values: Mutex::new(doc_values),
        }));
        state.changes += 1;
    }

    /// Resolve a frozen update packet against every segment published
    /// before it. Returns the number of documents newly deleted.
    ///
    /// A packet only targets segments whose delete generation is strictly
    /// lower than its own; the segment that carried the packet already had
    /// these deletes applied, bounded, during its flush.
    pub fn apply_updates(&self, packet: &FrozenUpdates) -> Result<usize> {
        let packet_gen = packet.del_gen();
        let segments: Vec<Arc<PublishedSegment>> = {
            let state = self.state.read();
            state
                .segments
                .iter()
                .filter(|s| s.info.del_gen < packet_gen)
                .cloned()
                .collect()
        };

        let mut newly_deleted = 0;
        for segment in segments {
            let Some(term_docs) = &segment.term_docs else {
                continue;
            };
            for term in packet.terms() {
                for doc_ord in term_docs.docs_for_term(term) {
                    if segment.deletes.lock().delete_document(doc_ord)? {
                        newly_deleted += 1;
                    }
                }
            }
            for update in packet.doc_values() {
                for doc_ord in term_docs.docs_for_term(&update.term) {
                    let deletes = segment.deletes.lock();
                    if deletes.is_deleted(doc_ord) {
                        continue;
                    }
                    drop(deletes);
                    let mut doc_values = segment.doc_values.lock();
                    let key = (update.field.clone(), doc_ord);
                    match doc_values.get_mut(&key) {
                        // A later generation's value always wins, even when
                        // packets resolve out of order.
                        Some(existing) if existing.0 > packet_gen => {}
                        Some(existing) => *existing = (packet_gen, update.value),
                        None => {
                            doc_values.insert(key, (packet_gen, update.value));
                        }
                    }
                }
            }
        }

        if newly_deleted > 0 {
            self.state.write().changes += 1;
        }
        Ok(newly_deleted)
    }

    /// Remove segments whose documents are all deleted and whose delete
    /// generation is fully resolved. Returns their metadata so the caller
    /// can give reservations back and schedule file cleanup.
    pub fn drop_fully_deleted(&self, completed_del_gen: u64) -> Vec<SegmentInfo> {
        let mut state = self.state.write();
        let mut dropped = Vec::new();
        state.segments.retain(|segment| {
            let fully_deleted = segment.deletes.lock().is_fully_deleted();
            if fully_deleted && segment.info.del_gen <= completed_del_gen {
                dropped.push(segment.info.clone());
                false
            } else {
                true
            }
        });
        if !dropped.is_empty() {
            state.changes += 1;
        }
        dropped
    }

    /// Snapshot of segment metadata, in publish order.
    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        self.state
            .read()
            .segments
            .iter()
            .map(|s| s.info.clone())
            .collect()
    }

    /// Published segments, in publish order.
    pub fn segments(&self) -> Vec<Arc<PublishedSegment>> {
        self.state.read().segments.clone()
    }

    /// Find one published segment by id.
    pub fn segment(&self, segment_id: &str) -> Option<Arc<PublishedSegment>> {
        self.state
            .read()
            .segments
            .iter()
            .find(|s| s.info.segment_id == segment_id)
            .cloned()
    }

    /// Number of published segments.
    pub fn num_segments(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Total documents across segments, including deleted ones.
    pub fn total_max_doc(&self) -> u64 {
        self.state
            .read()
            .segments
            .iter()
            .map(|s| s.info.max_doc as u64)
            .sum()
    }

    /// Live documents across segments.
    pub fn num_live_docs(&self) -> u64 {
        self.state
            .read()
            .segments
            .iter()
            .map(|s| s.live_count() as u64)
            .sum()
    }

    /// Generation of the last committed manifest.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.state.read();
        state.changes != state.committed_changes
    }

    /// Write the next manifest generation, fsync it, and prune older
    /// manifests. Returns the committed generation.
    pub fn commit(&self) -> Result<u64> {
        let (generation, changes) = {
            let state = self.state.read();

            let generation = state.generation + 1;
            let output = self.storage.create_output(&manifest_name(generation))?;
            let mut writer = StructWriter::new(output);
            writer.write_u32(MANIFEST_MAGIC)?;
            writer.write_u32(MANIFEST_VERSION)?;
            writer.write_varint(state.segments.len() as u64)?;
            for segment in &state.segments {
                let info = &segment.info;
                writer.write_string(&info.segment_id)?;
                writer.write_varint(info.max_doc as u64)?;
                writer.write_varint(info.del_gen)?;
                writer.write_varint(info.files.len() as u64)?;
                for file in &info.files {
                    writer.write_string(file)?;
                }

                let deletes = segment.deletes.lock();
                let deleted: Vec<u32> = (0..info.max_doc)
                    .filter(|&doc| deletes.is_deleted(doc))
                    .collect();
                writer.write_varint(deleted.len() as u64)?;
                let mut previous = 0u32;
                for doc in deleted {
                    writer.write_varint((doc - previous) as u64)?;
                    previous = doc;
                }
            }
            writer.close()?;
            self.storage.sync()?;
            (generation, state.changes)
        };

        let mut state = self.state.write();
        state.generation = generation;
        state.committed_changes = changes;
        drop(state);

        // Older manifests are superseded; drop them best-effort.
        for name in self.storage.list_files()? {
            if let Some(file_gen) = parse_generation(&name)
                && file_gen < generation
            {
                let _ = self.storage.delete_file(&name);
            }
        }
        Ok(generation)
    }
}

fn manifest_name(generation: u64) -> String {
    format!("{MANIFEST_PREFIX}{generation:010}")
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(MANIFEST_PREFIX)?.parse().ok()
}
