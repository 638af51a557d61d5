//! Pluggable storage backends for segment and manifest files.
//!
//! The write path only needs a small, append-oriented file surface: named
//! files, sequential writes, whole-file reads, deletion, listing, and an
//! explicit sync for commit durability.

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use structured::{StructReader, StructWriter};
pub use traits::{Storage, StorageConfig, StorageInput, StorageOutput};
