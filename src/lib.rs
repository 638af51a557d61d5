//! # Kontos
//!
//! The write and commit path of a full-text search index for Rust.
//!
//! ## Features
//!
//! - Concurrent document buffering across indexing threads
//! - Atomic delete-before-add update semantics
//! - Ordered segment publication independent of flush completion order
//! - Delete-generation tracking with a completed-generation watermark
//! - Pluggable storage backends and indexing chain

pub mod document;
pub mod error;
pub mod segment;
pub mod storage;
pub mod writer;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
