//! Writer configuration.

use serde::{Deserialize, Serialize};

use crate::error::{KontosError, Result};

/// Configuration for the index writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// RAM budget per write buffer before it is queued for flush (in bytes).
    pub ram_budget_per_buffer: usize,

    /// Maximum number of documents per write buffer before it is queued
    /// for flush.
    pub max_buffered_docs: u32,

    /// Hard ceiling on the total number of documents in the index,
    /// counting buffered and flushed documents.
    pub max_docs: u64,

    /// Number of distinct buffered delete terms that triggers a
    /// deletes-only flush.
    pub max_buffered_delete_terms: usize,

    /// Maximum number of flushes executing at once.
    pub max_concurrent_flushes: usize,

    /// Number of queued-but-not-flushing buffers at which incoming
    /// document calls stall until a flush completes.
    pub max_queued_flushes: usize,

    /// How long a single stall or full-flush wait blocks before
    /// re-checking for shutdown (in milliseconds).
    pub stall_wait_millis: u64,

    /// How long a commit waits for full-flush merges before finalizing
    /// (in milliseconds).
    pub commit_merge_wait_millis: u64,

    /// Whether closing the writer commits pending changes first.
    pub commit_on_close: bool,

    /// Segment name prefix.
    pub segment_prefix: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let max_concurrent_flushes = num_cpus::get().min(8);
        WriterConfig {
            ram_budget_per_buffer: 16 * 1024 * 1024, // 16MB
            max_buffered_docs: 10000,
            max_docs: 2_147_483_519, // i32::MAX minus headroom for deleted-doc bookkeeping
            max_buffered_delete_terms: 1000,
            max_concurrent_flushes,
            max_queued_flushes: max_concurrent_flushes * 2,
            stall_wait_millis: 1000, // 1 second
            commit_merge_wait_millis: 1000,
            commit_on_close: true,
            segment_prefix: "seg".to_string(),
        }
    }
}

impl WriterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ram_budget_per_buffer < 1024 * 1024 {
            return Err(KontosError::invalid_operation(
                "ram_budget_per_buffer must be at least 1MB",
            ));
        }
        if self.max_buffered_docs == 0 {
            return Err(KontosError::invalid_operation(
                "max_buffered_docs must be greater than zero",
            ));
        }
        if self.max_docs == 0 {
            return Err(KontosError::invalid_operation(
                "max_docs must be greater than zero",
            ));
        }
        if self.max_concurrent_flushes == 0 || self.max_queued_flushes == 0 {
            return Err(KontosError::invalid_operation(
                "flush concurrency limits must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WriterConfig::default();
        config.validate().unwrap();

        assert_eq!(config.ram_budget_per_buffer, 16 * 1024 * 1024);
        assert_eq!(config.max_buffered_docs, 10000);
        assert!(config.commit_on_close);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WriterConfig {
            ram_budget_per_buffer: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WriterConfig {
            max_buffered_docs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
