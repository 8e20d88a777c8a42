//! Process-wide configuration for the graph, tag store, and transfer engine.
//!
//! Mirrors the teacher crate's `AppConfig`/`RegistryConfig` split: small
//! typed sub-configs assembled into one struct that the top-level facade
//! takes as its single construction parameter.

use std::path::PathBuf;
use std::time::Duration;

/// Retry/backoff policy for v1 per-layer transfers (spec.md §4.5.3).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub backoff_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    /// `sleep = j * backoff_unit` for attempt `j` in `1..=max_attempts`.
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        self.backoff_unit * attempt as u32
    }
}

/// Concurrency caps for the transfer engine.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Maximum simultaneous layer downloads within one manifest pull.
    pub max_concurrent_downloads: usize,
    /// Maximum simultaneous layer uploads within one manifest push.
    pub max_concurrent_uploads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 6,
            max_concurrent_uploads: 6,
        }
    }
}

/// Top-level configuration for a [`crate::core::Core`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the content-addressed [`crate::graph::Graph`].
    pub graph_root: PathBuf,
    /// Path to the tag store's persisted JSON file.
    pub tag_store_path: PathBuf,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub verbose: bool,
}

impl Config {
    pub fn new(graph_root: impl Into<PathBuf>, tag_store_path: impl Into<PathBuf>) -> Self {
        Self {
            graph_root: graph_root.into(),
            tag_store_path: tag_store_path.into(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_linear() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(retry.backoff_for_attempt(5), Duration::from_millis(2500));
    }
}
