use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::utils::error::{FedError, FedResult};

/// Main federation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FederationConfig {
    pub bound_join_block_size: usize,
    pub enable_service_as_bound_join: bool,
    pub join_worker_threads: usize,
    pub union_worker_threads: usize,
    pub query_timeout_ms: u64,                // 0 disables the deadline
    pub scheduler_shutdown_timeout_secs: u64, // seconds
    pub log_queries: bool,
    pub cache: CacheConfig,
    pub source_selection: SourceSelectionConfig,
}

/// Source selection cache configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: Option<u64>, // None keeps entries until invalidated
}

/// Source selection policy
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSelectionConfig {
    /// Fail the query when every probe for a pattern errored instead of
    /// treating the pattern as empty
    pub fail_on_unresolved_sources: bool,
    pub probe_concurrency: usize, // 0 = unbounded
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            bound_join_block_size: 15,
            enable_service_as_bound_join: false,
            join_worker_threads: 20,
            union_worker_threads: 20,
            query_timeout_ms: 0,
            scheduler_shutdown_timeout_secs: 30,
            log_queries: false,
            cache: CacheConfig::default(),
            source_selection: SourceSelectionConfig::default(),
        }
    }
}

impl FederationConfig {
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.bound_join_block_size = size;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Evaluate SERVICE clauses with basic graph pattern bodies as bound joins
    pub fn with_service_as_bound_join(mut self, enabled: bool) -> Self {
        self.enable_service_as_bound_join = enabled;
        self
    }

    pub fn with_worker_threads(mut self, join: usize, union: usize) -> Self {
        self.join_worker_threads = join;
        self.union_worker_threads = union;
        self
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        if self.query_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.query_timeout_ms))
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler_shutdown_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache.ttl_seconds.map(Duration::from_secs)
    }

    /// Reject settings the executors cannot run with
    pub fn validate(&self) -> FedResult<()> {
        if self.bound_join_block_size == 0 {
            return Err(FedError::Configuration(
                "bound_join_block_size must be greater than zero".to_string(),
            ));
        }
        if self.join_worker_threads == 0 || self.union_worker_threads == 0 {
            return Err(FedError::Configuration(
                "worker thread counts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
