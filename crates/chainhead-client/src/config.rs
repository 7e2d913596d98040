use serde::{Deserialize, Serialize};

use chainhead_core::policy::RetryConfig;

/// Configuration for [`crate::ChainHead`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainHeadConfig {
    /// Method-name prefix negotiated with the node.
    pub method_prefix: String,
    /// Backoff used between re-follow attempts and `LimitReached` recoveries.
    pub retry: RetryConfig,
    /// Bound on `NOW` retries of one call.
    pub max_immediate_retries: u32,
    /// Bound on `QUEUED` retries of one call.
    pub max_queued_retries: u32,
    /// Finalized blocks kept pinned; older ones are unpinned.
    pub finalized_retention: usize,
    /// Unpinned hashes remembered so late requests fail as pruned.
    pub pruned_history: usize,
    /// Operation events buffered while their operation id is not yet registered.
    pub orphan_capacity: usize,
}

impl Default for ChainHeadConfig {
    fn default() -> Self {
        Self {
            method_prefix: "chainHead".into(),
            retry: RetryConfig::default(),
            max_immediate_retries: 3,
            max_queued_retries: 5,
            finalized_retention: 16,
            pruned_history: 256,
            orphan_capacity: 64,
        }
    }
}
