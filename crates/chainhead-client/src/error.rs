//! Error taxonomy of the chain-head client and the classifier that maps node
//! errors onto it.
//!
//! Every variant knows its [`RetryStrategy`]; retry loops dispatch on
//! [`ChainHeadError::retry_strategy`] instead of matching variants.

use std::sync::Arc;

use thiserror::Error;

use chainhead_core::policy::RetryStrategy;
use chainhead_core::TransportError;

use crate::types::BlockHash;

/// JSON-RPC code used by nodes for an unknown or unpinned block hash.
pub const INVALID_BLOCK_HASH_CODE: i64 = -32801;

#[derive(Debug, Clone, Error)]
pub enum ChainHeadError {
    /// The block state was momentarily unusable while the operation ran.
    #[error("operation inaccessible")]
    OperationInaccessible,

    /// The node tore down the follow subscription.
    #[error("follow subscription stopped by the node")]
    Stop,

    /// The node is shedding load and refused to start the operation.
    #[error("operation limit reached")]
    LimitReached,

    /// The body/call/storage request itself failed on the node.
    #[error("operation failed: {0}")]
    Operation(String),

    #[error("invalid runtime at {hash}: {reason}")]
    InvalidRuntime { hash: BlockHash, reason: String },

    #[error("block {0} is not pinned")]
    BlockNotPinned(BlockHash),

    /// The block was unpinned before or while the request ran.
    #[error("block {0} has been pruned")]
    BlockPruned(BlockHash),

    #[error("node exposes no methods with prefix `{0}`")]
    NoMethodsForPrefix(String),

    #[error("not following the chain")]
    NotFollowing,

    #[error("{strategy} retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        strategy: RetryStrategy,
        attempts: u32,
        last: Box<ChainHeadError>,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(Arc<TransportError>),
}

impl ChainHeadError {
    /// How the failed call should be re-issued, if at all.
    pub fn retry_strategy(&self) -> Option<RetryStrategy> {
        match self {
            Self::OperationInaccessible => Some(RetryStrategy::Now),
            Self::Stop | Self::LimitReached => Some(RetryStrategy::Queued),
            _ => None,
        }
    }

    /// Errors after which following cannot be resumed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NoMethodsForPrefix(_) => true,
            Self::Transport(e) => matches!(
                e.as_ref(),
                TransportError::SubscriptionsUnsupported { .. } | TransportError::Closed
            ),
            _ => false,
        }
    }

    /// Classify a transport failure of a request that targeted `at`.
    pub fn classify(err: TransportError, at: Option<&BlockHash>) -> Self {
        match &err {
            TransportError::Rpc(rpc) => {
                let msg = rpc.message.to_lowercase();
                if msg.contains("limit reached") || msg.contains("too many") {
                    Self::LimitReached
                } else if msg.contains("invalid subscription") || msg.contains("unknown subscription")
                {
                    Self::Stop
                } else if msg.contains("inaccessible") {
                    Self::OperationInaccessible
                } else if msg.contains("invalid runtime") {
                    match at {
                        Some(hash) => Self::InvalidRuntime {
                            hash: hash.clone(),
                            reason: rpc.message.clone(),
                        },
                        None => Self::Transport(Arc::new(err)),
                    }
                } else if rpc.code == INVALID_BLOCK_HASH_CODE
                    || msg.contains("invalid block hash")
                    || msg.contains("not pinned")
                {
                    match at {
                        Some(hash) => Self::BlockNotPinned(hash.clone()),
                        None => Self::Transport(Arc::new(err)),
                    }
                } else {
                    Self::Transport(Arc::new(err))
                }
            }
            // A dropped socket takes the follow subscription with it.
            TransportError::WebSocket(_) => Self::Stop,
            _ => Self::Transport(Arc::new(err)),
        }
    }
}

impl From<TransportError> for ChainHeadError {
    fn from(err: TransportError) -> Self {
        Self::classify(err, None)
    }
}

impl From<serde_json::Error> for ChainHeadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
