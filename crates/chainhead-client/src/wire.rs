//! Payloads of the chain-head follow subscription and of the legacy storage API.

use serde::{Deserialize, Serialize};

use crate::types::{BlockHash, Bytes, RuntimeVersion, StorageResultItem};

/// Runtime descriptor attached to `initialized` and `newBlock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeEvent {
    Valid { spec: RuntimeVersion },
    Invalid { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialized {
    #[serde(default)]
    pub finalized_block_hashes: Vec<BlockHash>,
    /// Older servers report a single hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_block_hash: Option<BlockHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_block_runtime: Option<RuntimeEvent>,
}

impl Initialized {
    /// Finalized hashes oldest first, whichever form the node used.
    pub fn hashes(&self) -> Vec<BlockHash> {
        if self.finalized_block_hashes.is_empty() {
            self.finalized_block_hash.iter().cloned().collect()
        } else {
            self.finalized_block_hashes.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlock {
    pub block_hash: BlockHash,
    pub parent_block_hash: BlockHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_runtime: Option<RuntimeEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestBlockChanged {
    pub best_block_hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finalized {
    pub finalized_block_hashes: Vec<BlockHash>,
    #[serde(default)]
    pub pruned_block_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationId {
    pub operation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBodyDone {
    pub operation_id: String,
    pub value: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCallDone {
    pub operation_id: String,
    pub output: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStorageItems {
    pub operation_id: String,
    pub items: Vec<StorageResultItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub operation_id: String,
    pub error: String,
}

/// One notification of `chainHead_v1_followEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FollowEvent {
    Initialized(Initialized),
    NewBlock(NewBlock),
    BestBlockChanged(BestBlockChanged),
    Finalized(Finalized),
    OperationBodyDone(OperationBodyDone),
    OperationCallDone(OperationCallDone),
    OperationStorageItems(OperationStorageItems),
    OperationWaitingForContinue(OperationId),
    OperationStorageDone(OperationId),
    OperationInaccessible(OperationId),
    OperationError(OperationError),
    Stop,
}

impl FollowEvent {
    /// The operation the event belongs to, for `operation*` events.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::OperationBodyDone(e) => Some(&e.operation_id),
            Self::OperationCallDone(e) => Some(&e.operation_id),
            Self::OperationStorageItems(e) => Some(&e.operation_id),
            Self::OperationWaitingForContinue(e)
            | Self::OperationStorageDone(e)
            | Self::OperationInaccessible(e) => Some(&e.operation_id),
            Self::OperationError(e) => Some(&e.operation_id),
            _ => None,
        }
    }
}

/// Immediate answer of `body`, `call` and `storage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum MethodResponse {
    Started(Started),
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Started {
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded_items: Option<usize>,
}

/// `rpc_methods` result.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMethods {
    pub methods: Vec<String>,
}

/// A legacy storage change set: `state_queryStorageAt` items and
/// `state_storage` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChangeSet {
    pub block: BlockHash,
    pub changes: Vec<(Bytes, Option<Bytes>)>,
}
