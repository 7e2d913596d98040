//! chainhead-client: follow a node's chain head and query its storage.
//!
//! # Overview
//!
//! [`ChainHead`] opens a `chainHead_v1_follow` subscription, tracks the
//! pinned blocks of the live session and runs `header`, `body`, `call` and
//! `storage` requests against them. Errors are classified into retry
//! strategies: transient ones are retried immediately, subscription-wide
//! ones wait for the shared recovery (a re-follow or a backoff pause).
//!
//! [`StorageQuery`] is the storage contract used by applications. It is
//! served either by [`ChainHeadStorage`] or, for nodes without the
//! chain-head API, by [`LegacyStorage`]. [`storage::connect`] picks one.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainhead_client::{ChainHead, ChainHeadConfig, EventKind};
//! # async fn run(transport: Arc<dyn chainhead_core::RpcTransport>) -> Result<(), chainhead_client::ChainHeadError> {
//! let head = ChainHead::new(transport, ChainHeadConfig::default());
//! head.follow(true).await?;
//! // Registered until `_listener` goes out of scope.
//! let _listener = head.on(EventKind::BestBlock, |ev| println!("{ev:?}"));
//! let best = head.best_hash().expect("following");
//! let header = head.header(&best).await?;
//! println!("best header: {header}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod head;
pub mod operation;
pub mod rpc;
pub mod storage;
pub mod types;
pub mod version;
pub mod wire;

pub use config::ChainHeadConfig;
pub use error::ChainHeadError;
pub use events::{ChainHeadEvent, EventBus, EventKind, Listener};
pub use head::{ChainHead, FollowHandle, FollowStatus};
pub use operation::{OperationEvent, OperationKind, OperationRequest, OperationStream, OperationTracker};
pub use rpc::RpcClient;
pub use storage::{
    Backend, ChainHeadStorage, LegacyStorage, StorageCallback, StorageEntries, StorageQuery,
    StorageSubscription,
};
pub use types::{
    BlockHash, Bytes, PinnedBlock, RuntimeVersion, StorageQueryItem, StorageQueryType,
    StorageResultItem,
};
pub use version::{ChainHeadMethods, VersionNegotiator};
