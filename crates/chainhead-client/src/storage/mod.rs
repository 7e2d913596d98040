//! Storage Query Engine.
//!
//! One contract, [`StorageQuery`], with two implementations selected once at
//! construction: [`ChainHeadStorage`] (operations against pinned blocks,
//! updates driven by best-block notifications) and [`LegacyStorage`]
//! (`state_queryStorageAt` plus the `state_subscribeStorage` change feed).
//!
//! Both de-duplicate keys keeping first-seen order, return results in input
//! order, report absent keys as `None` and never run a subscription callback
//! concurrently with itself.

mod chain_head;
mod legacy;

pub use chain_head::ChainHeadStorage;
pub use legacy::LegacyStorage;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use chainhead_core::RpcTransport;

use crate::config::ChainHeadConfig;
use crate::error::ChainHeadError;
use crate::head::ChainHead;
use crate::rpc::RpcClient;
use crate::types::{BlockHash, Bytes};

/// Key/value pairs in request order. `None` means absent from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageEntries(pub Vec<(Bytes, Option<Bytes>)>);

impl StorageEntries {
    pub fn get(&self, key: &Bytes) -> Option<&Option<Bytes>> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Option<Bytes>)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Assemble entries for `keys` from a lookup of found values.
    pub(crate) fn assemble(keys: &[Bytes], mut found: HashMap<Bytes, Option<Bytes>>) -> Self {
        Self(
            keys.iter()
                .map(|k| (k.clone(), found.remove(k).flatten()))
                .collect(),
        )
    }
}

impl IntoIterator for StorageEntries {
    type Item = (Bytes, Option<Bytes>);
    type IntoIter = std::vec::IntoIter<(Bytes, Option<Bytes>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Callback of [`StorageQuery::subscribe`].
pub type StorageCallback = Arc<dyn Fn(StorageEntries) + Send + Sync>;

/// Storage access shared by both backends.
#[async_trait]
pub trait StorageQuery: Send + Sync {
    /// Values of `keys` at `at` (default: best block).
    async fn query(&self, keys: &[Bytes], at: Option<&BlockHash>) -> Result<StorageEntries, ChainHeadError>;

    /// Watch `keys`. The callback fires once with every key, then with the
    /// keys whose value changed. Errors of the initial lookup are returned.
    async fn subscribe(
        &self,
        keys: &[Bytes],
        callback: StorageCallback,
    ) -> Result<StorageSubscription, ChainHeadError>;
}

/// Which [`StorageQuery`] implementation [`connect`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    ChainHead,
    Legacy,
    /// Chain-head when the node supports it, legacy otherwise.
    #[default]
    Auto,
}

/// Build the storage engine for `transport`.
pub async fn connect(
    transport: Arc<dyn RpcTransport>,
    backend: Backend,
    config: ChainHeadConfig,
) -> Result<Arc<dyn StorageQuery>, ChainHeadError> {
    let rpc = RpcClient::new(transport);
    match backend {
        Backend::Legacy => Ok(Arc::new(LegacyStorage::new(rpc))),
        Backend::ChainHead => {
            let head = ChainHead::with_rpc(rpc, config);
            head.follow(false).await?;
            Ok(Arc::new(ChainHeadStorage::new(head)))
        }
        Backend::Auto => {
            let head = ChainHead::with_rpc(rpc.clone(), config);
            match head.follow(false).await {
                Ok(_) => {
                    tracing::info!(url = %rpc.transport().url(), "using chain-head storage");
                    Ok(Arc::new(ChainHeadStorage::new(head)))
                }
                Err(e) if e.is_fatal() => {
                    tracing::info!(url = %rpc.transport().url(), reason = %e, "falling back to legacy storage");
                    Ok(Arc::new(LegacyStorage::new(rpc)))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Remove duplicate keys, keeping the first occurrence.
pub fn dedupe_keys(keys: &[Bytes]) -> Vec<Bytes> {
    let mut seen = HashSet::new();
    keys.iter()
        .filter(|k| seen.insert(*k))
        .cloned()
        .collect()
}

/// Entries of `next` whose value differs from `prev`.
pub fn changed_entries(prev: &StorageEntries, next: &StorageEntries) -> StorageEntries {
    StorageEntries(
        next.iter()
            .filter(|(k, v)| prev.get(k).map_or(true, |old| old != v))
            .cloned()
            .collect(),
    )
}

/// Handle of a storage subscription. Dropping it unsubscribes.
pub struct StorageSubscription {
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl StorageSubscription {
    pub(crate) fn new(
        cancelled: Arc<AtomicBool>,
        task: JoinHandle<()>,
        cleanup: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            cancelled,
            task: Mutex::new(Some(task)),
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    /// Stop delivering updates. No callback invocation starts after this
    /// returns. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(cleanup) = self.cleanup.lock().unwrap().take() {
            cleanup();
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for StorageSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Serialises callback invocations of one subscription and makes
/// cancellation final.
#[derive(Clone)]
pub(crate) struct Notifier {
    cancelled: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
    callback: StorageCallback,
}

impl Notifier {
    pub(crate) fn new(cancelled: Arc<AtomicBool>, callback: StorageCallback) -> Self {
        Self {
            cancelled,
            gate: Arc::new(Mutex::new(())),
            callback,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the callback unless cancelled. Returns `false` when cancelled.
    pub(crate) fn deliver(&self, entries: StorageEntries) -> bool {
        let _gate = self.gate.lock().unwrap();
        if self.is_cancelled() {
            return false;
        }
        (self.callback)(entries);
        true
    }
}
