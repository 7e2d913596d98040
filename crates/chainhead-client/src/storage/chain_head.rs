//! Storage queries through chain-head storage operations.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    changed_entries, dedupe_keys, Notifier, StorageCallback, StorageEntries, StorageQuery,
    StorageSubscription,
};
use crate::error::ChainHeadError;
use crate::events::{ChainHeadEvent, EventKind};
use crate::head::ChainHead;
use crate::types::{BlockHash, Bytes, StorageQueryItem};

/// [`StorageQuery`] backed by a following [`ChainHead`].
#[derive(Clone)]
pub struct ChainHeadStorage {
    head: ChainHead,
}

impl ChainHeadStorage {
    pub fn new(head: ChainHead) -> Self {
        Self { head }
    }

    pub fn head(&self) -> &ChainHead {
        &self.head
    }
}

/// One batched `value` lookup, reassembled in key order.
async fn query_keys(
    head: &ChainHead,
    keys: &[Bytes],
    at: Option<&BlockHash>,
) -> Result<StorageEntries, ChainHeadError> {
    let items: Vec<StorageQueryItem> = keys.iter().cloned().map(StorageQueryItem::value).collect();
    let results = head.storage(&items, at).await?;
    let found: HashMap<Bytes, Option<Bytes>> =
        results.into_iter().map(|item| (item.key, item.value)).collect();
    Ok(StorageEntries::assemble(keys, found))
}

#[async_trait]
impl StorageQuery for ChainHeadStorage {
    async fn query(
        &self,
        keys: &[Bytes],
        at: Option<&BlockHash>,
    ) -> Result<StorageEntries, ChainHeadError> {
        let keys = dedupe_keys(keys);
        query_keys(&self.head, &keys, at).await
    }

    async fn subscribe(
        &self,
        keys: &[Bytes],
        callback: StorageCallback,
    ) -> Result<StorageSubscription, ChainHeadError> {
        let keys = dedupe_keys(keys);

        // Listen before the initial lookup so no best-block change is missed.
        let (tx, mut rx) = mpsc::unbounded_channel::<BlockHash>();
        let listener = self.head.on(EventKind::BestBlock, move |ev| {
            if let ChainHeadEvent::BestBlock { hash } = ev {
                let _ = tx.send(hash.clone());
            }
        });

        let initial = match query_keys(&self.head, &keys, None).await {
            Ok(entries) => entries,
            Err(e) => {
                listener.unsubscribe();
                return Err(e);
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let notifier = Notifier::new(Arc::clone(&cancelled), callback);
        notifier.deliver(initial.clone());

        let head = self.head.clone();
        let task = tokio::spawn(async move {
            let mut last = initial;
            // Every best block is queried in order, none is skipped.
            while let Some(hash) = rx.recv().await {
                if notifier.is_cancelled() {
                    break;
                }
                match query_keys(&head, &keys, Some(&hash)).await {
                    Ok(next) => {
                        let changed = changed_entries(&last, &next);
                        last = next;
                        if !changed.is_empty() && !notifier.deliver(changed) {
                            break;
                        }
                    }
                    Err(ChainHeadError::BlockPruned(_) | ChainHeadError::BlockNotPinned(_)) => {
                        tracing::debug!(hash = %hash, "best block gone before storage re-query");
                    }
                    Err(e) => {
                        tracing::warn!(hash = %hash, error = %e, "storage re-query failed");
                    }
                }
            }
            tracing::debug!("chain-head storage subscription finished");
        });

        Ok(StorageSubscription::new(
            cancelled,
            task,
            Box::new(move || listener.unsubscribe()),
        ))
    }
}
