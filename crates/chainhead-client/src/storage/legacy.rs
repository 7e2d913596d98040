//! Storage queries through the pre-chain-head `state_*` API.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use chainhead_core::policy::{RetryConfig, RetryPolicy};
use chainhead_core::{Subscription, SubscriptionId, SubscriptionRequest};

use super::{
    changed_entries, dedupe_keys, Notifier, StorageCallback, StorageEntries, StorageQuery,
    StorageSubscription,
};
use crate::error::ChainHeadError;
use crate::rpc::RpcClient;
use crate::types::{BlockHash, Bytes};
use crate::wire::StorageChangeSet;

const QUERY_STORAGE_AT: &str = "state_queryStorageAt";
const SUBSCRIBE_STORAGE: &str = "state_subscribeStorage";
const UNSUBSCRIBE_STORAGE: &str = "state_unsubscribeStorage";
const STORAGE_NOTIFICATION: &str = "state_storage";

/// [`StorageQuery`] over `state_queryStorageAt` and `state_subscribeStorage`.
#[derive(Clone)]
pub struct LegacyStorage {
    rpc: RpcClient,
    backoff: RetryPolicy,
}

impl LegacyStorage {
    pub fn new(rpc: RpcClient) -> Self {
        Self::with_backoff(rpc, RetryConfig::default())
    }

    /// `backoff` paces re-subscription after the change feed is lost.
    pub fn with_backoff(rpc: RpcClient, backoff: RetryConfig) -> Self {
        Self {
            rpc,
            backoff: RetryPolicy::new(backoff),
        }
    }

    fn subscription_request(keys: &[Bytes]) -> Result<SubscriptionRequest, ChainHeadError> {
        Ok(SubscriptionRequest {
            subscribe_method: SUBSCRIBE_STORAGE.into(),
            unsubscribe_method: UNSUBSCRIBE_STORAGE.into(),
            notification_name: STORAGE_NOTIFICATION.into(),
            params: vec![serde_json::to_value(keys)?],
        })
    }
}

/// Apply a change set to the previous view of `keys`.
fn apply_changes(
    prev: Option<&StorageEntries>,
    keys: &[Bytes],
    changes: Vec<(Bytes, Option<Bytes>)>,
) -> StorageEntries {
    let mut values: HashMap<Bytes, Option<Bytes>> = prev
        .map(|p| p.iter().cloned().collect())
        .unwrap_or_default();
    for (key, value) in changes {
        values.insert(key, value);
    }
    StorageEntries::assemble(keys, values)
}

fn decode_change_set(value: Value) -> Result<StorageChangeSet, ChainHeadError> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl StorageQuery for LegacyStorage {
    async fn query(
        &self,
        keys: &[Bytes],
        at: Option<&BlockHash>,
    ) -> Result<StorageEntries, ChainHeadError> {
        let keys = dedupe_keys(keys);
        if keys.is_empty() {
            return Ok(StorageEntries::default());
        }
        let mut params = vec![serde_json::to_value(&keys)?];
        if let Some(at) = at {
            params.push(Value::String(at.0.clone()));
        }
        let sets: Vec<StorageChangeSet> = self
            .rpc
            .request(QUERY_STORAGE_AT, params)
            .await
            .map_err(|e| ChainHeadError::classify(e, at))?;
        let found: HashMap<Bytes, Option<Bytes>> =
            sets.into_iter().flat_map(|set| set.changes).collect();
        Ok(StorageEntries::assemble(&keys, found))
    }

    async fn subscribe(
        &self,
        keys: &[Bytes],
        callback: StorageCallback,
    ) -> Result<StorageSubscription, ChainHeadError> {
        let keys = dedupe_keys(keys);
        let cancelled = Arc::new(AtomicBool::new(false));
        if keys.is_empty() {
            // An empty key list subscribes the node to every change.
            Notifier::new(Arc::clone(&cancelled), callback).deliver(StorageEntries::default());
            let task = tokio::spawn(async {});
            return Ok(StorageSubscription::new(cancelled, task, Box::new(|| {})));
        }
        let request = Self::subscription_request(&keys)?;
        let mut subscription: Subscription = self.rpc.subscribe(&request).await?;

        // The node opens the feed with the current value of every key.
        let first = match subscription.notifications.recv().await {
            Some(value) => decode_change_set(value)?,
            None => return Err(ChainHeadError::Stop),
        };
        let initial = apply_changes(None, &keys, first.changes);

        let notifier = Notifier::new(Arc::clone(&cancelled), callback);
        notifier.deliver(initial.clone());

        let current: Arc<Mutex<Option<SubscriptionId>>> =
            Arc::new(Mutex::new(Some(subscription.id.clone())));
        let rpc = self.rpc.clone();
        let backoff = self.backoff.clone();
        let live = Arc::clone(&current);
        let task = tokio::spawn(async move {
            let mut last = initial;
            'feed: loop {
                while let Some(value) = subscription.notifications.recv().await {
                    if notifier.is_cancelled() {
                        break 'feed;
                    }
                    let set = match decode_change_set(value) {
                        Ok(set) => set,
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable storage change set");
                            continue;
                        }
                    };
                    let next = apply_changes(Some(&last), &keys, set.changes);
                    let changed = changed_entries(&last, &next);
                    last = next;
                    if !changed.is_empty() && !notifier.deliver(changed) {
                        break 'feed;
                    }
                }

                tracing::warn!("storage change feed lost, resubscribing");
                *live.lock().unwrap() = None;
                let mut attempt = 0u32;
                subscription = loop {
                    attempt += 1;
                    tokio::time::sleep(backoff.backoff(attempt)).await;
                    if notifier.is_cancelled() {
                        break 'feed;
                    }
                    match rpc.subscribe(&request).await {
                        Ok(s) => break s,
                        Err(e) => tracing::warn!(attempt, error = %e, "storage resubscribe failed"),
                    }
                };
                *live.lock().unwrap() = Some(subscription.id.clone());
            }
            tracing::debug!("legacy storage subscription finished");
        });

        let rpc = self.rpc.clone();
        let cleanup = move || {
            let Some(id) = current.lock().unwrap().take() else {
                return;
            };
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = rpc.unsubscribe(UNSUBSCRIBE_STORAGE, &id).await {
                        tracing::debug!(subscription = %id, error = %e, "unsubscribe failed");
                    }
                });
            }
        };
        Ok(StorageSubscription::new(cancelled, task, Box::new(cleanup)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(v: u8) -> Bytes {
        Bytes(vec![v])
    }

    #[test]
    fn changes_update_previous_view() {
        let keys = vec![b(1), b(2)];
        let first = apply_changes(None, &keys, vec![(b(1), Some(b(10)))]);
        assert_eq!(first.0, vec![(b(1), Some(b(10))), (b(2), None)]);

        let second = apply_changes(Some(&first), &keys, vec![(b(2), Some(b(20))), (b(9), Some(b(0)))]);
        assert_eq!(second.0, vec![(b(1), Some(b(10))), (b(2), Some(b(20)))]);
        assert_eq!(changed_entries(&first, &second).0, vec![(b(2), Some(b(20)))]);
    }
}
