//! Routing table for server-push subscriptions.
//!
//! Entries are keyed by the node-assigned subscription id. Every notification
//! is forwarded to the channel of the entry it names. When the connection
//! drops, every entry is closed: chain-head subscriptions do not survive a
//! reconnect, so their consumers must observe the end of the stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use chainhead_core::transport::SubscriptionId;

struct SubscriptionEntry {
    /// Notification method name the entry accepts (e.g. `chainHead_v1_followEvent`).
    notification_name: String,
    sender: mpsc::UnboundedSender<Value>,
}

/// Tracks active subscriptions for one connection.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, SubscriptionEntry>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return the receiving half of its stream.
    pub fn register(
        &self,
        id: SubscriptionId,
        notification_name: String,
    ) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.lock().unwrap().insert(
            id,
            SubscriptionEntry {
                notification_name,
                sender: tx,
            },
        );
        rx
    }

    /// Forward a notification to its subscription.
    ///
    /// Returns `false` if no matching entry exists or its receiver is gone;
    /// entries whose receiver was dropped are removed.
    pub fn dispatch(&self, id: &SubscriptionId, method: &str, message: Value) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(id) else {
            return false;
        };
        if entry.notification_name != method {
            tracing::debug!(
                subscription = %id,
                expected = %entry.notification_name,
                got = %method,
                "notification method mismatch"
            );
            return false;
        }
        if entry.sender.send(message).is_err() {
            entries.remove(id);
            return false;
        }
        true
    }

    /// Remove a subscription (e.g. after unsubscribing).
    pub fn remove(&self, id: &SubscriptionId) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Drop every entry, ending all subscription streams.
    pub fn close_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let n = entries.len();
        entries.clear();
        n
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
