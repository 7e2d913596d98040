//! Lifecycle of node-side operations (body, call and storage fetches).
//!
//! The follow driver feeds every `operation*` event into the
//! [`OperationTracker`], which routes it to the [`OperationStream`] of the
//! operation id. Events that arrive before the issuing caller registered the
//! id are buffered and replayed; events for finished or stopped operations
//! are dropped. `operationWaitingForContinue` never reaches the caller: the
//! stream answers every pause with a `continue` call, awaited before the
//! next event is read, so at most one is in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use chainhead_core::SubscriptionId;

use crate::error::ChainHeadError;
use crate::rpc::RpcClient;
use crate::types::{BlockHash, Bytes, StorageQueryItem, StorageResultItem};
use crate::version::ChainHeadMethods;
use crate::wire::FollowEvent;

/// Retired ids remembered to drop late events.
const RETIRED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Body,
    Call,
    Storage,
}

/// A request that starts a node-side operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    Body,
    Call {
        function: String,
        params: Bytes,
    },
    Storage {
        items: Vec<StorageQueryItem>,
        child_trie: Option<Bytes>,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Body => OperationKind::Body,
            Self::Call { .. } => OperationKind::Call,
            Self::Storage { .. } => OperationKind::Storage,
        }
    }

    /// Method and params, following the `(subscription, hash, ...)` convention.
    pub(crate) fn to_params(
        &self,
        methods: &ChainHeadMethods,
        subscription: &SubscriptionId,
        hash: &BlockHash,
    ) -> (String, Vec<Value>) {
        let mut params = vec![subscription.to_value(), Value::String(hash.0.clone())];
        let method = match self {
            Self::Body => methods.body.clone(),
            Self::Call { function, params: args } => {
                params.push(Value::String(function.clone()));
                params.push(Value::String(args.to_hex()));
                methods.call.clone()
            }
            Self::Storage { items, child_trie } => {
                params.push(serde_json::to_value(items).unwrap_or(Value::Array(vec![])));
                params.push(
                    child_trie
                        .as_ref()
                        .map(|c| Value::String(c.to_hex()))
                        .unwrap_or(Value::Null),
                );
                methods.storage.clone()
            }
        };
        (method, params)
    }
}

/// What the caller of an operation observes.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// Partial storage results, delivered as soon as the node has them.
    StorageItems(Vec<StorageResultItem>),
    BodyDone(Vec<Bytes>),
    CallDone(Bytes),
    StorageDone,
    /// The request failed on the node. Not retried.
    Error(String),
    /// The block became unusable mid-operation.
    Inaccessible,
}

impl OperationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StorageItems(_))
    }
}

/// Internal routing item.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Event(OperationEvent),
    WaitingForContinue,
    Failed(ChainHeadError),
}

impl Delivery {
    fn is_terminal(&self) -> bool {
        match self {
            Self::Event(e) => e.is_terminal(),
            Self::WaitingForContinue => false,
            Self::Failed(_) => true,
        }
    }

    /// Split an `operation*` follow event into its id and payload. Other
    /// events are handed back.
    pub(crate) fn from_follow_event(event: FollowEvent) -> Result<(String, Self), FollowEvent> {
        let routed = match event {
            FollowEvent::OperationBodyDone(e) => {
                (e.operation_id, Self::Event(OperationEvent::BodyDone(e.value)))
            }
            FollowEvent::OperationCallDone(e) => {
                (e.operation_id, Self::Event(OperationEvent::CallDone(e.output)))
            }
            FollowEvent::OperationStorageItems(e) => (
                e.operation_id,
                Self::Event(OperationEvent::StorageItems(e.items)),
            ),
            FollowEvent::OperationWaitingForContinue(e) => (e.operation_id, Self::WaitingForContinue),
            FollowEvent::OperationStorageDone(e) => {
                (e.operation_id, Self::Event(OperationEvent::StorageDone))
            }
            FollowEvent::OperationInaccessible(e) => {
                (e.operation_id, Self::Event(OperationEvent::Inaccessible))
            }
            FollowEvent::OperationError(e) => {
                (e.operation_id, Self::Event(OperationEvent::Error(e.error)))
            }
            other => return Err(other),
        };
        Ok(routed)
    }
}

struct Entry {
    hash: BlockHash,
    kind: OperationKind,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct TrackerState {
    /// Subscription the live operations belong to. `None` between sessions.
    session: Option<SubscriptionId>,
    active: HashMap<String, Entry>,
    orphans: VecDeque<(String, Delivery)>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

impl TrackerState {
    fn retire(&mut self, id: String) {
        if self.retired.insert(id.clone()) {
            self.retired_order.push_back(id);
            while self.retired_order.len() > RETIRED_CAPACITY {
                if let Some(old) = self.retired_order.pop_front() {
                    self.retired.remove(&old);
                }
            }
        }
    }
}

/// Registry of in-flight operations of the current follow session.
pub struct OperationTracker {
    state: Mutex<TrackerState>,
    orphan_capacity: usize,
}

impl OperationTracker {
    pub fn new(orphan_capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                session: None,
                active: HashMap::new(),
                orphans: VecDeque::new(),
                retired: HashSet::new(),
                retired_order: VecDeque::new(),
            }),
            orphan_capacity,
        }
    }

    /// Start accepting operations of a new follow subscription.
    pub fn begin_session(&self, subscription: SubscriptionId) {
        let mut st = self.state.lock().unwrap();
        st.session = Some(subscription);
        st.orphans.clear();
        st.retired.clear();
        st.retired_order.clear();
    }

    /// Register an operation started under `subscription`.
    ///
    /// Buffered events for the id are replayed into the returned receiver.
    /// Fails with `Stop` when the subscription is no longer the live one.
    pub(crate) fn register(
        &self,
        subscription: &SubscriptionId,
        id: &str,
        hash: BlockHash,
        kind: OperationKind,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, ChainHeadError> {
        let mut st = self.state.lock().unwrap();
        if st.session.as_ref() != Some(subscription) {
            return Err(ChainHeadError::Stop);
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let mut finished = false;
        let orphans = std::mem::take(&mut st.orphans);
        for (oid, delivery) in orphans {
            if oid == id && !finished {
                finished = delivery.is_terminal();
                let _ = tx.send(delivery);
            } else if oid != id {
                st.orphans.push_back((oid, delivery));
            }
        }

        if finished {
            st.retire(id.to_string());
        } else {
            st.active.insert(id.to_string(), Entry { hash, kind, tx });
        }
        Ok(rx)
    }

    /// Route one operation event. Terminal events finish the operation.
    pub(crate) fn dispatch(&self, id: String, delivery: Delivery) {
        let mut st = self.state.lock().unwrap();
        if st.retired.contains(&id) {
            tracing::debug!(operation = %id, "dropping event of finished operation");
            return;
        }
        let terminal = delivery.is_terminal();
        match st.active.get(&id) {
            Some(entry) => {
                tracing::trace!(operation = %id, kind = ?entry.kind, terminal, "operation event");
                let _ = entry.tx.send(delivery);
                if terminal {
                    st.active.remove(&id);
                    st.retire(id);
                }
            }
            None => {
                if st.orphans.len() >= self.orphan_capacity {
                    if let Some((dropped, _)) = st.orphans.pop_front() {
                        tracing::warn!(operation = %dropped, "orphan buffer full, dropping event");
                    }
                }
                tracing::debug!(operation = %id, "buffering event of unregistered operation");
                st.orphans.push_back((id, delivery));
            }
        }
    }

    /// Stop tracking an operation; its late events are dropped.
    pub fn retire(&self, id: &str) {
        let mut st = self.state.lock().unwrap();
        st.active.remove(id);
        st.orphans.retain(|(oid, _)| oid != id);
        st.retire(id.to_string());
    }

    /// Fail every operation running against `hash` with `BlockPruned`.
    pub fn fail_block(&self, hash: &BlockHash) -> usize {
        let mut st = self.state.lock().unwrap();
        let ids: Vec<String> = st
            .active
            .iter()
            .filter(|(_, e)| &e.hash == hash)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = st.active.remove(id) {
                let _ = entry
                    .tx
                    .send(Delivery::Failed(ChainHeadError::BlockPruned(hash.clone())));
            }
            st.retire(id.clone());
        }
        if !ids.is_empty() {
            tracing::debug!(hash = %hash, count = ids.len(), "failed operations of unpinned block");
        }
        ids.len()
    }

    /// End the session: fail every operation with `err`.
    pub fn fail_all(&self, err: ChainHeadError) -> usize {
        let mut st = self.state.lock().unwrap();
        st.session = None;
        st.orphans.clear();
        let n = st.active.len();
        for (_, entry) in st.active.drain() {
            let _ = entry.tx.send(Delivery::Failed(err.clone()));
        }
        n
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }
}

/// What an [`OperationStream`] needs to talk back to the node.
#[derive(Clone)]
pub(crate) struct OperationContext {
    pub rpc: RpcClient,
    pub methods: Arc<ChainHeadMethods>,
    pub subscription: SubscriptionId,
    pub tracker: Arc<OperationTracker>,
}

/// Events of one started operation, in node order, ending with exactly one
/// terminal item.
pub struct OperationStream {
    id: String,
    hash: BlockHash,
    kind: OperationKind,
    rx: mpsc::UnboundedReceiver<Delivery>,
    ctx: OperationContext,
    discarded: usize,
    done: bool,
}

impl OperationStream {
    pub(crate) fn new(
        id: String,
        hash: BlockHash,
        kind: OperationKind,
        rx: mpsc::UnboundedReceiver<Delivery>,
        ctx: OperationContext,
    ) -> Self {
        Self {
            id,
            hash,
            kind,
            rx,
            ctx,
            discarded: 0,
            done: false,
        }
    }

    pub(crate) fn with_discarded(mut self, discarded: usize) -> Self {
        self.discarded = discarded;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Trailing storage items the node refused to process; they are not
    /// part of this operation.
    pub fn discarded_items(&self) -> usize {
        self.discarded
    }

    /// Next event. `Err` items are terminal: the block was pruned or the
    /// follow session ended. Returns `None` after the terminal item.
    pub async fn next(&mut self) -> Option<Result<OperationEvent, ChainHeadError>> {
        loop {
            if self.done {
                return None;
            }
            let Some(delivery) = self.rx.recv().await else {
                self.done = true;
                return Some(Err(ChainHeadError::Stop));
            };
            match delivery {
                Delivery::WaitingForContinue => {
                    if let Err(e) = self.send_continue().await {
                        self.done = true;
                        self.ctx.tracker.retire(&self.id);
                        return Some(Err(e));
                    }
                }
                Delivery::Event(event) => {
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(Ok(event));
                }
                Delivery::Failed(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }

    async fn send_continue(&self) -> Result<(), ChainHeadError> {
        tracing::debug!(operation = %self.id, "sending continue");
        self.ctx
            .rpc
            .request_raw(
                &self.ctx.methods.continue_,
                vec![
                    self.ctx.subscription.to_value(),
                    Value::String(self.id.clone()),
                ],
            )
            .await
            .map(|_| ())
            .map_err(|e| ChainHeadError::classify(e, Some(&self.hash)))
    }

    /// Cancel the operation. The stream ends immediately; the node is told
    /// best-effort and late events are dropped.
    pub async fn stop(mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.ctx.tracker.retire(&self.id);
        stop_remote(&self.ctx, &self.id).await;
    }
}

impl Drop for OperationStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.ctx.tracker.retire(&self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let ctx = self.ctx.clone();
            let id = self.id.clone();
            handle.spawn(async move { stop_remote(&ctx, &id).await });
        }
    }
}

async fn stop_remote(ctx: &OperationContext, id: &str) {
    let params = vec![ctx.subscription.to_value(), Value::String(id.to_string())];
    if let Err(e) = ctx.rpc.request_raw(&ctx.methods.stop_operation, params).await {
        tracing::debug!(operation = %id, error = %e, "stopOperation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> SubscriptionId {
        SubscriptionId("s1".into())
    }

    fn items() -> Delivery {
        Delivery::Event(OperationEvent::StorageItems(vec![]))
    }

    #[test]
    fn early_events_are_replayed_on_register() {
        let tracker = OperationTracker::new(8);
        tracker.begin_session(sub());
        tracker.dispatch("op".into(), items());
        tracker.dispatch("op".into(), Delivery::Event(OperationEvent::StorageDone));
        tracker.dispatch("other".into(), items());

        let mut rx = tracker
            .register(&sub(), "op", "0x1".into(), OperationKind::Storage)
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Delivery::Event(OperationEvent::StorageItems(_)))));
        assert!(matches!(rx.try_recv(), Ok(Delivery::Event(OperationEvent::StorageDone))));
        // Already finished: nothing stays registered.
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn orphan_buffer_is_bounded() {
        let tracker = OperationTracker::new(2);
        tracker.begin_session(sub());
        for i in 0..3 {
            tracker.dispatch(format!("op{i}"), items());
        }
        let mut rx = tracker
            .register(&sub(), "op0", "0x1".into(), OperationKind::Storage)
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn retired_operation_drops_late_events() {
        let tracker = OperationTracker::new(8);
        tracker.begin_session(sub());
        let mut rx = tracker
            .register(&sub(), "op", "0x1".into(), OperationKind::Body)
            .unwrap();
        tracker.retire("op");
        tracker.dispatch("op".into(), Delivery::Event(OperationEvent::BodyDone(vec![])));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn register_on_stale_session_fails() {
        let tracker = OperationTracker::new(8);
        tracker.begin_session(sub());
        tracker.fail_all(ChainHeadError::Stop);
        let err = tracker
            .register(&sub(), "op", "0x1".into(), OperationKind::Call)
            .unwrap_err();
        assert!(matches!(err, ChainHeadError::Stop));
    }

    #[test]
    fn fail_block_only_touches_that_block() {
        let tracker = OperationTracker::new(8);
        tracker.begin_session(sub());
        let mut a = tracker
            .register(&sub(), "a", "0x1".into(), OperationKind::Storage)
            .unwrap();
        let mut b = tracker
            .register(&sub(), "b", "0x2".into(), OperationKind::Storage)
            .unwrap();
        assert_eq!(tracker.fail_block(&"0x1".into()), 1);
        assert!(matches!(
            a.try_recv(),
            Ok(Delivery::Failed(ChainHeadError::BlockPruned(_)))
        ));
        assert!(b.try_recv().is_err());
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn terminal_event_finishes_operation() {
        let tracker = OperationTracker::new(8);
        tracker.begin_session(sub());
        let mut rx = tracker
            .register(&sub(), "op", "0x1".into(), OperationKind::Call)
            .unwrap();
        tracker.dispatch("op".into(), Delivery::Event(OperationEvent::Inaccessible));
        tracker.dispatch("op".into(), Delivery::Event(OperationEvent::CallDone(Bytes::default())));
        assert!(matches!(rx.try_recv(), Ok(Delivery::Event(OperationEvent::Inaccessible))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn call_params_shape() {
        let methods = ChainHeadMethods::new("chainHead", "v1");
        let req = OperationRequest::Call {
            function: "Core_version".into(),
            params: Bytes(vec![]),
        };
        let (method, params) = req.to_params(&methods, &sub(), &"0xab".into());
        assert_eq!(method, "chainHead_v1_call");
        assert_eq!(
            params,
            vec![
                Value::String("s1".into()),
                Value::String("0xab".into()),
                Value::String("Core_version".into()),
                Value::String("0x".into()),
            ]
        );
    }
}
