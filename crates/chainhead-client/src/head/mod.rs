//! Chain-head state machine.
//!
//! [`ChainHead`] owns the follow subscription. A driver task consumes the
//! follow events in arrival order, keeps the pinned set of the current
//! session, routes operation events to the [`OperationTracker`] and emits
//! [`ChainHeadEvent`]s. When the node stops the subscription (or the
//! transport drops it) the session is discarded and the driver re-follows
//! after a backoff delay, until the caller unfollows. Until the first
//! `initialized` arrives, re-follows are bounded by the retry config and the
//! last failure is returned from [`ChainHead::follow`]. Every follow attempt
//! that ends before `initialized` costs waiting requests one queued retry.
//!
//! Requests (`header`, `body`, `call`, `storage`) check that their target
//! block is pinned before anything is sent, and retry according to the
//! [`RetryStrategy`] of the error they hit.

mod state;

pub use state::{Applied, PrunedHistory, Session};

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio::task::JoinHandle;

use chainhead_core::policy::{RetryPolicy, RetryStrategy, SingleFlight};
use chainhead_core::{RpcTransport, Subscription, SubscriptionId, SubscriptionRequest};

use crate::config::ChainHeadConfig;
use crate::error::ChainHeadError;
use crate::events::{ChainHeadEvent, EventBus, EventKind, Listener};
use crate::operation::{
    Delivery, OperationContext, OperationEvent, OperationRequest, OperationStream,
    OperationTracker,
};
use crate::rpc::RpcClient;
use crate::types::{
    header_number, header_parent, BlockHash, Bytes, PinnedBlock, RuntimeVersion,
    StorageQueryItem, StorageResultItem,
};
use crate::version::{ChainHeadMethods, VersionNegotiator};
use crate::wire::{self, FollowEvent, MethodResponse};

/// Lifecycle of the follow subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowStatus {
    Unfollowed,
    /// Subscribing, or waiting for `initialized` (first follow or re-follow).
    Connecting,
    Following,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    follow: FollowStatus,
    /// Number of sessions that reached `initialized`.
    generation: u64,
    /// Follow attempts that ended before `initialized`.
    failed_follows: u64,
}

struct HeadState {
    session: Option<Session>,
    pruned: PrunedHistory,
}

struct Driver {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum SessionEnd {
    Shutdown,
    Stopped(ChainHeadError),
    Fatal(ChainHeadError),
}

/// Block a request runs against, resolved in the live session.
struct Target {
    subscription: SubscriptionId,
    block: PinnedBlock,
}

struct Shared {
    rpc: RpcClient,
    config: ChainHeadConfig,
    backoff: RetryPolicy,
    negotiator: VersionNegotiator,
    methods: OnceCell<Arc<ChainHeadMethods>>,
    state: Mutex<HeadState>,
    status: watch::Sender<Status>,
    fatal: Mutex<Option<ChainHeadError>>,
    events: EventBus<ChainHeadEvent>,
    tracker: Arc<OperationTracker>,
    recovery: SingleFlight<Result<(), ChainHeadError>>,
    driver: Mutex<Option<Driver>>,
}

/// Client of the chain-head protocol. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChainHead {
    shared: Arc<Shared>,
}

/// Returned by [`ChainHead::follow`].
#[derive(Clone)]
pub struct FollowHandle {
    head: ChainHead,
}

impl std::fmt::Debug for FollowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowHandle")
            .field("status", &self.head.status())
            .field("subscription", &self.head.subscription_id())
            .finish()
    }
}

impl FollowHandle {
    pub fn head(&self) -> &ChainHead {
        &self.head
    }

    /// Tear the session down. Same as [`ChainHead::unfollow`].
    pub async fn unfollow(self) {
        self.head.unfollow().await;
    }
}

impl ChainHead {
    pub fn new(transport: Arc<dyn RpcTransport>, config: ChainHeadConfig) -> Self {
        Self::with_rpc(RpcClient::new(transport), config)
    }

    pub fn with_rpc(rpc: RpcClient, config: ChainHeadConfig) -> Self {
        let (status, _) = watch::channel(Status {
            follow: FollowStatus::Unfollowed,
            generation: 0,
            failed_follows: 0,
        });
        Self {
            shared: Arc::new(Shared {
                negotiator: VersionNegotiator::new(rpc.clone()),
                backoff: RetryPolicy::new(config.retry.clone()),
                state: Mutex::new(HeadState {
                    session: None,
                    pruned: PrunedHistory::new(config.pruned_history),
                }),
                tracker: Arc::new(OperationTracker::new(config.orphan_capacity)),
                rpc,
                config,
                methods: OnceCell::new(),
                status,
                fatal: Mutex::new(None),
                events: EventBus::new(),
                recovery: SingleFlight::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.shared.rpc
    }

    pub fn config(&self) -> &ChainHeadConfig {
        &self.shared.config
    }

    pub fn negotiator(&self) -> &VersionNegotiator {
        &self.shared.negotiator
    }

    /// Method names of the negotiated chain-head version.
    pub async fn methods(&self) -> Result<Arc<ChainHeadMethods>, ChainHeadError> {
        self.shared.methods().await
    }

    // ─── Follow lifecycle ────────────────────────────────────────────────────

    /// Start following and wait for the first `initialized` event.
    ///
    /// Calling it while already following returns a handle to the existing
    /// session.
    pub async fn follow(&self, with_runtime: bool) -> Result<FollowHandle, ChainHeadError> {
        {
            let mut driver = self.shared.driver.lock().unwrap();
            if driver.is_none() {
                *self.shared.fatal.lock().unwrap() = None;
                self.shared.set_follow(FollowStatus::Connecting);
                let (tx, rx) = oneshot::channel();
                let task = tokio::spawn(Arc::clone(&self.shared).drive(with_runtime, rx));
                *driver = Some(Driver { shutdown: tx, task });
            }
        }
        self.wait_until_following().await?;
        Ok(FollowHandle { head: self.clone() })
    }

    /// Stop following. In-flight operations fail with `NotFollowing`.
    pub async fn unfollow(&self) {
        let driver = self.shared.driver.lock().unwrap().take();
        if let Some(driver) = driver {
            let _ = driver.shutdown.send(());
            if let Err(e) = driver.task.await {
                tracing::warn!(error = %e, "follow driver panicked");
            }
        }
    }

    pub fn status(&self) -> FollowStatus {
        self.shared.status().follow
    }

    /// Resolve once a session is live. Fails with `NotFollowing` (or the
    /// fatal error that ended following) when not following.
    pub async fn wait_until_following(&self) -> Result<(), ChainHeadError> {
        self.shared.wait_following(0, false).await
    }

    // ─── Cached state ────────────────────────────────────────────────────────

    fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.shared.state.lock().unwrap().session.as_ref().map(f)
    }

    pub fn best_hash(&self) -> Option<BlockHash> {
        self.with_session(|s| s.best().clone())
    }

    pub fn finalized_hash(&self) -> Option<BlockHash> {
        self.with_session(|s| s.finalized().clone())
    }

    /// Runtime of the finalized block.
    pub fn runtime_version(&self) -> Option<Arc<RuntimeVersion>> {
        self.with_session(|s| s.runtime_at(s.finalized())).flatten()
    }

    /// Runtime of the best block.
    pub fn best_runtime_version(&self) -> Option<Arc<RuntimeVersion>> {
        self.with_session(|s| s.runtime_at(s.best())).flatten()
    }

    pub fn runtime_at(&self, hash: &BlockHash) -> Option<Arc<RuntimeVersion>> {
        self.with_session(|s| s.runtime_at(hash)).flatten()
    }

    pub fn block(&self, hash: &BlockHash) -> Option<PinnedBlock> {
        self.with_session(|s| s.block(hash).cloned()).flatten()
    }

    pub fn is_pinned(&self, hash: &BlockHash) -> bool {
        self.with_session(|s| s.is_pinned(hash)).unwrap_or(false)
    }

    /// Pinned blocks ordered by number.
    pub fn pinned_blocks(&self) -> Vec<PinnedBlock> {
        let mut blocks = self
            .with_session(|s| s.pinned().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        blocks.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.hash.cmp(&b.hash)));
        blocks
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.with_session(|s| s.subscription().clone())
    }

    /// Register a handler for one kind of notification. It is removed when
    /// the returned [`Listener`] is unsubscribed or dropped.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Listener
    where
        F: Fn(&ChainHeadEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(move |ev| {
            if ev.kind() == kind {
                handler(ev)
            }
        })
    }

    // ─── Requests ────────────────────────────────────────────────────────────

    /// SCALE-encoded header of a pinned block.
    pub async fn header(&self, hash: &BlockHash) -> Result<Bytes, ChainHeadError> {
        let shared = &self.shared;
        shared
            .with_retries("header", move || async move {
                let target = shared.target(Some(hash))?;
                shared
                    .fetch_header(&target.subscription, hash)
                    .await?
                    .ok_or_else(|| ChainHeadError::BlockNotPinned(hash.clone()))
            })
            .await
    }

    /// Extrinsics of a pinned block.
    pub async fn body(&self, hash: &BlockHash) -> Result<Vec<Bytes>, ChainHeadError> {
        let shared = &self.shared;
        shared
            .with_retries("body", move || async move {
                let target = shared.target(Some(hash))?;
                let stream = shared.start(&target, &OperationRequest::Body).await?;
                match finish(stream).await? {
                    OperationEvent::BodyDone(extrinsics) => Ok(extrinsics),
                    other => Err(unexpected(&other)),
                }
            })
            .await
    }

    /// Call a runtime API function at a pinned block.
    pub async fn call(
        &self,
        hash: &BlockHash,
        function: &str,
        params: &Bytes,
    ) -> Result<Bytes, ChainHeadError> {
        let shared = &self.shared;
        shared
            .with_retries("call", move || async move {
                let target = shared.target(Some(hash))?;
                if let Some(reason) = &target.block.invalid_runtime {
                    return Err(ChainHeadError::InvalidRuntime {
                        hash: hash.clone(),
                        reason: reason.clone(),
                    });
                }
                let request = OperationRequest::Call {
                    function: function.to_string(),
                    params: params.clone(),
                };
                let stream = shared.start(&target, &request).await?;
                match finish(stream).await? {
                    OperationEvent::CallDone(output) => Ok(output),
                    other => Err(unexpected(&other)),
                }
            })
            .await
    }

    /// Run a batch of storage queries against `at` (default: best block).
    ///
    /// Descendant queries fan out, so the result can hold more items than
    /// `queries`.
    pub async fn storage(
        &self,
        queries: &[StorageQueryItem],
        at: Option<&BlockHash>,
    ) -> Result<Vec<StorageResultItem>, ChainHeadError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let shared = &self.shared;
        shared
            .with_retries("storage", move || async move {
                let target = shared.target(at)?;
                shared.storage_at(&target, queries).await
            })
            .await
    }

    /// Start an operation without retries. `LimitReached` is returned as is.
    pub async fn start_operation(
        &self,
        hash: &BlockHash,
        request: OperationRequest,
    ) -> Result<OperationStream, ChainHeadError> {
        let target = self.shared.target(Some(hash))?;
        self.shared.start(&target, &request).await
    }

    /// Release pinned blocks. The best and finalized blocks are kept.
    pub async fn unpin(&self, hashes: &[BlockHash]) -> Result<(), ChainHeadError> {
        let (subscription, removed) = {
            let mut st = self.shared.state.lock().unwrap();
            let HeadState { session, pruned } = &mut *st;
            let Some(session) = session.as_mut() else {
                return Err(ChainHeadError::NotFollowing);
            };
            let removed = session.unpin(hashes);
            for hash in &removed {
                pruned.record(hash.clone());
            }
            (session.subscription().clone(), removed)
        };
        if removed.is_empty() {
            return Ok(());
        }
        for hash in &removed {
            self.shared.tracker.fail_block(hash);
        }
        self.shared.send_unpin(&subscription, &removed).await
    }
}

impl Shared {
    fn status(&self) -> Status {
        *self.status.borrow()
    }

    fn set_follow(&self, follow: FollowStatus) {
        self.status.send_modify(|s| s.follow = follow);
    }

    async fn methods(&self) -> Result<Arc<ChainHeadMethods>, ChainHeadError> {
        self.methods
            .get_or_try_init(|| async {
                let prefix = &self.config.method_prefix;
                let version = self.negotiator.version(prefix).await?;
                Ok::<_, ChainHeadError>(Arc::new(ChainHeadMethods::new(prefix, &version)))
            })
            .await
            .cloned()
    }

    /// Wait for a session newer than generation `after`.
    ///
    /// With `fail_on_retry`, a follow attempt that ends before `initialized`
    /// resolves the wait with `Stop`.
    async fn wait_following(&self, after: u64, fail_on_retry: bool) -> Result<(), ChainHeadError> {
        let mut rx = self.status.subscribe();
        let failed = rx.borrow().failed_follows;
        loop {
            let status = *rx.borrow_and_update();
            match status.follow {
                FollowStatus::Following if status.generation > after => return Ok(()),
                FollowStatus::Unfollowed => {
                    let fatal = self.fatal.lock().unwrap().clone();
                    return Err(fatal.unwrap_or(ChainHeadError::NotFollowing));
                }
                _ if fail_on_retry && status.failed_follows != failed => {
                    return Err(ChainHeadError::Stop);
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChainHeadError::NotFollowing);
            }
        }
    }

    fn target(&self, at: Option<&BlockHash>) -> Result<Target, ChainHeadError> {
        let st = self.state.lock().unwrap();
        let Some(session) = st.session.as_ref() else {
            return Err(match self.status().follow {
                FollowStatus::Connecting => ChainHeadError::Stop,
                _ => ChainHeadError::NotFollowing,
            });
        };
        let hash = at.unwrap_or(session.best());
        match session.block(hash) {
            Some(block) => Ok(Target {
                subscription: session.subscription().clone(),
                block: block.clone(),
            }),
            None if st.pruned.contains(hash) => Err(ChainHeadError::BlockPruned(hash.clone())),
            None => Err(ChainHeadError::BlockNotPinned(hash.clone())),
        }
    }

    /// Still pinned in the session the request was issued under?
    fn check_pinned(&self, subscription: &SubscriptionId, hash: &BlockHash) -> Result<(), ChainHeadError> {
        let st = self.state.lock().unwrap();
        match st.session.as_ref() {
            Some(s) if s.subscription() == subscription => {
                if s.is_pinned(hash) {
                    Ok(())
                } else if st.pruned.contains(hash) {
                    Err(ChainHeadError::BlockPruned(hash.clone()))
                } else {
                    Err(ChainHeadError::BlockNotPinned(hash.clone()))
                }
            }
            _ => Err(ChainHeadError::Stop),
        }
    }

    /// Run `attempt` until it succeeds, fails for good or runs out of retries.
    async fn with_retries<T, F, Fut>(
        self: &Arc<Self>,
        what: &'static str,
        mut attempt: F,
    ) -> Result<T, ChainHeadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainHeadError>>,
    {
        let mut immediate = 0u32;
        let mut queued = 0u32;
        loop {
            let generation = self.status().generation;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match err.retry_strategy() {
                None => return Err(err),
                Some(RetryStrategy::Now) => {
                    immediate += 1;
                    if immediate > self.config.max_immediate_retries {
                        tracing::error!(what, attempts = immediate, error = %err, "immediate retries exhausted");
                        return Err(ChainHeadError::RetriesExhausted {
                            strategy: RetryStrategy::Now,
                            attempts: immediate,
                            last: Box::new(err),
                        });
                    }
                    tracing::debug!(what, attempt = immediate, error = %err, "retrying immediately");
                }
                Some(RetryStrategy::Queued) => {
                    queued += 1;
                    if queued > self.config.max_queued_retries {
                        tracing::error!(what, attempts = queued, error = %err, "queued retries exhausted");
                        return Err(ChainHeadError::RetriesExhausted {
                            strategy: RetryStrategy::Queued,
                            attempts: queued,
                            last: Box::new(err),
                        });
                    }
                    tracing::debug!(what, attempt = queued, error = %err, "waiting for recovery");
                    match self.recover(&err, generation, queued).await {
                        Ok(()) => {}
                        // A failed re-follow costs one queued attempt.
                        Err(e) if e.retry_strategy() == Some(RetryStrategy::Queued) => {
                            tracing::debug!(what, error = %e, "recovery attempt failed");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Join (or start) the chain-wide recovery for a `QUEUED` error.
    async fn recover(
        self: &Arc<Self>,
        err: &ChainHeadError,
        generation: u64,
        attempt: u32,
    ) -> Result<(), ChainHeadError> {
        let recovery = match err {
            ChainHeadError::LimitReached => {
                let delay = self.backoff.backoff(attempt);
                self.recovery.run(move || async move {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
            }
            _ => {
                let shared = Arc::clone(self);
                self.recovery
                    .run(move || async move { shared.wait_following(generation, true).await })
            }
        };
        recovery.await
    }

    async fn start(
        &self,
        target: &Target,
        request: &OperationRequest,
    ) -> Result<OperationStream, ChainHeadError> {
        let methods = self.methods().await?;
        let hash = &target.block.hash;
        let (method, params) = request.to_params(&methods, &target.subscription, hash);
        let response: MethodResponse = self
            .rpc
            .request(&method, params)
            .await
            .map_err(|e| ChainHeadError::classify(e, Some(hash)))?;
        let started = match response {
            MethodResponse::LimitReached => {
                tracing::debug!(method = %method, hash = %hash, "node refused operation");
                return Err(ChainHeadError::LimitReached);
            }
            MethodResponse::Started(started) => started,
        };

        let rx = self.tracker.register(
            &target.subscription,
            &started.operation_id,
            hash.clone(),
            request.kind(),
        )?;
        tracing::debug!(operation = %started.operation_id, method = %method, hash = %hash, "operation started");
        let stream = OperationStream::new(
            started.operation_id,
            hash.clone(),
            request.kind(),
            rx,
            OperationContext {
                rpc: self.rpc.clone(),
                methods,
                subscription: target.subscription.clone(),
                tracker: Arc::clone(&self.tracker),
            },
        )
        .with_discarded(started.discarded_items.unwrap_or(0));

        // The block may have been unpinned while the request was in flight.
        if let Err(e) = self.check_pinned(&target.subscription, hash) {
            stream.stop().await;
            return Err(e);
        }
        Ok(stream)
    }

    async fn storage_at(
        &self,
        target: &Target,
        queries: &[StorageQueryItem],
    ) -> Result<Vec<StorageResultItem>, ChainHeadError> {
        let mut pending = queries.to_vec();
        let mut out = Vec::new();
        while !pending.is_empty() {
            let request = OperationRequest::Storage {
                items: pending.clone(),
                child_trie: None,
            };
            let stream = self.start(target, &request).await?;
            let discarded = stream.discarded_items();
            if discarded >= pending.len() {
                stream.stop().await;
                return Err(ChainHeadError::LimitReached);
            }
            let rest = pending.split_off(pending.len() - discarded);
            if discarded > 0 {
                tracing::debug!(discarded, hash = %target.block.hash, "node discarded storage items, re-issuing them");
            }
            out.extend(collect_storage(stream).await?);
            pending = rest;
        }
        Ok(out)
    }

    async fn fetch_header(
        &self,
        subscription: &SubscriptionId,
        hash: &BlockHash,
    ) -> Result<Option<Bytes>, ChainHeadError> {
        let methods = self.methods().await?;
        self.rpc
            .request(
                &methods.header,
                vec![subscription.to_value(), Value::String(hash.0.clone())],
            )
            .await
            .map_err(|e| ChainHeadError::classify(e, Some(hash)))
    }

    async fn send_unpin(
        &self,
        subscription: &SubscriptionId,
        hashes: &[BlockHash],
    ) -> Result<(), ChainHeadError> {
        let methods = self.methods().await?;
        let list = hashes.iter().map(|h| Value::String(h.0.clone())).collect();
        self.rpc
            .request_raw(&methods.unpin, vec![subscription.to_value(), Value::Array(list)])
            .await?;
        Ok(())
    }

    // ─── Driver ──────────────────────────────────────────────────────────────

    async fn drive(self: Arc<Self>, with_runtime: bool, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt = 0u32;
        let mut live = false;
        let fatal = loop {
            let opened = tokio::select! {
                _ = &mut shutdown => break None,
                opened = self.open(with_runtime) => opened,
            };
            let (end, initialized) = match opened {
                Ok(subscription) => self.pump(subscription, &mut shutdown).await,
                Err(e) if e.is_fatal() => (SessionEnd::Fatal(e), false),
                Err(e) => {
                    tracing::warn!(error = %e, "follow request failed");
                    (SessionEnd::Stopped(e), false)
                }
            };
            if initialized {
                attempt = 0;
                live = true;
            }
            match end {
                SessionEnd::Shutdown => break None,
                SessionEnd::Fatal(e) => break Some(e),
                SessionEnd::Stopped(e) => {
                    if !initialized {
                        self.status.send_modify(|s| s.failed_follows += 1);
                        // The first follow gives up after the configured retries.
                        if !live && !self.backoff.should_retry(attempt + 1) {
                            break Some(e);
                        }
                    }
                    self.end_session(ChainHeadError::Stop);
                    attempt += 1;
                    let delay = self.backoff.backoff(attempt);
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "re-following");
                    tokio::select! {
                        _ = &mut shutdown => break None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        match fatal {
            Some(e) => {
                tracing::error!(error = %e, "following ended");
                self.end_session(e.clone());
                *self.fatal.lock().unwrap() = Some(e);
                self.driver.lock().unwrap().take();
            }
            None => {
                tracing::info!("unfollowed");
                self.end_session(ChainHeadError::NotFollowing);
            }
        }
        self.set_follow(FollowStatus::Unfollowed);
    }

    async fn open(&self, with_runtime: bool) -> Result<Subscription, ChainHeadError> {
        let methods = self.methods().await?;
        let request = SubscriptionRequest {
            subscribe_method: methods.follow.clone(),
            unsubscribe_method: methods.unfollow.clone(),
            notification_name: methods.follow_event.clone(),
            params: vec![Value::Bool(with_runtime)],
        };
        Ok(self.rpc.subscribe(&request).await?)
    }

    /// Consume one follow subscription. Returns how it ended and whether it
    /// reached `initialized`.
    async fn pump(
        self: &Arc<Self>,
        mut subscription: Subscription,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> (SessionEnd, bool) {
        let id = subscription.id.clone();
        tracing::info!(subscription = %id, "follow subscription opened");
        let mut initialized = false;
        loop {
            let next = tokio::select! {
                _ = &mut *shutdown => {
                    if let Err(e) = self.rpc.unsubscribe(&subscription.unsubscribe_method, &id).await {
                        tracing::debug!(error = %e, "unfollow failed");
                    }
                    return (SessionEnd::Shutdown, initialized);
                }
                next = subscription.notifications.recv() => next,
            };
            let Some(value) = next else {
                tracing::warn!(subscription = %id, "follow stream ended");
                return (SessionEnd::Stopped(ChainHeadError::Stop), initialized);
            };
            let event = match serde_json::from_value::<FollowEvent>(value) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable follow event");
                    continue;
                }
            };
            match event {
                FollowEvent::Stop => {
                    tracing::info!(subscription = %id, "node stopped the follow subscription");
                    return (SessionEnd::Stopped(ChainHeadError::Stop), initialized);
                }
                FollowEvent::Initialized(init) => {
                    if initialized {
                        tracing::warn!("duplicate initialized event ignored");
                        continue;
                    }
                    match self.initialize(&id, init).await {
                        Ok(()) => initialized = true,
                        Err(e) if e.is_fatal() => return (SessionEnd::Fatal(e), false),
                        Err(e) => {
                            tracing::warn!(error = %e, "could not initialize session");
                            return (SessionEnd::Stopped(e), false);
                        }
                    }
                }
                other => match Delivery::from_follow_event(other) {
                    Ok((operation, delivery)) => self.tracker.dispatch(operation, delivery),
                    Err(block_event) => self.apply(&id, block_event),
                },
            }
        }
    }

    async fn initialize(
        self: &Arc<Self>,
        subscription: &SubscriptionId,
        init: wire::Initialized,
    ) -> Result<(), ChainHeadError> {
        let hashes = init.hashes();
        let Some(first) = hashes.first() else {
            return Err(ChainHeadError::Decode(
                "initialized event without finalized hashes".into(),
            ));
        };
        let header = match self.fetch_header(subscription, first).await {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(hash = %first, error = %e, "could not fetch finalized header");
                None
            }
        };
        let number = header
            .as_ref()
            .and_then(|h| header_number(h.as_slice()))
            .unwrap_or(0);
        let parent = header
            .as_ref()
            .and_then(|h| header_parent(h.as_slice()))
            .unwrap_or_default();

        let Some((session, applied)) = Session::initialize(
            subscription.clone(),
            &init,
            number,
            parent,
            self.config.finalized_retention,
        ) else {
            return Err(ChainHeadError::Decode("empty initialized event".into()));
        };
        let best = session.best().clone();
        {
            let mut st = self.state.lock().unwrap();
            for hash in session.pinned_hashes() {
                st.pruned.forget(&hash);
            }
            for hash in &applied.unpinned {
                st.pruned.record(hash.clone());
            }
            st.session = Some(session);
        }
        self.tracker.begin_session(subscription.clone());
        self.status.send_modify(|s| {
            s.follow = FollowStatus::Following;
            s.generation += 1;
        });
        tracing::info!(subscription = %subscription, best = %best, number, "following");
        self.publish(subscription, applied);
        Ok(())
    }

    fn apply(self: &Arc<Self>, subscription: &SubscriptionId, event: FollowEvent) {
        let applied = {
            let mut st = self.state.lock().unwrap();
            let HeadState { session, pruned } = &mut *st;
            let Some(session) = session.as_mut() else {
                tracing::debug!("block event before initialized ignored");
                return;
            };
            let applied = match event {
                FollowEvent::NewBlock(ev) => session.new_block(ev),
                FollowEvent::BestBlockChanged(ev) => session.best_block_changed(ev.best_block_hash),
                FollowEvent::Finalized(ev) => session.finalize(ev),
                _ => return,
            };
            for hash in &applied.unpinned {
                pruned.record(hash.clone());
            }
            applied
        };
        self.publish(subscription, applied);
    }

    /// Fail operations of unpinned blocks, release them on the node and emit
    /// the notifications of a transition.
    fn publish(self: &Arc<Self>, subscription: &SubscriptionId, applied: Applied) {
        if !applied.unpinned.is_empty() {
            for hash in &applied.unpinned {
                self.tracker.fail_block(hash);
            }
            let shared = Arc::clone(self);
            let subscription = subscription.clone();
            let hashes = applied.unpinned;
            tokio::spawn(async move {
                if let Err(e) = shared.send_unpin(&subscription, &hashes).await {
                    tracing::warn!(count = hashes.len(), error = %e, "unpin failed");
                }
            });
        }
        for event in &applied.events {
            self.events.emit(event);
        }
    }

    /// Drop the current session: its blocks count as pruned from now on and
    /// its operations fail with `err`.
    fn end_session(&self, err: ChainHeadError) {
        let stale = {
            let mut st = self.state.lock().unwrap();
            let HeadState { session, pruned } = &mut *st;
            let hashes = session.take().map(|s| s.pinned_hashes()).unwrap_or_default();
            for hash in &hashes {
                pruned.record(hash.clone());
            }
            hashes.len()
        };
        if self.status().follow == FollowStatus::Following {
            self.set_follow(FollowStatus::Connecting);
        }
        let failed = self.tracker.fail_all(err);
        tracing::debug!(stale, failed, "follow session ended");
    }
}

/// Wait for the single terminal event of a body or call operation.
async fn finish(mut stream: OperationStream) -> Result<OperationEvent, ChainHeadError> {
    loop {
        match stream.next().await {
            Some(Ok(OperationEvent::StorageItems(_))) => continue,
            Some(Ok(OperationEvent::Error(e))) => return Err(ChainHeadError::Operation(e)),
            Some(Ok(OperationEvent::Inaccessible)) => {
                return Err(ChainHeadError::OperationInaccessible)
            }
            Some(Ok(event)) => return Ok(event),
            Some(Err(e)) => return Err(e),
            None => return Err(ChainHeadError::Stop),
        }
    }
}

async fn collect_storage(mut stream: OperationStream) -> Result<Vec<StorageResultItem>, ChainHeadError> {
    let mut items = Vec::new();
    loop {
        match stream.next().await {
            Some(Ok(OperationEvent::StorageItems(batch))) => items.extend(batch),
            Some(Ok(OperationEvent::StorageDone)) => return Ok(items),
            Some(Ok(OperationEvent::Error(e))) => return Err(ChainHeadError::Operation(e)),
            Some(Ok(OperationEvent::Inaccessible)) => {
                return Err(ChainHeadError::OperationInaccessible)
            }
            Some(Ok(other)) => return Err(unexpected(&other)),
            Some(Err(e)) => return Err(e),
            None => return Err(ChainHeadError::Stop),
        }
    }
}

fn unexpected(event: &OperationEvent) -> ChainHeadError {
    ChainHeadError::Decode(format!("unexpected operation event: {event:?}"))
}
