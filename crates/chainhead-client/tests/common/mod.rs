//! Scripted in-process node used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use chainhead_client::{BlockHash, Bytes, ChainHeadConfig};
use chainhead_core::policy::RetryConfig;
use chainhead_core::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcTransport, Subscription, SubscriptionId,
    SubscriptionRequest, TransportError,
};

pub const FOLLOW_EVENT: &str = "chainHead_v1_followEvent";
pub const STORAGE_NOTIFICATION: &str = "state_storage";

/// Answers one call, or `None` to fall through to the built-in behaviour.
pub type Handler =
    Arc<dyn Fn(&MockNode, &str, &[Value]) -> Option<Result<Value, JsonRpcError>> + Send + Sync>;

struct Inner {
    methods: Vec<String>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    subs: Mutex<HashMap<String, (SubscriptionId, mpsc::UnboundedSender<Value>)>>,
    next_sub: AtomicU64,
    next_op: AtomicU64,
    handler: Mutex<Option<Handler>>,
    refuse_follow: AtomicBool,
    initial: Mutex<Vec<u64>>,
    storage: Mutex<HashMap<BlockHash, HashMap<Bytes, Bytes>>>,
    best: Mutex<BlockHash>,
}

/// In-process node speaking the chain-head and legacy storage methods.
#[derive(Clone)]
pub struct MockNode {
    inner: Arc<Inner>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::with_methods(
            [
                "rpc_methods",
                "chainHead_v1_follow",
                "chainHead_v1_unfollow",
                "chainHead_v1_header",
                "chainHead_v1_body",
                "chainHead_v1_call",
                "chainHead_v1_storage",
                "chainHead_v1_continue",
                "chainHead_v1_stopOperation",
                "chainHead_v1_unpin",
                "state_queryStorageAt",
                "state_subscribeStorage",
                "state_unsubscribeStorage",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        )
    }

    /// A node that only advertises the legacy API.
    pub fn legacy_only() -> Self {
        Self::with_methods(
            [
                "rpc_methods",
                "state_queryStorageAt",
                "state_subscribeStorage",
                "state_unsubscribeStorage",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        )
    }

    fn with_methods(methods: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                methods,
                calls: Mutex::new(Vec::new()),
                subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(1),
                next_op: AtomicU64::new(1),
                handler: Mutex::new(None),
                refuse_follow: AtomicBool::new(false),
                initial: Mutex::new(vec![1, 2, 3]),
                storage: Mutex::new(HashMap::new()),
                best: Mutex::new(hash(3)),
            }),
        }
    }

    pub fn transport(&self) -> Arc<dyn RpcTransport> {
        Arc::new(self.clone())
    }

    pub fn set_handler<F>(&self, f: F)
    where
        F: Fn(&MockNode, &str, &[Value]) -> Option<Result<Value, JsonRpcError>>
            + Send
            + Sync
            + 'static,
    {
        *self.inner.handler.lock().unwrap() = Some(Arc::new(f));
    }

    /// Reject every `chainHead_v1_follow` subscribe, as a node at its
    /// subscription limit does.
    pub fn refuse_follow(&self, refuse: bool) {
        self.inner.refuse_follow.store(refuse, Ordering::SeqCst);
    }

    /// Finalized block numbers announced by the next `initialized` event.
    pub fn set_initial(&self, numbers: &[u64]) {
        *self.inner.initial.lock().unwrap() = numbers.to_vec();
    }

    /// Best block used by legacy queries without an explicit block.
    pub fn set_best(&self, hash: BlockHash) {
        *self.inner.best.lock().unwrap() = hash;
    }

    pub fn set_value(&self, at: &BlockHash, key: &Bytes, value: &Bytes) {
        self.inner
            .storage
            .lock()
            .unwrap()
            .entry(at.clone())
            .or_default()
            .insert(key.clone(), value.clone());
    }

    pub fn value(&self, at: &BlockHash, key: &Bytes) -> Option<Bytes> {
        self.inner
            .storage
            .lock()
            .unwrap()
            .get(at)
            .and_then(|values| values.get(key).cloned())
    }

    /// Push a notification on the live subscription named `name`.
    pub fn notify(&self, name: &str, value: Value) {
        if let Some((_, tx)) = self.inner.subs.lock().unwrap().get(name) {
            let _ = tx.send(value);
        }
    }

    pub fn notify_follow(&self, value: Value) {
        self.notify(FOLLOW_EVENT, value);
    }

    /// Drop the subscription named `name` as a lost connection would.
    pub fn close(&self, name: &str) {
        self.inner.subs.lock().unwrap().remove(name);
    }

    pub fn subscription(&self, name: &str) -> Option<SubscriptionId> {
        self.inner
            .subs
            .lock()
            .unwrap()
            .get(name)
            .map(|(id, _)| id.clone())
    }

    /// Params of every call of `method`, in order.
    pub fn calls(&self, method: &str) -> Vec<Vec<Value>> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    pub fn next_operation_id(&self) -> String {
        format!("op-{}", self.inner.next_op.fetch_add(1, Ordering::SeqCst))
    }

    /// Answer a `chainHead_v1_storage` call: emit the found items for all but
    /// the last `discarded` queries, then `operationStorageDone`.
    pub fn storage_response(&self, params: &[Value], discarded: usize) -> Result<Value, JsonRpcError> {
        self.check_follow_subscription(params)?;
        let at = BlockHash(params[1].as_str().unwrap_or_default().to_string());
        let queries = params[2].as_array().cloned().unwrap_or_default();
        let served = queries.len().saturating_sub(discarded);
        let op = self.next_operation_id();

        let items: Vec<Value> = queries[..served]
            .iter()
            .filter_map(|q| {
                let key = Bytes::from_hex(q["key"].as_str()?).ok()?;
                let value = self.value(&at, &key)?;
                Some(json!({ "key": key, "value": value }))
            })
            .collect();
        if !items.is_empty() {
            self.notify_follow(json!({
                "event": "operationStorageItems",
                "operationId": op,
                "items": items,
            }));
        }
        self.notify_follow(json!({ "event": "operationStorageDone", "operationId": op }));

        let mut started = json!({ "result": "started", "operationId": op });
        if discarded > 0 {
            started["discardedItems"] = json!(discarded);
        }
        Ok(started)
    }

    /// `Started` response without any follow-up event.
    pub fn started(&self) -> (String, Value) {
        let op = self.next_operation_id();
        let response = json!({ "result": "started", "operationId": op });
        (op, response)
    }

    fn check_follow_subscription(&self, params: &[Value]) -> Result<(), JsonRpcError> {
        let live = self.subscription(FOLLOW_EVENT);
        match (params.first().and_then(Value::as_str), live) {
            (Some(given), Some(live)) if given == live.0 => Ok(()),
            _ => Err(JsonRpcError::new(-32602, "Invalid subscription id")),
        }
    }

    fn builtin(&self, method: &str, params: &[Value]) -> Result<Value, JsonRpcError> {
        match method {
            "rpc_methods" => Ok(json!({ "methods": self.inner.methods })),
            "chainHead_v1_header" => {
                self.check_follow_subscription(params)?;
                let hash = BlockHash(params[1].as_str().unwrap_or_default().to_string());
                Ok(json!(header_bytes(number_of(&hash))))
            }
            "chainHead_v1_body" => {
                self.check_follow_subscription(params)?;
                let op = self.next_operation_id();
                self.notify_follow(json!({
                    "event": "operationBodyDone",
                    "operationId": op,
                    "value": ["0x0102"],
                }));
                Ok(json!({ "result": "started", "operationId": op }))
            }
            "chainHead_v1_call" => {
                self.check_follow_subscription(params)?;
                let op = self.next_operation_id();
                self.notify_follow(json!({
                    "event": "operationCallDone",
                    "operationId": op,
                    "output": "0x2a",
                }));
                Ok(json!({ "result": "started", "operationId": op }))
            }
            "chainHead_v1_storage" => self.storage_response(params, 0),
            "chainHead_v1_continue" | "chainHead_v1_stopOperation" | "chainHead_v1_unpin" => {
                Ok(Value::Null)
            }
            "state_queryStorageAt" => {
                let keys: Vec<Bytes> = serde_json::from_value(params[0].clone())
                    .map_err(|e| JsonRpcError::new(-32602, e.to_string()))?;
                let at = match params.get(1) {
                    Some(Value::String(h)) => BlockHash(h.clone()),
                    _ => self.inner.best.lock().unwrap().clone(),
                };
                Ok(json!([self.change_set(&at, &keys)]))
            }
            _ => Err(JsonRpcError::new(-32601, format!("Method not found: {method}"))),
        }
    }

    pub fn change_set(&self, at: &BlockHash, keys: &[Bytes]) -> Value {
        let changes: Vec<Value> = keys
            .iter()
            .map(|k| json!([k, self.value(at, k)]))
            .collect();
        json!({ "block": at, "changes": changes })
    }

    /// First notification of a fresh subscription.
    fn greet(&self, request: &SubscriptionRequest) {
        match request.notification_name.as_str() {
            FOLLOW_EVENT => {
                let with_runtime = request.params.first() == Some(&Value::Bool(true));
                let numbers = self.inner.initial.lock().unwrap().clone();
                let runtime = with_runtime.then(|| runtime_spec(1));
                self.notify_follow(initialized(&numbers, runtime));
            }
            STORAGE_NOTIFICATION => {
                let keys: Vec<Bytes> =
                    serde_json::from_value(request.params[0].clone()).unwrap_or_default();
                let best = self.inner.best.lock().unwrap().clone();
                let set = self.change_set(&best, &keys);
                self.notify(STORAGE_NOTIFICATION, set);
            }
            _ => {}
        }
    }

    fn record(&self, method: &str, params: &[Value]) {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.to_vec()));
    }
}

#[async_trait]
impl RpcTransport for MockNode {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.record(&req.method, &req.params);
        let handler = self.inner.handler.lock().unwrap().clone();
        let answer = handler
            .and_then(|h| h(self, &req.method, &req.params))
            .unwrap_or_else(|| self.builtin(&req.method, &req.params));
        Ok(match answer {
            Ok(result) => JsonRpcResponse::success(req.id, result),
            Err(err) => JsonRpcResponse::failure(req.id, err),
        })
    }

    async fn subscribe(
        &self,
        _id: u64,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, TransportError> {
        self.record(&request.subscribe_method, &request.params);
        if !self.inner.methods.contains(&request.subscribe_method) {
            return Err(TransportError::Rpc(JsonRpcError::new(
                -32601,
                format!("Method not found: {}", request.subscribe_method),
            )));
        }
        if request.subscribe_method == "chainHead_v1_follow"
            && self.inner.refuse_follow.load(Ordering::SeqCst)
        {
            return Err(TransportError::Rpc(JsonRpcError::new(
                -32800,
                "Maximum number of chainHead_follow has been reached",
            )));
        }
        let id = SubscriptionId(format!(
            "sub-{}",
            self.inner.next_sub.fetch_add(1, Ordering::SeqCst)
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subs
            .lock()
            .unwrap()
            .insert(request.notification_name.clone(), (id.clone(), tx));
        self.greet(request);
        Ok(Subscription {
            id,
            unsubscribe_method: request.unsubscribe_method.clone(),
            notifications: rx,
        })
    }

    async fn unsubscribe(
        &self,
        _id: u64,
        method: &str,
        subscription: &SubscriptionId,
    ) -> Result<(), TransportError> {
        self.record(method, &[subscription.to_value()]);
        self.inner
            .subs
            .lock()
            .unwrap()
            .retain(|_, (id, _)| id != subscription);
        Ok(())
    }

    fn url(&self) -> &str {
        "mock://node"
    }
}

// ─── Chain fixtures ──────────────────────────────────────────────────────────

/// Hash of canonical block `n`. Fork blocks use numbers above 1000.
pub fn hash(n: u64) -> BlockHash {
    BlockHash(format!("0x{n:064x}"))
}

pub fn number_of(hash: &BlockHash) -> u64 {
    let tail = &hash.0[hash.0.len().saturating_sub(16)..];
    u64::from_str_radix(tail, 16).unwrap_or(0)
}

/// SCALE header prefix: parent hash, then the compact block number.
pub fn header_bytes(n: u64) -> Bytes {
    let parent = hash(n.saturating_sub(1));
    let mut out = Bytes::from_hex(&parent.0).unwrap().0;
    if n < 1 << 6 {
        out.push((n as u8) << 2);
    } else if n < 1 << 14 {
        out.extend_from_slice(&(((n as u16) << 2) | 0b01).to_le_bytes());
    } else {
        out.extend_from_slice(&(((n as u32) << 2) | 0b10).to_le_bytes());
    }
    out.extend_from_slice(&[0u8; 32]);
    Bytes(out)
}

pub fn key(name: &str) -> Bytes {
    Bytes(name.as_bytes().to_vec())
}

pub fn val(v: u8) -> Bytes {
    Bytes(vec![v])
}

pub fn runtime_spec(spec_version: u32) -> Value {
    json!({
        "type": "valid",
        "spec": {
            "specName": "mock",
            "implName": "mock-node",
            "specVersion": spec_version,
            "implVersion": 0,
            "transactionVersion": 1,
            "apis": { "0xdf6acb689907609b": 4 },
        },
    })
}

pub fn initialized(numbers: &[u64], runtime: Option<Value>) -> Value {
    let hashes: Vec<BlockHash> = numbers.iter().map(|n| hash(*n)).collect();
    let mut ev = json!({ "event": "initialized", "finalizedBlockHashes": hashes });
    if let Some(runtime) = runtime {
        ev["finalizedBlockRuntime"] = runtime;
    }
    ev
}

pub fn new_block(block: u64, parent: u64, runtime: Option<Value>) -> Value {
    let mut ev = json!({
        "event": "newBlock",
        "blockHash": hash(block),
        "parentBlockHash": hash(parent),
    });
    if let Some(runtime) = runtime {
        ev["newRuntime"] = runtime;
    }
    ev
}

pub fn best_block(block: u64) -> Value {
    json!({ "event": "bestBlockChanged", "bestBlockHash": hash(block) })
}

pub fn finalized(finalized: &[u64], pruned: &[u64]) -> Value {
    let fin: Vec<BlockHash> = finalized.iter().map(|n| hash(*n)).collect();
    let pr: Vec<BlockHash> = pruned.iter().map(|n| hash(*n)).collect();
    json!({ "event": "finalized", "finalizedBlockHashes": fin, "prunedBlockHashes": pr })
}

pub fn stop() -> Value {
    json!({ "event": "stop" })
}

/// Millisecond backoff so recovery paths run fast.
pub fn fast_config() -> ChainHeadConfig {
    ChainHeadConfig {
        retry: RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_fraction: 0.0,
            ..RetryConfig::default()
        },
        ..ChainHeadConfig::default()
    }
}

/// Poll `cond` until it holds; panic after two seconds.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
