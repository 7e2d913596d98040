//! Request-id allocation on top of a shared transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use chainhead_core::{
    JsonRpcRequest, RpcTransport, Subscription, SubscriptionId, SubscriptionRequest,
    TransportError,
};

/// Cheap-to-clone handle used by every component to talk to the node.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call `method` and return the raw result value.
    pub async fn request_raw(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        tracing::trace!(method, "rpc request");
        self.transport
            .send(req)
            .await?
            .into_result()
            .map_err(TransportError::Rpc)
    }

    /// Call `method` and deserialize the result.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let value = self.request_raw(method, params).await?;
        serde_json::from_value(value).map_err(TransportError::Deserialization)
    }

    pub async fn subscribe(&self, request: &SubscriptionRequest) -> Result<Subscription, TransportError> {
        self.transport.subscribe(self.next_id(), request).await
    }

    pub async fn unsubscribe(&self, method: &str, id: &SubscriptionId) -> Result<(), TransportError> {
        self.transport.unsubscribe(self.next_id(), method, id).await
    }
}
