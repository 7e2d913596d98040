//! The `RpcTransport` trait, the boundary between the client and a node.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// A subscription id handed out by the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SubscriptionId {
    /// Parse the `result` of a subscribe call. Nodes answer with a string or a number.
    pub fn from_result(method: &str, value: &Value) -> Result<Self, TransportError> {
        match value {
            Value::String(s) => Ok(Self(s.clone())),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(TransportError::InvalidSubscriptionId {
                method: method.to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// The id as a JSON value for use in request params.
    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

/// Describes a server-push subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    /// Method that opens the subscription (e.g. `chainHead_v1_follow`).
    pub subscribe_method: String,
    /// Method that closes it (e.g. `chainHead_v1_unfollow`).
    pub unsubscribe_method: String,
    /// Method name carried by the notifications (e.g. `chainHead_v1_followEvent`).
    pub notification_name: String,
    /// Parameters of the subscribe call.
    pub params: Vec<Value>,
}

/// A live subscription.
///
/// `notifications` yields the `result` payload of every notification in
/// arrival order. The stream ending means the transport lost the subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub unsubscribe_method: String,
    pub notifications: mpsc::UnboundedReceiver<Value>,
}

/// The central async trait every node transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Open a server-push subscription.
    ///
    /// Transports without a persistent connection keep the default, which
    /// refuses.
    async fn subscribe(
        &self,
        id: u64,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, TransportError> {
        let _ = (id, request);
        Err(TransportError::SubscriptionsUnsupported {
            transport: self.url().to_string(),
        })
    }

    /// Close a subscription previously opened with [`RpcTransport::subscribe`].
    async fn unsubscribe(
        &self,
        id: u64,
        method: &str,
        subscription: &SubscriptionId,
    ) -> Result<(), TransportError> {
        let req = JsonRpcRequest::new(id, method, vec![subscription.to_value()]);
        self.send(req)
            .await?
            .into_result()
            .map_err(TransportError::Rpc)?;
        Ok(())
    }

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    /// Convenience: call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.send(req).await?;
        let result = resp.into_result().map_err(TransportError::Rpc)?;
        serde_json::from_value(result).map_err(TransportError::Deserialization)
    }
}
