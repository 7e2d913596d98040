//! WebSocket JSON-RPC client with auto-reconnect and subscription routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use chainhead_core::error::TransportError;
use chainhead_core::policy::retry::millis;
use chainhead_core::request::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId};
use chainhead_core::transport::{RpcTransport, Subscription, SubscriptionId, SubscriptionRequest};

use crate::subscriptions::SubscriptionManager;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsClientConfig {
    /// Reconnect backoff starting duration.
    #[serde(with = "millis")]
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    #[serde(with = "millis")]
    pub reconnect_max: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type SubscribeSender = oneshot::Sender<Result<Subscription, TransportError>>;

/// What a request id is waiting for.
enum Pending {
    Response(ResponseSender),
    Subscription {
        method: String,
        notification_name: String,
        unsubscribe_method: String,
        tx: SubscribeSender,
    },
}

impl Pending {
    fn fail(self, err: TransportError) {
        match self {
            Self::Response(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Subscription { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: ResponseSender,
    },
    Subscribe {
        req: JsonRpcRequest,
        notification_name: String,
        unsubscribe_method: String,
        tx: SubscribeSender,
    },
    Close,
}

/// WebSocket JSON-RPC client.
///
/// Maintains a background task that owns the WebSocket connection and
/// reconnects transparently. Subscriptions do not survive a reconnect.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionManager,
    next_id: AtomicU64,
}

impl WsRpcClient {
    /// Start the background task for `url`. Connection happens in the background.
    pub fn connect(url: impl Into<String>, config: WsClientConfig) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let subscriptions = SubscriptionManager::new();
        let subs_clone = subscriptions.clone();
        let url_clone = url.clone();

        tokio::spawn(async move {
            ws_task(url_clone, cmd_rx, subs_clone, config).await;
        });

        Self {
            url,
            cmd_tx,
            subscriptions,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Self {
        Self::connect(url, WsClientConfig::default())
    }

    /// Allocate a request id for callers that do not manage their own.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live subscriptions on the current connection.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    fn command(&self, cmd: WsCommand) -> Result<(), TransportError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| TransportError::WebSocket("WS task closed".into()))
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(WsCommand::Send { req, tx })?;
        rx.await
            .map_err(|_| TransportError::WebSocket("WS response dropped".into()))?
    }

    async fn subscribe(
        &self,
        id: u64,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, TransportError> {
        let (tx, rx) = oneshot::channel();
        let req = JsonRpcRequest::new(id, &request.subscribe_method, request.params.clone());
        self.command(WsCommand::Subscribe {
            req,
            notification_name: request.notification_name.clone(),
            unsubscribe_method: request.unsubscribe_method.clone(),
            tx,
        })?;
        rx.await
            .map_err(|_| TransportError::WebSocket("WS response dropped".into()))?
    }

    async fn unsubscribe(
        &self,
        id: u64,
        method: &str,
        subscription: &SubscriptionId,
    ) -> Result<(), TransportError> {
        self.subscriptions.remove(subscription);
        let req = JsonRpcRequest::new(id, method, vec![subscription.to_value()]);
        self.send(req).await?.into_result().map_err(TransportError::Rpc)?;
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
    config: WsClientConfig,
) {
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut backoff = config.reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.reconnect_max);
                continue;
            }
        };
        backoff = config.reconnect_initial;
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let (req, entry) = match cmd {
                        None | Some(WsCommand::Close) => {
                            let _ = sink.close().await;
                            return;
                        }
                        Some(WsCommand::Send { req, tx }) => (req, Pending::Response(tx)),
                        Some(WsCommand::Subscribe { req, notification_name, unsubscribe_method, tx }) => {
                            let method = req.method.clone();
                            (req, Pending::Subscription { method, notification_name, unsubscribe_method, tx })
                        }
                    };
                    let Some(id) = req.numeric_id() else {
                        entry.fail(TransportError::WebSocket("request id must be numeric".into()));
                        continue;
                    };
                    let msg = match serde_json::to_string(&req) {
                        Ok(m) => m,
                        Err(e) => {
                            entry.fail(TransportError::Deserialization(e));
                            continue;
                        }
                    };
                    pending.insert(id, entry);
                    if let Err(e) = sink.send(Message::Text(msg)).await {
                        tracing::warn!(error = %e, "WS send failed");
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WS receive error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => {
                            handle_message(text.as_str(), &mut pending, &subscriptions);
                        }
                        Some(Ok(Message::Close(_))) => break,
                        _ => {}
                    }
                }
            }
        }

        let failed = pending.len();
        for (_, entry) in pending.drain() {
            entry.fail(TransportError::WebSocket("connection lost".into()));
        }
        let closed = subscriptions.close_all();
        tracing::warn!(
            url = %url,
            failed_requests = failed,
            closed_subscriptions = closed,
            "WS disconnected, reconnecting in {backoff:?}"
        );
        time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

fn handle_message(
    text: &str,
    pending: &mut HashMap<u64, Pending>,
    subscriptions: &SubscriptionManager,
) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    if val.get("id").is_none() && val.get("method").is_some() {
        match serde_json::from_value::<JsonRpcNotification>(val) {
            Ok(notification) => {
                let Some(key) = notification.subscription_key() else {
                    tracing::debug!(method = %notification.method, "notification without subscription id");
                    return;
                };
                let id = SubscriptionId(key);
                if !subscriptions.dispatch(&id, &notification.method, notification.params.result) {
                    tracing::debug!(subscription = %id, "notification for unknown subscription dropped");
                }
            }
            Err(e) => tracing::debug!(error = %e, "malformed notification"),
        }
        return;
    }

    let resp = match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "malformed response");
            return;
        }
    };
    let id = match &resp.id {
        RpcId::Number(n) => *n,
        _ => return,
    };
    match pending.remove(&id) {
        Some(Pending::Response(tx)) => {
            let _ = tx.send(Ok(resp));
        }
        Some(Pending::Subscription {
            method,
            notification_name,
            unsubscribe_method,
            tx,
        }) => {
            // Registering here, before the next message is read, keeps notifications
            // that immediately follow the response from being dropped.
            let outcome = resp
                .into_result()
                .map_err(TransportError::Rpc)
                .and_then(|v| SubscriptionId::from_result(&method, &v))
                .map(|sub_id| {
                    let notifications =
                        subscriptions.register(sub_id.clone(), notification_name);
                    Subscription {
                        id: sub_id,
                        unsubscribe_method,
                        notifications,
                    }
                });
            if let Err(Ok(sub)) = tx.send(outcome) {
                subscriptions.remove(&sub.id);
            }
        }
        None => tracing::debug!(id, "response for unknown request id"),
    }
}
