//! chainhead-ws: WebSocket JSON-RPC transport with auto-reconnect.
//!
//! # Features
//! - Request multiplexing over a single connection
//! - Generic server-push subscriptions (`chainHead_v1_follow`, `state_subscribeStorage`, ...)
//! - Subscription routing registered in the connection task, so no notification is lost
//!   between a subscribe response and the caller taking the stream
//! - Reconnect with exponential backoff; in-flight requests fail and subscription
//!   streams end on disconnect, letting higher layers re-establish their state

pub mod client;
pub mod subscriptions;

pub use client::{WsClientConfig, WsRpcClient};
pub use subscriptions::SubscriptionManager;
