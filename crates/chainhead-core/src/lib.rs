//! chainhead-core: foundation traits and types for ChainHead.
//!
//! # Overview
//!
//! ChainHead is a client for Substrate-style nodes that follows the node's
//! live chain state over JSON-RPC and answers storage queries against pinned
//! blocks. The core crate defines:
//!
//! - [`RpcTransport`]: the async trait every transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`JsonRpcNotification`]: wire types
//! - [`SubscriptionRequest`] / [`Subscription`]: server-push subscriptions
//! - [`TransportError`]: structured error type
//! - [`policy`] module: backoff, retry strategies, single-flight recovery

pub mod error;
pub mod policy;
pub mod request;
pub mod transport;

pub use error::TransportError;
pub use request::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use transport::{RpcTransport, Subscription, SubscriptionId, SubscriptionRequest};
