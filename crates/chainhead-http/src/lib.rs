//! chainhead-http: HTTP JSON-RPC transport.
//!
//! HTTP carries request/response calls only. It is enough for one-shot
//! legacy storage queries and version negotiation; anything that needs a
//! subscription (following the chain head, live storage updates) requires
//! the WebSocket transport.

pub mod client;

pub use client::{HttpClientConfig, HttpRpcClient};
