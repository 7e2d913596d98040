//! Protocol version negotiation.
//!
//! The node's `rpc_methods` list is fetched once per connection. The version
//! exposed for a prefix is the second `_`-separated segment of the first
//! advertised method carrying that prefix (`chainHead_v1_follow` → `v1`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::ChainHeadError;
use crate::rpc::RpcClient;
use crate::wire::RpcMethods;

pub struct VersionNegotiator {
    rpc: RpcClient,
    methods: OnceCell<Arc<Vec<String>>>,
    versions: Mutex<HashMap<String, String>>,
}

impl VersionNegotiator {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            methods: OnceCell::new(),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Methods advertised by the node.
    pub async fn methods(&self) -> Result<Arc<Vec<String>>, ChainHeadError> {
        self.methods
            .get_or_try_init(|| async {
                let list: RpcMethods = self.rpc.request("rpc_methods", vec![]).await?;
                tracing::debug!(count = list.methods.len(), "fetched rpc methods");
                Ok::<_, ChainHeadError>(Arc::new(list.methods))
            })
            .await
            .cloned()
    }

    /// Version tag the node exposes for `prefix`.
    pub async fn version(&self, prefix: &str) -> Result<String, ChainHeadError> {
        if let Some(v) = self.versions.lock().unwrap().get(prefix) {
            return Ok(v.clone());
        }
        let methods = self.methods().await?;
        let version = version_from_methods(&methods, prefix)
            .ok_or_else(|| ChainHeadError::NoMethodsForPrefix(prefix.to_string()))?;
        tracing::info!(prefix, version = %version, "negotiated protocol version");
        self.versions
            .lock()
            .unwrap()
            .insert(prefix.to_string(), version.clone());
        Ok(version)
    }
}

/// Extract the version token for `prefix` from an advertised method list.
pub fn version_from_methods(methods: &[String], prefix: &str) -> Option<String> {
    let wanted = format!("{prefix}_");
    methods
        .iter()
        .find(|m| m.starts_with(&wanted))
        .and_then(|m| m.split('_').nth(1))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Fully-qualified method names of one negotiated chain-head version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHeadMethods {
    pub follow: String,
    pub unfollow: String,
    pub follow_event: String,
    pub header: String,
    pub body: String,
    pub call: String,
    pub storage: String,
    pub continue_: String,
    pub stop_operation: String,
    pub unpin: String,
}

impl ChainHeadMethods {
    pub fn new(prefix: &str, version: &str) -> Self {
        let m = |name: &str| format!("{prefix}_{version}_{name}");
        Self {
            follow: m("follow"),
            unfollow: m("unfollow"),
            follow_event: m("followEvent"),
            header: m("header"),
            body: m("body"),
            call: m("call"),
            storage: m("storage"),
            continue_: m("continue"),
            stop_operation: m("stopOperation"),
            unpin: m("unpin"),
        }
    }
}
