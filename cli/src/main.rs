//! ChainHead CLI: follow a node and query its storage from the terminal.
//!
//! # Commands
//! ```text
//! chainhead methods --url <ws-url>
//! chainhead follow  --url <ws-url> [--runtime] [--count N]
//! chainhead header  --url <ws-url> [--at <hash>]
//! chainhead body    --url <ws-url> [--at <hash>]
//! chainhead call    --url <ws-url> --function <name> [--params <hex>] [--at <hash>]
//! chainhead storage --url <url> --key <hex>... [--at <hash>] [--legacy]
//! chainhead watch   --url <ws-url> --key <hex>... [--legacy]
//! ```

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainhead_client::storage::{self, Backend};
use chainhead_client::{
    BlockHash, Bytes, ChainHead, ChainHeadConfig, ChainHeadEvent, EventKind, StorageEntries,
};
use chainhead_core::RpcTransport;
use chainhead_http::HttpRpcClient;
use chainhead_ws::WsRpcClient;

#[derive(Parser)]
#[command(
    name = "chainhead",
    about = "Follow a Substrate node's chain head and query its storage",
    long_about = "
ChainHead CLI: talk to a node over the chainHead_v1 JSON-RPC API.
Following needs a WebSocket endpoint (ws:// or wss://). Plain storage
queries also work over HTTP with --legacy.

Log filtering honours RUST_LOG, e.g. RUST_LOG=chainhead_client=debug.
",
    version
)]
struct Cli {
    /// Node endpoint (ws://, wss://, http:// or https://)
    #[arg(long, global = true, default_value = "ws://127.0.0.1:9944")]
    url: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the node's RPC methods and the negotiated chainHead version
    Methods,

    /// Follow the chain and print block notifications
    Follow {
        /// Ask the node for runtime information
        #[arg(long)]
        runtime: bool,
        /// Stop after this many notifications (default: until Ctrl-C)
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print the SCALE-encoded header of a pinned block
    Header {
        /// Block hash (default: best block)
        #[arg(long)]
        at: Option<String>,
    },

    /// Print the extrinsics of a pinned block
    Body {
        #[arg(long)]
        at: Option<String>,
    },

    /// Call a runtime API function
    Call {
        /// Function name, e.g. Core_version
        #[arg(long)]
        function: String,
        /// SCALE-encoded parameters (hex)
        #[arg(long, default_value = "0x")]
        params: String,
        #[arg(long)]
        at: Option<String>,
    },

    /// Read storage values
    Storage {
        /// Storage key (hex); repeat for several keys
        #[arg(long = "key", required = true, num_args = 1..)]
        keys: Vec<String>,
        #[arg(long)]
        at: Option<String>,
        /// Use state_queryStorageAt instead of chainHead
        #[arg(long)]
        legacy: bool,
    },

    /// Print storage values whenever they change
    Watch {
        #[arg(long = "key", required = true, num_args = 1..)]
        keys: Vec<String>,
        /// Use state_subscribeStorage instead of chainHead
        #[arg(long)]
        legacy: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);
    let transport = transport(&cli.url)?;

    match cli.command {
        Commands::Methods => cmd_methods(transport, cli.json).await,
        Commands::Follow { runtime, count } => cmd_follow(transport, runtime, count, cli.json).await,
        Commands::Header { at } => cmd_header(transport, at, cli.json).await,
        Commands::Body { at } => cmd_body(transport, at, cli.json).await,
        Commands::Call {
            function,
            params,
            at,
        } => cmd_call(transport, &function, &params, at, cli.json).await,
        Commands::Storage { keys, at, legacy } => {
            cmd_storage(transport, &keys, at, legacy, cli.json).await
        }
        Commands::Watch { keys, legacy } => cmd_watch(transport, &keys, legacy, cli.json).await,
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn transport(url: &str) -> Result<Arc<dyn RpcTransport>> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(Arc::new(WsRpcClient::default_for(url)))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let client = HttpRpcClient::default_for(url).context("building HTTP client")?;
        Ok(Arc::new(client))
    } else {
        bail!("unsupported URL scheme: {url}")
    }
}

fn parse_keys(keys: &[String]) -> Result<Vec<Bytes>> {
    keys.iter()
        .map(|k| Bytes::from_hex(k).with_context(|| format!("invalid storage key {k}")))
        .collect()
}

async fn followed(transport: Arc<dyn RpcTransport>, with_runtime: bool) -> Result<ChainHead> {
    let head = ChainHead::new(transport, ChainHeadConfig::default());
    head.follow(with_runtime)
        .await
        .context("following the chain")?;
    Ok(head)
}

fn target(head: &ChainHead, at: Option<String>) -> Result<BlockHash> {
    match at {
        Some(hash) => Ok(BlockHash::from(hash)),
        None => head.best_hash().ok_or_else(|| anyhow!("no best block")),
    }
}

async fn cmd_methods(transport: Arc<dyn RpcTransport>, as_json: bool) -> Result<()> {
    let head = ChainHead::new(transport, ChainHeadConfig::default());
    let methods = head.negotiator().methods().await.context("fetching rpc_methods")?;
    let version = head.negotiator().version("chainHead").await.ok();
    if as_json {
        println!("{}", json!({ "methods": *methods, "chainHead": version }));
        return Ok(());
    }
    for method in methods.iter() {
        println!("{method}");
    }
    match version {
        Some(v) => println!("\nchainHead version: {v}"),
        None => println!("\nchainHead: not supported"),
    }
    Ok(())
}

fn describe(event: &ChainHeadEvent, as_json: bool) -> String {
    if as_json {
        let value = match event {
            ChainHeadEvent::NewBlock(block) => json!({
                "event": "newBlock",
                "hash": block.hash,
                "number": block.number,
                "parent": block.parent,
                "runtimeUpgraded": block.runtime_upgraded,
            }),
            ChainHeadEvent::BestBlock { hash } => json!({ "event": "bestBlock", "hash": hash }),
            ChainHeadEvent::Finalized { hashes, pruned } => {
                json!({ "event": "finalized", "hashes": hashes, "pruned": pruned })
            }
            ChainHeadEvent::InvalidRuntime { hash, error } => {
                json!({ "event": "invalidRuntime", "hash": hash, "error": error })
            }
        };
        return value.to_string();
    }
    match event {
        ChainHeadEvent::NewBlock(block) => {
            let upgrade = if block.runtime_upgraded { " (runtime upgrade)" } else { "" };
            format!("new      #{} {}{upgrade}", block.number, block.hash)
        }
        ChainHeadEvent::BestBlock { hash } => format!("best     {hash}"),
        ChainHeadEvent::Finalized { hashes, pruned } => {
            let last = hashes.last().map(ToString::to_string).unwrap_or_default();
            format!("final    {last} (+{} finalized, {} pruned)", hashes.len(), pruned.len())
        }
        ChainHeadEvent::InvalidRuntime { hash, error } => format!("invalid  {hash}: {error}"),
    }
}

async fn cmd_follow(
    transport: Arc<dyn RpcTransport>,
    with_runtime: bool,
    count: Option<usize>,
    as_json: bool,
) -> Result<()> {
    let head = followed(transport, with_runtime).await?;
    if let (Some(best), Some(fin)) = (head.best_hash(), head.finalized_hash()) {
        eprintln!("following: best {best}, finalized {fin}");
    }
    if let Some(rt) = head.runtime_version() {
        eprintln!("runtime: {} v{}", rt.spec_name, rt.spec_version);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let kinds = [
        EventKind::NewBlock,
        EventKind::BestBlock,
        EventKind::Finalized,
        EventKind::InvalidRuntime,
    ];
    let listeners: Vec<_> = kinds
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            head.on(kind, move |ev| {
                let _ = tx.send(describe(ev, as_json));
            })
        })
        .collect();

    let mut printed = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = rx.recv() => match line {
                Some(line) => {
                    println!("{line}");
                    printed += 1;
                    if count.is_some_and(|n| printed >= n) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    for listener in &listeners {
        listener.unsubscribe();
    }
    head.unfollow().await;
    Ok(())
}

async fn cmd_header(transport: Arc<dyn RpcTransport>, at: Option<String>, as_json: bool) -> Result<()> {
    let head = followed(transport, false).await?;
    let hash = target(&head, at)?;
    let header = head.header(&hash).await.context("fetching header")?;
    let number = chainhead_client::types::header_number(header.as_slice());
    if as_json {
        println!("{}", json!({ "hash": hash, "number": number, "header": header }));
    } else {
        if let Some(n) = number {
            println!("#{n} {hash}");
        }
        println!("{header}");
    }
    head.unfollow().await;
    Ok(())
}

async fn cmd_body(transport: Arc<dyn RpcTransport>, at: Option<String>, as_json: bool) -> Result<()> {
    let head = followed(transport, false).await?;
    let hash = target(&head, at)?;
    let extrinsics = head.body(&hash).await.context("fetching body")?;
    if as_json {
        println!("{}", json!({ "hash": hash, "extrinsics": extrinsics }));
    } else {
        println!("{} extrinsics in {hash}", extrinsics.len());
        for (i, xt) in extrinsics.iter().enumerate() {
            println!("  [{i}] {xt}");
        }
    }
    head.unfollow().await;
    Ok(())
}

async fn cmd_call(
    transport: Arc<dyn RpcTransport>,
    function: &str,
    params: &str,
    at: Option<String>,
    as_json: bool,
) -> Result<()> {
    let params = Bytes::from_hex(params).context("invalid --params hex")?;
    let head = followed(transport, true).await?;
    let hash = target(&head, at)?;
    let output = head
        .call(&hash, function, &params)
        .await
        .with_context(|| format!("calling {function}"))?;
    if as_json {
        println!("{}", json!({ "hash": hash, "function": function, "output": output }));
    } else {
        println!("{output}");
    }
    head.unfollow().await;
    Ok(())
}

fn print_entries(entries: &StorageEntries, as_json: bool) {
    if as_json {
        let map: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(k, v)| (k.to_hex(), json!(v)))
            .collect();
        println!("{}", serde_json::Value::Object(map));
        return;
    }
    for (key, value) in entries.iter() {
        match value {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} = <none>"),
        }
    }
}

fn backend(legacy: bool) -> Backend {
    if legacy {
        Backend::Legacy
    } else {
        Backend::Auto
    }
}

async fn cmd_storage(
    transport: Arc<dyn RpcTransport>,
    keys: &[String],
    at: Option<String>,
    legacy: bool,
    as_json: bool,
) -> Result<()> {
    let keys = parse_keys(keys)?;
    let at = at.map(BlockHash::from);
    let engine = storage::connect(transport, backend(legacy), ChainHeadConfig::default())
        .await
        .context("connecting storage backend")?;
    let entries = engine
        .query(&keys, at.as_ref())
        .await
        .context("querying storage")?;
    print_entries(&entries, as_json);
    Ok(())
}

async fn cmd_watch(
    transport: Arc<dyn RpcTransport>,
    keys: &[String],
    legacy: bool,
    as_json: bool,
) -> Result<()> {
    let keys = parse_keys(keys)?;
    let engine = storage::connect(transport, backend(legacy), ChainHeadConfig::default())
        .await
        .context("connecting storage backend")?;
    let subscription = engine
        .subscribe(&keys, Arc::new(move |entries: StorageEntries| print_entries(&entries, as_json)))
        .await
        .context("subscribing to storage")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    subscription.unsubscribe();
    Ok(())
}
