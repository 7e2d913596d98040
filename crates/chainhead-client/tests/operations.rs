mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use chainhead_client::{
    ChainHead, ChainHeadConfig, ChainHeadError, FollowStatus, OperationEvent, OperationRequest,
    StorageQueryItem,
};
use chainhead_core::policy::RetryStrategy;
use common::*;

async fn following(node: &MockNode, config: ChainHeadConfig) -> ChainHead {
    let head = ChainHead::new(node.transport(), config);
    head.follow(false).await.unwrap();
    head
}

fn storage_request(keys: &[&str]) -> OperationRequest {
    OperationRequest::Storage {
        items: keys.iter().map(|k| StorageQueryItem::value(key(k))).collect(),
        child_trie: None,
    }
}

#[tokio::test]
async fn body_and_call_resolve_with_their_terminal_event() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;

    let body = head.body(&hash(3)).await.unwrap();
    assert_eq!(body, vec![chainhead_client::Bytes(vec![1, 2])]);

    let params = chainhead_client::Bytes(vec![7]);
    let out = head.call(&hash(3), "Core_version", &params).await.unwrap();
    assert_eq!(out, val(0x2a));
    let call = &node.calls("chainHead_v1_call")[0];
    assert_eq!(call[2], json!("Core_version"));
    assert_eq!(call[3], json!("0x07"));
}

#[tokio::test]
async fn stream_ends_after_exactly_one_terminal_event() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_value(&hash(3), &key("a"), &val(1));

    let mut stream = head
        .start_operation(&hash(3), storage_request(&["a", "b"]))
        .await
        .unwrap();
    let op = stream.id().to_string();

    let mut terminal = 0;
    let mut items = Vec::new();
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            OperationEvent::StorageItems(batch) => items.extend(batch),
            ev => {
                assert!(ev.is_terminal());
                terminal += 1;
            }
        }
    }
    assert_eq!(terminal, 1);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, key("a"));

    // Late duplicates for a finished operation are dropped.
    node.notify_follow(json!({ "event": "operationStorageDone", "operationId": op }));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn every_pause_is_answered_with_continue() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    let op = Arc::new(Mutex::new(String::new()));
    let continues = Arc::new(AtomicUsize::new(0));
    let (current, sent) = (op.clone(), continues.clone());
    node.set_handler(move |node, method, _params| match method {
        "chainHead_v1_storage" => {
            let (id, started) = node.started();
            node.notify_follow(json!({ "event": "operationWaitingForContinue", "operationId": id }));
            *current.lock().unwrap() = id;
            Some(Ok(started))
        }
        "chainHead_v1_continue" => {
            let id = current.lock().unwrap().clone();
            // Pause again right after the first continue, with nothing sent in between.
            if sent.fetch_add(1, Ordering::SeqCst) == 0 {
                node.notify_follow(json!({ "event": "operationWaitingForContinue", "operationId": id }));
            } else {
                node.notify_follow(json!({
                    "event": "operationStorageItems",
                    "operationId": id,
                    "items": [{ "key": key("a"), "value": val(1) }],
                }));
                node.notify_follow(json!({ "event": "operationStorageDone", "operationId": id }));
            }
            Some(Ok(json!(null)))
        }
        _ => None,
    });

    let mut stream = head
        .start_operation(&hash(3), storage_request(&["a"]))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(event) = stream.next().await {
        seen.push(event.unwrap());
    }

    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[1], OperationEvent::StorageDone));
    assert_eq!(node.call_count("chainHead_v1_continue"), 2);
    assert_eq!(continues.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dropped_stream_stops_the_operation() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_handler(|node, method, _| (method == "chainHead_v1_body").then(|| Ok(node.started().1)));

    let stream = head.start_operation(&hash(3), OperationRequest::Body).await.unwrap();
    let op = stream.id().to_string();
    drop(stream);

    wait_for("stopOperation", || node.call_count("chainHead_v1_stopOperation") == 1).await;
    let params = &node.calls("chainHead_v1_stopOperation")[0];
    assert_eq!(params[1], json!(op));
}

#[tokio::test]
async fn stopped_operation_ignores_late_events() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_handler(|node, method, _| (method == "chainHead_v1_body").then(|| Ok(node.started().1)));

    let stream = head.start_operation(&hash(3), OperationRequest::Body).await.unwrap();
    let op = stream.id().to_string();
    stream.stop().await;
    assert_eq!(node.call_count("chainHead_v1_stopOperation"), 1);

    node.notify_follow(json!({ "event": "operationBodyDone", "operationId": op, "value": [] }));
    // The session is unaffected and later operations still complete.
    node.set_handler(|_, _, _| None);
    assert_eq!(head.body(&hash(3)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn limit_reached_waits_and_retries() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_value(&hash(3), &key("a"), &val(9));
    let refusals = Arc::new(AtomicUsize::new(2));
    let left = refusals.clone();
    node.set_handler(move |_, method, _| {
        if method == "chainHead_v1_storage" && left.load(Ordering::SeqCst) > 0 {
            left.fetch_sub(1, Ordering::SeqCst);
            return Some(Ok(json!({ "result": "limitReached" })));
        }
        None
    });

    let items = head.storage(&[StorageQueryItem::value(key("a"))], None).await.unwrap();
    assert_eq!(items[0].value, Some(val(9)));
    assert_eq!(node.call_count("chainHead_v1_storage"), 3);
}

#[tokio::test]
async fn limit_reached_gives_up_after_queued_budget() {
    let node = MockNode::new();
    let config = ChainHeadConfig {
        max_queued_retries: 2,
        ..fast_config()
    };
    let head = following(&node, config).await;
    node.set_handler(|_, method, _| {
        (method == "chainHead_v1_storage").then(|| Ok(json!({ "result": "limitReached" })))
    });

    let err = head
        .storage(&[StorageQueryItem::value(key("a"))], None)
        .await
        .unwrap_err();
    match err {
        ChainHeadError::RetriesExhausted { strategy, attempts, last } => {
            assert_eq!(strategy, RetryStrategy::Queued);
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ChainHeadError::LimitReached));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(node.call_count("chainHead_v1_storage"), 3);
}

#[tokio::test]
async fn start_operation_reports_limit_reached_as_is() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_handler(|_, method, _| {
        (method == "chainHead_v1_body").then(|| Ok(json!({ "result": "limitReached" })))
    });

    let err = head
        .start_operation(&hash(3), OperationRequest::Body)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ChainHeadError::LimitReached));
    assert_eq!(node.call_count("chainHead_v1_body"), 1);
}

#[tokio::test]
async fn inaccessible_is_retried_immediately() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    let failures = Arc::new(AtomicUsize::new(1));
    let left = failures.clone();
    node.set_handler(move |node, method, _| {
        if method == "chainHead_v1_body" && left.load(Ordering::SeqCst) > 0 {
            left.fetch_sub(1, Ordering::SeqCst);
            let (op, started) = node.started();
            node.notify_follow(json!({ "event": "operationInaccessible", "operationId": op }));
            return Some(Ok(started));
        }
        None
    });

    let body = head.body(&hash(3)).await.unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(node.call_count("chainHead_v1_body"), 2);
}

#[tokio::test]
async fn inaccessible_gives_up_after_immediate_budget() {
    let node = MockNode::new();
    let config = ChainHeadConfig {
        max_immediate_retries: 2,
        ..fast_config()
    };
    let head = following(&node, config).await;
    node.set_handler(|node, method, _| {
        (method == "chainHead_v1_call").then(|| {
            let (op, started) = node.started();
            node.notify_follow(json!({ "event": "operationInaccessible", "operationId": op }));
            Ok(started)
        })
    });

    let err = head
        .call(&hash(3), "Core_version", &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChainHeadError::RetriesExhausted { strategy: RetryStrategy::Now, attempts: 3, .. }
    ));
    assert_eq!(node.call_count("chainHead_v1_call"), 3);
}

#[tokio::test]
async fn operation_error_is_not_retried() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_handler(|node, method, _| {
        (method == "chainHead_v1_call").then(|| {
            let (op, started) = node.started();
            node.notify_follow(json!({
                "event": "operationError",
                "operationId": op,
                "error": "function not found",
            }));
            Ok(started)
        })
    });

    let err = head
        .call(&hash(3), "Nope_nope", &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChainHeadError::Operation(msg) if msg == "function not found"));
    assert_eq!(node.call_count("chainHead_v1_call"), 1);
}

#[tokio::test]
async fn pruned_block_fails_before_any_request() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.notify_follow(new_block(1004, 3, None));
    node.notify_follow(new_block(4, 3, None));
    node.notify_follow(best_block(4));
    node.notify_follow(finalized(&[4], &[1004]));
    wait_for("fork pruned", || head.finalized_hash() == Some(hash(4))).await;

    let err = head
        .storage(&[StorageQueryItem::value(key("a"))], Some(&hash(1004)))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainHeadError::BlockPruned(h) if h == hash(1004)));
    assert_eq!(node.call_count("chainHead_v1_storage"), 0);
}

#[tokio::test]
async fn running_operation_fails_when_its_block_is_pruned() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.notify_follow(new_block(1004, 3, None));
    wait_for("fork block", || head.is_pinned(&hash(1004))).await;
    node.set_handler(|node, method, _| (method == "chainHead_v1_storage").then(|| Ok(node.started().1)));

    let mut stream = head
        .start_operation(&hash(1004), storage_request(&["a"]))
        .await
        .unwrap();
    node.notify_follow(new_block(4, 3, None));
    node.notify_follow(best_block(4));
    node.notify_follow(finalized(&[4], &[1004]));

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, ChainHeadError::BlockPruned(h) if h == hash(1004)));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn discarded_storage_items_are_reissued() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
        node.set_value(&hash(3), &key(k), &val(v));
    }
    let first = Arc::new(AtomicUsize::new(1));
    let left = first.clone();
    node.set_handler(move |node, method, params| {
        if method == "chainHead_v1_storage" && left.swap(0, Ordering::SeqCst) == 1 {
            return Some(node.storage_response(params, 1));
        }
        None
    });

    let queries: Vec<StorageQueryItem> =
        ["a", "b", "c"].iter().map(|k| StorageQueryItem::value(key(k))).collect();
    let items = head.storage(&queries, Some(&hash(3))).await.unwrap();

    let keys: Vec<_> = items.iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec![key("a"), key("b"), key("c")]);
    let calls = node.calls("chainHead_v1_storage");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1][2].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn stop_during_request_retries_in_the_next_session() {
    let node = MockNode::new();
    let head = following(&node, fast_config()).await;
    node.set_value(&hash(3), &key("a"), &val(5));
    let stopped = Arc::new(AtomicUsize::new(1));
    let left = stopped.clone();
    node.set_handler(move |node, method, _| {
        if method == "chainHead_v1_storage" && left.swap(0, Ordering::SeqCst) == 1 {
            let (_, started) = node.started();
            node.notify_follow(stop());
            return Some(Ok(started));
        }
        None
    });

    let items = head.storage(&[StorageQueryItem::value(key("a"))], None).await.unwrap();

    assert_eq!(items[0].value, Some(val(5)));
    assert_eq!(node.call_count("chainHead_v1_follow"), 2);
    let calls = node.calls("chainHead_v1_storage");
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0][0], calls[1][0]);
}

#[tokio::test]
async fn refused_refollows_use_up_queued_retries() {
    let node = MockNode::new();
    let config = ChainHeadConfig {
        max_queued_retries: 2,
        ..fast_config()
    };
    let head = following(&node, config).await;
    node.refuse_follow(true);
    node.notify_follow(stop());
    wait_for("session end", || head.status() != FollowStatus::Following).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        head.storage(&[StorageQueryItem::value(key("a"))], None),
    )
    .await
    .expect("storage resolves while re-follow keeps failing");
    match outcome.unwrap_err() {
        ChainHeadError::RetriesExhausted { strategy, attempts, last } => {
            assert_eq!(strategy, RetryStrategy::Queued);
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ChainHeadError::Stop));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(node.call_count("chainHead_v1_follow") >= 3);
    assert_eq!(node.call_count("chainHead_v1_storage"), 0);
    assert_eq!(head.status(), FollowStatus::Connecting);
}
