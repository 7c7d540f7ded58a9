/// JSON-RPC connection behavior under concurrency and cancellation
use std::time::Duration;

use async_trait::async_trait;
use mcp_broker::jsonrpc::{method_not_found, Handler, RejectAll, Request, RpcError};
use mcp_broker::{CallError, Connection};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::support::wait_until;

/// Answers `delay` after `ms` milliseconds with the request's `tag`
struct Delayed;

#[async_trait]
impl Handler for Delayed {
    async fn handle(&self, _conn: &Connection, request: Request) -> Result<Value, RpcError> {
        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            "delay" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params["tag"].clone())
            }
            "never" => std::future::pending().await,
            other => Err(method_not_found(other)),
        }
    }
}

fn client_and_server() -> (Connection, Connection) {
    let (left, right) = duplex(64 * 1024);
    let (left_r, left_w) = split(left);
    let (right_r, right_w) = split(right);
    (
        Connection::new(left_r, left_w, RejectAll, Span::none()),
        Connection::new(right_r, right_w, Delayed, Span::none()),
    )
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (client, _server) = client_and_server();
    let cancel = CancellationToken::new();

    // Later calls finish first
    let calls: Vec<_> = (0..16u64)
        .map(|i| {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let tag: u64 = client
                    .call(&cancel, "delay", json!({"ms": (16 - i) * 10, "tag": i}))
                    .await
                    .unwrap();
                (i, tag)
            })
        })
        .collect();

    for call in calls {
        let (sent, received) = call.await.unwrap();
        assert_eq!(sent, received);
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_cancelled_calls_release_correlation_entries() {
    let (client, _server) = client_and_server();
    let cancel = CancellationToken::new();
    const N: usize = 25;

    let calls: Vec<_> = (0..N)
        .map(|_| {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.call::<_, Value>(&cancel, "never", json!({})).await })
        })
        .collect();

    let pending = client.clone();
    wait_until("all calls pending", move || pending.pending_count() == N).await;

    cancel.cancel();
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
    }
    assert_eq!(client.pending_count(), 0);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_dropped_call_future_releases_entry() {
    let (client, _server) = client_and_server();
    let cancel = CancellationToken::new();

    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.call::<_, Value>(&cancel, "never", json!({})).await })
    };

    let pending = client.clone();
    wait_until("call pending", move || pending.pending_count() == 1).await;

    call.abort();
    let _ = call.await;
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_garbage_frames_leave_connection_usable() {
    let (ours, theirs) = duplex(64 * 1024);
    let (r, w) = split(theirs);
    let server = Connection::new(r, w, Delayed, Span::none());

    let (peer_r, mut peer_w) = split(ours);
    let mut replies = BufReader::new(peer_r).lines();

    let frames: [&[u8]; 4] = [
        b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"x\xff\"}\n",
        b"}{ definitely not json\n",
        b"\xc3\x28\n",
        b"{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"delay\",\"params\":{\"tag\":\"alive\"}}\n",
    ];
    for frame in frames {
        peer_w.write_all(frame).await.unwrap();
    }

    let mut parse_errors = 0;
    loop {
        let line = tokio::time::timeout(Duration::from_secs(2), replies.next_line())
            .await
            .expect("reply arrives")
            .unwrap()
            .expect("connection still open");
        let reply: Value = serde_json::from_str(&line).unwrap();
        if reply["id"] == json!(9) {
            assert_eq!(reply["result"], json!("alive"));
            break;
        }
        assert_eq!(reply["error"]["code"], json!(-32700));
        parse_errors += 1;
    }

    assert_eq!(parse_errors, 3);
    assert!(!server.is_closed());
}

#[tokio::test]
async fn test_peer_close_fails_calls_with_closed() {
    let (client, server) = client_and_server();
    let cancel = CancellationToken::new();

    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.call::<_, Value>(&cancel, "never", json!({})).await })
    };

    let pending = client.clone();
    wait_until("call pending", move || pending.pending_count() == 1).await;

    server.close();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_closed());

    tokio::time::timeout(Duration::from_secs(1), client.disconnected())
        .await
        .expect("client sees the disconnect");
    let late = client.call::<_, Value>(&cancel, "delay", json!({})).await.unwrap_err();
    assert!(late.is_closed());
}
