/// End-to-end broker sessions against the fake container platform
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use mcp_broker::jsonrpc::ErrorCode;
use mcp_broker::*;
use serde_json::{json, Value};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

use crate::support::{manifest, wait_until, Harness, RawSession};

fn remote_code(error: CallError) -> ErrorCode {
    match error {
        CallError::Remote(e) => e.code,
        other => panic!("expected a remote error, got {:?}", other),
    }
}

async fn wait_running(harness: &Harness, id: &str) {
    let broker = harness.broker.clone();
    let id = id.to_string();
    wait_until("integration running", move || broker.active_integrations().is_running(&id)).await;
}

#[tokio::test]
async fn test_zero_integrations_lists_only_builtins() {
    let harness = Harness::in_memory().await;

    let init = harness.initialize().await;
    assert_eq!(init["protocolVersion"], json!("2024-11-05"));
    assert_eq!(init["serverInfo"]["name"], json!("mcp"));
    assert_eq!(init["capabilities"]["tools"]["listChanged"], json!(true));
    assert!(init["instructions"].as_str().unwrap().contains("__mcp__search_registry"));

    let result = harness.list_tools().await;
    assert!(result.get("isError").is_none());

    let names = harness.tool_names().await;
    let unique: BTreeSet<_> = names.iter().cloned().collect();
    assert_eq!(names.len(), 3);
    assert_eq!(unique.len(), 3);
    assert!(unique.contains("__mcp__install_server"));
    assert!(unique.contains("__mcp__search_registry"));
    assert!(unique.contains("__mcp__suggest_tool"));

    let (result, platform) = harness.shut_down().await;
    assert!(result.is_ok());
    assert_eq!(platform.created_containers(), 0);
}

#[tokio::test]
async fn test_tools_require_initialize() {
    let harness = Harness::in_memory().await;

    let err = harness
        .client
        .call::<_, Value>(&harness.cancel, "tools/list", json!({}))
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidRequest);

    harness.initialize().await;
    let again = harness
        .client
        .call::<_, Value>(
            &harness.cancel,
            "initialize",
            json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": "x", "version": "1"}}),
        )
        .await
        .unwrap_err();
    assert_eq!(remote_code(again), ErrorCode::InvalidRequest);

    let unknown = harness
        .client
        .call::<_, Value>(&harness.cancel, "resources/list", json!({}))
        .await
        .unwrap_err();
    assert_eq!(remote_code(unknown), ErrorCode::MethodNotFound);

    let (result, _) = harness.shut_down().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_added_integration_with_bad_runtime_never_runs() {
    let harness = Harness::in_memory().await;
    harness.initialize().await;

    let broken = harness
        .install(manifest("broken", "cobol", "fake-serve", &["broken_tool"]))
        .await;
    let clock = harness
        .install(manifest("clock", "node", "fake-serve", &["get_time"]))
        .await;

    wait_running(&harness, &clock.id).await;
    let broker = harness.broker.clone();
    wait_until("no start in flight", move || broker.active_integrations().starting_count() == 0).await;

    assert!(!harness.broker.active_integrations().is_running(&broken.id));
    assert_eq!(harness.broker.active_integrations().running_count(), 1);
    assert_eq!(harness.platform.created_containers(), 1);

    let names = harness.tool_names().await;
    assert_eq!(names.len(), 4);
    assert!(names.contains(&"get_time".to_string()));
    assert!(!names.contains(&"broken_tool".to_string()));

    let (result, platform) = harness.shut_down().await;
    assert!(result.is_ok());
    assert_eq!(platform.live_containers(), 0);
}

#[tokio::test]
async fn test_child_exit_removes_integration_and_keeps_session() {
    let mut harness = Harness::in_memory().await;
    harness.initialize().await;

    let steady = harness
        .install(manifest("steady", "node", "fake-serve", &["steady_tool"]))
        .await;
    wait_running(&harness, &steady.id).await;

    let doomed = harness.install(manifest("doomed", "node", "fake-exit", &["1"])).await;
    wait_running(&harness, &doomed.id).await;
    assert!(harness.tool_names().await.contains(&"doomed_tool".to_string()));

    let broker = harness.broker.clone();
    let doomed_id = doomed.id.clone();
    wait_until("exited integration removed", move || {
        !broker.active_integrations().is_running(&doomed_id)
    })
    .await;

    let names = harness.tool_names().await;
    assert!(!names.contains(&"doomed_tool".to_string()));
    assert!(names.contains(&"steady_tool".to_string()));

    let result = harness.call_tool("steady_tool", json!({})).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("steady_tool called"));
    assert!(!harness.client.is_closed());

    let platform = harness.platform.clone();
    wait_until("exited container removed", move || platform.live_containers() == 1).await;

    // steady started, doomed started, doomed stopped
    let mut changes = 0;
    while changes < 3 {
        let method = tokio::time::timeout(Duration::from_secs(2), harness.notifications.recv())
            .await
            .expect("tools/list_changed notification")
            .expect("client connection open");
        if method == "notifications/tools/list_changed" {
            changes += 1;
        }
    }
    let (result, _) = harness.shut_down().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_start_timeout_abandons_start() {
    let harness = Harness::in_memory().await;
    let integration = InstalledIntegration::new(
        manifest("slow", "node", "fake-slow", &["slow_tool"]),
        BTreeMap::new(),
    );

    let err = harness
        .broker
        .start_integration(integration.clone(), Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::Timeout(t) if t == Duration::from_millis(1)));

    let active = harness.broker.active_integrations();
    assert!(!active.is_running(&integration.id));
    assert_eq!(active.starting_count(), 0);

    let platform = harness.platform.clone();
    wait_until("abandoned container removed", move || platform.live_containers() == 0).await;

    // The same integration starts fine with room to spare
    harness
        .broker
        .start_integration(integration.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(harness.broker.active_integrations().is_running(&integration.id));

    let err = harness
        .broker
        .start_integration(integration.clone(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::AlreadyActive));

    let (_, platform) = harness.shut_down().await;
    assert_eq!(platform.live_containers(), 0);
}

#[tokio::test]
async fn test_root_cancel_mid_start_releases_every_container() {
    let repository = SqliteIntegrationsRepository::open_in_memory().unwrap();
    repository
        .install(manifest("stuck-a", "node", "fake-hang", &[]), BTreeMap::new())
        .await
        .unwrap();
    repository
        .install(manifest("stuck-b", "python@3.12.1", "fake-hang", &[]), BTreeMap::new())
        .await
        .unwrap();

    let harness = Harness::start(Arc::new(repository)).await;
    let platform = harness.platform.clone();
    wait_until("both containers created", move || platform.live_containers() == 2).await;
    assert_eq!(harness.broker.active_integrations().starting_count(), 2);
    assert_eq!(harness.broker.active_integrations().running_count(), 0);

    let session = harness.broker.session_token().clone();
    let started = tokio::time::Instant::now();
    let (result, platform) = harness.shut_down().await;

    assert!(result.is_ok());
    assert!(session.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(platform.created_containers(), 2);
    assert_eq!(platform.live_containers(), 0);
}

#[tokio::test]
async fn test_tool_calls_route_to_owner() {
    let harness = Harness::in_memory().await;
    harness.initialize().await;

    let files = harness
        .install(manifest("files", "node", "fake-serve", &["read_file", "failing_tool"]))
        .await;
    wait_running(&harness, &files.id).await;

    let result = harness.call_tool("read_file", json!({"path": "/tmp/x"})).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("read_file called"));

    let err = harness.call_tool("failing_tool", json!({})).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidParams);

    let err = harness.call_tool("no_such_tool", json!({})).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::MethodNotFound);

    let found = harness
        .call_tool("__mcp__search_registry", json!({"query": "filesystem"}))
        .await
        .unwrap();
    assert!(found.get("isError").is_none());
    assert!(found["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("@modelcontextprotocol/server-filesystem"));

    let empty = harness
        .call_tool("__mcp__search_registry", json!({}))
        .await
        .unwrap();
    assert_eq!(empty["isError"], json!(true));

    let err = harness
        .call_tool("__mcp__install_server", json!({"name": "x", "version": "1.0.0"}))
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InternalError);

    let (result, _) = harness.shut_down().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_duplicate_tool_names_keep_first_registration() {
    let harness = Harness::in_memory().await;
    harness.initialize().await;

    let first = harness
        .install(manifest("first", "node", "fake-serve", &["shared", "first_only"]))
        .await;
    wait_running(&harness, &first.id).await;
    let second = harness
        .install(manifest("second", "node", "fake-serve", &["shared", "__mcp__search_registry"]))
        .await;
    wait_running(&harness, &second.id).await;

    let names = harness.tool_names().await;
    assert_eq!(names.iter().filter(|n| *n == "shared").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "__mcp__search_registry").count(), 1);
    assert_eq!(names.len(), 5);

    // Listing twice yields the same result
    assert_eq!(harness.tool_names().await, names);

    let (result, _) = harness.shut_down().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_uninstall_stops_running_integration() {
    let harness = Harness::in_memory().await;
    harness.initialize().await;

    let weather = harness
        .install(manifest("weather", "node", "fake-serve", &["forecast"]))
        .await;
    wait_running(&harness, &weather.id).await;
    assert_eq!(harness.platform.live_containers(), 1);

    harness.repository.uninstall(&weather.id).await.unwrap();

    let broker = harness.broker.clone();
    let id = weather.id.clone();
    wait_until("integration stopped", move || !broker.active_integrations().is_running(&id)).await;
    let platform = harness.platform.clone();
    wait_until("container removed", move || platform.live_containers() == 0).await;

    assert!(!harness.tool_names().await.contains(&"forecast".to_string()));

    let (result, _) = harness.shut_down().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_upstream_disconnect_ends_session() {
    let harness = Harness::in_memory().await;
    harness.initialize().await;

    let notes = harness
        .install(manifest("notes", "node", "fake-serve", &["add_note"]))
        .await;
    wait_running(&harness, &notes.id).await;

    harness.client.close();
    let result = tokio::time::timeout(Duration::from_secs(10), harness.serve)
        .await
        .expect("serve returns after disconnect")
        .expect("serve task does not panic");

    assert!(matches!(result, Err(ref e) if e.is_connection_closed()));
    assert_eq!(harness.broker.session_state(), SessionState::Closed);
    assert_eq!(harness.platform.live_containers(), 0);
}

async fn next_reply<R>(replies: &mut Lines<BufReader<R>>) -> Value
where
    R: tokio::io::AsyncRead + Unpin,
{
    let line = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
        .await
        .expect("broker replies")
        .unwrap()
        .expect("session still open");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_malformed_upstream_line_keeps_session() {
    let session = RawSession::start().await;
    let (upstream_r, mut upstream_w) = tokio::io::split(session.upstream);
    let mut replies = BufReader::new(upstream_r).lines();

    upstream_w
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"x\xff\"}\n")
        .await
        .unwrap();
    upstream_w
        .write_all(
            b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"initialize\",\"params\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"clientInfo\":{\"name\":\"raw\",\"version\":\"1\"}}}\n",
        )
        .await
        .unwrap();

    let parse_error = next_reply(&mut replies).await;
    assert_eq!(parse_error["error"]["code"], json!(-32700));

    let init = next_reply(&mut replies).await;
    assert_eq!(init["id"], json!(2));
    assert_eq!(init["result"]["serverInfo"]["name"], json!("mcp"));
    assert_eq!(session.broker.session_state(), SessionState::Initialized);

    session.root.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), session.serve)
        .await
        .expect("serve returns after cancellation")
        .expect("serve task does not panic");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_restart_after_stop_survives_stale_attempt() {
    let harness = Harness::in_memory().await;
    let integration = InstalledIntegration::new(
        manifest("flaky", "node", "fake-slow", &["flaky_tool"]),
        BTreeMap::new(),
    );

    let first = {
        let broker = harness.broker.clone();
        let integration = integration.clone();
        tokio::spawn(async move { broker.start_integration(integration, Duration::from_secs(5)).await })
    };
    let broker = harness.broker.clone();
    wait_until("first attempt starting", move || broker.active_integrations().starting_count() == 1).await;

    assert!(!harness.broker.stop_integration(&integration.id));
    let second = {
        let broker = harness.broker.clone();
        let integration = integration.clone();
        tokio::spawn(async move { broker.start_integration(integration, Duration::from_secs(5)).await })
    };

    // The stopped attempt fails while the new one is still starting
    assert!(first.await.unwrap().is_err());
    second.await.unwrap().unwrap();
    assert!(harness.broker.active_integrations().is_running(&integration.id));

    let (result, platform) = harness.shut_down().await;
    assert!(result.is_ok());
    assert_eq!(platform.live_containers(), 0);
}
