//! Integration tests: drive the `tw-reference-server` binary through the
//! full client stack (registry → connection → dispatcher → child process).
//!
//! Covers:
//! - Round trips, out-of-order answers, and remote errors routed by id
//! - Timeouts, late responses, and recovery on the same connection
//! - Crashes failing pending calls, startup failures, handshake + discovery
//! - Stdout noise, split frames, stderr capture
//! - Shutdown, restart policy, force-kill, and the in-flight cap

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tw_client::config::{HandshakeConfig, RestartPolicy, StartPolicy};
use tw_client::{
    ConnectionState, ErrorKind, ServerConnection, ToolClient, ToolServerConfig, ToolServersConfig,
};

const SERVER: &str = env!("CARGO_BIN_EXE_tw-reference-server");

/// Upper bound on any single test step; a hang is a failure.
const STEP: Duration = Duration::from_secs(10);

fn server(name: &str) -> ToolServerConfig {
    let mut cfg = ToolServerConfig::new(name, SERVER);
    cfg.env.insert("RUST_LOG".into(), "warn".into());
    cfg.startup_timeout_ms = 5_000;
    cfg.default_call_timeout_ms = 5_000;
    cfg.shutdown_grace_ms = 1_000;
    cfg
}

async fn client(servers: Vec<ToolServerConfig>) -> ToolClient {
    ToolClient::from_config(&ToolServersConfig {
        start_policy: StartPolicy::Lazy,
        servers,
    })
    .await
    .unwrap()
}

fn connection(client: &ToolClient, name: &str) -> Arc<ServerConnection> {
    client.registry().get(name).unwrap()
}

async fn wait_for_state(conn: &ServerConnection, want: ConnectionState) {
    let mut rx = conn.subscribe();
    tokio::time::timeout(STEP, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("connection never reached {want}"))
        .unwrap();
}

// ── Round trips ─────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_roundtrip() {
    let client = client(vec![server("ref")]).await;

    let out = client
        .use_tool("ref", "echo", json!({ "text": "hi\nthere", "n": 1 }), None)
        .await
        .unwrap();
    assert_eq!(out, json!({ "text": "hi\nthere", "n": 1 }));

    let status = connection(&client, "ref").status();
    assert_eq!(status.state, ConnectionState::Running);
    assert!(status.pid.is_some());
    assert!(status.alive);
    assert_eq!(status.in_flight, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn unbounded_timeout_is_accepted() {
    let client = client(vec![server("ref")]).await;

    let out = tokio::time::timeout(
        STEP,
        client.use_tool("ref", "echo", json!({ "n": 7 }), Some(Duration::MAX)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(out, json!({ "n": 7 }));

    client.shutdown().await;
}

#[tokio::test]
async fn out_of_order_answers_reach_their_callers() {
    let client = client(vec![server("ref")]).await;

    let (slow, fast, mid) = tokio::join!(
        client.use_tool("ref", "sleep", json!({ "ms": 300, "value": "slow" }), None),
        client.use_tool("ref", "sleep", json!({ "ms": 10, "value": "fast" }), None),
        client.use_tool("ref", "sleep", json!({ "ms": 150, "value": "mid" }), None),
    );
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
    assert_eq!(mid.unwrap(), json!("mid"));

    client.shutdown().await;
}

#[tokio::test]
async fn identical_concurrent_calls_are_independent() {
    let client = client(vec![server("ref")]).await;
    let args = json!({ "same": true });

    let (a, b) = tokio::join!(
        client.use_tool("ref", "echo", args.clone(), None),
        client.use_tool("ref", "echo", args.clone(), None),
    );
    assert_eq!(a.unwrap(), args);
    assert_eq!(b.unwrap(), args);

    client.shutdown().await;
}

#[tokio::test]
async fn remote_error_is_routed_to_its_caller() {
    let client = client(vec![server("ref")]).await;

    let (missing, ok) = tokio::join!(
        client.use_tool("ref", "no_such_tool", json!({}), None),
        client.use_tool("ref", "sleep", json!({ "ms": 50, "value": 42 }), None),
    );

    let err = missing.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ToolExecution);
    let remote = err.remote.unwrap();
    assert_eq!(remote.kind, "NotFound");
    assert_eq!(remote.message, "no such tool");
    assert_eq!(ok.unwrap(), json!(42));

    client.shutdown().await;
}

#[tokio::test]
async fn unknown_server_fails_without_io() {
    let client = client(vec![server("ref")]).await;
    let err = client
        .use_tool("other", "echo", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownServer);
    assert_eq!(connection(&client, "ref").state(), ConnectionState::NotStarted);
}

// ── Timeouts ────────────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_discards_late_response() {
    let client = client(vec![server("ref")]).await;

    let err = client
        .use_tool(
            "ref",
            "sleep",
            json!({ "ms": 300, "value": "late" }),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // The connection is still healthy.
    let out = client.use_tool("ref", "echo", json!("after"), None).await.unwrap();
    assert_eq!(out, json!("after"));

    // The late answer shows up as an orphan, never as a result.
    let conn = connection(&client, "ref");
    tokio::time::timeout(STEP, async {
        while conn.status().orphans == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(conn.status().in_flight, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn dropped_caller_frees_its_slot() {
    let mut cfg = server("ref");
    cfg.max_in_flight = 1;
    let client = client(vec![cfg]).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        client.use_tool("ref", "hang", json!({}), None),
    )
    .await;
    assert!(abandoned.is_err());

    // The hung call no longer counts against the cap.
    let out = client.use_tool("ref", "echo", json!(1), None).await.unwrap();
    assert_eq!(out, json!(1));

    client.shutdown().await;
}

// ── Failures ────────────────────────────────────────────────────────────

#[tokio::test]
async fn crash_fails_pending_calls() {
    let client = client(vec![server("ref")]).await;
    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let hung = {
        let client = client.clone();
        tokio::spawn(async move { client.use_tool("ref", "hang", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let crash = tokio::time::timeout(STEP, client.use_tool("ref", "crash", json!({ "code": 7 }), None))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(crash.kind, ErrorKind::ServerCrashed);

    let hung = tokio::time::timeout(STEP, hung).await.unwrap().unwrap().unwrap_err();
    assert_eq!(hung.kind, ErrorKind::ServerCrashed);
    assert!(hung.message.contains("crashing on request"), "{}", hung.message);

    let conn = connection(&client, "ref");
    assert_eq!(conn.state(), ConnectionState::Crashed);
    assert_eq!(conn.status().last_exit.unwrap().code, Some(7));

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerUnavailable);

    client.shutdown().await;
}

#[tokio::test]
async fn exit_during_startup_is_terminal() {
    let mut cfg = server("ref");
    cfg.args = vec!["--exit-immediately".into()];
    cfg.handshake = Some(HandshakeConfig {
        tool: "initialize".into(),
        arguments: json!({}),
        notification: None,
    });
    let client = client(vec![cfg]).await;

    let err = tokio::time::timeout(STEP, client.use_tool("ref", "echo", json!({}), None))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerCrashed);
    assert_eq!(connection(&client, "ref").state(), ConnectionState::Failed);

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerUnavailable);
}

#[tokio::test]
async fn missing_executable_is_launch_error() {
    let client = client(vec![ToolServerConfig::new("ghost", "/definitely/not/a/binary")]).await;
    let err = client.use_tool("ghost", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProcessLaunch);
}

// ── Handshake and discovery ─────────────────────────────────────────────

#[tokio::test]
async fn handshake_and_discovery() {
    let mut cfg = server("ref");
    cfg.handshake = Some(HandshakeConfig {
        tool: "initialize".into(),
        arguments: json!({ "client": "tests" }),
        notification: Some("initialized".into()),
    });
    cfg.discovery_tool = Some("tools/list".into());
    let client = client(vec![cfg]).await;

    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let catalog = client.registry().catalog("ref").unwrap();
    let tools = catalog["tools"].as_array().unwrap();
    assert!(tools.contains(&json!("echo")));

    client.shutdown().await;
}

#[tokio::test]
async fn discovery_failure_does_not_block_startup() {
    let mut cfg = server("ref");
    cfg.discovery_tool = Some("no_such_tool".into());
    let client = client(vec![cfg]).await;

    client.use_tool("ref", "echo", json!({}), None).await.unwrap();
    assert!(client.registry().catalog("ref").is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn handshake_timeout() {
    let mut cfg = server("ref");
    cfg.startup_timeout_ms = 200;
    cfg.handshake = Some(HandshakeConfig {
        tool: "hang".into(),
        arguments: json!({}),
        notification: None,
    });
    let client = client(vec![cfg]).await;

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StartupTimeout);
    assert_eq!(connection(&client, "ref").state(), ConnectionState::Failed);
}

#[tokio::test]
async fn handshake_rejected() {
    let mut cfg = server("ref");
    cfg.handshake = Some(HandshakeConfig {
        tool: "not_a_handshake".into(),
        arguments: json!({}),
        notification: None,
    });
    let client = client(vec![cfg]).await;

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProcessLaunch);
    assert!(err.message.contains("no such tool"));
}

// ── Stream robustness ───────────────────────────────────────────────────

#[tokio::test]
async fn stdout_noise_is_skipped() {
    let client = client(vec![server("ref")]).await;

    let out = client.use_tool("ref", "noise", json!({ "x": 1 }), None).await.unwrap();
    assert_eq!(out, json!({ "x": 1 }));
    assert_eq!(connection(&client, "ref").state(), ConnectionState::Running);

    client.shutdown().await;
}

#[tokio::test]
async fn lost_framing_fails_connection() {
    let mut cfg = server("ref");
    cfg.max_consecutive_decode_errors = 1;
    let client = client(vec![cfg]).await;

    let err = tokio::time::timeout(STEP, client.use_tool("ref", "noise", json!({}), None))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolDecode);
    assert_eq!(connection(&client, "ref").state(), ConnectionState::Failed);
}

#[tokio::test]
async fn split_frame_is_reassembled() {
    let client = client(vec![server("ref")]).await;
    let payload = json!({ "blob": "x".repeat(10_000) });

    let out = client.use_tool("ref", "split", payload.clone(), None).await.unwrap();
    assert_eq!(out, payload);

    client.shutdown().await;
}

#[tokio::test]
async fn stderr_is_captured() {
    let client = client(vec![server("ref")]).await;
    client
        .use_tool("ref", "stderr", json!({ "line": "diagnostic hello" }), None)
        .await
        .unwrap();

    let conn = connection(&client, "ref");
    tokio::time::timeout(STEP, async {
        while !conn.status().stderr_tail.iter().any(|l| l == "diagnostic hello") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    client.shutdown().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_resolves_pending_and_rejects_new_calls() {
    let client = client(vec![server("ref")]).await;
    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let hung = {
        let client = client.clone();
        tokio::spawn(async move { client.use_tool("ref", "hang", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(STEP, client.shutdown()).await.unwrap();

    let err = tokio::time::timeout(STEP, hung).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DispatcherClosed);
    assert_eq!(client.registry().status()[0].state, ConnectionState::Stopped);
}

#[tokio::test]
async fn restart_after_crash() {
    let mut cfg = server("ref");
    cfg.restart = RestartPolicy {
        max_attempts: 2,
        initial_delay_ms: 50,
        max_delay_ms: 200,
        backoff_factor: 2.0,
    };
    let client = client(vec![cfg]).await;
    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let err = client
        .use_tool("ref", "crash", json!({ "code": 1 }), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerCrashed);

    let conn = connection(&client, "ref");
    tokio::time::timeout(STEP, async {
        while conn.status().restarts < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let out = client.use_tool("ref", "echo", json!("again"), None).await.unwrap();
    assert_eq!(out, json!("again"));

    client.shutdown().await;
}

#[tokio::test]
async fn restart_budget_exhaustion_is_terminal() {
    let mut cfg = server("ref");
    cfg.args = vec!["--exit-immediately".into()];
    cfg.restart = RestartPolicy {
        max_attempts: 2,
        initial_delay_ms: 20,
        max_delay_ms: 100,
        backoff_factor: 2.0,
    };
    let client = client(vec![cfg]).await;
    client.registry().start_all().await;

    let conn = connection(&client, "ref");
    wait_for_state(&conn, ConnectionState::Failed).await;

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerUnavailable);
    assert!(err.message.contains("restart attempts"), "{}", err.message);
}

#[cfg(unix)]
#[tokio::test]
async fn stubborn_server_is_killed_after_grace() {
    let mut cfg = server("ref");
    cfg.args = vec!["--ignore-eof".into()];
    cfg.shutdown_grace_ms = 200;
    let client = client(vec![cfg]).await;
    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let conn = connection(&client, "ref");
    assert!(tokio::time::timeout(STEP, client.registry().remove("ref")).await.unwrap());

    let status = conn.status();
    assert_eq!(status.state, ConnectionState::Stopped);
    // Killed by a signal, so no exit code.
    assert_eq!(status.last_exit.unwrap().code, None);
}

#[tokio::test]
async fn in_flight_cap_rejects_excess_calls() {
    let mut cfg = server("ref");
    cfg.max_in_flight = 2;
    let client = client(vec![cfg]).await;
    client.use_tool("ref", "echo", json!({}), None).await.unwrap();

    let hung: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.use_tool("ref", "hang", json!({}), None).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.use_tool("ref", "echo", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Overloaded);

    client.shutdown().await;
    for h in hung {
        let err = h.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
