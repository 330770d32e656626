//! Integration tests for the daemon router.
//!
//! Each test drives a real `Router` task whose worker is a scripted fake:
//! the spawner hands the test both ends of the worker pipe, so worker
//! replies (and silences, and crashes) are fully under test control.

use std::time::Duration;

use bdg::daemon::{Router, RouterHandle, SpawnedWorker, WorkerLink, WorkerSpawner, spawn_reader};
use bdg::ipc::{
    ClientRequest, ErrorCode, RequestEnvelope, ResponseStatus, StartSessionConfig, WorkerReply,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

// =============================================================================
// Fake worker plumbing
// =============================================================================

/// The test's ends of a spawned fake worker's pipes.
struct FakePipes {
    /// Lines the router wrote to the worker's stdin.
    commands: tokio::io::Lines<BufReader<DuplexStream>>,
    /// The worker's stdout; dropping it simulates worker exit.
    stdout: DuplexStream,
}

impl FakePipes {
    async fn next_command(&mut self) -> Value {
        let line = self
            .commands
            .next_line()
            .await
            .expect("read command")
            .expect("command stream open");
        serde_json::from_str(&line).expect("command is JSON")
    }

    async fn write_line(&mut self, value: &Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.stdout.write_all(line.as_bytes()).await.unwrap();
    }

    async fn reply_ok(&mut self, request_id: &str, data: Value) {
        let reply = serde_json::to_value(WorkerReply::ok(request_id, Some(data))).unwrap();
        self.write_line(&reply).await;
    }

    async fn emit_ready(&mut self) {
        self.write_line(&json!({
            "type": "worker_ready",
            "requestId": "ready",
            "workerPid": 4242,
            "chromePid": 4243,
            "port": 9299,
            "target": {"url": "http://example.test", "title": "Example"},
        }))
        .await;
    }
}

struct FakeSpawner {
    pipes_tx: mpsc::UnboundedSender<FakePipes>,
}

impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self, _config: &StartSessionConfig) -> Result<SpawnedWorker, String> {
        let (stdin_theirs, stdin_ours) = tokio::io::duplex(64 * 1024);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(64 * 1024);

        // Pid 0 keeps WorkerLink::kill a no-op for the fake worker.
        let link = WorkerLink::new(Box::new(stdin_theirs), None, 0);
        let messages = spawn_reader(stdout_theirs);

        self.pipes_tx
            .send(FakePipes {
                commands: BufReader::new(stdin_ours).lines(),
                stdout: stdout_ours,
            })
            .map_err(|_| "test dropped pipe receiver".to_owned())?;

        Ok(SpawnedWorker { link, messages })
    }
}

/// Spin up a router with a scripted spawner and the given command timeout.
fn start_router(
    timeout: Duration,
) -> (
    RouterHandle,
    mpsc::UnboundedReceiver<FakePipes>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let (pipes_tx, pipes_rx) = mpsc::unbounded_channel();
    let (router, handle) = Router::new(dir.path().to_path_buf(), FakeSpawner { pipes_tx });
    tokio::spawn(router.with_command_timeout(timeout).run());
    (handle, pipes_rx, dir)
}

fn envelope(request: ClientRequest) -> RequestEnvelope {
    RequestEnvelope {
        session_id: None,
        request,
    }
}

fn start_request() -> ClientRequest {
    ClientRequest::StartSessionRequest {
        config: StartSessionConfig::new("http://example.test"),
    }
}

/// Start a session and return the fake worker's pipes once ready.
async fn start_session(
    handle: &RouterHandle,
    pipes_rx: &mut mpsc::UnboundedReceiver<FakePipes>,
) -> FakePipes {
    let handle2 = handle.clone();
    let start_task =
        tokio::spawn(async move { handle2.request(envelope(start_request())).await.unwrap() });

    let mut pipes = pipes_rx.recv().await.expect("worker spawned");
    pipes.emit_ready().await;

    let response = start_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    pipes
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn handshake_replies_immediately_without_worker() {
    let (handle, _pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let response = handle
        .request(envelope(ClientRequest::Handshake))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.response_type.as_deref(), Some("handshake_response"));
    assert!(response.session_id.is_some());
}

#[tokio::test]
async fn handshake_echoes_the_client_session_id() {
    let (handle, _pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let response = handle
        .request(RequestEnvelope {
            session_id: Some("s-echo".into()),
            request: ClientRequest::Handshake,
        })
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.session_id.as_deref(), Some("s-echo"));
}

#[tokio::test]
async fn forwarded_command_without_worker_gets_no_session() {
    let (handle, _pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let response = handle
        .request(envelope(ClientRequest::StatusRequest))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::NoSession));
}

#[tokio::test]
async fn stop_without_worker_gets_no_session() {
    let (handle, _pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let response = handle
        .request(envelope(ClientRequest::StopRequest))
        .await
        .unwrap();
    assert_eq!(response.error_code, Some(ErrorCode::NoSession));
}

#[tokio::test]
async fn start_forward_reply_round_trip() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    let handle2 = handle.clone();
    let request_task = tokio::spawn(async move {
        handle2
            .request(envelope(ClientRequest::GetPeekRequest {
                last: Some(5),
                types: None,
            }))
            .await
            .unwrap()
    });

    // The daemon stripped `_request` and attached a fresh request id.
    let command = pipes.next_command().await;
    assert_eq!(command["type"], "get_peek");
    assert_eq!(command["last"], 5);
    assert!(command.get("sessionId").is_none());
    let request_id = command["requestId"].as_str().unwrap().to_owned();

    pipes
        .reply_ok(&request_id, json!({"preview": {"data": {"network": []}}}))
        .await;

    let response = request_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.request_id.as_deref(), Some(request_id.as_str()));
    assert!(response.data.unwrap()["preview"]["data"]["network"].is_array());
}

#[tokio::test]
async fn network_body_forwarding_keeps_the_cdp_request_id() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    let handle2 = handle.clone();
    let request_task = tokio::spawn(async move {
        handle2
            .request(envelope(ClientRequest::NetworkBodyRequest {
                request_id: "1000.42".into(),
            }))
            .await
            .unwrap()
    });

    // The fresh correlation id must not overwrite the CDP request id.
    let command = pipes.next_command().await;
    assert_eq!(command["type"], "network_body");
    assert_eq!(command["networkRequestId"], "1000.42");
    let correlation_id = command["requestId"].as_str().unwrap().to_owned();
    assert_ne!(correlation_id, "1000.42");

    pipes
        .reply_ok(&correlation_id, json!({"requestId": "1000.42", "body": "ok"}))
        .await;

    let response = request_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.data.unwrap()["requestId"], "1000.42");
}

#[tokio::test]
async fn second_start_reports_existing_session() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let _pipes = start_session(&handle, &mut pipes_rx).await;

    let response = handle.request(envelope(start_request())).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::SessionAlreadyRunning));

    let existing = response.existing_session.expect("existing session summary");
    assert_eq!(existing.pid, 4242);
    assert_eq!(existing.target_url, "http://example.test");
}

#[tokio::test]
async fn unanswered_command_times_out_and_router_recovers() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_millis(150));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    let handle2 = handle.clone();
    let request_task = tokio::spawn(async move {
        handle2
            .request(envelope(ClientRequest::StatusRequest))
            .await
            .unwrap()
    });

    let command = pipes.next_command().await;
    let stale_id = command["requestId"].as_str().unwrap().to_owned();
    // Never reply; the deadline fires instead.

    let response = request_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::CdpTimeout));
    assert_eq!(response.request_id.as_deref(), Some(stale_id.as_str()));

    // A late reply for the forgotten id is dropped, and the router keeps
    // serving fresh commands.
    pipes.reply_ok(&stale_id, json!({"late": true})).await;

    let handle3 = handle.clone();
    let next_task = tokio::spawn(async move {
        handle3
            .request(envelope(ClientRequest::StatusRequest))
            .await
            .unwrap()
    });
    let command = pipes.next_command().await;
    let fresh_id = command["requestId"].as_str().unwrap().to_owned();
    assert_ne!(fresh_id, stale_id);
    pipes.reply_ok(&fresh_id, json!({"ok": true})).await;

    let response = next_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.data.unwrap()["ok"], true);
}

#[tokio::test]
async fn worker_death_fails_outstanding_requests_with_daemon_error() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    let handle2 = handle.clone();
    let request_task = tokio::spawn(async move {
        handle2
            .request(envelope(ClientRequest::StatusRequest))
            .await
            .unwrap()
    });

    // Wait until the command is in flight, then kill the worker.
    let _command = pipes.next_command().await;
    drop(pipes);

    let response = request_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::DaemonError));

    // The session is gone.
    let response = handle
        .request(envelope(ClientRequest::StatusRequest))
        .await
        .unwrap();
    assert_eq!(response.error_code, Some(ErrorCode::NoSession));
}

#[tokio::test]
async fn stop_sends_shutdown_and_completes_on_worker_exit() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    let handle2 = handle.clone();
    let stop_task = tokio::spawn(async move {
        handle2
            .request(envelope(ClientRequest::StopRequest))
            .await
            .unwrap()
    });

    let command = pipes.next_command().await;
    assert_eq!(command["type"], "shutdown");

    // The worker acknowledges and exits.
    let request_id = command["requestId"].as_str().unwrap().to_owned();
    pipes.reply_ok(&request_id, json!({"stopping": true})).await;
    drop(pipes);

    let response = stop_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.data.unwrap()["stopped"], true);

    // And a fresh session can start afterwards.
    let response = handle
        .request(envelope(ClientRequest::StatusRequest))
        .await
        .unwrap();
    assert_eq!(response.error_code, Some(ErrorCode::NoSession));
}

#[tokio::test]
async fn pipelined_requests_on_one_socket_reply_in_order() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));
    let mut pipes = start_session(&handle, &mut pipes_rx).await;

    // Fake worker: answer every command with its own request id as data.
    tokio::spawn(async move {
        loop {
            let command = pipes.next_command().await;
            let request_id = command["requestId"].as_str().unwrap().to_owned();
            let echo = command["type"].clone();
            pipes.reply_ok(&request_id, json!({"command": echo})).await;
        }
    });

    let (client, server) = tokio::net::UnixStream::pair().unwrap();
    tokio::spawn(bdg::daemon::serve_connection(server, handle.clone()));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Pipeline three requests before reading any reply.
    let batch = concat!(
        r#"{"type":"status_request"}"#,
        "\n",
        r#"{"type":"get_peek_request"}"#,
        "\n",
        r#"{"type":"a11y_tree_request"}"#,
        "\n",
    );
    write_half.write_all(batch.as_bytes()).await.unwrap();

    let expected = ["status", "get_peek", "a11y_tree"];
    for command in expected {
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["command"], command, "reply order broken");
    }
}

#[tokio::test]
async fn startup_error_reply_surfaces_chrome_launch_failure() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let handle2 = handle.clone();
    let start_task =
        tokio::spawn(async move { handle2.request(envelope(start_request())).await.unwrap() });

    // The worker reports the launch failure in the ready slot, then exits.
    let mut pipes = pipes_rx.recv().await.unwrap();
    pipes
        .write_line(&json!({
            "requestId": "ready",
            "status": "error",
            "error": "Chrome launch failed: no executable",
            "errorCode": "CHROME_LAUNCH_FAILED",
        }))
        .await;

    let response = start_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::ChromeLaunchFailed));
    assert!(response.error.unwrap().contains("no executable"));
}

#[tokio::test]
async fn worker_exit_before_ready_fails_the_start() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let handle2 = handle.clone();
    let start_task =
        tokio::spawn(async move { handle2.request(envelope(start_request())).await.unwrap() });

    // The worker dies without ever signaling ready.
    let pipes = pipes_rx.recv().await.unwrap();
    drop(pipes);

    let response = start_task.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_code, Some(ErrorCode::WorkerStartFailed));
}

#[tokio::test]
async fn stop_during_starting_is_queued_until_ready() {
    let (handle, mut pipes_rx, _dir) = start_router(Duration::from_secs(10));

    let handle2 = handle.clone();
    let start_task =
        tokio::spawn(async move { handle2.request(envelope(start_request())).await.unwrap() });
    let mut pipes = pipes_rx.recv().await.unwrap();

    // Stop arrives while the worker is still starting.
    let handle3 = handle.clone();
    let stop_task = tokio::spawn(async move {
        handle3
            .request(envelope(ClientRequest::StopRequest))
            .await
            .unwrap()
    });

    // Give the stop a moment to land in the queue, then become ready.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipes.emit_ready().await;

    let start_response = start_task.await.unwrap();
    assert_eq!(start_response.status, ResponseStatus::Ok);

    // Ready immediately transitions into stopping: a shutdown command lands.
    let command = pipes.next_command().await;
    assert_eq!(command["type"], "shutdown");
    drop(pipes);

    let stop_response = stop_task.await.unwrap();
    assert_eq!(stop_response.status, ResponseStatus::Ok);
}
