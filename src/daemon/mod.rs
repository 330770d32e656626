//! The long-lived daemon: owns the local socket and exactly one worker.

mod router;
mod state;
mod worker_link;

pub use router::{DEFAULT_COMMAND_TIMEOUT, Router, RouterHandle, RouterRequest};
pub use state::{ActiveSession, Phase};
pub use worker_link::{
    ProcessSpawner, SpawnedWorker, WORKER_CONFIG_ENV, WorkerLink, WorkerSpawner, spawn_reader,
};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::error::AppError;
use crate::ipc::{ClientRequest, ErrorCode, RequestEnvelope, Response, to_line};
use crate::sessiondir;

/// Run the daemon until SIGINT/SIGTERM.
///
/// Binding refuses when a live daemon already owns the socket; a stale
/// socket file left by a crash is unlinked first.
///
/// # Errors
///
/// Returns `AppError` when the session directory or socket cannot be set up.
pub async fn run() -> Result<(), AppError> {
    let session_dir = sessiondir::session_dir()?;
    sessiondir::ensure_session_dir(&session_dir)?;
    let socket = sessiondir::socket_path(&session_dir);

    if socket.exists() {
        if UnixStream::connect(&socket).await.is_ok() {
            return Err(AppError {
                message: "a bdg daemon is already running".into(),
                code: crate::error::ExitCode::SessionConflict,
                suggestion: Some("Run `bdg stop` to end the existing session".into()),
            });
        }
        warn!(socket = %socket.display(), "removing stale socket file");
        sessiondir::remove_file(&socket)?;
    }

    let listener = UnixListener::bind(&socket)
        .map_err(|e| AppError::general(format!("bind {}: {e}", socket.display())))?;
    info!(socket = %socket.display(), "daemon listening");

    let (router_core, handle) = Router::new(session_dir.clone(), ProcessSpawner);
    let router_task = tokio::spawn(router_core.run());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(serve_connection(stream, handle.clone()));
                    }
                    Err(e) => warn!(%e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            () = sigterm() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    // Stop the worker (NO_SESSION is fine), then tear down.
    let _ = handle
        .request(RequestEnvelope {
            session_id: None,
            request: ClientRequest::StopRequest,
        })
        .await;
    router_task.abort();
    sessiondir::remove_file(&socket)?;
    info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}

/// Serve one client connection: requests are answered strictly in arrival
/// order, so a client that pipelines N requests gets N replies in order.
pub async fn serve_connection(stream: UnixStream, handle: RouterHandle) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(envelope) => handle.request(envelope).await.unwrap_or_else(|| {
                Response::err(ErrorCode::DaemonError, "daemon is shutting down")
            }),
            Err(e) => Response::err(ErrorCode::DaemonError, format!("malformed request: {e}")),
        };

        let Ok(out) = to_line(&response) else { break };
        if write_half.write_all(out.as_bytes()).await.is_err() {
            // Client hung up; the reply is discarded.
            break;
        }
    }
}
