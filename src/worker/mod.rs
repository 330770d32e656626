//! The per-session browser worker.
//!
//! Owns one Chrome instance and one CDP connection, runs the telemetry
//! collectors, and serves commands framed as newline JSON on stdin/stdout.
//! Emits a single `worker_ready` message after the initial navigation.

pub mod collectors;
pub mod expander;
mod handlers;
pub mod registry;
pub mod snapshot;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use crate::cdp::{CdpConfig, CdpConnection};
use crate::chrome::{
    self, ChromeProcess, LaunchConfig, find_available_port, find_chrome_executable, launch_chrome,
    wait_for_page_target,
};
use crate::error::AppError;
use crate::ipc::{
    StartSessionConfig, TargetSummary, WorkerCommandEnvelope, WorkerReady, WorkerReply, to_line,
};
use crate::query_cache::{NavIdCache, QueryCacheManager};
use crate::sessiondir;
use crate::telemetry::TelemetryStore;

use collectors::CollectorHandle;
use registry::{DispatchOutcome, WorkerContext};

/// Default Chrome startup timeout.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait for the initial navigation's load event.
const INITIAL_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `startup` builds before the worker is ready to serve.
struct WorkerParts {
    ctx: WorkerContext,
    handles: Vec<CollectorHandle>,
    chrome_process: Option<ChromeProcess>,
    conn: Arc<CdpConnection>,
    ready: WorkerReady,
}

/// Run the worker until shutdown. Fatal errors (Chrome launch, CDP
/// handshake, initial navigation) abort the session; everything else only
/// fails individual commands.
///
/// # Errors
///
/// Returns `AppError` on the fatal paths above.
pub async fn run(config: StartSessionConfig) -> Result<(), AppError> {
    let session_dir = sessiondir::session_dir()?;
    sessiondir::ensure_session_dir(&session_dir)?;
    let mut stdout = tokio::io::stdout();

    let parts = match startup(&config, &session_dir).await {
        Ok(parts) => parts,
        Err(e) => {
            // Report the startup failure on the pipe, correlated to the
            // ready slot, so the daemon can relay a precise error code.
            let code = match e.code {
                crate::error::ExitCode::ConnectionError | crate::error::ExitCode::TimeoutError => {
                    crate::ipc::ErrorCode::ChromeLaunchFailed
                }
                _ => crate::ipc::ErrorCode::WorkerStartFailed,
            };
            let _ = write_line(&mut stdout, &WorkerReply::err("ready", code, e.to_string())).await;
            error!(%e, "worker startup failed");
            return Err(e);
        }
    };
    let WorkerParts {
        ctx,
        handles,
        chrome_process,
        conn,
        ready,
    } = parts;

    write_line(&mut stdout, &ready).await?;
    info!(port = ready.port, chrome_pid = ready.chrome_pid, "worker ready");

    let exit = serve(&ctx, &mut stdout).await;

    // Shutdown: collectors in reverse start order, then the transport, then
    // Chrome (dropped with `chrome_process`), then the query cache.
    for handle in handles.into_iter().rev() {
        handle.close();
    }
    if conn.is_connected() {
        let _ = conn.close().await;
    }
    drop(chrome_process);
    ctx.query_cache.clear();
    info!("worker shut down");

    exit
}

/// Launch or attach to Chrome, connect CDP, start collectors, and perform
/// the initial navigation.
async fn startup(
    config: &StartSessionConfig,
    session_dir: &std::path::Path,
) -> Result<WorkerParts, AppError> {
    let startup_timeout = config
        .timeout_secs
        .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_secs);

    // Launch Chrome, or attach to a caller-provided instance.
    let (chrome_process, port) = if let Some(ws_url) = &config.chrome_ws_url {
        let port = extract_port(ws_url)
            .or(config.port)
            .ok_or_else(|| AppError::general("could not determine CDP port from websocket URL"))?;
        info!(port, "attaching to existing Chrome");
        (None, port)
    } else {
        let port = match config.port {
            Some(p) => p,
            None => find_available_port().map_err(app_err)?,
        };
        let executable = find_chrome_executable().map_err(app_err)?;
        info!(executable = %executable.display(), port, "launching Chrome");
        let process = launch_chrome(
            LaunchConfig {
                executable,
                port,
                headless: config.headless,
                extra_args: config.chrome_flags.clone(),
                user_data_dir: config.user_data_dir.clone(),
            },
            startup_timeout,
        )
        .await
        .map_err(app_err)?;
        (Some(process), port)
    };
    let chrome_pid = chrome_process.as_ref().map_or(0, ChromeProcess::pid);

    let page = wait_for_page_target("127.0.0.1", port, startup_timeout)
        .await
        .map_err(app_err)?;
    let ws_url = page
        .ws_debugger_url
        .clone()
        .ok_or_else(|| AppError::general("page target has no webSocketDebuggerUrl"))?;

    let conn = Arc::new(
        CdpConnection::connect(&ws_url, CdpConfig::default())
            .await
            .map_err(AppError::from)?,
    );

    let store = Arc::new(Mutex::new(TelemetryStore::new(sessiondir::epoch_secs_f64())));
    let nav_cache = Arc::new(Mutex::new(NavIdCache::default()));

    // Collectors start before the initial navigation so it is captured too.
    let mut handles: Vec<CollectorHandle> = Vec::new();
    handles.push(
        collectors::start_navigation_collector(&conn, Arc::clone(&store), Arc::clone(&nav_cache))
            .await
            .map_err(AppError::from)?,
    );
    handles.push(
        collectors::start_network_collector(&conn, Arc::clone(&store), config.include_all)
            .await
            .map_err(AppError::from)?,
    );
    handles.push(
        collectors::start_console_collector(&conn, Arc::clone(&store), config.include_all)
            .await
            .map_err(AppError::from)?,
    );
    {
        let names = handles.iter().map(|h| h.name().to_owned()).collect();
        store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .set_active_telemetry(names);
    }

    let target = initial_navigate(&conn, &config.url).await?;
    store
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .set_target(target.clone());

    // Session metadata for other processes; removed again by the daemon.
    let session_file = sessiondir::SessionFile {
        bdg_pid: std::process::id(),
        chrome_pid,
        start_time: sessiondir::now_iso8601(),
        port,
        target_id: page.id.clone(),
        web_socket_debugger_url: ws_url.clone(),
        active_telemetry: store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .active_telemetry()
            .to_vec(),
    };
    if let Err(e) =
        sessiondir::write_json_atomic(&sessiondir::session_json_path(&session_dir), &session_file)
    {
        warn!(%e, "could not write session.json");
    }

    let ctx = WorkerContext {
        conn: Arc::clone(&conn),
        store,
        nav_cache,
        query_cache: QueryCacheManager::new(session_dir),
        max_body_size: config.max_body_size,
        chrome_pid,
        port,
        target: target.clone(),
    };

    Ok(WorkerParts {
        ctx,
        handles,
        chrome_process,
        conn,
        ready: WorkerReady::new(std::process::id(), chrome_pid, port, target),
    })
}

/// Serve commands from stdin until shutdown, SIGINT, EOF, or CDP closure.
async fn serve(ctx: &WorkerContext, stdout: &mut tokio::io::Stdout) -> Result<(), AppError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match handle_line(ctx, &line).await {
                            LineOutcome::Reply(reply) => write_line(stdout, &reply).await?,
                            LineOutcome::Stop(reply) => {
                                write_line(stdout, &reply).await?;
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => {
                        // Daemon closed our stdin: treat as a stop signal.
                        info!("stdin closed, shutting down");
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(AppError::general(format!("stdin read error: {e}")));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                return Ok(());
            }
            () = ctx.conn.wait_closed() => {
                error!("CDP connection closed unexpectedly");
                return Err(AppError {
                    message: "CDP connection closed unexpectedly".into(),
                    code: crate::error::ExitCode::ConnectionError,
                    suggestion: None,
                });
            }
        }
    }
}

enum LineOutcome {
    Reply(WorkerReply),
    Stop(WorkerReply),
}

/// Parse one stdin line and dispatch it. Unknown or malformed commands get a
/// `DAEMON_ERROR` reply correlated as well as the line allows.
async fn handle_line(ctx: &WorkerContext, line: &str) -> LineOutcome {
    match serde_json::from_str::<WorkerCommandEnvelope>(line) {
        Ok(envelope) => match registry::dispatch(ctx, envelope).await {
            DispatchOutcome::Reply(reply) => LineOutcome::Reply(reply),
            DispatchOutcome::Shutdown(reply) => LineOutcome::Stop(reply),
        },
        Err(parse_err) => {
            warn!(%parse_err, "unparseable command envelope");
            let request_id = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v["requestId"].as_str().map(str::to_owned))
                .unwrap_or_else(|| "unknown".into());
            LineOutcome::Reply(WorkerReply::err(
                request_id,
                crate::ipc::ErrorCode::DaemonError,
                format!("unrecognized command: {parse_err}"),
            ))
        }
    }
}

/// Navigate to the session's start URL and resolve the target identity.
async fn initial_navigate(conn: &CdpConnection, url: &str) -> Result<TargetSummary, AppError> {
    conn.ensure_domain("Page").await.map_err(AppError::from)?;
    let mut load_rx = conn
        .subscribe("Page.loadEventFired")
        .await
        .map_err(AppError::from)?;

    let result = conn
        .send_command("Page.navigate", Some(serde_json::json!({"url": url})))
        .await
        .map_err(AppError::from)?;
    if let Some(error_text) = result["errorText"].as_str() {
        return Err(AppError::general(format!(
            "initial navigation to {url} failed: {error_text}"
        )));
    }

    if tokio::time::timeout(INITIAL_LOAD_TIMEOUT, load_rx.recv())
        .await
        .is_err()
    {
        warn!(url, "load event not observed before timeout, continuing");
    }

    let title = conn
        .send_command(
            "Runtime.evaluate",
            Some(serde_json::json!({"expression": "document.title", "returnByValue": true})),
        )
        .await
        .ok()
        .and_then(|v| v["result"]["value"].as_str().map(str::to_owned))
        .unwrap_or_default();

    Ok(TargetSummary {
        url: url.to_owned(),
        title,
    })
}

async fn write_line<T: serde::Serialize>(
    stdout: &mut tokio::io::Stdout,
    msg: &T,
) -> Result<(), AppError> {
    let line = to_line(msg).map_err(|e| AppError::general(format!("serialize reply: {e}")))?;
    stdout
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AppError::general(format!("stdout write error: {e}")))?;
    stdout
        .flush()
        .await
        .map_err(|e| AppError::general(format!("stdout flush error: {e}")))?;
    Ok(())
}

fn extract_port(ws_url: &str) -> Option<u16> {
    let without_scheme = ws_url
        .strip_prefix("ws://")
        .or_else(|| ws_url.strip_prefix("wss://"))?;
    let host_port = without_scheme.split('/').next()?;
    host_port.rsplit(':').next()?.parse().ok()
}

fn app_err(e: chrome::ChromeError) -> AppError {
    use crate::error::ExitCode;
    let code = match &e {
        chrome::ChromeError::StartupTimeout { .. } => ExitCode::TimeoutError,
        chrome::ChromeError::NotFound(_) | chrome::ChromeError::ParseError(_) => {
            ExitCode::GeneralError
        }
        _ => ExitCode::ConnectionError,
    };
    AppError {
        message: e.to_string(),
        code,
        suggestion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_port_from_ws_url() {
        assert_eq!(
            extract_port("ws://127.0.0.1:9222/devtools/browser/abc"),
            Some(9222)
        );
        assert_eq!(extract_port("wss://localhost:9333/devtools/page/x"), Some(9333));
        assert_eq!(extract_port("http://localhost:9222"), None);
    }

    #[test]
    fn chrome_errors_map_to_exit_codes() {
        use crate::error::ExitCode;
        assert_eq!(
            app_err(chrome::ChromeError::StartupTimeout { port: 1 }).code,
            ExitCode::TimeoutError
        );
        assert_eq!(
            app_err(chrome::ChromeError::NotFound("x".into())).code,
            ExitCode::GeneralError
        );
        assert_eq!(
            app_err(chrome::ChromeError::NoPageTarget).code,
            ExitCode::ConnectionError
        );
    }
}
