mod cli;

use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, error::ErrorKind};

use bdg::config;
use bdg::daemon;
use bdg::error::{AppError, ExitCode};
use bdg::ipc::{ClientRequest, DaemonClient, ErrorCode, Response, ResponseStatus,
    StartSessionConfig};
use bdg::logging;
use bdg::sessiondir;
use bdg::worker;

use cli::{Cli, Command, CompletionsArgs, DomCommand, GlobalOpts, ManArgs, NetworkCommand, StartArgs};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are informational, not errors
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print().expect("failed to write to stdout");
                std::process::exit(0);
            }
            let app_err = AppError::general(e.kind().to_string());
            app_err.print_json_stderr();
            std::process::exit(app_err.code as i32);
        }
    };

    if let Err(e) = run(&cli).await {
        e.print_json_stderr();
        std::process::exit(e.code as i32);
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Daemon => run_daemon().await,
        Command::Worker => run_worker().await,
        Command::Completions(args) => execute_completions(args),
        Command::Man(args) => execute_man(args),
        Command::Start(args) => execute_start(&cli.global, args).await,
        Command::Stop => client_command(&cli.global, ClientRequest::StopRequest).await,
        Command::Status => client_command(&cli.global, ClientRequest::StatusRequest).await,
        Command::Peek(args) => {
            client_command(
                &cli.global,
                ClientRequest::GetPeekRequest {
                    last: Some(args.last),
                    types: args.r#type.clone(),
                },
            )
            .await
        }
        Command::Dom(args) => {
            let request = match &args.command {
                DomCommand::Query { selector } => ClientRequest::DomQueryRequest {
                    selector: selector.clone(),
                },
                DomCommand::Get { index } => ClientRequest::DomGetRequest { index: *index },
                DomCommand::Click { index } => ClientRequest::DomClickRequest { index: *index },
                DomCommand::Fill { index, value } => ClientRequest::DomFillRequest {
                    index: *index,
                    value: value.clone(),
                },
            };
            client_command(&cli.global, request).await
        }
        Command::A11y => client_command(&cli.global, ClientRequest::A11yTreeRequest).await,
        Command::Network(args) => {
            let NetworkCommand::Body { request_id } = &args.command;
            client_command(
                &cli.global,
                ClientRequest::NetworkBodyRequest {
                    request_id: request_id.clone(),
                },
            )
            .await
        }
        Command::Navigate(args) => {
            client_command(
                &cli.global,
                ClientRequest::NavigateRequest {
                    url: args.url.clone(),
                },
            )
            .await
        }
        Command::Cdp(args) => {
            let params = match &args.params {
                Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                    AppError::general(format!("invalid JSON parameters: {e}"))
                        .with_suggestion("Pass parameters as inline JSON, e.g. '{\"url\":\"...\"}'")
                })?),
                None => None,
            };
            client_command(
                &cli.global,
                ClientRequest::CdpRawRequest {
                    method: args.method.clone(),
                    params,
                },
            )
            .await
        }
    }
}

// =============================================================================
// Long-lived process entry points
// =============================================================================

async fn run_daemon() -> Result<(), AppError> {
    let dir = sessiondir::session_dir()?;
    sessiondir::ensure_session_dir(&dir)?;
    let _guard = logging::init_file_logging(&dir, "daemon.log");
    daemon::run().await
}

async fn run_worker() -> Result<(), AppError> {
    let dir = sessiondir::session_dir()?;
    sessiondir::ensure_session_dir(&dir)?;
    let _guard = logging::init_file_logging(&dir, "worker.log");

    let raw = std::env::var(daemon::WORKER_CONFIG_ENV).map_err(|_| {
        AppError::general(format!(
            "missing {} (the worker is spawned by the daemon)",
            daemon::WORKER_CONFIG_ENV
        ))
    })?;
    let config: StartSessionConfig = serde_json::from_str(&raw)
        .map_err(|e| AppError::general(format!("invalid worker configuration: {e}")))?;

    worker::run(config).await
}

// =============================================================================
// Client commands
// =============================================================================

async fn execute_start(global: &GlobalOpts, args: &StartArgs) -> Result<(), AppError> {
    url::Url::parse(&args.url).map_err(|e| {
        AppError::general(format!("invalid URL `{}`: {e}", args.url))
            .with_suggestion("Pass a full URL, e.g. https://example.com")
    })?;

    let file = config::load_config(global.config.as_deref());
    let mut config = StartSessionConfig::new(&args.url);
    config.port = args.port;
    config.timeout_secs = args.timeout;
    config.user_data_dir = args.user_data_dir.clone();
    config.include_all = args.include_all;
    config.compact_output = global.compact;
    config.headless = !args.headed;
    config.chrome_ws_url = args.chrome_ws_url.clone();
    config.chrome_flags = args.chrome_flags.clone();
    config::apply_launch_defaults(&mut config, &file);
    if let Some(max) = args.max_body_size {
        config.max_body_size = max;
    }

    let socket = socket_path()?;
    ensure_daemon_running(&socket).await?;

    let mut client = DaemonClient::connect(&socket).await.map_err(AppError::from)?;
    let response = client
        .roundtrip(ClientRequest::StartSessionRequest { config })
        .await
        .map_err(AppError::from)?;
    print_response(response, global.compact)
}

async fn client_command(global: &GlobalOpts, request: ClientRequest) -> Result<(), AppError> {
    let socket = socket_path()?;
    let mut client = DaemonClient::connect(&socket).await.map_err(AppError::from)?;
    let response = client.roundtrip(request).await.map_err(AppError::from)?;
    print_response(response, global.compact)
}

fn socket_path() -> Result<PathBuf, AppError> {
    let dir = sessiondir::session_dir()?;
    Ok(sessiondir::socket_path(&dir))
}

/// Start the daemon in the background when none is listening, then wait for
/// its socket to come up.
async fn ensure_daemon_running(socket: &std::path::Path) -> Result<(), AppError> {
    if tokio::net::UnixStream::connect(socket).await.is_ok() {
        return Ok(());
    }

    let exe = std::env::current_exe()
        .map_err(|e| AppError::general(format!("could not locate own executable: {e}")))?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().map_err(|e| AppError {
        message: format!("could not start daemon: {e}"),
        code: ExitCode::ConnectionError,
        suggestion: None,
    })?;

    // Poll until the daemon binds its socket.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if tokio::net::UnixStream::connect(socket).await.is_ok() {
            return Ok(());
        }
    }
    Err(AppError {
        message: "daemon did not start listening in time".into(),
        code: ExitCode::ConnectionError,
        suggestion: Some(format!("Check {} for details", daemon_log_hint())),
    })
}

fn daemon_log_hint() -> String {
    sessiondir::session_dir()
        .map(|d| sessiondir::daemon_log_path(&d).display().to_string())
        .unwrap_or_else(|_| "~/.bdg/daemon.log".into())
}

fn print_response(response: Response, compact: bool) -> Result<(), AppError> {
    match response.status {
        ResponseStatus::Ok => {
            let data = response
                .data
                .unwrap_or_else(|| serde_json::json!({"status": "ok"}));
            let rendered = if compact {
                serde_json::to_string(&data)
            } else {
                serde_json::to_string_pretty(&data)
            }
            .map_err(|e| AppError::general(format!("serialization error: {e}")))?;
            println!("{rendered}");
            Ok(())
        }
        ResponseStatus::Error => {
            let code = response.error_code.unwrap_or(ErrorCode::DaemonError);
            let mut err = AppError::from_ipc(
                code,
                response
                    .error
                    .unwrap_or_else(|| "unknown daemon error".into()),
            );
            err.suggestion = response.suggestion;
            // Conflicts carry the existing session for scripts to inspect.
            if let Some(existing) = response.existing_session {
                if let Ok(summary) = serde_json::to_string(&existing) {
                    err.message = format!("{} (existing: {summary})", err.message);
                }
            }
            Err(err)
        }
    }
}

fn execute_completions(args: &CompletionsArgs) -> Result<(), AppError> {
    let mut cmd = Cli::command();
    clap_complete::generate(args.shell, &mut cmd, "bdg", &mut std::io::stdout());
    Ok(())
}

fn execute_man(args: &ManArgs) -> Result<(), AppError> {
    let cmd = Cli::command();

    let target = match &args.command {
        None => cmd,
        Some(name) => find_subcommand(&cmd, name)
            .ok_or_else(|| AppError::general(format!("unknown command: {name}")))?,
    };

    let man = clap_mangen::Man::new(target);
    man.render(&mut std::io::stdout())
        .map_err(|e| AppError::general(format!("failed to render man page: {e}")))?;
    Ok(())
}

fn find_subcommand(cmd: &clap::Command, name: &str) -> Option<clap::Command> {
    let parent_name = cmd.get_name().to_string();
    for sub in cmd.get_subcommands() {
        if sub.get_name() == name {
            let full_name = format!("{parent_name}-{name}");
            let leaked: &'static str = Box::leak(full_name.into_boxed_str());
            return Some(sub.clone().name(leaked));
        }
    }
    None
}
