#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bdg",
    version,
    about = "Browser telemetry collector over the Chrome DevTools Protocol",
    long_about = "bdg drives a Chrome instance through the Chrome DevTools Protocol and \
        collects its network and console activity into bounded in-memory buffers. A \
        long-lived daemon owns one browser worker per session; short-lived CLI commands \
        talk to it over a local socket. Designed for AI agents and shell scripting: every \
        command prints structured JSON on stdout and structured JSON errors on stderr.",
    term_width = 100
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Output compact single-line JSON
    #[arg(long, global = true)]
    pub compact: bool,

    /// Config file path (default: ~/.bdg/config.toml)
    #[arg(long, global = true, env = "BDG_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a browser session
    #[command(
        long_about = "Start the daemon (if needed), launch a Chrome worker, navigate to the \
            given URL, and begin collecting network and console telemetry."
    )]
    Start(StartArgs),

    /// Stop the session and shut the worker down
    Stop,

    /// Show session status and the current navigation id
    Status,

    /// Read current telemetry buffers without stopping the session
    #[command(
        long_about = "Read a snapshot of the network and console buffers. --last bounds how \
            many entries per buffer are returned; 0 returns everything."
    )]
    Peek(PeekArgs),

    /// DOM queries and index-based element commands
    Dom(DomArgs),

    /// Capture the accessibility tree
    A11y,

    /// Network helpers beyond peek
    Network(NetworkArgs),

    /// Navigate the session's page to a URL
    Navigate(NavigateArgs),

    /// Send a raw CDP command (capability-ladder escape hatch)
    #[command(
        long_about = "Pass an arbitrary `Domain.method` call straight to Chrome and print the \
            raw reply. Parameters are given as inline JSON."
    )]
    Cdp(CdpArgs),

    /// Run the daemon in the foreground (normally spawned by `start`)
    #[command(hide = true)]
    Daemon,

    /// Run the browser worker (spawned by the daemon, never by hand)
    #[command(hide = true)]
    Worker,

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Render a man page to stdout
    #[command(hide = true)]
    Man(ManArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// URL to navigate to
    pub url: String,

    /// CDP port (default: any free port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Chrome startup timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Persistent Chrome profile directory
    #[arg(long)]
    pub user_data_dir: Option<PathBuf>,

    /// Capture analytics/tracking noise too
    #[arg(long)]
    pub include_all: bool,

    /// Cap on inlined response bodies, in bytes
    #[arg(long)]
    pub max_body_size: Option<u64>,

    /// Run Chrome with a visible window
    #[arg(long)]
    pub headed: bool,

    /// Attach to an already-running Chrome via its websocket URL
    #[arg(long)]
    pub chrome_ws_url: Option<String>,

    /// Extra Chrome flag (repeatable)
    #[arg(long = "chrome-flag")]
    pub chrome_flags: Vec<String>,
}

#[derive(Args)]
pub struct PeekArgs {
    /// Entries per buffer from the tail; 0 returns everything
    #[arg(long, default_value_t = 0)]
    pub last: u64,

    /// Comma-separated resource-type filter for the network slice
    #[arg(long = "type")]
    pub r#type: Option<String>,
}

#[derive(Args)]
pub struct DomArgs {
    #[command(subcommand)]
    pub command: DomCommand,
}

#[derive(Subcommand)]
pub enum DomCommand {
    /// Search the DOM by CSS selector and cache the results
    Query {
        /// CSS selector
        selector: String,
    },
    /// Show the Nth node of the last query
    Get {
        /// Zero-based index into the last query's results
        index: usize,
    },
    /// Click the Nth node of the last query
    Click {
        index: usize,
    },
    /// Fill the Nth node of the last query with a value
    Fill {
        index: usize,
        value: String,
    },
}

#[derive(Args)]
pub struct NetworkArgs {
    #[command(subcommand)]
    pub command: NetworkCommand,
}

#[derive(Subcommand)]
pub enum NetworkCommand {
    /// Fetch the response body of a captured request
    Body {
        /// CDP request id, as shown by `peek`
        request_id: String,
    },
}

#[derive(Args)]
pub struct NavigateArgs {
    /// URL to navigate to
    pub url: String,
}

#[derive(Args)]
pub struct CdpArgs {
    /// CDP method, e.g. `Page.captureScreenshot`
    pub method: String,

    /// JSON parameters for the method
    pub params: Option<String>,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

#[derive(Args)]
pub struct ManArgs {
    /// Subcommand to render; the top-level page when omitted
    pub command: Option<String>,
}
