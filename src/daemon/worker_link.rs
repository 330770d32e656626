//! Spawning the worker process and framing its stdin/stdout pipe.
//!
//! The link's write half carries command envelopes; a reader task drains the
//! worker's stdout into classified `WorkerMessage`s for the router. The
//! spawner is a trait so the router can be driven by a scripted fake worker
//! in tests.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chrome::kill_process_group;
use crate::ipc::{RawWorkerMessage, StartSessionConfig, WorkerMessage};

/// Environment variable carrying the start configuration to the worker.
pub const WORKER_CONFIG_ENV: &str = "BDG_WORKER_CONFIG";

/// The write half of the worker pipe plus process control.
pub struct WorkerLink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    pid: u32,
}

impl WorkerLink {
    /// Wrap an arbitrary writer; used by tests and by `ProcessSpawner`.
    #[must_use]
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>, child: Option<Child>, pid: u32) -> Self {
        Self { writer, child, pid }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write one envelope as a JSON line to the worker's stdin.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the pipe is gone.
    pub async fn send_value(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Forcibly terminate the worker and its process group.
    pub fn kill(&mut self) {
        if self.pid != 0 {
            kill_process_group(self.pid);
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// True once the worker process has exited (always true for test links
    /// with no child).
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }
}

/// A spawned worker: the command link plus the classified message stream.
pub struct SpawnedWorker {
    pub link: WorkerLink,
    pub messages: mpsc::Receiver<WorkerMessage>,
}

/// How the router obtains a worker.
pub trait WorkerSpawner {
    /// Spawn a worker for the given session configuration.
    fn spawn(
        &self,
        config: &StartSessionConfig,
    ) -> impl Future<Output = Result<SpawnedWorker, String>> + Send;
}

/// Spawns `bdg worker` as a child process in its own process group.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, config: &StartSessionConfig) -> Result<SpawnedWorker, String> {
        let exe = std::env::current_exe().map_err(|e| format!("current_exe: {e}"))?;
        let config_json =
            serde_json::to_string(config).map_err(|e| format!("serialize config: {e}"))?;

        let mut command = Command::new(exe);
        command
            .arg("worker")
            .env(WORKER_CONFIG_ENV, config_json)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| format!("spawn worker: {e}"))?;
        let pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "worker stdin unavailable".to_owned())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "worker stdout unavailable".to_owned())?;

        let messages = spawn_reader(stdout);
        Ok(SpawnedWorker {
            link: WorkerLink::new(Box::new(stdin), Some(child), pid),
            messages,
        })
    }
}

/// Drain a worker stdout stream into classified messages.
///
/// The channel closes when the stream reaches EOF, which is how the router
/// learns the worker is gone.
pub fn spawn_reader<R>(reader: R) -> mpsc::Receiver<WorkerMessage>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RawWorkerMessage>(&line) {
                        Ok(raw) => {
                            if let Some(message) = raw.classify() {
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            } else {
                                warn!(line, "unclassifiable worker message");
                            }
                        }
                        Err(e) => warn!(%e, "malformed worker output line"),
                    }
                }
                Ok(None) => {
                    debug!("worker stdout reached EOF");
                    return;
                }
                Err(e) => {
                    warn!(%e, "worker stdout read error");
                    return;
                }
            }
        }
    });
    rx
}
