use std::collections::HashSet;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::error::CdpError;
use super::transport::{TransportCommand, TransportHandle, spawn_transport};
use super::types::CdpEvent;

/// Configuration for a CDP connection.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket connection (default: 10s).
    pub connect_timeout: Duration,
    /// Timeout for individual CDP commands (default: 30s).
    pub command_timeout: Duration,
    /// Capacity of the internal command channel (default: 256).
    pub channel_capacity: usize,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// A CDP connection attached directly to one page target.
///
/// The worker owns exactly one of these for the lifetime of the session.
/// Commands and event subscriptions go through a background transport task
/// that owns the WebSocket. Domains are enabled lazily and at most once.
#[derive(Debug)]
pub struct CdpConnection {
    handle: TransportHandle,
    config: CdpConfig,
    enabled_domains: Mutex<HashSet<String>>,
}

impl CdpConnection {
    /// Connect to a page target's CDP WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` if the WebSocket handshake fails, or
    /// `CdpError::ConnectionTimeout` if the attempt exceeds the configured
    /// timeout.
    pub async fn connect(url: &str, config: CdpConfig) -> Result<Self, CdpError> {
        let handle =
            spawn_transport(url, config.channel_capacity, config.connect_timeout).await?;

        Ok(Self {
            handle,
            config,
            enabled_domains: Mutex::new(HashSet::new()),
        })
    }

    /// Send a CDP command and await its response.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CommandTimeout` if Chrome does not respond within
    /// the configured timeout, `CdpError::Protocol` if Chrome returns an
    /// error, or `CdpError::Internal` if the transport task has exited.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        let id = self.handle.next_message_id();
        let command = super::types::CdpCommand {
            id,
            method: method.to_owned(),
            params,
        };

        let (response_tx, response_rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.command_timeout;

        self.handle
            .send(TransportCommand::SendCommand {
                command,
                response_tx,
                deadline,
            })
            .await?;

        response_rx
            .await
            .map_err(|_| CdpError::Internal("transport task exited before responding".into()))?
    }

    /// Ensure a CDP domain is enabled, sending `{domain}.enable` only the
    /// first time it is requested on this connection.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if the enable command fails.
    pub async fn ensure_domain(&self, domain: &str) -> Result<(), CdpError> {
        {
            let enabled = self.enabled_domains.lock().await;
            if enabled.contains(domain) {
                return Ok(());
            }
        }
        let method = format!("{domain}.enable");
        self.send_command(&method, None).await?;
        self.enabled_domains.lock().await.insert(domain.to_owned());
        Ok(())
    }

    /// Subscribe to CDP events matching a method name.
    ///
    /// Returns a receiver yielding `CdpEvent` values. Delivery stops when the
    /// receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        self.handle
            .send(TransportCommand::Subscribe {
                method: method.to_owned(),
                event_tx,
            })
            .await?;
        Ok(event_rx)
    }

    /// Gracefully close the WebSocket connection.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has already exited.
    pub async fn close(&self) -> Result<(), CdpError> {
        self.handle.send(TransportCommand::Shutdown).await
    }

    /// Resolve once the underlying WebSocket has closed, for any reason.
    pub async fn wait_closed(&self) {
        self.handle.wait_closed().await;
    }

    /// Check if the connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}
