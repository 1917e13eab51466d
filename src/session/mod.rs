//! Session controller: `send` and `cancel` against one host and port.
//!
//! A [`Session`] is a cheap, cloneable front for a task that owns all
//! session state. Each `send` writes one line-terminated
//! message and resolves with the response bytes once a termination pattern
//! appears or the peer closes the stream, whichever comes first, unless the
//! timeout or a `cancel` gets there before.
//!
//! At most one `send` is in flight per session; a concurrent `send` fails
//! with [`SessionError::InvalidState`] instead of queueing.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use linewire_client::Session;
//!
//! #[tokio::main]
//! async fn main() -> linewire_client::Result<()> {
//!     let session = Session::new("127.0.0.1", 7000);
//!
//!     let response = session.send("status").await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!
//!     // A second request gets a fresh connection.
//!     let response = session
//!         .send_with_timeout("stats", Duration::from_secs(1))
//!         .await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!     Ok(())
//! }
//! ```

mod state;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::{Connector, TcpConnector};

use state::Command;

/// Extra time the caller waits beyond the timeout before giving up on the
/// session task and failing closed.
const FAIL_CLOSED_GRACE: Duration = Duration::from_secs(1);

/// Phase of the session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No handle; the next `send` creates one.
    NotConnected,
    /// A handle is connecting.
    Connecting,
    /// Connected; a request is being written or its response read.
    Ready,
    /// The last handle failed and was torn down.
    Failed,
    /// The last handle was cancelled (or timed out) and torn down.
    Cancelled,
}

/// Snapshot of a session's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Phase of the current (or last) connection.
    pub link: LinkPhase,
    /// A `send` is waiting for its result.
    pub in_progress: bool,
    /// Response bytes accumulated so far for the current `send`.
    pub buffered: usize,
}

/// Client session for one `host:port`.
///
/// Clones share the same underlying session. The session stops, closing any
/// open connection, once every clone is dropped.
#[derive(Clone)]
pub struct Session {
    host: Arc<str>,
    port: u16,
    config: Arc<SessionConfig>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Create a TCP session with the default configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(host, port, SessionConfig::default())
    }

    /// Create a TCP session with a custom configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(host: impl Into<String>, port: u16, config: SessionConfig) -> Self {
        Self::with_connector(host, port, config, TcpConnector::new())
    }

    /// Create a session over a custom transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_connector<C: Connector>(
        host: impl Into<String>,
        port: u16,
        config: SessionConfig,
        connector: C,
    ) -> Self {
        let host: String = host.into();
        let config = Arc::new(config);
        let commands = state::spawn(host.clone(), port, config.clone(), Arc::new(connector));

        Self {
            host: host.into(),
            port,
            config,
            commands,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send `message` and wait for the response, using the configured
    /// timeout.
    pub async fn send(&self, message: impl Into<String>) -> Result<Bytes> {
        self.send_with_timeout(message, self.config.connection_timeout())
            .await
    }

    /// Send `message` and wait at most `timeout` for the response.
    ///
    /// Partial response bytes are discarded when the operation fails.
    pub async fn send_with_timeout(
        &self,
        message: impl Into<String>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send {
                message: message.into(),
                timeout,
                reply,
            })
            .map_err(|_| SessionError::InvalidState("session has stopped".into()))?;

        match tokio::time::timeout(timeout.saturating_add(FAIL_CLOSED_GRACE), result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::warn!("Session dropped an operation without resolving it");
                Err(SessionError::Timeout)
            }
            Err(_) => {
                tracing::warn!("No result from session within {:?}; failing closed", timeout);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Cancel the in-flight `send`, if any, and close the connection.
    ///
    /// Never blocks and never fails; calling it again is a no-op.
    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel).is_err() {
            tracing::debug!("Cancel on a stopped session");
        }
    }

    /// Current state of the session.
    pub async fn status(&self) -> Result<SessionStatus> {
        let (reply, status) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| SessionError::InvalidState("session has stopped".into()))?;
        status
            .await
            .map_err(|_| SessionError::InvalidState("session has stopped".into()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
