//! Transport module - the byte-stream collaborator behind a session.
//!
//! A [`Connector`] opens one stream to `host:port`. A [`TransportHandle`]
//! owns one connection attempt: it connects, reports lifecycle events, and
//! performs the sends and receives the session asks for. Every event is
//! tagged with the handle's id, so the session can discard events from a
//! handle it has already torn down.
//!
//! # Custom transports
//!
//! Any `AsyncRead + AsyncWrite` stream can back a session:
//!
//! ```ignore
//! use async_trait::async_trait;
//! use linewire_client::transport::{ConnectProgress, Connector};
//!
//! struct UnixConnector;
//!
//! #[async_trait]
//! impl Connector for UnixConnector {
//!     type Stream = tokio::net::UnixStream;
//!
//!     async fn connect(
//!         &self,
//!         host: &str,
//!         _port: u16,
//!         _progress: &ConnectProgress,
//!     ) -> std::io::Result<Self::Stream> {
//!         tokio::net::UnixStream::connect(host).await
//!     }
//! }
//! ```

mod handle;
mod tcp;
mod writer;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use handle::TransportHandle;
pub use tcp::TcpConnector;

/// Identifies one connection attempt within a session.
pub type HandleId = u64;

/// Opens the underlying byte stream for a handle.
///
/// Returning an error of kind [`io::ErrorKind::Interrupted`] reports the
/// attempt as cancelled rather than failed.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connected stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `host:port`.
    ///
    /// Transient problems that do not end the attempt (for example one of
    /// several resolved addresses refusing) can be reported through
    /// `progress`.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        progress: &ConnectProgress,
    ) -> io::Result<Self::Stream>;
}

/// Channel for a connector to report transient conditions while connecting.
#[derive(Debug, Clone)]
pub struct ConnectProgress {
    id: HandleId,
    events: mpsc::UnboundedSender<HandleEvent>,
}

impl ConnectProgress {
    pub(crate) fn new(id: HandleId, events: mpsc::UnboundedSender<HandleEvent>) -> Self {
        Self { id, events }
    }

    /// Id of the handle this attempt belongs to.
    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    /// Report a transient error; the attempt continues.
    pub fn waiting(&self, error: io::Error) {
        let _ = self.events.send(HandleEvent {
            id: self.id,
            event: TransportEvent::Waiting(error),
        });
    }
}

/// Result of a single receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Bytes read (may be empty).
    pub data: Bytes,
    /// The peer closed its side; no more data will follow.
    pub is_complete: bool,
}

/// Lifecycle and I/O notifications from a transport handle.
#[derive(Debug)]
pub enum TransportEvent {
    /// Transient condition; the handle may still become ready.
    Waiting(io::Error),
    /// Connected; sends and receives may be issued.
    Ready,
    /// The connection attempt failed.
    Failed(io::Error),
    /// The attempt was cancelled before it completed.
    Cancelled,
    /// A write finished; carries the number of bytes written.
    Sent(usize),
    /// A write failed.
    SendFailed(io::Error),
    /// A receive finished.
    Received(Received),
    /// A receive failed.
    ReceiveFailed(io::Error),
}

/// A [`TransportEvent`] tagged with the handle that produced it.
#[derive(Debug)]
pub struct HandleEvent {
    pub id: HandleId,
    pub event: TransportEvent,
}
