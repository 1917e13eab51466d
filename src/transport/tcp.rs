//! TCP connector.
//!
//! Resolves the host with the runtime's resolver and tries each address in
//! order. Every failed address except the last is reported as a transient
//! `Waiting` condition; the last failure ends the attempt.
//!
//! # Example
//!
//! ```ignore
//! use linewire_client::{Session, SessionConfig, TcpConnector};
//!
//! let session = Session::with_connector(
//!     "localhost",
//!     7000,
//!     SessionConfig::default(),
//!     TcpConnector::new().nodelay(true),
//! );
//! ```

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};

use super::{ConnectProgress, Connector};

/// Default [`Connector`] over `tokio::net::TcpStream`.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector with default socket options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `TCP_NODELAY` on connected sockets.
    ///
    /// Default: false
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    fn configure(&self, stream: TcpStream) -> io::Result<TcpStream> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        progress: &ConnectProgress,
    ) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();

        let (last, rest) = addrs.split_last().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}:{}", host, port),
            )
        })?;

        for addr in rest {
            match TcpStream::connect(addr).await {
                Ok(stream) => return self.configure(stream),
                Err(e) => {
                    tracing::warn!("Connect to {} failed, trying next address: {}", addr, e);
                    progress.waiting(e);
                }
            }
        }

        let stream = TcpStream::connect(last).await?;
        self.configure(stream)
    }
}
