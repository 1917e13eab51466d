//! # linewire-client
//!
//! Single-connection request/response sessions over a byte stream.
//!
//! A [`Session`] sends one line-terminated message to `host:port` and
//! accumulates the response until a configured termination pattern shows
//! up or the peer closes the stream. Every `send` runs under a timeout and
//! can be cancelled; it resolves exactly once, with the response bytes or a
//! [`SessionError`].
//!
//! ## Architecture
//!
//! - **Session** (`session`): one task owns all state; `send`, `cancel`
//!   and transport events are applied to it in order
//! - **Transport** (`transport`): a [`Connector`] opens the stream, a
//!   [`TransportHandle`] runs one connection attempt and reports events
//! - **Accumulator** (`accumulator`): [`ReceiveBuffer`] collects bytes and
//!   checks termination patterns
//!
//! ## Example
//!
//! ```ignore
//! use linewire_client::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> linewire_client::Result<()> {
//!     let config = SessionConfig::builder()
//!         .termination_patterns(["OK", "ERROR"])
//!         .build()?;
//!     let session = Session::with_config("127.0.0.1", 7000, config);
//!
//!     let response = session.send("PING").await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod config;
pub mod error;
pub mod transport;

mod session;

pub use accumulator::ReceiveBuffer;
pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{Result, SessionError};
pub use session::{LinkPhase, Session, SessionStatus};
pub use transport::{Connector, TcpConnector, TransportHandle};
