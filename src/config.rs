//! Session configuration.
//!
//! [`SessionConfig`] is immutable once built. Use [`SessionConfig::builder`]
//! to override individual values, or [`SessionConfig::from_json`] to load
//! one from a JSON document. Missing JSON fields fall back to the defaults.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use linewire_client::SessionConfig;
//!
//! let config = SessionConfig::builder()
//!     .connection_timeout(Duration::from_secs(2))
//!     .termination_patterns(["OK", "ERROR"])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.receive_chunk_size(), 8192);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Default operation timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum bytes requested per receive.
pub const DEFAULT_RECEIVE_CHUNK_SIZE: usize = 8192;

/// Default termination patterns.
pub const DEFAULT_TERMINATION_PATTERNS: [&str; 2] = ["end", "err"];

/// Default terminator appended to every outgoing message.
pub const DEFAULT_LINE_TERMINATOR: &str = "\n";

/// Immutable configuration shared read-only by a session.
///
/// Deserializing validates, so a `SessionConfig` obtained through serde is
/// as trustworthy as one from the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSessionConfig")]
pub struct SessionConfig {
    /// Timeout applied to `send` when the caller does not pass one.
    #[serde(rename = "connection_timeout_ms", with = "duration_millis")]
    connection_timeout: Duration,
    /// Maximum bytes requested from the transport per receive.
    receive_chunk_size: usize,
    /// Substrings that end the receive loop, checked in order.
    termination_patterns: Vec<String>,
    /// Appended to the message before it is written.
    line_terminator: String,
    /// Whether a bare pattern matches, or only `"<pattern> <message>"`.
    match_bare_pattern: bool,
}

/// Wire form of [`SessionConfig`] before validation.
#[derive(Deserialize)]
#[serde(default)]
struct RawSessionConfig {
    #[serde(rename = "connection_timeout_ms", with = "duration_millis")]
    connection_timeout: Duration,
    #[serde(alias = "receive_buffer_size")]
    receive_chunk_size: usize,
    termination_patterns: Vec<String>,
    line_terminator: String,
    match_bare_pattern: bool,
}

impl Default for RawSessionConfig {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            connection_timeout: defaults.connection_timeout,
            receive_chunk_size: defaults.receive_chunk_size,
            termination_patterns: defaults.termination_patterns,
            line_terminator: defaults.line_terminator,
            match_bare_pattern: defaults.match_bare_pattern,
        }
    }
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = SessionError;

    fn try_from(raw: RawSessionConfig) -> Result<Self> {
        let config = SessionConfig {
            connection_timeout: raw.connection_timeout,
            receive_chunk_size: raw.receive_chunk_size,
            termination_patterns: raw.termination_patterns,
            line_terminator: raw.line_terminator,
            match_bare_pattern: raw.match_bare_pattern,
        };
        config.validate()?;
        Ok(config)
    }
}

impl SessionConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawSessionConfig = serde_json::from_str(json)?;
        SessionConfig::try_from(raw)
    }

    /// Check the invariants the session relies on.
    pub fn validate(&self) -> Result<()> {
        if self.receive_chunk_size == 0 {
            return Err(SessionError::InvalidConfig(
                "receive chunk size must be positive".into(),
            ));
        }
        if let Some(index) = self.termination_patterns.iter().position(|p| p.is_empty()) {
            return Err(SessionError::InvalidConfig(format!(
                "termination pattern {} is empty",
                index
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    #[inline]
    pub fn receive_chunk_size(&self) -> usize {
        self.receive_chunk_size
    }

    #[inline]
    pub fn termination_patterns(&self) -> &[String] {
        &self.termination_patterns
    }

    #[inline]
    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    #[inline]
    pub fn match_bare_pattern(&self) -> bool {
        self.match_bare_pattern
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            receive_chunk_size: DEFAULT_RECEIVE_CHUNK_SIZE,
            termination_patterns: DEFAULT_TERMINATION_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            line_terminator: DEFAULT_LINE_TERMINATOR.to_string(),
            match_bare_pattern: true,
        }
    }
}

/// Fluent builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default operation timeout.
    ///
    /// Default: 5 seconds
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the maximum bytes requested per receive.
    ///
    /// Default: 8192
    pub fn receive_chunk_size(mut self, size: usize) -> Self {
        self.config.receive_chunk_size = size;
        self
    }

    /// Replace the termination patterns.
    ///
    /// An empty list means the response only ends with the stream.
    /// Default: `["end", "err"]`
    pub fn termination_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.termination_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the terminator appended to outgoing messages.
    ///
    /// Default: `"\n"`
    pub fn line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.config.line_terminator = terminator.into();
        self
    }

    /// Only terminate on `"<pattern> <message>"` when set to `false`.
    ///
    /// Generic patterns such as `"err"` otherwise match inside ordinary
    /// payload text. Default: `true`
    pub fn match_bare_pattern(mut self, enabled: bool) -> Self {
        self.config.match_bare_pattern = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
