//! Session configuration.
//!
//! Defaults match the protocol's reference values: a 256-stream backlog,
//! keepalive every 30 seconds with a 10 second write deadline, and a
//! 256 KiB per-stream window. Validation guards the invariants the session
//! relies on rather than every conceivable misuse.

use std::time::Duration;

use thiserror::Error;

use crate::frame::INITIAL_STREAM_WINDOW;

/// How backlog admission counts streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BacklogMode {
    /// Count every stream ever registered on the connection; the count
    /// never decreases, so a long-lived connection eventually stops
    /// accepting inbound streams once the backlog total is reached. This
    /// reproduces the reference implementation's accounting.
    #[default]
    Cumulative,
    /// Count only currently-registered streams. Streams that close free
    /// their slot.
    Live,
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of inbound streams admitted (see [`BacklogMode`]).
    pub accept_backlog: u32,
    /// Admission accounting mode.
    pub backlog_mode: BacklogMode,
    /// Whether to send periodic pings.
    pub enable_keep_alive: bool,
    /// Interval between keepalive pings.
    pub keep_alive_interval: Duration,
    /// Deadline for ping acknowledgements and for a writer blocked on a
    /// zero send window.
    pub connection_write_timeout: Duration,
    /// Largest receive window a stream may grow to.
    pub max_stream_window_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            backlog_mode: BacklogMode::default(),
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(10),
            max_stream_window_size: INITIAL_STREAM_WINDOW,
        }
    }
}

impl Config {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accept backlog.
    #[must_use]
    pub fn with_accept_backlog(mut self, backlog: u32) -> Self {
        self.accept_backlog = backlog;
        self
    }

    /// Set the backlog accounting mode.
    #[must_use]
    pub fn with_backlog_mode(mut self, mode: BacklogMode) -> Self {
        self.backlog_mode = mode;
        self
    }

    /// Enable or disable keepalive pings.
    #[must_use]
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.enable_keep_alive = enabled;
        self
    }

    /// Set the keepalive interval.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the connection write timeout.
    #[must_use]
    pub fn with_connection_write_timeout(mut self, timeout: Duration) -> Self {
        self.connection_write_timeout = timeout;
        self
    }

    /// Set the maximum per-stream window size.
    #[must_use]
    pub fn with_max_stream_window_size(mut self, size: u32) -> Self {
        self.max_stream_window_size = size;
        self
    }

    /// Validate invariants the session depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        if self.enable_keep_alive && self.keep_alive_interval.is_zero() {
            return Err(ConfigError::ZeroKeepAliveInterval);
        }
        if self.connection_write_timeout.is_zero() {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        if self.max_stream_window_size < INITIAL_STREAM_WINDOW {
            return Err(ConfigError::WindowBelowInitial(self.max_stream_window_size));
        }
        Ok(())
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `accept_backlog` must admit at least one stream.
    #[error("accept backlog must be at least 1")]
    ZeroBacklog,

    /// A zero keepalive interval would spin.
    #[error("keepalive interval must be non-zero")]
    ZeroKeepAliveInterval,

    /// A zero write timeout would fail every blocked write immediately.
    #[error("connection write timeout must be non-zero")]
    ZeroWriteTimeout,

    /// Streams start with the initial window; a smaller maximum could never
    /// be honored.
    #[error("max stream window size {0} is below the initial window")]
    WindowBelowInitial(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn default_values_match_reference() {
        let config = Config::default();
        assert_eq!(config.accept_backlog, 256);
        assert_eq!(config.backlog_mode, BacklogMode::Cumulative);
        assert!(config.enable_keep_alive);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.connection_write_timeout, Duration::from_secs(10));
        assert_eq!(config.max_stream_window_size, 256 * 1024);
    }

    #[test]
    fn builder_chains() {
        let config = Config::new()
            .with_accept_backlog(8)
            .with_backlog_mode(BacklogMode::Live)
            .with_keep_alive(false)
            .with_keep_alive_interval(Duration::from_millis(100))
            .with_connection_write_timeout(Duration::from_millis(500))
            .with_max_stream_window_size(512 * 1024);

        assert_eq!(config.accept_backlog, 8);
        assert_eq!(config.backlog_mode, BacklogMode::Live);
        assert!(!config.enable_keep_alive);
        assert_eq!(config.keep_alive_interval, Duration::from_millis(100));
        assert_eq!(config.connection_write_timeout, Duration::from_millis(500));
        assert_eq!(config.max_stream_window_size, 512 * 1024);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_degenerate_values() {
        assert_eq!(
            Config::new().with_accept_backlog(0).validate(),
            Err(ConfigError::ZeroBacklog)
        );
        assert_eq!(
            Config::new()
                .with_keep_alive_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroKeepAliveInterval)
        );
        assert_eq!(
            Config::new()
                .with_connection_write_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroWriteTimeout)
        );
        assert_eq!(
            Config::new().with_max_stream_window_size(1024).validate(),
            Err(ConfigError::WindowBelowInitial(1024))
        );
    }

    #[test]
    fn keep_alive_disabled_ignores_interval() {
        let config = Config::new()
            .with_keep_alive(false)
            .with_keep_alive_interval(Duration::ZERO);
        assert_eq!(config.validate(), Ok(()));
    }
}
