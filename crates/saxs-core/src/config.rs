//! Per-connection configuration.
//!
//! Durations are written in humantime notation (`"500ms"`, `"2s"`).
//!
//! ```toml
//! address = "192.168.1.10:41234"
//! read_timeout = "2s"
//! put_back = true
//!
//! [retry]
//! max_attempts = 3
//! backoff_delay = "50ms"
//! ```

use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport and timing settings for one instrument connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `host:port` of the instrument.
    pub address: String,

    /// Bound on opening the transport.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bound on waiting for a reply.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Bound on writing one command.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// How long the collector blocks on the transport per iteration. Also the
    /// worst-case latency for the collector to notice a stop request.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often the property poller wakes to look for due properties.
    #[serde(with = "humantime_serde")]
    pub poller_tick: Duration,

    /// Give an unmatched reply one more chance with another waiter instead of
    /// failing the wait with a protocol error.
    pub put_back: bool,

    /// Register bus unit id.
    pub unit_id: u8,

    /// Retry policy applied by device operations.
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            poller_tick: Duration::from_millis(250),
            put_back: true,
            unit_id: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Defaults with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Check that the address looks like `host:port` and timeouts are non-zero.
    pub fn validate(&self) -> CoreResult<()> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| CoreError::Config(format!("address {:?} is not host:port", self.address)))?;
        if host.is_empty() {
            return Err(CoreError::Config(format!(
                "address {:?} has an empty host",
                self.address
            )));
        }
        port.parse::<u16>().map_err(|_| {
            CoreError::Config(format!("address {:?} has an invalid port", self.address))
        })?;

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("poll_interval", self.poll_interval),
            ("poller_tick", self.poller_tick),
        ] {
            if value.is_zero() {
                return Err(CoreError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
