use crate::error::{AvrError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default telnet control port on Denon receivers
pub const DEFAULT_PORT: u16 = 23;

/// Connection settings for a receiver
///
/// Every timing knob of the connection task lives here. The defaults match
/// what the AVR-1912 needs in practice: mode switches can take one to two
/// seconds to be acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Address of the receiver, as `host:port`
    pub address: String,

    /// Hard limit on a single TCP dial attempt
    pub dial_timeout: Duration,

    /// How long a command waits for its response before reporting a timeout
    pub command_timeout: Duration,

    /// Fixed wait between a disconnect and the next dial
    pub reconnect_delay: Duration,

    /// Interval at which unsolicited traffic is drained between commands
    pub poll_interval: Duration,

    /// Deadline of each individual socket read while polling
    pub read_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: format!("localhost:{}", DEFAULT_PORT),
            dial_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            read_deadline: Duration::from_millis(10),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for the given `host:port` with default timings
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the per-command response timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the delay between a disconnect and the next dial
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the drain interval for unsolicited traffic
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the deadline of each socket read
    pub fn with_read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline = deadline;
        self
    }

    /// Check that the address has a `host:port` shape and the timings are usable
    pub fn validate(&self) -> Result<()> {
        validate_address(&self.address)?;

        if self.poll_interval.is_zero() {
            return Err(AvrError::Config("poll interval must be non-zero".to_string()));
        }
        if self.read_deadline.is_zero() {
            return Err(AvrError::Config("read deadline must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// Check that an address looks like `host:port`
pub(crate) fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AvrError::Config(format!("address {} is not host:port", address)))?;

    if host.is_empty() {
        return Err(AvrError::Config(format!("address {} has no host", address)));
    }

    port.parse::<u16>()
        .map_err(|_| AvrError::Config(format!("address {} has an invalid port", address)))?;

    Ok(())
}
