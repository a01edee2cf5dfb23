use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{AvrError, Result};
use crate::protocol::{strip_prefix, Command, Family};
use crate::subscription::EventReceiver;
use crate::volume;

/// Text front-ends show in place of a value when a command fails
pub const FAILED: &str = "FAILED";

/// Map a command result to the text a front-end displays
pub fn display_or_failed(result: Result<String>) -> String {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("command failed: {}", e);
            FAILED.to_string()
        }
    }
}

/// Client for a Denon AVR-1912 (and compatible) receiver
///
/// Every method sends one command, waits for the receiver's answer and
/// returns the value it now displays, without the two letter prefix. The
/// connection is made and kept alive in the background, so a method called
/// while the receiver is unreachable waits until it is reachable again.
///
/// # Example
///
/// ```no_run
/// use denon_avr::DenonAvr;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let avr = DenonAvr::new("192.168.1.40:23")?;
///
///     avr.power_on().await?;
///     avr.set_input_source("dvd").await?;
///     println!("volume is {}", avr.set_volume("35.5").await?);
///
///     avr.close().await;
///     Ok(())
/// }
/// ```
pub struct DenonAvr {
    conn: Connection,
}

impl DenonAvr {
    /// Connect to a receiver at `host:port` with default timings
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        Self::with_config(ConnectionConfig::new(addr))
    }

    /// Connect with explicit connection settings
    pub fn with_config(config: ConnectionConfig) -> Result<Self> {
        Ok(Self {
            conn: Connection::start(config)?,
        })
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Subscribe to status changes the receiver reports on its own
    pub fn subscribe_events(&self) -> Result<EventReceiver> {
        self.conn.subscribe()
    }

    // ========== Power ==========

    /// Query the power state (`ON` or `STANDBY`)
    pub async fn power(&self) -> Result<String> {
        self.send(Command::query(Family::Power)).await
    }

    /// Turn the receiver on
    pub async fn power_on(&self) -> Result<String> {
        self.send(Command::new(Family::Power, "ON")).await
    }

    /// Put the receiver into standby
    pub async fn standby(&self) -> Result<String> {
        self.send(Command::new(Family::Power, "STANDBY")).await
    }

    // ========== Input Source ==========

    /// Query the selected input source
    pub async fn input_source(&self) -> Result<String> {
        self.send(Command::query(Family::InputSource)).await
    }

    /// Select an input source, e.g. `DVD` or `TUNER`
    pub async fn set_input_source(&self, input: &str) -> Result<String> {
        self.send(Command::from_text(Family::InputSource, input))
            .await
    }

    // ========== Surround Mode ==========

    /// Query the surround mode
    pub async fn surround_mode(&self) -> Result<String> {
        self.send(Command::query(Family::SurroundMode)).await
    }

    /// Select a surround mode, e.g. `STEREO` or `DOLBY DIGITAL`
    pub async fn set_surround_mode(&self, mode: &str) -> Result<String> {
        self.send(Command::from_text(Family::SurroundMode, mode))
            .await
    }

    // ========== Volume ==========

    /// Query the master volume, as shown on the front panel (e.g. `40.5`)
    pub async fn volume(&self) -> Result<String> {
        self.send_volume("?").await
    }

    /// Raise the volume by one step
    pub async fn volume_up(&self) -> Result<String> {
        self.send_volume("UP").await
    }

    /// Lower the volume by one step
    pub async fn volume_down(&self) -> Result<String> {
        self.send_volume("DOWN").await
    }

    /// Set the master volume to a front-panel level in [0, 80]
    ///
    /// The level is converted to device units, which are truncated toward
    /// zero onto a multiple of 5.
    pub async fn set_volume(&self, level: &str) -> Result<String> {
        let units = volume::encode(level);
        if units == volume::INVALID_LEVEL {
            return Err(AvrError::InvalidVolume(level.to_string()));
        }

        self.send_volume(&units.to_string()).await
    }

    /// Shut the connection down; further calls fail with `ConnectionClosed`
    pub async fn close(&self) {
        self.conn.close().await;
    }

    async fn send_volume(&self, argument: &str) -> Result<String> {
        let value = self
            .send(Command::new(Family::MasterVolume, argument))
            .await?;
        Ok(volume::decode(&value))
    }

    /// Send a command and strip the family prefix from the answer
    async fn send(&self, command: Command) -> Result<String> {
        let matcher = command.family().matcher();
        let line = self.conn.request(command, matcher).await?;
        Ok(strip_prefix(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_maps_errors_to_failed() {
        assert_eq!(display_or_failed(Ok("STANDBY".to_string())), "STANDBY");
        assert_eq!(display_or_failed(Err(AvrError::Timeout)), FAILED);
        assert_eq!(display_or_failed(Err(AvrError::ConnectionClosed)), FAILED);
    }

    #[tokio::test]
    async fn set_volume_rejects_garbage_without_sending() {
        let avr = DenonAvr::new("127.0.0.1:1").unwrap();
        let err = avr.set_volume("loud").await.unwrap_err();
        assert!(matches!(err, AvrError::InvalidVolume(level) if level == "loud"));
        avr.close().await;
    }
}
