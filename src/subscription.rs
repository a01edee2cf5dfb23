use crate::error::{AvrError, Result};
use crate::protocol::Family;
use tokio::sync::broadcast;

/// A line the receiver sent that did not answer any pending command
///
/// These are heartbeats and asynchronous status pushes, e.g. `PWSTANDBY`
/// after someone pressed the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// The raw line, without terminator
    pub line: String,
}

impl DeviceEvent {
    pub(crate) fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// The command family the line belongs to, if it carries a known prefix
    pub fn family(&self) -> Option<Family> {
        [
            Family::Power,
            Family::InputSource,
            Family::SurroundMode,
            Family::MasterVolume,
        ]
        .into_iter()
        .find(|family| self.line.starts_with(family.prefix()))
    }

    /// The line with its two letter prefix removed
    pub fn value(&self) -> &str {
        self.line.get(2..).unwrap_or_default()
    }
}

/// Receiver for unsolicited receiver events
pub struct EventReceiver {
    rx: broadcast::Receiver<DeviceEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<DeviceEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Returns `ConnectionClosed` once the connection has shut down.
    pub async fn recv(&mut self) -> Result<DeviceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Closed) => return Err(AvrError::ConnectionClosed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event receiver lagged by {} events", n);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available. Lagging skips to the oldest
    /// event still buffered.
    pub fn try_recv(&mut self) -> Result<Option<DeviceEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(AvrError::ConnectionClosed)
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("event receiver lagged by {} events", n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_family_and_value() {
        let event = DeviceEvent::new("PWSTANDBY");
        assert_eq!(event.family(), Some(Family::Power));
        assert_eq!(event.value(), "STANDBY");

        let banner = DeviceEvent::new("Fake AVR1912 Telnet server");
        assert_eq!(banner.family(), None);
    }

    #[tokio::test]
    async fn receiver_reports_closed_channel() {
        let (tx, rx) = broadcast::channel(4);
        let mut events = EventReceiver::new(rx);

        tx.send(DeviceEvent::new("MSSTEREO")).unwrap();
        assert_eq!(events.try_recv().unwrap(), Some(DeviceEvent::new("MSSTEREO")));
        assert_eq!(events.try_recv().unwrap(), None);

        drop(tx);
        assert!(matches!(events.recv().await, Err(AvrError::ConnectionClosed)));
    }
}
