use thiserror::Error;

/// Result type for AVR operations
pub type Result<T> = std::result::Result<T, AvrError>;

/// Errors that can occur when talking to a Denon receiver
#[derive(Error, Debug)]
pub enum AvrError {
    /// I/O error on the control socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection was shut down, or dropped before a reply was delivered
    #[error("Connection closed")]
    ConnectionClosed,

    /// The receiver did not answer the command in time
    #[error("Request timeout")]
    Timeout,

    /// A volume level that could not be parsed as a decimal
    #[error("Invalid volume level: {0}")]
    InvalidVolume(String),

    /// Invalid connection configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
