//! Rust library for controlling Denon AVR receivers
//!
//! This library speaks the line-oriented control protocol that Denon
//! receivers (AVR-1912 and relatives) expose on their telnet port. It
//! supports:
//!
//! - Power on and standby
//! - Input source selection
//! - Surround mode selection
//! - Master volume, using the level shown on the front panel
//! - Unsolicited status updates pushed by the receiver
//!
//! # Quick Start
//!
//! ```no_run
//! use denon_avr::DenonAvr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let avr = DenonAvr::new("192.168.1.40:23")?;
//!
//!     println!("power: {}", avr.power().await?);
//!     println!("input: {}", avr.input_source().await?);
//!     println!("volume: {}", avr.volume_up().await?);
//!
//!     avr.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: the public command set, decoding answers for display
//! - **Connection**: one background task that owns the socket, writes one
//!   command at a time, matches answers and reconnects after failures
//! - **Protocol**: command families, command encoding and response matching
//! - **Volume**: conversion between front-panel levels and wire values
//! - **Fake**: an in-process receiver for tests and local development

mod client;
mod config;
mod connection;
mod error;
pub mod fake;
mod protocol;
mod subscription;
pub mod volume;

// Public exports
pub use client::{display_or_failed, DenonAvr, FAILED};
pub use config::{ConnectionConfig, DEFAULT_PORT};
pub use connection::Connection;
pub use error::{AvrError, Result};
pub use protocol::{to_bytes, AnyLine, Command, Family, FamilyMatcher, ResponseMatcher, QUERY, TERMINATOR};
pub use subscription::{DeviceEvent, EventReceiver};
