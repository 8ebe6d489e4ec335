//! Autosync Core - Shared types, configuration, and callback protocol
//!
//! This crate contains the foundational types used by the autosync daemon.
//! It has no dependencies on sockets, gateways, or the clock.

pub mod config;
pub mod error;
pub mod netrange;
pub mod protocol;
pub mod schedule;

pub use config::{CommandsConfig, Config, SmtpConfig};
pub use error::*;
pub use protocol::*;
pub use schedule::*;

/// Default callback marker (secret path segment)
pub const DEFAULT_CALLBACK_MARKER: &str = "bunq2ynab-autosync";

/// Maximum bytes read from a callback connection
pub const CALLBACK_BUFFER_SIZE: usize = 4096;

/// Number of random candidates tried when binding or mapping a port
pub const MAX_PORT_ATTEMPTS: usize = 128;

/// Lowest port handed out by random selection
pub const MIN_RANDOM_PORT: u16 = 1025;

/// Highest port handed out by random selection
pub const MAX_RANDOM_PORT: u16 = 65535;

/// Standard HTTPS port; callback URLs omit it
pub const HTTPS_PORT: u16 = 443;
