//! Error types for wgbridge
//!
//! This module defines the error types used throughout the crate. We use
//! `thiserror` for ergonomic error definitions. The error type is `Clone`
//! because listeners latch the first close error and replay it to every
//! blocked accept.

use thiserror::Error;

/// Main error type for wgbridge operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network stack setup errors (interface, routes, packet queues)
    #[error("Netstack error: {0}")]
    Netstack(String),

    /// Listen failures, carrying the stack engine's own description
    #[error("Listen error: {0}")]
    Listen(String),

    /// Dial failures, carrying the stack engine's own description
    #[error("Dial error: {0}")]
    Dial(String),

    /// UDP socket errors
    #[error("UDP error: {0}")]
    Udp(String),

    /// WireGuard protocol errors
    #[error("WireGuard error: {0}")]
    WireGuard(String),

    /// Control protocol decode errors
    #[error("Control protocol error: {0}")]
    Protocol(#[from] crate::uapi::ParseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// The listener or interface has been closed
    #[error("Closed")]
    Closed,

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Multiple close failures combined into one
    #[error("Shutdown errors: {0}")]
    Shutdown(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Whether this error marks intentional shutdown rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}
