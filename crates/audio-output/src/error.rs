//! Error taxonomy for the output session.
//!
//! Only structural failures appear here. Per-cycle recoverable conditions
//! (no server buffer this period, player underrun) are absorbed where they
//! occur and never interrupt the state machine.

use std::time::Duration;

use thiserror::Error;

/// Structural failures surfaced by the session API.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The requested bit depth has no server-side representation.
    #[error("no server sample format for {0}-bit audio")]
    UnsupportedBitDepth(u16),

    /// The server refused the connection.
    #[error("server refused connection: {reason} (check the remote name and that the server is running)")]
    Connect {
        /// Server-reported reason, when available.
        reason: String,
    },

    /// The connection thread is gone; the session must be re-opened.
    #[error("connection thread is not running")]
    Disconnected,

    /// The discovery sync barrier did not complete in time.
    #[error("device enumeration timed out after {0:?}")]
    EnumerationTimeout(Duration),

    /// A fault inside the server backend itself.
    #[error("server backend error: {0}")]
    Backend(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OutputError>;
