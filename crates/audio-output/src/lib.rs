//! Audio output session over an async audio server.
//!
//! One [`Session`] manages one playback stream: format negotiation, the
//! Stopped/Playing/Paused lifecycle, deferred reconfiguration when the
//! format changes mid-stream, bidirectional volume sync, and synchronous
//! device enumeration. The server client library sits behind the traits in
//! [`server`]; [`backend::CpalBackend`] provides a CPAL-backed stand-in.

pub mod backend;
pub mod config;
pub mod error;
pub mod format;
pub mod player;
pub mod producer;
pub mod server;
pub mod session;

mod connection;
mod enumerate;
#[cfg(test)]
pub(crate) mod fake;

pub use config::{ConfigStore, OutputSettings};
pub use error::{OutputError, Result};
pub use player::{PlayerSource, TitleFormatter};
pub use producer::StreamCounters;
pub use session::{ClientFactory, Session};
