//! Host configuration surface.
//!
//! The host player owns a string/int key-value store; the session reads a
//! small set of named settings from it with defaults. Settings are loaded
//! into an [`OutputSettings`] snapshot so the real-time path never touches
//! the store.

use std::time::Duration;

/// Read-only key/value settings provided by the host player.
pub trait ConfigStore {
    /// String value for `key`, or `default` when unset.
    fn get_str(&self, key: &str, default: &str) -> String;
    /// Integer value for `key`, or `default` when unset.
    fn get_int(&self, key: &str, default: i64) -> i64;
}

/// Setting keys understood by the session.
pub mod keys {
    /// Target output device name; empty means the server default.
    pub const DEVICE: &str = "output.device";
    /// Remote server name; empty means the local server.
    pub const REMOTE: &str = "output.remote";
    /// Free-form `key=value` lines merged over the computed stream properties.
    pub const EXTRA_PROPS: &str = "output.extra_props";
    /// Whether the server controls amplitude instead of the player (0/1).
    pub const SERVER_VOLUME: &str = "output.server_volume";
    /// Target buffer latency in milliseconds.
    pub const BUFFER_MS: &str = "output.buffer_ms";
    /// Device enumeration sync-barrier timeout in milliseconds.
    pub const ENUM_TIMEOUT_MS: &str = "output.enum_timeout_ms";
}

/// Default buffer latency in milliseconds.
pub const DEFAULT_BUFFER_MS: u32 = 25;
/// Default enumeration timeout in milliseconds.
pub const DEFAULT_ENUM_TIMEOUT_MS: u64 = 5_000;

/// Snapshot of the session settings.
#[derive(Clone, Debug)]
pub struct OutputSettings {
    /// Target device name; `None` selects the server default.
    pub device: Option<String>,
    /// Remote server name; `None` selects the local server.
    pub remote: Option<String>,
    /// Raw `key=value` lines merged over computed stream properties.
    pub extra_props: String,
    /// Whether server-side volume control is enabled.
    pub server_volume: bool,
    /// Target buffer latency in milliseconds.
    pub buffer_ms: u32,
    /// Timeout for the enumeration sync barrier.
    pub enum_timeout: Duration,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            device: None,
            remote: None,
            extra_props: String::new(),
            server_volume: false,
            buffer_ms: DEFAULT_BUFFER_MS,
            enum_timeout: Duration::from_millis(DEFAULT_ENUM_TIMEOUT_MS),
        }
    }
}

impl OutputSettings {
    /// Read a settings snapshot from the host store.
    pub fn load(store: &dyn ConfigStore) -> Self {
        let device = non_empty(store.get_str(keys::DEVICE, ""));
        let remote = non_empty(store.get_str(keys::REMOTE, ""));
        let extra_props = store.get_str(keys::EXTRA_PROPS, "");
        let server_volume = store.get_int(keys::SERVER_VOLUME, 0) != 0;
        let buffer_ms = store
            .get_int(keys::BUFFER_MS, i64::from(DEFAULT_BUFFER_MS))
            .clamp(1, 10_000) as u32;
        let enum_timeout_ms = store
            .get_int(keys::ENUM_TIMEOUT_MS, DEFAULT_ENUM_TIMEOUT_MS as i64)
            .max(1) as u64;
        Self {
            device,
            remote,
            extra_props,
            server_volume,
            buffer_ms,
            enum_timeout: Duration::from_millis(enum_timeout_ms),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse free-form `key=value` lines into property pairs.
///
/// Lines without `=` and lines with an empty key are skipped. Whitespace
/// around keys and values is trimmed; values may contain further `=`.
pub fn parse_extra_props(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.push((key.to_string(), value.trim().to_string()));
    }
    out
}
