//! Shared plain types for the audio output session.
//!
//! These are the logical types exchanged with the host player: the PCM format
//! it asks for, the three-valued playback state it observes, track metadata
//! for display strings, and device metadata returned by enumeration.

use serde::{Deserialize, Serialize};

/// Logical PCM format as described by the player.
///
/// This is the *requested* shape of the stream, before negotiation. A zeroed
/// format (notably `channels == 0`) is valid input and negotiates to the
/// generic default (16-bit stereo 44100 Hz).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcmFormat {
    /// Bits per sample (8, 16, 24, or 32).
    pub bps: u16,
    /// `true` when 32-bit samples are IEEE float rather than signed int.
    pub is_float: bool,
    /// Channel count; `0` means "no preference".
    pub channels: u16,
    /// Bitmask of speaker positions as reported by the player.
    pub channel_mask: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl PcmFormat {
    /// The generic fallback format used when the player expresses no
    /// preference: 16-bit signed stereo at 44100 Hz, both-channel mask.
    pub const GENERIC: Self = Self {
        bps: 16,
        is_float: false,
        channels: 2,
        channel_mask: 0x3,
        sample_rate: 44_100,
    };
}

/// Playback state of the output session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No connection is live; initial and terminal state.
    #[default]
    Stopped,
    /// Buffers are being delivered to the server.
    Playing,
    /// Connection is held open but delivery is suspended.
    Paused,
}

/// Metadata for the currently playing track, used for display strings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track title, if known.
    pub title: Option<String>,
    /// Artist name, if known.
    pub artist: Option<String>,
    /// Album name, if known.
    pub album: Option<String>,
    /// Source location (path or URL), if known.
    pub uri: Option<String>,
}

/// Output device metadata reported by enumeration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identifier suitable for the device-name setting.
    pub id: String,
    /// Human-readable description, truncated for display.
    pub description: String,
}
