//! Contracts consumed from the host player.

use audio_output_types::TrackInfo;

use crate::error::OutputError;

/// The media player the session streams from.
///
/// `ok_to_read` and `read` are invoked from the real-time producer and must
/// not block; the remaining methods are called from control or connection
/// threads.
pub trait PlayerSource: Send + Sync {
    /// Whether at least `max_bytes` of PCM are ready without blocking.
    fn ok_to_read(&self, max_bytes: usize) -> bool;

    /// Pull PCM into `buf`, returning the number of bytes written.
    ///
    /// A short read signals the stream is ending or under-running; the
    /// producer pads the remainder with silence.
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Current linear amplitude in `0.0..=1.0`.
    fn amplitude(&self) -> f32;

    /// Apply a server-originated amplitude change.
    fn set_amplitude(&self, value: f32);

    /// Currently playing track, if any.
    fn current_track(&self) -> Option<TrackInfo>;

    /// A structural failure ended streaming; the player should treat this as
    /// a stop and react (for example by aborting playback).
    fn output_stopped(&self, reason: &OutputError);
}

/// Compiled "now playing" template, evaluated per track.
///
/// Treated as a pure function; the session calls it when building stream
/// properties and on track changes.
pub trait TitleFormatter: Send + Sync {
    /// Produce a short display string for `track`.
    fn format(&self, track: &TrackInfo) -> String;
}
