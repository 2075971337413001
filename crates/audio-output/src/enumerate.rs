//! Device enumeration: a synchronous walk over the server's registry.
//!
//! Discovery is asynchronous on the wire; callers get a blocking call. A
//! short-lived registry is opened, a sync request tagged with a fresh
//! sequence number marks the end of the initial object dump, and the call
//! drains registry events until that marker comes back or the deadline
//! expires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use audio_output_types::DeviceInfo;
use crossbeam_channel::{RecvTimeoutError, unbounded};

use crate::error::{OutputError, Result};
use crate::server::{RegistryEvent, ServerClient};

/// Descriptions longer than this are truncated for display.
const MAX_DESCRIPTION_CHARS: usize = 80;

/// Sequence numbers for sync barriers, unique across all enumerations in
/// the process so a stale completion can never satisfy a newer call.
static SYNC_SEQ: AtomicU32 = AtomicU32::new(1);

/// Report every output device known to the server through `callback`.
///
/// Blocks the caller until the registry's initial dump completes or
/// `timeout` expires. Devices missing a stable name fall back to their
/// numeric id; devices missing a description fall back to the id.
pub(crate) fn enumerate_devices(
    client: &mut dyn ServerClient,
    timeout: Duration,
    callback: &mut dyn FnMut(&DeviceInfo),
) -> Result<()> {
    let (events_tx, events_rx) = unbounded();
    let mut registry = client.open_registry(events_tx)?;
    let seq = SYNC_SEQ.fetch_add(1, Ordering::Relaxed);
    registry.sync(seq);

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events_rx.recv_timeout(remaining) {
            Ok(RegistryEvent::Global(global)) => {
                if !global.is_output_device() {
                    continue;
                }
                let id = global
                    .name
                    .clone()
                    .unwrap_or_else(|| global.id.to_string());
                let description = global.description.as_deref().unwrap_or(&id);
                let device = DeviceInfo {
                    description: middle_ellipsis(description, MAX_DESCRIPTION_CHARS),
                    id,
                };
                callback(&device);
            }
            Ok(RegistryEvent::SyncDone(done)) if done == seq => return Ok(()),
            Ok(RegistryEvent::SyncDone(stale)) => {
                tracing::trace!(seq = stale, "ignoring stale sync completion");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "device enumeration timed out");
                return Err(OutputError::EnumerationTimeout(timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(OutputError::Backend(
                    "registry closed during enumeration".to_string(),
                ));
            }
        }
    }
}

/// Truncate `text` to at most `limit` characters by eliding the middle.
///
/// Keeps the head and tail halves, which preserves both the device family
/// prefix and the distinguishing suffix of long descriptions.
fn middle_ellipsis(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let half = limit / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    format!("{head}...{tail}")
}
