//! Real-time producer: one buffer exchange per server process cycle.
//!
//! Runs on the connection thread inside its event loop. The hot path takes
//! no locks, performs no allocation, and never consults the configuration
//! store; the only cross-thread signal it reads is the format-change flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::player::PlayerSource;
use crate::server::{Chunk, ServerStream};

/// Diagnostic counters updated by the producer.
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Frames handed to the server.
    pub produced_frames: AtomicU64,
    /// Frames padded with silence because the player came up short.
    pub underrun_frames: AtomicU64,
    /// Cycles on which padding was needed.
    pub underrun_events: AtomicU64,
}

/// Per-cycle inputs, owned by the connection thread.
pub(crate) struct ProducerCtx<'a> {
    /// Bytes per frame of the negotiated format.
    pub stride: usize,
    /// Target buffer depth in frames.
    pub buffer_frames: usize,
    /// Set by the control thread when a reconfiguration is in flight.
    pub format_change_pending: &'a AtomicBool,
    pub player: &'a dyn PlayerSource,
    pub counters: &'a StreamCounters,
}

/// Outcome of one producer cycle.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// A buffer was exchanged.
    Produced,
    /// No server buffer was available; transient, skip this cycle.
    Skipped,
    /// A reconfiguration is pending; no buffer I/O happened.
    Reconfigure,
}

/// Run one producer cycle against `stream`.
pub(crate) fn run_cycle(stream: &mut dyn ServerStream, ctx: &ProducerCtx<'_>) -> Cycle {
    if ctx.format_change_pending.load(Ordering::Acquire) {
        return Cycle::Reconfigure;
    }
    if ctx.stride == 0 {
        return Cycle::Skipped;
    }

    let stride = ctx.stride;
    let want;
    let supplied;
    let read_attempted;
    {
        let Some(slot) = stream.dequeue() else {
            tracing::debug!("no server buffer available this cycle");
            return Cycle::Skipped;
        };

        let capacity_frames = slot.data.len() / stride;
        let mut frames = ctx.buffer_frames.min(capacity_frames);
        if let Some(requested) = slot.requested_frames {
            frames = frames.min(requested);
        }
        want = frames * stride;

        read_attempted = ctx.player.ok_to_read(want);
        supplied = if read_attempted {
            ctx.player.read(&mut slot.data[..want]).min(want)
        } else {
            0
        };
        if supplied < want {
            // Silence, never garbage, on short reads.
            slot.data[supplied..want].fill(0);
        }
    }

    if read_attempted && supplied < want {
        ctx.counters.underrun_events.fetch_add(1, Ordering::Relaxed);
        ctx.counters
            .underrun_frames
            .fetch_add(((want - supplied) / stride) as u64, Ordering::Relaxed);
    }
    ctx.counters
        .produced_frames
        .fetch_add((want / stride) as u64, Ordering::Relaxed);

    // When the player had data ready the chunk reports the bytes it actually
    // supplied; a cycle with nothing ready submits a full period of silence.
    let size = if read_attempted { supplied } else { want };
    stream.queue(Chunk {
        offset: 0,
        stride: stride as u32,
        size: size as u32,
    });
    Cycle::Produced
}
