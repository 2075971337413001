//! The connection thread: the server client's event loop.
//!
//! One dedicated thread owns the server client object and the connected
//! stream. Work that must happen on that thread arrives as a [`LoopMsg`]
//! (marshaled closures from the control side, plus a shutdown notice);
//! server callbacks arrive as [`StreamEvent`]s on a second channel. Both
//! are drained by one exhaustive dispatch.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use audio_output_types::PlaybackState;
use crossbeam_channel::{Receiver, Sender};

use crate::format;
use crate::player::PlayerSource;
use crate::producer::{self, Cycle, ProducerCtx, StreamCounters};
use crate::server::{ControlChange, ControlKind, ServerClient, ServerStream, StreamEvent, StreamProps};
use crate::session::Shared;

/// Two volume values closer than this are considered the same write.
pub(crate) const VOLUME_EPSILON: f32 = 1e-4;

/// A closure marshaled onto the connection thread.
pub(crate) type Task = Box<dyn FnOnce(&mut ConnState) + Send>;

/// Messages drained by the connection thread's loop.
pub(crate) enum LoopMsg {
    /// Run this closure on the connection thread.
    Invoke(Task),
    /// Tear down the stream and exit the loop.
    Shutdown,
}

/// State owned by the connection thread.
pub(crate) struct ConnState {
    pub(crate) client: Box<dyn ServerClient>,
    pub(crate) stream: Option<Box<dyn ServerStream>>,
    /// Bytes per frame of the live format; recomputed on every negotiation.
    pub(crate) stride: usize,
    /// Target buffer depth in frames; recomputed on every negotiation.
    pub(crate) buffer_frames: usize,
    pub(crate) shared: Arc<Shared>,
    pub(crate) player: Arc<dyn PlayerSource>,
    pub(crate) events_tx: Sender<StreamEvent>,
    pub(crate) loop_tx: Sender<LoopMsg>,
    pub(crate) counters: Arc<StreamCounters>,
}

/// Connection thread entry point.
pub(crate) fn run(
    mut st: ConnState,
    loop_rx: Receiver<LoopMsg>,
    events_rx: Receiver<StreamEvent>,
) {
    loop {
        // Biased toward server events so marshaled work always observes the
        // stream state the server had already reported.
        crossbeam_channel::select_biased! {
            recv(events_rx) -> event => {
                // `st` keeps a sender clone, so the channel cannot disconnect.
                if let Ok(event) = event {
                    dispatch(&mut st, event);
                }
            }
            recv(loop_rx) -> msg => match msg {
                Ok(LoopMsg::Invoke(task)) => task(&mut st),
                Ok(LoopMsg::Shutdown) | Err(_) => break,
            },
        }
    }
    // Dropping the stream disconnects it.
    st.stream.take();
    tracing::debug!("connection thread exited");
}

fn dispatch(st: &mut ConnState, event: StreamEvent) {
    match event {
        StreamEvent::Process => on_process(st),
        StreamEvent::StateChanged(state) => {
            tracing::debug!(?state, "stream state changed");
        }
        StreamEvent::FormatLive => reapply_volume(st),
        StreamEvent::Control(change) => on_control(st, change),
    }
}

fn on_process(st: &mut ConnState) {
    let Some(stream) = st.stream.as_mut() else {
        return;
    };
    let ctx = ProducerCtx {
        stride: st.stride,
        buffer_frames: st.buffer_frames,
        format_change_pending: &st.shared.format_change_pending,
        player: st.player.as_ref(),
        counters: &st.counters,
    };
    if producer::run_cycle(stream.as_mut(), &ctx) == Cycle::Reconfigure {
        // The reconfiguration must not run inside a process cycle; marshal it
        // onto our own loop instead.
        let _ = st
            .loop_tx
            .send(LoopMsg::Invoke(Box::new(apply_format_change)));
    }
}

/// Apply a pending format change.
///
/// Runs on the connection thread with the session lock held; this is the
/// only place allowed to disconnect and reconnect the stream outside of
/// teardown. Idempotent: with no pending format it only clears the flag, so
/// the producer-triggered and control-triggered marshals may both fire.
pub(crate) fn apply_format_change(st: &mut ConnState) {
    let shared = st.shared.clone();
    let mut inner = shared.inner.lock().unwrap();
    let Some(pending) = inner.pending.take() else {
        shared.format_change_pending.store(false, Ordering::Release);
        return;
    };

    // Volume must survive the reconnect.
    inner.captured_amplitude = Some(st.player.amplitude());
    st.stream.take();

    let result = format::negotiate(&pending, inner.settings.buffer_ms).and_then(
        |(effective, spec)| {
            let props = StreamProps::for_playback(&inner.settings, inner.media_name.as_deref());
            let stream = st.client.connect(&props, &spec, st.events_tx.clone())?;
            Ok((effective, spec, stream))
        },
    );

    match result {
        Ok((effective, spec, mut stream)) => {
            if inner.state == PlaybackState::Paused {
                stream.set_active(false);
            }
            st.stride = spec.stride;
            st.buffer_frames = spec.buffer_frames;
            st.stream = Some(stream);
            inner.current = effective;
            shared.format_change_pending.store(false, Ordering::Release);
            tracing::debug!(
                channels = effective.channels,
                rate = effective.sample_rate,
                stride = spec.stride,
                "stream reconfigured"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "deferred reconfiguration failed; stopping");
            inner.state = PlaybackState::Stopped;
            shared.format_change_pending.store(false, Ordering::Release);
            drop(inner);
            st.player.output_stopped(&e);
        }
    }
}

/// Re-apply the captured amplitude once the server confirms the stream is
/// live; the pushed value becomes the reference for feedback suppression.
fn reapply_volume(st: &mut ConnState) {
    let shared = st.shared.clone();
    let mut inner = shared.inner.lock().unwrap();
    if !inner.settings.server_volume {
        return;
    }
    let Some(amplitude) = inner.captured_amplitude else {
        return;
    };
    let channels = inner.current.channels.max(1) as usize;
    inner.last_amplitude = Some(amplitude);
    drop(inner);
    push_volume(st, amplitude, channels);
}

/// Server-originated control change; only channel volumes are of interest.
fn on_control(st: &mut ConnState, change: ControlChange) {
    match change.control {
        ControlKind::ChannelVolumes => {}
        ControlKind::Other(id) => {
            tracing::trace!(control = id, "ignoring control change");
            return;
        }
    }
    let Some(value) = change.values.first().copied() else {
        return;
    };
    let shared = st.shared.clone();
    let mut inner = shared.inner.lock().unwrap();
    if !inner.settings.server_volume {
        return;
    }
    if let Some(last) = inner.last_amplitude {
        // Our own write echoed back; reacting would oscillate.
        if (last - value).abs() <= VOLUME_EPSILON {
            return;
        }
    }
    inner.last_amplitude = Some(value);
    drop(inner);
    st.player.set_amplitude(value);
}

/// Push `amplitude`, replicated across all channels, to the server control.
pub(crate) fn push_volume(st: &mut ConnState, amplitude: f32, channels: usize) {
    if let Some(stream) = st.stream.as_mut() {
        stream.set_channel_volumes(&vec![amplitude; channels.max(1)]);
    }
}
