//! The output session: lifecycle state machine and control surface.
//!
//! Exactly one session exists per output. All control entry points serialize
//! on a session-wide lock; the data behind it is shared with the connection
//! thread and held only briefly, never across a wait on that thread. The
//! only lock-free cross-thread signal is the format-change flag: set by the
//! control side before deactivating the stream, cleared by the connection
//! thread once the reconfiguration has been applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use audio_output_types::{DeviceInfo, PcmFormat, PlaybackState, TrackInfo};
use crossbeam_channel::{Sender, bounded, unbounded};

use crate::config::{ConfigStore, OutputSettings};
use crate::connection::{self, ConnState, LoopMsg, VOLUME_EPSILON};
use crate::enumerate;
use crate::error::{OutputError, Result};
use crate::format;
use crate::player::{PlayerSource, TitleFormatter};
use crate::producer::StreamCounters;
use crate::server::{ServerClient, StreamProps};

/// Creates the server client object owned by a connection thread.
///
/// Called once per `open()` and once per device enumeration (which uses a
/// short-lived client of its own).
pub type ClientFactory = Box<dyn Fn() -> Result<Box<dyn ServerClient>> + Send + Sync>;

/// State shared between the control side and the connection thread.
pub(crate) struct Shared {
    pub(crate) inner: Mutex<SessionInner>,
    /// Read without a lock by the real-time producer; see module docs.
    pub(crate) format_change_pending: AtomicBool,
}

pub(crate) struct SessionInner {
    pub(crate) state: PlaybackState,
    /// Last format requested by the player; used by the next `play()`.
    pub(crate) requested: PcmFormat,
    /// Format actually negotiated with the server.
    pub(crate) current: PcmFormat,
    /// Format awaiting deferred reconfiguration, when one is outstanding.
    pub(crate) pending: Option<PcmFormat>,
    pub(crate) settings: OutputSettings,
    /// Player amplitude captured before negotiation, re-applied when the
    /// server confirms the stream is live.
    pub(crate) captured_amplitude: Option<f32>,
    /// Last amplitude pushed to, or observed from, the server.
    pub(crate) last_amplitude: Option<f32>,
    pub(crate) media_name: Option<String>,
    pub(crate) connection: Option<Connection>,
}

/// Handle to the connection thread.
pub(crate) struct Connection {
    pub(crate) loop_tx: Sender<LoopMsg>,
    join: Option<JoinHandle<()>>,
}

/// The single live (or about-to-be-live) output connection and its state.
pub struct Session {
    /// Serializes control entry points for their whole duration.
    op_lock: Mutex<()>,
    shared: Arc<Shared>,
    player: Arc<dyn PlayerSource>,
    formatter: Option<Box<dyn TitleFormatter>>,
    client_factory: ClientFactory,
    counters: Arc<StreamCounters>,
}

impl Session {
    /// Create a session reading its settings from `store`.
    pub fn new(
        player: Arc<dyn PlayerSource>,
        client_factory: ClientFactory,
        store: &dyn ConfigStore,
    ) -> Self {
        Self {
            op_lock: Mutex::new(()),
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner {
                    state: PlaybackState::Stopped,
                    requested: PcmFormat::default(),
                    current: PcmFormat::default(),
                    pending: None,
                    settings: OutputSettings::load(store),
                    captured_amplitude: None,
                    last_amplitude: None,
                    media_name: None,
                    connection: None,
                }),
                format_change_pending: AtomicBool::new(false),
            }),
            player,
            formatter: None,
            client_factory,
            counters: Arc::new(StreamCounters::default()),
        }
    }

    /// Attach a "now playing" formatter used for the stream's media name.
    pub fn with_formatter(mut self, formatter: Box<dyn TitleFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    /// Allocate the connection thread and server client object.
    ///
    /// Idempotent; a precondition for every operation except `close()`.
    pub fn open(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        self.ensure_open().map(|_| ())
    }

    /// Negotiate, connect, and start streaming.
    pub fn play(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        self.do_play()
    }

    /// Flush queued data and suspend delivery. From `Stopped` this starts
    /// playback first, then pauses it; from `Paused` it is a no-op.
    pub fn pause(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        self.do_pause()
    }

    /// Resume delivery. A no-op when not paused, but the stream is still
    /// reactivated defensively.
    pub fn unpause(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        self.do_unpause()
    }

    /// Tear down the stream and connection thread. Safe from any state,
    /// idempotent, and the sole cancellation path.
    pub fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        self.do_stop();
        Ok(())
    }

    /// Alias for [`Session::stop`], for symmetry with `open()`.
    pub fn close(&self) -> Result<()> {
        self.stop()
    }

    /// Record the player's requested format.
    ///
    /// Without a live stream this only updates the default for the next
    /// `play()`; while streaming it triggers the deferred reconfiguration
    /// protocol. Negotiation never happens on the caller's thread once a
    /// connection is live.
    pub fn set_format(&self, fmt: PcmFormat) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        let loop_tx = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.requested = fmt;
            if inner.state == PlaybackState::Stopped || fmt == inner.current {
                return Ok(());
            }
            let tx = match inner.connection.as_ref() {
                Some(conn) => conn.loop_tx.clone(),
                None => return Ok(()),
            };
            inner.pending = Some(fmt);
            self.shared
                .format_change_pending
                .store(true, Ordering::Release);
            tx
        };
        // Deactivate first so no further buffers are produced against the
        // stale format, then apply on the connection thread. The producer
        // also marshals the application when it observes the flag; both
        // paths are idempotent.
        loop_tx
            .send(LoopMsg::Invoke(Box::new(|st| {
                if let Some(stream) = st.stream.as_mut() {
                    stream.set_active(false);
                }
                connection::apply_format_change(st);
            })))
            .map_err(|_| OutputError::Disconnected)?;
        Ok(())
    }

    /// Current playback state. Callable from any thread; takes only a brief
    /// data lock, never the operation lock.
    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().unwrap().state
    }

    /// Format currently negotiated with the server.
    pub fn current_format(&self) -> PcmFormat {
        self.shared.inner.lock().unwrap().current
    }

    /// Producer diagnostics (produced/underrun counters).
    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    /// Player-originated volume change: push the player's amplitude to the
    /// server when server-side volume control is enabled.
    pub fn volume_changed(&self) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        let amplitude = self.player.amplitude();
        let (loop_tx, channels) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.settings.server_volume {
                return Ok(());
            }
            let tx = match inner.connection.as_ref() {
                Some(conn) => conn.loop_tx.clone(),
                None => return Ok(()),
            };
            if let Some(last) = inner.last_amplitude {
                // This is the value we last synchronized; pushing it again
                // would feed the server's echo back to it.
                if (last - amplitude).abs() <= VOLUME_EPSILON {
                    return Ok(());
                }
            }
            inner.last_amplitude = Some(amplitude);
            (tx, inner.current.channels.max(1) as usize)
        };
        loop_tx
            .send(LoopMsg::Invoke(Box::new(move |st| {
                connection::push_volume(st, amplitude, channels);
            })))
            .map_err(|_| OutputError::Disconnected)?;
        Ok(())
    }

    /// A new track started; update the stream's media name.
    pub fn track_started(&self, track: &TrackInfo) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        let Some(formatter) = self.formatter.as_ref() else {
            return Ok(());
        };
        let name = formatter.format(track);
        let loop_tx = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.media_name = Some(name.clone());
            match inner.connection.as_ref() {
                Some(conn) => conn.loop_tx.clone(),
                None => return Ok(()),
            }
        };
        loop_tx
            .send(LoopMsg::Invoke(Box::new(move |st| {
                if let Some(stream) = st.stream.as_mut() {
                    stream.update_media_name(&name);
                }
            })))
            .map_err(|_| OutputError::Disconnected)?;
        Ok(())
    }

    /// Re-read settings. Disabling server-side volume control resets the
    /// server control to full scale so no stale attenuation lingers.
    pub fn config_changed(&self, store: &dyn ConfigStore) -> Result<()> {
        let _op = self.op_lock.lock().unwrap();
        let settings = OutputSettings::load(store);
        let reset = {
            let mut inner = self.shared.inner.lock().unwrap();
            let was_enabled = inner.settings.server_volume;
            inner.settings = settings;
            if was_enabled && !inner.settings.server_volume {
                inner.last_amplitude = Some(1.0);
                let channels = inner.current.channels.max(1) as usize;
                inner
                    .connection
                    .as_ref()
                    .map(|conn| (conn.loop_tx.clone(), channels))
            } else {
                None
            }
        };
        if let Some((loop_tx, channels)) = reset {
            let _ = loop_tx.send(LoopMsg::Invoke(Box::new(move |st| {
                connection::push_volume(st, 1.0, channels);
            })));
        }
        Ok(())
    }

    /// Enumerate output devices through a short-lived client distinct from
    /// the playback connection. Blocks until the discovery sync barrier
    /// completes or the configured timeout expires.
    pub fn enumerate_devices(&self, callback: &mut dyn FnMut(&DeviceInfo)) -> Result<()> {
        let timeout = self.shared.inner.lock().unwrap().settings.enum_timeout;
        let mut client = (self.client_factory)()?;
        enumerate::enumerate_devices(client.as_mut(), timeout, callback)
    }

    fn ensure_open(&self) -> Result<Sender<LoopMsg>> {
        {
            let inner = self.shared.inner.lock().unwrap();
            if let Some(conn) = inner.connection.as_ref() {
                return Ok(conn.loop_tx.clone());
            }
        }
        let client = (self.client_factory)()?;
        let (loop_tx, loop_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let st = ConnState {
            client,
            stream: None,
            stride: 0,
            buffer_frames: 0,
            shared: self.shared.clone(),
            player: self.player.clone(),
            events_tx,
            loop_tx: loop_tx.clone(),
            counters: self.counters.clone(),
        };
        let join = thread::Builder::new()
            .name("audio-output-conn".to_string())
            .spawn(move || connection::run(st, loop_rx, events_rx))
            .map_err(|e| OutputError::Backend(format!("spawn connection thread: {e}")))?;
        self.shared.inner.lock().unwrap().connection = Some(Connection {
            loop_tx: loop_tx.clone(),
            join: Some(join),
        });
        Ok(loop_tx)
    }

    /// Run `f` on the connection thread and wait for its result.
    ///
    /// Must not be called while holding the data lock: marshaled work may
    /// itself take that lock.
    fn run_on_loop<R, F>(&self, loop_tx: &Sender<LoopMsg>, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ConnState) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        loop_tx
            .send(LoopMsg::Invoke(Box::new(move |st| {
                let _ = tx.send(f(st));
            })))
            .map_err(|_| OutputError::Disconnected)?;
        rx.recv().map_err(|_| OutputError::Disconnected)
    }

    fn do_play(&self) -> Result<()> {
        let loop_tx = self.ensure_open()?;
        let (requested, settings) = {
            let inner = self.shared.inner.lock().unwrap();
            (inner.requested, inner.settings.clone())
        };
        let media_name = self
            .player
            .current_track()
            .and_then(|track| self.formatter.as_ref().map(|f| f.format(&track)));

        let (effective, spec) = match format::negotiate(&requested, settings.buffer_ms) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!(error = %e, "format negotiation failed");
                self.do_stop();
                return Err(e);
            }
        };

        // Captured before the connect so the volume re-application triggered
        // by the server's format confirmation finds it.
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.current = effective;
            inner.captured_amplitude = Some(self.player.amplitude());
            inner.media_name = media_name.clone();
        }

        let props = StreamProps::for_playback(&settings, media_name.as_deref());
        let connected = self
            .run_on_loop(&loop_tx, move |st| -> Result<()> {
                let stream = st.client.connect(&props, &spec, st.events_tx.clone())?;
                st.stride = spec.stride;
                st.buffer_frames = spec.buffer_frames;
                st.stream = Some(stream);
                Ok(())
            })
            .and_then(|result| result);

        match connected {
            Ok(()) => {
                self.shared.inner.lock().unwrap().state = PlaybackState::Playing;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed; tearing down");
                self.do_stop();
                Err(e)
            }
        }
    }

    fn do_pause(&self) -> Result<()> {
        match self.state() {
            PlaybackState::Paused => return Ok(()),
            PlaybackState::Stopped => self.do_play()?,
            PlaybackState::Playing => {}
        }
        let loop_tx = self.loop_tx()?;
        self.run_on_loop(&loop_tx, |st| {
            if let Some(stream) = st.stream.as_mut() {
                stream.flush();
                stream.set_active(false);
            }
        })?;
        self.shared.inner.lock().unwrap().state = PlaybackState::Paused;
        Ok(())
    }

    fn do_unpause(&self) -> Result<()> {
        let Ok(loop_tx) = self.loop_tx() else {
            // Nothing to reactivate.
            return Ok(());
        };
        self.run_on_loop(&loop_tx, |st| {
            if let Some(stream) = st.stream.as_mut() {
                stream.set_active(true);
            }
        })?;
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == PlaybackState::Paused {
            inner.state = PlaybackState::Playing;
        }
        Ok(())
    }

    fn do_stop(&self) {
        let conn = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.state = PlaybackState::Stopped;
            inner.pending = None;
            self.shared
                .format_change_pending
                .store(false, Ordering::Release);
            inner.connection.take()
        };
        if let Some(mut conn) = conn {
            let _ = conn.loop_tx.send(LoopMsg::Shutdown);
            if let Some(join) = conn.join.take() {
                let _ = join.join();
            }
        }
    }

    fn loop_tx(&self) -> Result<Sender<LoopMsg>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .connection
            .as_ref()
            .map(|conn| conn.loop_tx.clone())
            .ok_or(OutputError::Disconnected)
    }

    /// Wait until all work currently queued on the connection thread ran.
    #[cfg(test)]
    pub(crate) fn sync_with_loop(&self) {
        if let Ok(loop_tx) = self.loop_tx() {
            let _ = self.run_on_loop(&loop_tx, |_| {});
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.do_stop();
    }
}
