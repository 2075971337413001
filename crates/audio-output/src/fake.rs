//! Scripted in-memory server and player doubles for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use audio_output_types::TrackInfo;
use crossbeam_channel::Sender;

use crate::error::{OutputError, Result};
use crate::format::NegotiatedSpec;
use crate::player::PlayerSource;
use crate::server::{
    BufferSlot, Chunk, GlobalInfo, RegistryEvent, ServerClient, ServerRegistry, ServerStream,
    StreamEvent, StreamProps, StreamState,
};

/// Shared scripting/recording state behind all fake clients and streams.
#[derive(Debug)]
pub(crate) struct FakeShared {
    buffer_capacity: AtomicUsize,
    requested_frames: Mutex<Option<usize>>,
    deny_buffers: AtomicBool,
    fail_next_connect: AtomicBool,
    dequeues: AtomicUsize,
    connects: Mutex<Vec<NegotiatedSpec>>,
    connect_props: Mutex<Vec<StreamProps>>,
    disconnects: AtomicUsize,
    queued: Mutex<Vec<(Vec<u8>, Chunk)>>,
    active_log: Mutex<Vec<bool>>,
    flushes: AtomicUsize,
    volumes: Mutex<Vec<Vec<f32>>>,
    media_names: Mutex<Vec<String>>,
    stream_events: Mutex<Option<Sender<StreamEvent>>>,
    globals: Mutex<Vec<GlobalInfo>>,
    respond_sync: AtomicBool,
}

impl Default for FakeShared {
    fn default() -> Self {
        Self {
            buffer_capacity: AtomicUsize::new(4096),
            requested_frames: Mutex::new(None),
            deny_buffers: AtomicBool::new(false),
            fail_next_connect: AtomicBool::new(false),
            dequeues: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
            connect_props: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            queued: Mutex::new(Vec::new()),
            active_log: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            volumes: Mutex::new(Vec::new()),
            media_names: Mutex::new(Vec::new()),
            stream_events: Mutex::new(None),
            globals: Mutex::new(Vec::new()),
            respond_sync: AtomicBool::new(true),
        }
    }
}

impl FakeShared {
    pub(crate) fn set_buffer_capacity(&self, bytes: usize) {
        self.buffer_capacity.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_requested_frames(&self, frames: Option<usize>) {
        *self.requested_frames.lock().unwrap() = frames;
    }

    pub(crate) fn deny_buffers(&self, deny: bool) {
        self.deny_buffers.store(deny, Ordering::Relaxed);
    }

    pub(crate) fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::Relaxed);
    }

    pub(crate) fn dequeue_count(&self) -> usize {
        self.dequeues.load(Ordering::Relaxed)
    }

    pub(crate) fn connects(&self) -> Vec<NegotiatedSpec> {
        self.connects.lock().unwrap().clone()
    }

    pub(crate) fn connect_props(&self) -> Vec<StreamProps> {
        self.connect_props.lock().unwrap().clone()
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn queued_buffers(&self) -> Vec<(Vec<u8>, Chunk)> {
        self.queued.lock().unwrap().clone()
    }

    pub(crate) fn active_log(&self) -> Vec<bool> {
        self.active_log.lock().unwrap().clone()
    }

    pub(crate) fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn pushed_volumes(&self) -> Vec<Vec<f32>> {
        self.volumes.lock().unwrap().clone()
    }

    pub(crate) fn media_names(&self) -> Vec<String> {
        self.media_names.lock().unwrap().clone()
    }

    pub(crate) fn script_global(&self, global: GlobalInfo) {
        self.globals.lock().unwrap().push(global);
    }

    pub(crate) fn withhold_sync(&self) {
        self.respond_sync.store(false, Ordering::Relaxed);
    }

    /// Inject a stream event as the server would.
    pub(crate) fn send_event(&self, event: StreamEvent) {
        let guard = self.stream_events.lock().unwrap();
        let tx = guard.as_ref().expect("no stream connected");
        tx.send(event).expect("connection loop gone");
    }
}

/// Scripted stand-in for the server client library.
pub(crate) struct FakeServer {
    pub(crate) shared: Arc<FakeShared>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(FakeShared::default()),
        }
    }

    pub(crate) fn with_shared(shared: Arc<FakeShared>) -> Self {
        Self { shared }
    }
}

impl ServerClient for FakeServer {
    fn connect(
        &mut self,
        props: &StreamProps,
        spec: &NegotiatedSpec,
        events: Sender<StreamEvent>,
    ) -> Result<Box<dyn ServerStream>> {
        if self.shared.fail_next_connect.swap(false, Ordering::Relaxed) {
            return Err(OutputError::Connect {
                reason: "connection refused".to_string(),
            });
        }
        self.shared.connects.lock().unwrap().push(spec.clone());
        self.shared.connect_props.lock().unwrap().push(props.clone());
        *self.shared.stream_events.lock().unwrap() = Some(events.clone());
        let _ = events.send(StreamEvent::StateChanged(StreamState::Streaming));
        let _ = events.send(StreamEvent::FormatLive);
        Ok(Box::new(FakeStream {
            shared: self.shared.clone(),
            scratch: vec![0u8; self.shared.buffer_capacity.load(Ordering::Relaxed)],
        }))
    }

    fn open_registry(&mut self, events: Sender<RegistryEvent>) -> Result<Box<dyn ServerRegistry>> {
        for global in self.shared.globals.lock().unwrap().iter() {
            let _ = events.send(RegistryEvent::Global(global.clone()));
        }
        Ok(Box::new(FakeRegistry {
            shared: self.shared.clone(),
            events,
        }))
    }
}

struct FakeStream {
    shared: Arc<FakeShared>,
    scratch: Vec<u8>,
}

impl ServerStream for FakeStream {
    fn dequeue(&mut self) -> Option<BufferSlot<'_>> {
        if self.shared.deny_buffers.load(Ordering::Relaxed) {
            return None;
        }
        self.shared.dequeues.fetch_add(1, Ordering::Relaxed);
        let capacity = self.shared.buffer_capacity.load(Ordering::Relaxed);
        if self.scratch.len() != capacity {
            self.scratch.resize(capacity, 0);
        }
        let requested_frames = *self.shared.requested_frames.lock().unwrap();
        Some(BufferSlot {
            data: &mut self.scratch[..],
            requested_frames,
        })
    }

    fn queue(&mut self, chunk: Chunk) {
        self.shared
            .queued
            .lock()
            .unwrap()
            .push((self.scratch.clone(), chunk));
    }

    fn set_active(&mut self, active: bool) {
        self.shared.active_log.lock().unwrap().push(active);
    }

    fn flush(&mut self) {
        self.shared.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn set_channel_volumes(&mut self, volumes: &[f32]) {
        self.shared.volumes.lock().unwrap().push(volumes.to_vec());
    }

    fn update_media_name(&mut self, name: &str) {
        self.shared.media_names.lock().unwrap().push(name.to_string());
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.shared.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

struct FakeRegistry {
    shared: Arc<FakeShared>,
    events: Sender<RegistryEvent>,
}

impl ServerRegistry for FakeRegistry {
    fn sync(&mut self, seq: u32) {
        if self.shared.respond_sync.load(Ordering::Relaxed) {
            let _ = self.events.send(RegistryEvent::SyncDone(seq));
        }
    }
}

/// Scripted stand-in for the host player.
pub(crate) struct FakePlayer {
    data: Mutex<VecDeque<u8>>,
    ok: AtomicBool,
    amplitude: Mutex<f32>,
    amplitude_sets: Mutex<Vec<f32>>,
    stops: Mutex<Vec<String>>,
    track: Mutex<Option<TrackInfo>>,
}

impl FakePlayer {
    pub(crate) fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data.into()),
            ok: AtomicBool::new(true),
            amplitude: Mutex::new(1.0),
            amplitude_sets: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            track: Mutex::new(None),
        }
    }

    pub(crate) fn set_ok_to_read(&self, ok: bool) {
        self.ok.store(ok, Ordering::Relaxed);
    }

    pub(crate) fn set_player_amplitude(&self, value: f32) {
        *self.amplitude.lock().unwrap() = value;
    }

    pub(crate) fn set_track(&self, track: TrackInfo) {
        *self.track.lock().unwrap() = Some(track);
    }

    pub(crate) fn amplitude_sets(&self) -> Vec<f32> {
        self.amplitude_sets.lock().unwrap().clone()
    }

    pub(crate) fn stop_reasons(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

impl PlayerSource for FakePlayer {
    fn ok_to_read(&self, _max_bytes: usize) -> bool {
        self.ok.load(Ordering::Relaxed)
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        let n = buf.len().min(data.len());
        for byte in buf.iter_mut().take(n) {
            *byte = data.pop_front().unwrap();
        }
        n
    }

    fn amplitude(&self) -> f32 {
        *self.amplitude.lock().unwrap()
    }

    fn set_amplitude(&self, value: f32) {
        *self.amplitude.lock().unwrap() = value;
        self.amplitude_sets.lock().unwrap().push(value);
    }

    fn current_track(&self) -> Option<TrackInfo> {
        self.track.lock().unwrap().clone()
    }

    fn output_stopped(&self, reason: &OutputError) {
        self.stops.lock().unwrap().push(reason.to_string());
    }
}
