//! CPAL-backed server client.
//!
//! Stands in for a native audio server connection on hosts without one. The
//! CPAL stream handle is not `Send`, so a dedicated holder thread owns it
//! and takes activation commands over a channel; the device callback and the
//! producer exchange bytes through a bounded ring. Each device callback also
//! emits a `Process` event, which is what drives the producer cycle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::error::{OutputError, Result};
use crate::format::{NegotiatedSpec, SampleFormat};
use crate::server::{
    BufferSlot, Chunk, GlobalInfo, ObjectType, RegistryEvent, ServerClient, ServerRegistry,
    ServerStream, StreamEvent, StreamProps, StreamState, prop_keys,
};

/// Server client backed by the host's CPAL output devices.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn cpal_sample_format(format: SampleFormat) -> cpal::SampleFormat {
    match format {
        SampleFormat::S8 => cpal::SampleFormat::I8,
        SampleFormat::S16Le => cpal::SampleFormat::I16,
        SampleFormat::S24Le => cpal::SampleFormat::I24,
        SampleFormat::S32Le => cpal::SampleFormat::I32,
        SampleFormat::F32Le => cpal::SampleFormat::F32,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| OutputError::Backend(format!("no output devices: {e}")))?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.to_string(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(OutputError::Connect {
            reason: format!("no output device matched: {needle}"),
        });
    }

    host.default_output_device()
        .ok_or_else(|| OutputError::Connect {
            reason: "no default output device".to_string(),
        })
}

fn pick_config(device: &cpal::Device, spec: &NegotiatedSpec) -> Result<cpal::StreamConfig> {
    let wanted = cpal_sample_format(spec.format);
    let ranges = device
        .supported_output_configs()
        .map_err(|e| OutputError::Connect {
            reason: format!("query output configs: {e}"),
        })?;
    for range in ranges {
        if range.sample_format() != wanted || range.channels() != spec.channels {
            continue;
        }
        if spec.rate < range.min_sample_rate() || spec.rate > range.max_sample_rate() {
            continue;
        }
        return Ok(range.with_sample_rate(spec.rate).config());
    }
    Err(OutputError::Connect {
        reason: format!(
            "device does not support {:?} {}ch @ {} Hz",
            spec.format, spec.channels, spec.rate
        ),
    })
}

/// Interleaved bytes in flight between the producer and the device callback.
struct ByteRing {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl ByteRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.buf.lock().unwrap().len())
    }

    fn push(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend(bytes.iter().copied());
    }

    fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    /// Fill `out` from the ring, padding with silence when it runs dry.
    fn drain_into(&self, out: &mut [u8]) {
        let mut buf = self.buf.lock().unwrap();
        for byte in out.iter_mut() {
            *byte = buf.pop_front().unwrap_or(0);
        }
    }
}

enum HolderCmd {
    SetActive(bool),
    Shutdown,
}

impl ServerClient for CpalBackend {
    fn connect(
        &mut self,
        props: &StreamProps,
        spec: &NegotiatedSpec,
        events: Sender<StreamEvent>,
    ) -> Result<Box<dyn ServerStream>> {
        // Two target periods in flight keeps the callback fed without
        // letting latency grow past the configured depth.
        let capacity = (spec.buffer_frames * spec.stride * 2).max(spec.stride * 64);
        let ring = Arc::new(ByteRing::new(capacity));

        let (ready_tx, ready_rx) = bounded(1);
        let (cmd_tx, cmd_rx) = unbounded();
        let spec_holder = spec.clone();
        let target = props.get(prop_keys::TARGET_DEVICE).map(str::to_string);
        let ring_holder = ring.clone();
        let events_holder = events.clone();
        let join = thread::Builder::new()
            .name("audio-output-cpal".to_string())
            .spawn(move || {
                holder_main(spec_holder, target, ring_holder, events_holder, ready_tx, cmd_rx)
            })
            .map_err(|e| OutputError::Backend(format!("spawn stream holder: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(OutputError::Backend("stream holder died".to_string()));
            }
        }

        let _ = events.send(StreamEvent::StateChanged(StreamState::Streaming));
        let _ = events.send(StreamEvent::FormatLive);

        Ok(Box::new(CpalStream {
            ring,
            stride: spec.stride,
            scratch: Vec::new(),
            cmd_tx,
            join: Some(join),
        }))
    }

    fn open_registry(&mut self, events: Sender<RegistryEvent>) -> Result<Box<dyn ServerRegistry>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| OutputError::Backend(format!("no output devices: {e}")))?;
        for (index, device) in devices.enumerate() {
            let description = device
                .description()
                .map(|d| d.to_string())
                .unwrap_or_else(|_| format!("output #{index}"));
            let name = device
                .id()
                .map(|id| id.to_string())
                .unwrap_or_else(|_| description.clone());
            let _ = events.send(RegistryEvent::Global(GlobalInfo {
                id: index as u32,
                object_type: ObjectType::AudioNode,
                media_class: Some("Audio/Sink".to_string()),
                name: Some(name),
                description: Some(description),
            }));
        }
        Ok(Box::new(CpalRegistry { events }))
    }
}

fn holder_main(
    spec: NegotiatedSpec,
    target: Option<String>,
    ring: Arc<ByteRing>,
    events: Sender<StreamEvent>,
    ready_tx: Sender<Result<()>>,
    cmd_rx: Receiver<HolderCmd>,
) {
    let stream = match build_stream(&spec, target.as_deref(), ring, events) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(OutputError::Connect {
            reason: format!("start stream: {e}"),
        }));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    loop {
        match cmd_rx.recv() {
            Ok(HolderCmd::SetActive(true)) => {
                if let Err(e) = stream.play() {
                    tracing::warn!(error = %e, "resume stream failed");
                }
            }
            Ok(HolderCmd::SetActive(false)) => {
                if let Err(e) = stream.pause() {
                    tracing::warn!(error = %e, "pause stream failed");
                }
            }
            Ok(HolderCmd::Shutdown) | Err(_) => break,
        }
    }
    tracing::debug!("stream holder exited");
}

fn build_stream(
    spec: &NegotiatedSpec,
    target: Option<&str>,
    ring: Arc<ByteRing>,
    events: Sender<StreamEvent>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, target)?;
    let config = pick_config(&device, spec)?;
    let sample_format = cpal_sample_format(spec.format);

    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device
        .build_output_stream_raw(
            &config,
            sample_format,
            move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                ring.drain_into(data.bytes_mut());
                let _ = events.send(StreamEvent::Process);
            },
            err_fn,
            None,
        )
        .map_err(|e| OutputError::Connect {
            reason: format!("build output stream: {e}"),
        })?;
    Ok(stream)
}

struct CpalStream {
    ring: Arc<ByteRing>,
    stride: usize,
    scratch: Vec<u8>,
    cmd_tx: Sender<HolderCmd>,
    join: Option<JoinHandle<()>>,
}

impl ServerStream for CpalStream {
    fn dequeue(&mut self) -> Option<BufferSlot<'_>> {
        let free = self.ring.free_bytes();
        let usable = free - free % self.stride.max(1);
        if usable == 0 {
            return None;
        }
        self.scratch.resize(usable, 0);
        Some(BufferSlot {
            data: &mut self.scratch[..],
            requested_frames: Some(usable / self.stride.max(1)),
        })
    }

    fn queue(&mut self, chunk: Chunk) {
        let start = chunk.offset as usize;
        let end = (start + chunk.size as usize).min(self.scratch.len());
        self.ring.push(&self.scratch[start..end]);
    }

    fn set_active(&mut self, active: bool) {
        let _ = self.cmd_tx.send(HolderCmd::SetActive(active));
    }

    fn flush(&mut self) {
        self.ring.clear();
    }

    fn set_channel_volumes(&mut self, volumes: &[f32]) {
        // CPAL exposes no per-stream volume control.
        tracing::debug!(?volumes, "ignoring channel volume request");
    }

    fn update_media_name(&mut self, name: &str) {
        tracing::debug!(name, "ignoring media name update");
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(HolderCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct CpalRegistry {
    events: Sender<RegistryEvent>,
}

impl ServerRegistry for CpalRegistry {
    fn sync(&mut self, seq: u32) {
        // Device listing is synchronous; the initial dump is already complete.
        let _ = self.events.send(RegistryEvent::SyncDone(seq));
    }
}
