//! The audio server client library, as the contract the session honors.
//!
//! The streaming API itself lives behind these traits and is not
//! reimplemented here. Server callbacks are modeled as closed sum types
//! ([`StreamEvent`], [`RegistryEvent`]) delivered over channels into the
//! connection thread's loop, so every dispatch site is an exhaustive match.

use crossbeam_channel::Sender;

use crate::config::{OutputSettings, parse_extra_props};
use crate::error::Result;
use crate::format::NegotiatedSpec;

/// Stream states reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Connection requested, not yet streaming.
    Connecting,
    /// Connected but not delivering buffers.
    Suspended,
    /// Delivering buffers.
    Streaming,
    /// The server reported a stream error.
    Error,
}

/// Server controls the session reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// Per-channel linear amplitude.
    ChannelVolumes,
    /// Any other control, identified by its server id.
    Other(u32),
}

/// A control-value notification from the server.
#[derive(Clone, Debug)]
pub struct ControlChange {
    /// Which control changed.
    pub control: ControlKind,
    /// New values, one per channel for channel-bound controls.
    pub values: Vec<f32>,
}

/// Events delivered by the server client for the playback stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// A buffer period elapsed; run one producer cycle.
    Process,
    /// The stream changed state.
    StateChanged(StreamState),
    /// A control value changed server-side (for example an external mixer).
    Control(ControlChange),
    /// The (re)negotiated format is live on the server.
    FormatLive,
}

/// Kinds of global objects a registry can announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    /// An audio node (source, sink, or duplex).
    AudioNode,
    /// Anything else the registry knows about.
    Other,
}

/// A global object announced during discovery.
#[derive(Clone, Debug)]
pub struct GlobalInfo {
    /// Server-assigned numeric id.
    pub id: u32,
    /// Object kind.
    pub object_type: ObjectType,
    /// Media class string such as `Audio/Sink`.
    pub media_class: Option<String>,
    /// Advertised stable name.
    pub name: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
}

impl GlobalInfo {
    /// Whether this global is an output (sink or duplex) audio device.
    pub fn is_output_device(&self) -> bool {
        self.object_type == ObjectType::AudioNode
            && matches!(
                self.media_class.as_deref(),
                Some("Audio/Sink") | Some("Audio/Duplex")
            )
    }
}

/// Events delivered by a discovery registry.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    /// A global object appeared.
    Global(GlobalInfo),
    /// Completion notice for a sync request, tagged with its sequence number.
    SyncDone(u32),
}

/// Properties attached to a new stream connection.
///
/// Later insertions override earlier ones with the same key, which is how
/// the free-form extra-props config text is merged over the computed set.
#[derive(Clone, Debug, Default)]
pub struct StreamProps {
    entries: Vec<(String, String)>,
}

/// Well-known property keys.
pub mod prop_keys {
    pub const MEDIA_TYPE: &str = "media.type";
    pub const MEDIA_CATEGORY: &str = "media.category";
    pub const MEDIA_ROLE: &str = "media.role";
    pub const MEDIA_NAME: &str = "media.name";
    pub const NODE_NAME: &str = "node.name";
    pub const TARGET_DEVICE: &str = "target.device";
    pub const REMOTE_NAME: &str = "remote.name";
}

impl StreamProps {
    /// Computed properties for a playback stream, with the settings'
    /// free-form extra `key=value` text merged over them.
    pub fn for_playback(settings: &OutputSettings, media_name: Option<&str>) -> Self {
        let mut props = Self::default();
        props.set(prop_keys::MEDIA_TYPE, "Audio");
        props.set(prop_keys::MEDIA_CATEGORY, "Playback");
        props.set(prop_keys::MEDIA_ROLE, "Music");
        props.set(prop_keys::NODE_NAME, "audio-output");
        if let Some(name) = media_name {
            props.set(prop_keys::MEDIA_NAME, name);
        }
        if let Some(device) = settings.device.as_deref() {
            props.set(prop_keys::TARGET_DEVICE, device);
        }
        if let Some(remote) = settings.remote.as_deref() {
            props.set(prop_keys::REMOTE_NAME, remote);
        }
        for (key, value) in parse_extra_props(&settings.extra_props) {
            props.set(&key, &value);
        }
        props
    }

    /// Set `key` to `value`, overriding any earlier entry.
    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// Look up `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One dequeued server buffer for the producer to fill.
pub struct BufferSlot<'a> {
    /// Writable sample region.
    pub data: &'a mut [u8],
    /// Server-requested frame count for this cycle, when communicated.
    pub requested_frames: Option<usize>,
}

/// Metadata describing the filled region of a queued buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the data within the buffer.
    pub offset: u32,
    /// Bytes per frame.
    pub stride: u32,
    /// Bytes supplied by the player this cycle.
    pub size: u32,
}

/// A connected playback stream. Dropping the handle disconnects it.
pub trait ServerStream: Send {
    /// Borrow the next output buffer, or `None` when the server has none
    /// available this cycle.
    fn dequeue(&mut self) -> Option<BufferSlot<'_>>;

    /// Submit the buffer obtained from the last [`ServerStream::dequeue`].
    fn queue(&mut self, chunk: Chunk);

    /// Start or stop callback delivery.
    fn set_active(&mut self, active: bool);

    /// Discard queued data.
    fn flush(&mut self);

    /// Push per-channel linear amplitudes to the server's control interface.
    fn set_channel_volumes(&mut self, volumes: &[f32]);

    /// Update the stream's display name.
    fn update_media_name(&mut self, name: &str);
}

/// A short-lived discovery registry. Dropping the handle tears down the
/// temporary connection.
pub trait ServerRegistry: Send {
    /// Request a completion notification tagged with `seq`.
    fn sync(&mut self, seq: u32);
}

/// The server client object owned by the connection thread.
pub trait ServerClient: Send {
    /// Connect a playback stream with the negotiated format.
    ///
    /// Stream events are delivered through `events`; the target buffer depth
    /// travels inside `spec` as a latency hint.
    fn connect(
        &mut self,
        props: &StreamProps,
        spec: &NegotiatedSpec,
        events: Sender<StreamEvent>,
    ) -> Result<Box<dyn ServerStream>>;

    /// Open a discovery registry distinct from the playback stream.
    fn open_registry(&mut self, events: Sender<RegistryEvent>) -> Result<Box<dyn ServerRegistry>>;
}
