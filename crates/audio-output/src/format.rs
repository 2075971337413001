//! Format negotiation.
//!
//! Translates the player's logical PCM format into the server-side format
//! descriptor plus a positional channel map, and derives the frame stride
//! and target buffer depth used by the producer.

use audio_output_types::PcmFormat;

use crate::error::{OutputError, Result};

/// Sample rates above this are clamped before negotiation.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Server-side sample format descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// Bytes per sample for this format.
    pub fn bytes(self) -> usize {
        match self {
            Self::S8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le | Self::F32Le => 4,
        }
    }
}

/// Speaker positions, in the standard surround order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    RearLeft,
    RearRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    RearCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopRearLeft,
    TopRearCenter,
    TopRearRight,
    /// Position not covered by the table; left unassigned.
    Unknown,
}

/// The standard surround ordering for multi-channel layouts.
const SURROUND_ORDER: [ChannelPosition; 18] = [
    ChannelPosition::FrontLeft,
    ChannelPosition::FrontRight,
    ChannelPosition::FrontCenter,
    ChannelPosition::Lfe,
    ChannelPosition::RearLeft,
    ChannelPosition::RearRight,
    ChannelPosition::FrontLeftOfCenter,
    ChannelPosition::FrontRightOfCenter,
    ChannelPosition::RearCenter,
    ChannelPosition::SideLeft,
    ChannelPosition::SideRight,
    ChannelPosition::TopCenter,
    ChannelPosition::TopFrontLeft,
    ChannelPosition::TopFrontCenter,
    ChannelPosition::TopFrontRight,
    ChannelPosition::TopRearLeft,
    ChannelPosition::TopRearCenter,
    ChannelPosition::TopRearRight,
];

/// Everything the server needs to accept a stream, plus the derived values
/// the producer works with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedSpec {
    /// Server sample format.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u16,
    /// Sample rate in Hz.
    pub rate: u32,
    /// Positional channel map, one entry per channel.
    pub positions: Vec<ChannelPosition>,
    /// Bytes per frame.
    pub stride: usize,
    /// Target buffer depth in frames, communicated as a latency hint.
    pub buffer_frames: usize,
}

/// Map a bit depth (and float flag) to the server sample format.
///
/// Any depth outside the table is a hard negotiation failure.
pub fn sample_format_for(bps: u16, is_float: bool) -> Result<SampleFormat> {
    match bps {
        8 => Ok(SampleFormat::S8),
        16 => Ok(SampleFormat::S16Le),
        24 => Ok(SampleFormat::S24Le),
        32 if is_float => Ok(SampleFormat::F32Le),
        32 => Ok(SampleFormat::S32Le),
        other => Err(OutputError::UnsupportedBitDepth(other)),
    }
}

/// Positional channel map for `channels`.
///
/// Mono maps to a single `Mono` position; other counts take the first N
/// entries of the standard surround order. Counts above the table's ceiling
/// degrade gracefully: the extra positions stay `Unknown`.
pub fn channel_map(channels: u16) -> Vec<ChannelPosition> {
    if channels == 1 {
        return vec![ChannelPosition::Mono];
    }
    (0..channels as usize)
        .map(|i| {
            SURROUND_ORDER
                .get(i)
                .copied()
                .unwrap_or(ChannelPosition::Unknown)
        })
        .collect()
}

/// Negotiate `requested` into a server spec.
///
/// Returns the effective logical format (after defaulting and clamping)
/// together with the negotiated spec. No state is touched; on failure the
/// caller sees no partial result.
pub fn negotiate(requested: &PcmFormat, buffer_ms: u32) -> Result<(PcmFormat, NegotiatedSpec)> {
    let mut fmt = *requested;
    if fmt.channels == 0 {
        fmt = PcmFormat::GENERIC;
    }
    if fmt.sample_rate == 0 {
        fmt.sample_rate = PcmFormat::GENERIC.sample_rate;
    }
    if fmt.sample_rate > MAX_SAMPLE_RATE {
        fmt.sample_rate = MAX_SAMPLE_RATE;
    }

    let format = sample_format_for(fmt.bps, fmt.is_float)?;
    let stride = fmt.channels as usize * format.bytes();
    let buffer_frames = (buffer_ms as u64 * fmt.sample_rate as u64 / 1000) as usize;

    tracing::debug!(
        bps = fmt.bps,
        float = fmt.is_float,
        channels = fmt.channels,
        rate = fmt.sample_rate,
        stride,
        buffer_frames,
        "negotiated format"
    );

    let spec = NegotiatedSpec {
        format,
        channels: fmt.channels,
        rate: fmt.sample_rate,
        positions: channel_map(fmt.channels),
        stride,
        buffer_frames,
    };
    Ok((fmt, spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_channels_negotiates_generic_default() {
        let (fmt, spec) = negotiate(&PcmFormat::default(), 25).unwrap();
        assert_eq!(fmt.bps, 16);
        assert!(!fmt.is_float);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.sample_rate, 44_100);
        assert_eq!(fmt.channel_mask, 0x3);
        assert_eq!(spec.format, SampleFormat::S16Le);
        assert_eq!(spec.stride, 4);
    }

    #[test]
    fn unsupported_bit_depth_is_a_hard_failure() {
        let fmt = PcmFormat {
            bps: 7,
            channels: 2,
            sample_rate: 44_100,
            ..PcmFormat::default()
        };
        match negotiate(&fmt, 25) {
            Err(OutputError::UnsupportedBitDepth(7)) => {}
            other => panic!("expected UnsupportedBitDepth, got {other:?}"),
        }
    }

    #[test]
    fn float_flag_selects_f32() {
        assert_eq!(sample_format_for(32, true).unwrap(), SampleFormat::F32Le);
        assert_eq!(sample_format_for(32, false).unwrap(), SampleFormat::S32Le);
        assert_eq!(sample_format_for(24, false).unwrap(), SampleFormat::S24Le);
        assert_eq!(sample_format_for(8, false).unwrap(), SampleFormat::S8);
    }

    #[test]
    fn rate_is_clamped() {
        let fmt = PcmFormat {
            bps: 16,
            channels: 2,
            sample_rate: 384_000,
            ..PcmFormat::default()
        };
        let (fmt, spec) = negotiate(&fmt, 25).unwrap();
        assert_eq!(fmt.sample_rate, MAX_SAMPLE_RATE);
        assert_eq!(spec.rate, MAX_SAMPLE_RATE);
    }

    #[test]
    fn stride_for_24_bit_6_channels_is_18() {
        let fmt = PcmFormat {
            bps: 24,
            channels: 6,
            sample_rate: 48_000,
            ..PcmFormat::default()
        };
        let (_, spec) = negotiate(&fmt, 25).unwrap();
        assert_eq!(spec.stride, 18);
    }

    #[test]
    fn buffer_frames_follow_latency_and_rate() {
        let fmt = PcmFormat {
            bps: 16,
            channels: 2,
            sample_rate: 48_000,
            ..PcmFormat::default()
        };
        let (_, spec) = negotiate(&fmt, 25).unwrap();
        assert_eq!(spec.buffer_frames, 1_200);
    }

    #[test]
    fn channel_map_anchors() {
        assert_eq!(channel_map(1), vec![ChannelPosition::Mono]);
        assert_eq!(
            channel_map(2),
            vec![ChannelPosition::FrontLeft, ChannelPosition::FrontRight]
        );
        let full = channel_map(18);
        assert_eq!(full.len(), 18);
        assert_eq!(full[2], ChannelPosition::FrontCenter);
        assert_eq!(full[17], ChannelPosition::TopRearRight);
    }

    #[test]
    fn channel_map_beyond_table_leaves_positions_unassigned() {
        let map = channel_map(20);
        assert_eq!(map.len(), 20);
        assert_eq!(map[18], ChannelPosition::Unknown);
        assert_eq!(map[19], ChannelPosition::Unknown);
    }
}
