//! Stream descriptions handed to the encapsuler by the capture pipeline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum VideoCodec {
    H264 = 1,
    Mjpeg = 2,
    /// Produced by some capture pipelines but not muxable.
    Mpeg4Visual = 3,
}

impl VideoCodec {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::H264),
            2 => Some(Self::Mjpeg),
            3 => Some(Self::Mpeg4Visual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    Jpeg,
    Unknown,
}

impl FrameType {
    /// Sync samples: H.264 I-frames and every JPEG.
    pub fn is_key(self) -> bool {
        matches!(self, Self::I | Self::Jpeg)
    }
}

/// Video payload as delivered by the encoder.
#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    /// One buffer: an Annex-B access unit for H.264, a whole JPEG for MJPEG.
    Raw(&'a [u8]),
    /// Pre-split H.264 NAL units without start codes.
    Nalus(&'a [&'a [u8]]),
}

impl FramePayload<'_> {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Raw(data) => data.is_empty(),
            Self::Nalus(nalus) => nalus.iter().all(|n| n.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub frame_type: FrameType,
    pub payload: FramePayload<'a>,
    /// Capture time in microseconds; 0 derives it from the frame rate.
    pub timestamp_us: u64,
    /// Prefix this frame with the stored SPS and PPS.
    pub insert_parameter_sets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AudioCodec {
    /// Little-endian signed PCM, muxed as `sowt`.
    PcmLe = 1,
}

impl AudioCodec {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::PcmLe),
            _ => None,
        }
    }
}

/// Bits per PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum AudioFormat {
    S8 = 8,
    S16 = 16,
}

impl AudioFormat {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::S8),
            16 => Some(Self::S16),
            _ => None,
        }
    }

    pub fn bits(self) -> u16 {
        self as u16
    }

    pub fn bytes(self) -> u16 {
        self.bits() / 8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioSample<'a> {
    pub codec: AudioCodec,
    pub format: AudioFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub data: &'a [u8],
    /// Capture time in microseconds; 0 derives it from the buffer duration.
    pub timestamp_us: u64,
}

/// Track kinds in the order their track ids are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Sound,
    Metadata,
}

impl MediaType {
    pub fn track_id(self) -> u32 {
        match self {
            Self::Video => 1,
            Self::Sound => 2,
            Self::Metadata => 3,
        }
    }
}

/// Next free track id, written into `mvhd`.
pub const NEXT_TRACK_ID: u32 = 4;
