//! Side info file written next to the temp data file.
//!
//! Layout:
//!
//! ```text
//!   bytes 0..4    magic "ENCD"
//!   bytes 4..8    descriptor version (u32 big-endian)
//!   bytes 8..12   descriptor length (u32 big-endian), everything up to the records
//!   session block     fixed SESSION_BLOCK_LEN bytes
//!   video block       fixed VIDEO_BLOCK_LEN bytes
//!   sps, pps          lengths taken from the video block
//!   metadata block    fixed METADATA_BLOCK_LEN bytes
//!   audio block       fixed AUDIO_BLOCK_LEN bytes
//!   records           one "<tag>;<size>;<type>;<delta_us>\n" line per sample
//! ```
//!
//! Blocks are fixed-size so the session and audio blocks can be rewritten in
//! place after recording has started.

use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::atom::metadata::{Location, UntimedMetadata};
use crate::config::EncapsulerConfig;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::media::{AudioCodec, AudioFormat, VideoCodec};

pub const DESCRIPTOR_MAGIC: [u8; 4] = *b"ENCD";
pub const DESCRIPTOR_VERSION: u32 = 5;
const PREAMBLE_LEN: u64 = 12;

pub const ID_FIELD_LEN: usize = 64;
pub const STSD_INFO_LEN: usize = 100;
const EXTRAS_SLOT_LEN: usize = 16 * 1024;

const SESSION_BLOCK_LEN: u64 = 4 + 4 + 8 + 2 + 2 + 8 + 8 + 8 + 2 * ID_FIELD_LEN as u64 + 4 + EXTRAS_SLOT_LEN as u64;
const VIDEO_BLOCK_LEN: u64 = 1 + 1 + 2 + 2 + 4 + 8 + 2 + 2;
const METADATA_BLOCK_LEN: u64 = 1 + 4 + 2 * STSD_INFO_LEN as u64;
const AUDIO_BLOCK_LEN: u64 = 1 + 1 + 2 + 2 + 4 + 4;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackTag {
    Video,
    Audio,
    Metadata,
}

impl TrackTag {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Video => b'v',
            Self::Audio => b'a',
            Self::Metadata => b't',
        }
    }

    pub fn from_byte(val: u8) -> Option<Self> {
        match val {
            b'v' => Some(Self::Video),
            b'a' => Some(Self::Audio),
            b't' => Some(Self::Metadata),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Video key frame (H.264 IDR or JPEG).
    Sync,
    /// Any other video frame.
    Delta,
    /// Audio chunk or metadata block.
    Media,
}

impl SampleKind {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Sync => b'i',
            Self::Delta => b'p',
            Self::Media => b'm',
        }
    }

    pub fn from_byte(val: u8) -> Option<Self> {
        match val {
            b'i' => Some(Self::Sync),
            b'p' => Some(Self::Delta),
            b'm' => Some(Self::Media),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRecord {
    pub track: TrackTag,
    /// Bytes appended to the data file for this sample.
    pub size: u64,
    pub kind: SampleKind,
    /// Time since the previous sample of the same track.
    pub delta_us: u32,
}

impl InfoRecord {
    pub fn encode(&self) -> String {
        format!(
            "{};{};{};{}\n",
            self.track.as_byte() as char,
            self.size,
            self.kind.as_byte() as char,
            self.delta_us
        )
    }

    /// Parse one line without its terminating newline.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let line = std::str::from_utf8(line).ok()?;
        let mut fields = line.split(';');
        let track = single_byte(fields.next()?).and_then(TrackTag::from_byte)?;
        let size = fields.next()?.parse().ok()?;
        let kind = single_byte(fields.next()?).and_then(SampleKind::from_byte)?;
        let delta_us = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            track,
            size,
            kind,
            delta_us,
        })
    }
}

fn single_byte(field: &str) -> Option<u8> {
    match field.as_bytes() {
        [b] => Some(*b),
        _ => None,
    }
}

/// A record and where its line ends, relative to the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedRecord {
    pub line_end: u64,
    pub record: InfoRecord,
}

/// Read records until EOF or the first incomplete or unparsable line.
/// Returns the records and the length of the valid prefix.
pub fn read_records<R: BufRead>(mut reader: R) -> io::Result<(Vec<LoggedRecord>, u64)> {
    let mut records = Vec::new();
    let mut consumed = 0u64;
    let mut line = Vec::with_capacity(32);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let Some(record) = InfoRecord::parse(&line[..n - 1]) else {
            break;
        };
        consumed += n as u64;
        records.push(LoggedRecord {
            line_end: consumed,
            record,
        });
    }
    Ok((records, consumed))
}

// ---------------------------------------------------------------------------
// Descriptor blocks
// ---------------------------------------------------------------------------

fn write_fixed_str<W: Write>(w: &mut W, s: &str, len: usize) -> io::Result<()> {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    w.write_all(&bytes[..n])?;
    w.write_all(&vec![0u8; len - n])
}

fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> EncapsulerResult<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| EncapsulerError::DescriptorMismatch("non UTF-8 string field".into()))
}

/// Settings and metadata that only matter at finalize time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionExtras {
    pub config: EncapsulerConfig,
    pub untimed: Option<UntimedMetadata>,
    pub thumbnail: Option<PathBuf>,
    pub gps: Location,
}

impl SessionExtras {
    /// JSON for the extras slot. When it does not fit, untimed metadata and
    /// the thumbnail are left out; the returned flag reports that.
    fn to_slot(&self) -> EncapsulerResult<(Vec<u8>, bool)> {
        let json = serde_json::to_vec(self)?;
        if json.len() <= EXTRAS_SLOT_LEN {
            return Ok((json, false));
        }
        let reduced = Self {
            untimed: None,
            thumbnail: None,
            ..self.clone()
        };
        let json = serde_json::to_vec(&reduced)?;
        if json.len() > EXTRAS_SLOT_LEN {
            return Err(EncapsulerError::BadParameter("session settings exceed the descriptor slot".into()));
        }
        Ok((json, true))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionBlock {
    pub timescale: u32,
    pub fps: u32,
    /// Unix seconds.
    pub creation_time: i64,
    pub product_id: u16,
    pub pvat_offset: u64,
    pub mdat_offset: u64,
    pub data_offset: u64,
    pub run_uuid: String,
    pub run_date: String,
    pub extras: SessionExtras,
}

impl SessionBlock {
    /// Returns whether untimed metadata had to be left out.
    fn write_to<W: Write>(&self, w: &mut W) -> EncapsulerResult<bool> {
        let (extras, reduced) = self.extras.to_slot()?;
        w.write_u32::<BigEndian>(self.timescale)?;
        w.write_u32::<BigEndian>(self.fps)?;
        w.write_i64::<BigEndian>(self.creation_time)?;
        w.write_u16::<BigEndian>(self.product_id)?;
        w.write_u16::<BigEndian>(0)?;
        w.write_u64::<BigEndian>(self.pvat_offset)?;
        w.write_u64::<BigEndian>(self.mdat_offset)?;
        w.write_u64::<BigEndian>(self.data_offset)?;
        write_fixed_str(w, &self.run_uuid, ID_FIELD_LEN)?;
        write_fixed_str(w, &self.run_date, ID_FIELD_LEN)?;
        w.write_u32::<BigEndian>(extras.len() as u32)?;
        w.write_all(&extras)?;
        w.write_all(&vec![0u8; EXTRAS_SLOT_LEN - extras.len()])?;
        Ok(reduced)
    }

    fn read_from<R: Read>(r: &mut R) -> EncapsulerResult<Self> {
        let timescale = r.read_u32::<BigEndian>()?;
        let fps = r.read_u32::<BigEndian>()?;
        let creation_time = r.read_i64::<BigEndian>()?;
        let product_id = r.read_u16::<BigEndian>()?;
        r.read_u16::<BigEndian>()?;
        let pvat_offset = r.read_u64::<BigEndian>()?;
        let mdat_offset = r.read_u64::<BigEndian>()?;
        let data_offset = r.read_u64::<BigEndian>()?;
        let run_uuid = read_fixed_str(r, ID_FIELD_LEN)?;
        let run_date = read_fixed_str(r, ID_FIELD_LEN)?;
        let extras_len = r.read_u32::<BigEndian>()? as usize;
        if extras_len > EXTRAS_SLOT_LEN {
            return Err(EncapsulerError::DescriptorMismatch("extras length out of range".into()));
        }
        let mut slot = vec![0u8; EXTRAS_SLOT_LEN];
        r.read_exact(&mut slot)?;
        let extras = serde_json::from_slice(&slot[..extras_len])
            .map_err(|e| EncapsulerError::DescriptorMismatch(format!("extras: {e}")))?;
        if timescale == 0 || pvat_offset > mdat_offset || mdat_offset + 16 != data_offset {
            return Err(EncapsulerError::DescriptorMismatch("inconsistent session offsets".into()));
        }
        Ok(Self {
            timescale,
            fps,
            creation_time,
            product_id,
            pvat_offset,
            mdat_offset,
            data_offset,
            run_uuid,
            run_date,
            extras,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoBlock {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub default_frame_duration_us: u32,
    pub first_frame_timestamp_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlock {
    pub block_size: u32,
    pub content_encoding: String,
    pub mime_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBlock {
    pub codec: AudioCodec,
    pub format: AudioFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub default_sample_duration_us: u32,
}

impl AudioBlock {
    /// Bytes per sample frame across all channels.
    pub fn frame_bytes(&self) -> u64 {
        self.channels as u64 * self.format.bytes() as u64
    }

    fn write_to<W: Write>(block: Option<&Self>, w: &mut W) -> io::Result<()> {
        match block {
            Some(a) => {
                w.write_u8(1)?;
                w.write_u8(a.codec as u8)?;
                w.write_u16::<BigEndian>(a.format.bits())?;
                w.write_u16::<BigEndian>(a.channels)?;
                w.write_u32::<BigEndian>(a.sample_rate)?;
                w.write_u32::<BigEndian>(a.default_sample_duration_us)
            }
            None => w.write_all(&[0u8; AUDIO_BLOCK_LEN as usize]),
        }
    }

    fn read_from<R: Read>(r: &mut R) -> EncapsulerResult<Option<Self>> {
        let present = r.read_u8()?;
        let codec = r.read_u8()?;
        let bits = r.read_u16::<BigEndian>()?;
        let channels = r.read_u16::<BigEndian>()?;
        let sample_rate = r.read_u32::<BigEndian>()?;
        let default_sample_duration_us = r.read_u32::<BigEndian>()?;
        if present == 0 {
            return Ok(None);
        }
        let mismatch = || EncapsulerError::DescriptorMismatch("invalid audio block".into());
        Ok(Some(Self {
            codec: AudioCodec::from_u8(codec).ok_or_else(mismatch)?,
            format: AudioFormat::from_bits(bits).ok_or_else(mismatch)?,
            channels,
            sample_rate,
            default_sample_duration_us,
        }))
    }
}

/// Everything the finalizer needs besides the records themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub session: SessionBlock,
    pub video: VideoBlock,
    /// Parameter sets without start codes.
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub metadata: Option<MetadataBlock>,
    pub audio: Option<AudioBlock>,
}

impl Descriptor {
    /// Offset of the session block in the info file.
    pub fn session_block_offset() -> u64 {
        PREAMBLE_LEN
    }

    /// Offset of the audio block in the info file.
    pub fn audio_block_offset(&self) -> u64 {
        PREAMBLE_LEN
            + SESSION_BLOCK_LEN
            + VIDEO_BLOCK_LEN
            + self.sps.len() as u64
            + self.pps.len() as u64
            + METADATA_BLOCK_LEN
    }

    /// Offset of the first record in the info file.
    pub fn records_offset(&self) -> u64 {
        self.audio_block_offset() + AUDIO_BLOCK_LEN
    }

    /// Encode the whole header. The flag reports dropped untimed metadata.
    pub fn encode(&self) -> EncapsulerResult<(Vec<u8>, bool)> {
        let mut buf = Vec::with_capacity(self.records_offset() as usize);
        buf.write_all(&DESCRIPTOR_MAGIC)?;
        buf.write_u32::<BigEndian>(DESCRIPTOR_VERSION)?;
        buf.write_u32::<BigEndian>((self.records_offset() - PREAMBLE_LEN) as u32)?;
        let reduced = self.session.write_to(&mut buf)?;

        buf.write_u8(self.video.codec as u8)?;
        buf.write_u8(0)?;
        buf.write_u16::<BigEndian>(self.video.width)?;
        buf.write_u16::<BigEndian>(self.video.height)?;
        buf.write_u32::<BigEndian>(self.video.default_frame_duration_us)?;
        buf.write_u64::<BigEndian>(self.video.first_frame_timestamp_us)?;
        buf.write_u16::<BigEndian>(self.sps.len() as u16)?;
        buf.write_u16::<BigEndian>(self.pps.len() as u16)?;
        buf.write_all(&self.sps)?;
        buf.write_all(&self.pps)?;

        match &self.metadata {
            Some(m) => {
                buf.write_u8(1)?;
                buf.write_u32::<BigEndian>(m.block_size)?;
                write_fixed_str(&mut buf, &m.content_encoding, STSD_INFO_LEN)?;
                write_fixed_str(&mut buf, &m.mime_format, STSD_INFO_LEN)?;
            }
            None => buf.write_all(&[0u8; METADATA_BLOCK_LEN as usize])?,
        }
        AudioBlock::write_to(self.audio.as_ref(), &mut buf)?;
        Ok((buf, reduced))
    }

    /// Encoded session block alone, for in-place rewrites.
    pub fn encode_session(&self) -> EncapsulerResult<(Vec<u8>, bool)> {
        let mut buf = Vec::with_capacity(SESSION_BLOCK_LEN as usize);
        let reduced = self.session.write_to(&mut buf)?;
        Ok((buf, reduced))
    }

    /// Encoded audio block alone, for the in-place write on the first sample.
    pub fn encode_audio(&self) -> EncapsulerResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(AUDIO_BLOCK_LEN as usize);
        AudioBlock::write_to(self.audio.as_ref(), &mut buf)?;
        Ok(buf)
    }

    /// Decode a header, reporting any truncation or inconsistency as
    /// `DescriptorMismatch`.
    pub fn decode<R: Read>(r: &mut R) -> EncapsulerResult<Self> {
        Self::decode_inner(r).map_err(|e| match e {
            EncapsulerError::FileError(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                EncapsulerError::DescriptorMismatch("truncated descriptor".into())
            }
            other => other,
        })
    }

    fn decode_inner<R: Read>(r: &mut R) -> EncapsulerResult<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != DESCRIPTOR_MAGIC {
            return Err(EncapsulerError::DescriptorMismatch("bad magic".into()));
        }
        let version = r.read_u32::<BigEndian>()?;
        if version != DESCRIPTOR_VERSION {
            return Err(EncapsulerError::DescriptorMismatch(format!(
                "version {version}, expected {DESCRIPTOR_VERSION}"
            )));
        }
        let declared_len = r.read_u32::<BigEndian>()? as u64;
        let session = SessionBlock::read_from(r)?;

        let codec = VideoCodec::from_u8(r.read_u8()?)
            .ok_or_else(|| EncapsulerError::DescriptorMismatch("unknown video codec".into()))?;
        r.read_u8()?;
        let width = r.read_u16::<BigEndian>()?;
        let height = r.read_u16::<BigEndian>()?;
        let default_frame_duration_us = r.read_u32::<BigEndian>()?;
        let first_frame_timestamp_us = r.read_u64::<BigEndian>()?;
        let sps_len = r.read_u16::<BigEndian>()? as usize;
        let pps_len = r.read_u16::<BigEndian>()? as usize;
        let mut sps = vec![0u8; sps_len];
        r.read_exact(&mut sps)?;
        let mut pps = vec![0u8; pps_len];
        r.read_exact(&mut pps)?;

        let metadata_present = r.read_u8()?;
        let block_size = r.read_u32::<BigEndian>()?;
        let content_encoding = read_fixed_str(r, STSD_INFO_LEN)?;
        let mime_format = read_fixed_str(r, STSD_INFO_LEN)?;
        let metadata = (metadata_present != 0).then_some(MetadataBlock {
            block_size,
            content_encoding,
            mime_format,
        });
        let audio = AudioBlock::read_from(r)?;

        let descriptor = Self {
            session,
            video: VideoBlock {
                codec,
                width,
                height,
                default_frame_duration_us,
                first_frame_timestamp_us,
            },
            sps,
            pps,
            metadata,
            audio,
        };
        if descriptor.records_offset() - PREAMBLE_LEN != declared_len {
            return Err(EncapsulerError::DescriptorMismatch("descriptor length mismatch".into()));
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_descriptor() -> Descriptor {
        Descriptor {
            session: SessionBlock {
                timescale: 60_000,
                fps: 30,
                creation_time: 1_427_882_400,
                product_id: 0x0901,
                pvat_offset: 32,
                mdat_offset: 552,
                data_offset: 568,
                run_uuid: "4F1C".into(),
                run_date: "2015-04-01T120000+0200".into(),
                extras: SessionExtras::default(),
            },
            video: VideoBlock {
                codec: VideoCodec::H264,
                width: 640,
                height: 480,
                default_frame_duration_us: 33_333,
                first_frame_timestamp_us: 1_000,
            },
            sps: vec![0x67, 0x42, 0x80, 0x1e],
            pps: vec![0x68, 0xce],
            metadata: Some(MetadataBlock {
                block_size: 64,
                content_encoding: String::new(),
                mime_format: "application/octet-stream".into(),
            }),
            audio: None,
        }
    }

    #[test]
    fn record_line_format() {
        let record = InfoRecord {
            track: TrackTag::Video,
            size: 1234,
            kind: SampleKind::Sync,
            delta_us: 33_333,
        };
        assert_eq!(record.encode(), "v;1234;i;33333\n");
        assert_eq!(InfoRecord::parse(b"v;1234;i;33333"), Some(record));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(InfoRecord::parse(b"v;12"), None);
        assert_eq!(InfoRecord::parse(b"x;12;i;0"), None);
        assert_eq!(InfoRecord::parse(b"v;12;i;0;9"), None);
        assert_eq!(InfoRecord::parse(b"v;-3;i;0"), None);
        assert_eq!(InfoRecord::parse(b"vv;3;i;0"), None);
    }

    #[test]
    fn read_stops_at_partial_line() {
        let log = b"v;100;i;0\na;400;m;0\nv;90;p;33333\nv;8";
        let (records, consumed) = read_records(Cursor::new(&log[..])).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].line_end, 20);
        assert_eq!(records[2].record.track, TrackTag::Video);
        assert_eq!(consumed, 33);
    }

    #[test]
    fn read_stops_at_garbage() {
        let log = b"v;100;i;0\n\0\0\0\nv;90;p;33333\n";
        let (records, consumed) = read_records(Cursor::new(&log[..])).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn descriptor_layout() {
        let descriptor = sample_descriptor();
        let (bytes, reduced) = descriptor.encode().unwrap();
        assert!(!reduced);
        assert_eq!(bytes.len() as u64, descriptor.records_offset());
        assert_eq!(&bytes[..4], b"ENCD");
        assert_eq!(descriptor.audio_block_offset(), descriptor.records_offset() - AUDIO_BLOCK_LEN);

        let decoded = Descriptor::decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn in_place_blocks_match_full_encoding() {
        let mut descriptor = sample_descriptor();
        descriptor.audio = Some(AudioBlock {
            codec: AudioCodec::PcmLe,
            format: AudioFormat::S16,
            channels: 2,
            sample_rate: 48_000,
            default_sample_duration_us: 21_333,
        });
        let (full, _) = descriptor.encode().unwrap();
        let audio = descriptor.encode_audio().unwrap();
        let at = descriptor.audio_block_offset() as usize;
        assert_eq!(&full[at..at + audio.len()], &audio[..]);

        let (session, _) = descriptor.encode_session().unwrap();
        let at = Descriptor::session_block_offset() as usize;
        assert_eq!(&full[at..at + session.len()], &session[..]);
    }

    #[test]
    fn version_mismatch() {
        let (mut bytes, _) = sample_descriptor().encode().unwrap();
        bytes[7] = 1;
        assert!(matches!(
            Descriptor::decode(&mut Cursor::new(bytes)),
            Err(EncapsulerError::DescriptorMismatch(_))
        ));
    }

    #[test]
    fn truncated_descriptor() {
        let (bytes, _) = sample_descriptor().encode().unwrap();
        assert!(matches!(
            Descriptor::decode(&mut Cursor::new(&bytes[..200])),
            Err(EncapsulerError::DescriptorMismatch(_))
        ));
        assert!(matches!(
            Descriptor::decode(&mut Cursor::new(Vec::new())),
            Err(EncapsulerError::DescriptorMismatch(_))
        ));
    }

    #[test]
    fn oversized_untimed_metadata_is_dropped_from_slot() {
        let mut descriptor = sample_descriptor();
        descriptor.session.extras.untimed = Some(UntimedMetadata {
            comment: "c".repeat(EXTRAS_SLOT_LEN),
            ..Default::default()
        });
        let (bytes, reduced) = descriptor.encode().unwrap();
        assert!(reduced);
        let decoded = Descriptor::decode(&mut Cursor::new(bytes)).unwrap();
        assert!(decoded.session.extras.untimed.is_none());
    }
}
