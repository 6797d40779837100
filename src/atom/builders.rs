//! Exact-layout box builders.
//!
//! Every function returns a finished [`Atom`] and performs no I/O. Fixed
//! layouts follow the QuickTime / ISO-BMFF field positions byte for byte;
//! players read several of them at fixed offsets.

use super::Atom;
use crate::media::{AudioFormat, MediaType, VideoCodec, NEXT_TRACK_ID};

/// Seconds between 1904-01-01 (QuickTime epoch) and 1970-01-01.
pub const MP4_EPOCH_OFFSET: i64 = 2_082_844_800;

/// `und` packed as ISO-639-2/T in 15 bits.
const LANGUAGE_UNDETERMINED: u16 = 0x55c4;

const UNITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

/// `data` class for UTF-8 text.
pub const DATA_CLASS_UTF8: u8 = 1;
/// `data` class for JPEG images.
pub const DATA_CLASS_JPEG: u8 = 13;

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_zeros(buf: &mut Vec<u8>, count: usize) {
    buf.resize(buf.len() + count, 0);
}

fn put_matrix(buf: &mut Vec<u8>) {
    for v in UNITY_MATRIX {
        put_u32(buf, v);
    }
}

/// Unix seconds to a 32-bit QuickTime date.
pub fn mp4_date(unix_seconds: i64) -> u32 {
    (unix_seconds + MP4_EPOCH_OFFSET) as u32
}

// ---------------------------------------------------------------------------
// File level
// ---------------------------------------------------------------------------

pub fn ftyp(codec: VideoCodec) -> Atom {
    let mut buf = Vec::with_capacity(24);
    match codec {
        VideoCodec::Mjpeg => {
            buf.extend_from_slice(b"qt  ");
            put_u32(&mut buf, 0x200);
            buf.extend_from_slice(b"qt  ");
        }
        _ => {
            buf.extend_from_slice(b"isom");
            put_u32(&mut buf, 0x200);
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso2");
            buf.extend_from_slice(b"mp41");
            buf.extend_from_slice(b"avc1");
        }
    }
    Atom::leaf(b"ftyp", buf)
}

/// The 16-byte mdat header for `payload_len` bytes of media.
///
/// Small files get an 8-byte `free` box whose payload is the compact
/// `[size]mdat` header; files past 32-bit addressing get `mdat` with the
/// large-size sentinel and a 64-bit size.
pub fn mdat_header(payload_len: u64) -> Atom {
    let mdat_size = payload_len + 8;
    if mdat_size <= u32::MAX as u64 {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&(mdat_size as u32).to_be_bytes());
        data[4..].copy_from_slice(b"mdat");
        Atom::wide(b"free", 8, data)
    } else {
        Atom::wide(b"mdat", super::LARGE_SIZE_SENTINEL, (mdat_size + 8).to_be_bytes())
    }
}

/// Header region written while recording: a `free` placeholder followed by
/// an mdat with size 0, which readers treat as "extends to end of file".
pub fn mdat_header_open() -> Atom {
    let mut data = [0u8; 8];
    data[4..].copy_from_slice(b"mdat");
    Atom::wide(b"free", 8, data)
}

/// A `free` box that serializes to exactly `total_len` bytes.
pub fn free(total_len: u32) -> Atom {
    Atom::leaf(b"free", vec![0; total_len.saturating_sub(8) as usize])
}

// ---------------------------------------------------------------------------
// Movie and track headers
// ---------------------------------------------------------------------------

pub fn mvhd(timescale: u32, duration: u32, creation_time: i64) -> Atom {
    let date = mp4_date(creation_time);
    let mut buf = Vec::with_capacity(100);
    put_u32(&mut buf, 0); // version + flags
    put_u32(&mut buf, date); // creation
    put_u32(&mut buf, date); // modification
    put_u32(&mut buf, timescale);
    put_u32(&mut buf, duration);
    put_u32(&mut buf, 0x00010000); // rate 1.0
    put_u16(&mut buf, 0x0100); // volume 1.0
    put_zeros(&mut buf, 10);
    put_matrix(&mut buf);
    put_zeros(&mut buf, 24); // pre_defined
    put_u32(&mut buf, NEXT_TRACK_ID);
    Atom::leaf(b"mvhd", buf)
}

pub fn tkhd(media: MediaType, width: u16, height: u16, duration: u32, creation_time: i64) -> Atom {
    let date = mp4_date(creation_time);
    let mut buf = Vec::with_capacity(84);
    put_u32(&mut buf, 0x0000000f); // enabled | in movie | in preview | in poster
    put_u32(&mut buf, date);
    put_u32(&mut buf, date);
    put_u32(&mut buf, media.track_id());
    put_u32(&mut buf, 0);
    put_u32(&mut buf, duration);
    put_zeros(&mut buf, 8);
    if media == MediaType::Sound {
        put_u16(&mut buf, 0); // layer
        put_u16(&mut buf, 1); // alternate group
        put_u16(&mut buf, 0x0100); // volume 1.0
        put_u16(&mut buf, 0);
    } else {
        put_zeros(&mut buf, 8);
    }
    put_matrix(&mut buf);
    if media == MediaType::Video {
        put_u16(&mut buf, width);
        put_u16(&mut buf, 0);
        put_u16(&mut buf, height);
        put_u16(&mut buf, 0);
    } else {
        put_zeros(&mut buf, 8);
    }
    Atom::leaf(b"tkhd", buf)
}

/// `tref` holding a single `cdsc` reference list.
pub fn tref_cdsc(target_track_ids: &[u32]) -> Atom {
    let mut buf = Vec::with_capacity(target_track_ids.len() * 4);
    for id in target_track_ids {
        put_u32(&mut buf, *id);
    }
    Atom::container(b"tref").with(Atom::leaf(b"cdsc", buf))
}

pub fn mdhd(timescale: u32, duration: u32, creation_time: i64) -> Atom {
    let date = mp4_date(creation_time);
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, date);
    put_u32(&mut buf, date);
    put_u32(&mut buf, timescale);
    put_u32(&mut buf, duration);
    put_u16(&mut buf, LANGUAGE_UNDETERMINED);
    put_u16(&mut buf, 0); // quality
    Atom::leaf(b"mdhd", buf)
}

// ---------------------------------------------------------------------------
// Handlers and media headers
// ---------------------------------------------------------------------------

fn hdlr(component_type: &[u8; 4], subtype: &[u8; 4], manufacturer: &[u8; 4]) -> Atom {
    let mut buf = Vec::with_capacity(25);
    put_u32(&mut buf, 0);
    buf.extend_from_slice(component_type);
    buf.extend_from_slice(subtype);
    buf.extend_from_slice(manufacturer);
    put_zeros(&mut buf, 9); // flags, mask, empty name
    Atom::leaf(b"hdlr", buf)
}

/// Media handler inside `mdia`.
pub fn hdlr_media(media: MediaType) -> Atom {
    let subtype = match media {
        MediaType::Video => b"vide",
        MediaType::Sound => b"soun",
        MediaType::Metadata => b"meta",
    };
    hdlr(b"mhlr", subtype, &[0; 4])
}

/// Data handler inside `minf`.
pub fn hdlr_data() -> Atom {
    hdlr(b"dhlr", b"url ", &[0; 4])
}

/// Handler of the iTunes-style `udta/meta` box.
pub fn hdlr_udta_meta() -> Atom {
    hdlr(&[0; 4], b"mdir", b"appl")
}

/// Handler of the keyed `moov/meta` box.
pub fn hdlr_keyed_meta() -> Atom {
    hdlr(&[0; 4], b"mdta", &[0; 4])
}

pub fn vmhd() -> Atom {
    Atom::leaf(b"vmhd", vec![0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])
}

pub fn smhd() -> Atom {
    Atom::leaf(b"smhd", vec![0; 8])
}

pub fn nmhd() -> Atom {
    Atom::leaf(b"nmhd", vec![0; 4])
}

/// `dinf` with a single self-contained `url ` reference.
pub fn dinf() -> Atom {
    let mut buf = Vec::with_capacity(20);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 1); // entry count
    put_u32(&mut buf, 12);
    buf.extend_from_slice(b"url ");
    put_u32(&mut buf, 1); // self-contained
    Atom::container(b"dinf").with(Atom::leaf(b"dref", buf))
}

// ---------------------------------------------------------------------------
// Sample descriptions
// ---------------------------------------------------------------------------

/// Common 86-byte visual sample entry plus an optional extension box.
fn visual_sample_entry(format: &[u8; 4], width: u16, height: u16, extension: Option<Atom>) -> Atom {
    let mut buf = Vec::with_capacity(78);
    put_zeros(&mut buf, 6);
    put_u16(&mut buf, 1); // data reference index
    put_u16(&mut buf, 0); // version
    put_u16(&mut buf, 0); // revision
    buf.extend_from_slice(b"PAOT"); // vendor
    put_u32(&mut buf, 0x200); // temporal quality
    put_u32(&mut buf, 0x200); // spatial quality
    put_u16(&mut buf, width);
    put_u16(&mut buf, height);
    put_u32(&mut buf, 0x00480000); // 72 dpi
    put_u32(&mut buf, 0x00480000);
    put_u32(&mut buf, 0); // data size
    put_u16(&mut buf, 1); // frame count
    put_zeros(&mut buf, 32); // compressor name
    put_u16(&mut buf, 0x18); // depth
    put_u16(&mut buf, 0xffff); // no color table
    Atom::leaf(format, buf).with_opt(extension)
}

fn stsd(entry: Atom) -> Atom {
    let mut buf = Vec::with_capacity(8 + entry.serialized_len() as usize);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 1);
    buf.extend_from_slice(&entry.into_bytes());
    Atom::leaf(b"stsd", buf)
}

/// `avcC` decoder configuration from SPS and PPS NAL units (no start codes).
pub fn avcc(sps: &[u8], pps: &[u8]) -> Atom {
    let profile = sps.get(1..4).unwrap_or(&[0, 0, 0]);
    let mut buf = Vec::with_capacity(11 + sps.len() + pps.len());
    buf.push(1); // configuration version
    buf.extend_from_slice(profile); // profile, compatibility, level
    buf.push(0xff); // 4-byte NAL lengths
    buf.push(0xe1); // one SPS
    put_u16(&mut buf, sps.len() as u16);
    buf.extend_from_slice(sps);
    buf.push(1); // one PPS
    put_u16(&mut buf, pps.len() as u16);
    buf.extend_from_slice(pps);
    Atom::leaf(b"avcC", buf)
}

pub fn stsd_avc(width: u16, height: u16, sps: &[u8], pps: &[u8]) -> Atom {
    stsd(visual_sample_entry(b"avc1", width, height, Some(avcc(sps, pps))))
}

pub fn stsd_jpeg(width: u16, height: u16) -> Atom {
    stsd(visual_sample_entry(b"jpeg", width, height, None))
}

/// QuickTime `sowt` entry for little-endian PCM with a `chan` layout.
pub fn stsd_pcm(format: AudioFormat, channels: u16, sample_rate: u16) -> Atom {
    let mut buf = Vec::with_capacity(52);
    put_zeros(&mut buf, 6);
    put_u16(&mut buf, 1); // data reference index
    put_u32(&mut buf, 0); // version + revision
    put_u32(&mut buf, 0); // vendor
    put_u16(&mut buf, channels);
    put_u16(&mut buf, format.bits());
    put_u16(&mut buf, 0); // compression id
    put_u16(&mut buf, 0); // packet size
    put_u16(&mut buf, sample_rate); // 16.16 rate
    put_u16(&mut buf, 0);

    let mut chan = Vec::with_capacity(16);
    put_u32(&mut chan, 0);
    put_u32(&mut chan, 0x00640001); // kAudioChannelLayoutTag_UseChannelBitmap
    put_u64(&mut chan, 0);

    stsd(Atom::leaf(b"sowt", buf).with(Atom::leaf(b"chan", chan)))
}

/// Timed metadata entry: NUL-terminated content encoding then MIME format.
pub fn stsd_mett(content_encoding: &str, mime_format: &str) -> Atom {
    let mut buf = Vec::with_capacity(10 + content_encoding.len() + mime_format.len());
    put_zeros(&mut buf, 6);
    put_u16(&mut buf, 1);
    buf.extend_from_slice(content_encoding.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mime_format.as_bytes());
    buf.push(0);
    stsd(Atom::leaf(b"mett", buf))
}

// ---------------------------------------------------------------------------
// Sample tables
// ---------------------------------------------------------------------------

/// `(sample_count, sample_delta)` runs.
pub fn stts(runs: &[(u32, u32)]) -> Atom {
    let mut buf = Vec::with_capacity(8 + runs.len() * 8);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, runs.len() as u32);
    for (count, delta) in runs {
        put_u32(&mut buf, *count);
        put_u32(&mut buf, *delta);
    }
    Atom::leaf(b"stts", buf)
}

/// 1-based sync sample numbers.
pub fn stss(sync_samples: &[u32]) -> Atom {
    let mut buf = Vec::with_capacity(8 + sync_samples.len() * 4);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, sync_samples.len() as u32);
    for sample in sync_samples {
        put_u32(&mut buf, *sample);
    }
    Atom::leaf(b"stss", buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub description_index: u32,
}

pub fn stsc(entries: &[StscEntry]) -> Atom {
    let mut buf = Vec::with_capacity(8 + entries.len() * 12);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, entries.len() as u32);
    for entry in entries {
        put_u32(&mut buf, entry.first_chunk);
        put_u32(&mut buf, entry.samples_per_chunk);
        put_u32(&mut buf, entry.description_index);
    }
    Atom::leaf(b"stsc", buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSizes {
    Uniform { size: u32, count: u32 },
    Table(Vec<u32>),
}

impl SampleSizes {
    /// Collapse to `Uniform` when every sample has the same size.
    pub fn from_sizes(sizes: Vec<u32>) -> Self {
        match sizes.first() {
            Some(&first) if sizes.iter().all(|&s| s == first) => Self::Uniform {
                size: first,
                count: sizes.len() as u32,
            },
            _ => Self::Table(sizes),
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            Self::Uniform { count, .. } => *count,
            Self::Table(sizes) => sizes.len() as u32,
        }
    }
}

pub fn stsz(sizes: &SampleSizes) -> Atom {
    let mut buf = Vec::with_capacity(12);
    put_u32(&mut buf, 0);
    match sizes {
        SampleSizes::Uniform { size, count } => {
            put_u32(&mut buf, *size);
            put_u32(&mut buf, *count);
        }
        SampleSizes::Table(table) => {
            put_u32(&mut buf, 0);
            put_u32(&mut buf, table.len() as u32);
            buf.reserve(table.len() * 4);
            for size in table {
                put_u32(&mut buf, *size);
            }
        }
    }
    Atom::leaf(b"stsz", buf)
}

/// `co64` when `wide`, otherwise `stco` with offsets truncated to 32 bits.
pub fn chunk_offsets(offsets: &[u64], wide: bool) -> Atom {
    let entry_len = if wide { 8 } else { 4 };
    let mut buf = Vec::with_capacity(8 + offsets.len() * entry_len);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, offsets.len() as u32);
    for offset in offsets {
        if wide {
            put_u64(&mut buf, *offset);
        } else {
            put_u32(&mut buf, *offset as u32);
        }
    }
    Atom::leaf(if wide { b"co64" } else { b"stco" }, buf)
}

// ---------------------------------------------------------------------------
// Metadata items
// ---------------------------------------------------------------------------

/// `data` box: type indicator (class) then a zero locale.
pub fn data(class: u8, value: &[u8]) -> Atom {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&[0, 0, 0, class, 0, 0, 0, 0]);
    buf.extend_from_slice(value);
    Atom::leaf(b"data", buf)
}

/// `ilst` item named by a four-character code, e.g. `©ART`.
pub fn ilst_item(tag: &[u8; 4], class: u8, value: &[u8]) -> Atom {
    Atom::container(tag).with(data(class, value))
}

/// `ilst` item referencing the 1-based index of a `keys` entry.
pub fn keyed_item(key_index: u32, class: u8, value: &[u8]) -> Atom {
    ilst_item(&key_index.to_be_bytes(), class, value)
}

pub fn keys<S: AsRef<str>>(keys: &[S]) -> Atom {
    let mut buf = Vec::new();
    put_u32(&mut buf, 0);
    put_u32(&mut buf, keys.len() as u32);
    for key in keys {
        let key = key.as_ref().as_bytes();
        put_u32(&mut buf, 8 + key.len() as u32);
        buf.extend_from_slice(b"mdta");
        buf.extend_from_slice(key);
    }
    Atom::leaf(b"keys", buf)
}

/// `©xyz` user-data location: be16 length, language, ISO 6709 string.
pub fn xyz(location: &str) -> Atom {
    let mut buf = Vec::with_capacity(4 + location.len());
    put_u16(&mut buf, location.len() as u16);
    put_u16(&mut buf, 0x15c7);
    buf.extend_from_slice(location.as_bytes());
    Atom::leaf(b"\xA9xyz", buf)
}
