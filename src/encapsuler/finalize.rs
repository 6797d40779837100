//! Turning a recorded session into a playable file.
//!
//! The info log is replayed into sample tables, `moov` is appended after the
//! last media byte, and the head placeholders (pvat slot and mdat header)
//! are overwritten. The same path serves live sessions and recovery.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::info_log::{self, AudioBlock, Descriptor, LoggedRecord, SampleKind, TrackTag};
use super::SessionPaths;
use crate::atom::builders::{self, SampleSizes, StscEntry};
use crate::atom::metadata::{self, UntimedMetadata};
use crate::atom::Atom;
use crate::config::OffsetMode;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::logging::Logger;
use crate::media::{MediaType, VideoCodec};
use crate::pvat::{self, PvatDescription};

/// Microseconds to timescale units, rounded to nearest.
pub fn to_timescale(delta_us: u64, timescale: u32) -> u32 {
    let units = (delta_us * timescale as u64 + 500_000) / 1_000_000;
    u32::try_from(units).unwrap_or(u32::MAX)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// `stts` run builder. The first sample has no meaningful delta, so it is
/// skipped during the scan and counted into the last run with the default
/// duration once the track ends.
#[derive(Debug, Default, Clone)]
pub struct DurationRuns {
    runs: Vec<(u32, u32)>,
    current: Option<(u32, u32)>,
    seen_first: bool,
}

impl DurationRuns {
    pub fn push(&mut self, duration: u32) {
        if !self.seen_first {
            self.seen_first = true;
            return;
        }
        self.current = match self.current {
            Some((count, d)) if d == duration => Some((count + 1, d)),
            Some(run) => {
                self.runs.push(run);
                Some((1, duration))
            }
            None => Some((1, duration)),
        };
    }

    /// `(count, duration)` entries summing to the number of pushed samples.
    pub fn finish(mut self, default_duration: u32) -> Vec<(u32, u32)> {
        if !self.seen_first {
            return self.runs;
        }
        match self.current {
            Some((count, d)) if d == default_duration => self.runs.push((count + 1, d)),
            Some(run) => {
                self.runs.push(run);
                self.runs.push((1, default_duration));
            }
            None => self.runs.push((1, default_duration)),
        }
        self.runs
    }
}

/// Total duration of `stts` runs.
pub fn runs_duration(runs: &[(u32, u32)]) -> u64 {
    runs.iter().map(|&(count, d)| count as u64 * d as u64).sum()
}

/// Per-sample tables of the video or metadata track: one sample per chunk.
#[derive(Debug, Default, Clone)]
pub struct TrackTables {
    pub sizes: Vec<u32>,
    pub offsets: Vec<u64>,
    /// 1-based sync sample numbers.
    pub sync_samples: Vec<u32>,
    pub durations: DurationRuns,
}

impl TrackTables {
    fn push(&mut self, offset: u64, size: u64, delta_us: u32, timescale: u32) -> EncapsulerResult<()> {
        let size = u32::try_from(size)
            .map_err(|_| EncapsulerError::BadParameter(format!("{size}-byte sample does not fit stsz")))?;
        self.sizes.push(size);
        self.offsets.push(offset);
        self.durations.push(to_timescale(delta_us as u64, timescale));
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.sizes.len()
    }
}

/// Audio is stored as one chunk per ingested buffer.
#[derive(Debug, Default, Clone)]
pub struct AudioTables {
    pub chunk_offsets: Vec<u64>,
    pub chunk_sizes: Vec<u64>,
    pub total_bytes: u64,
}

impl AudioTables {
    pub fn sample_count(&self, block: &AudioBlock) -> u64 {
        self.total_bytes / block.frame_bytes()
    }

    /// One entry per run of chunks holding the same number of samples.
    pub fn stsc_entries(&self, block: &AudioBlock) -> Vec<StscEntry> {
        let mut entries: Vec<StscEntry> = Vec::new();
        for (index, size) in self.chunk_sizes.iter().enumerate() {
            let samples_per_chunk = clamp_u32(size / block.frame_bytes());
            if entries.last().map(|e| e.samples_per_chunk) != Some(samples_per_chunk) {
                entries.push(StscEntry {
                    first_chunk: index as u32 + 1,
                    samples_per_chunk,
                    description_index: 1,
                });
            }
        }
        entries
    }
}

/// Everything `moov` needs, rebuilt from the info log.
#[derive(Debug, Default, Clone)]
pub struct SampleTables {
    pub video: TrackTables,
    pub metadata: TrackTables,
    pub audio: AudioTables,
    /// Media bytes following `data_offset`.
    pub data_len: u64,
}

impl SampleTables {
    pub fn replay(records: &[LoggedRecord], descriptor: &Descriptor) -> EncapsulerResult<Self> {
        let timescale = descriptor.session.timescale;
        let mut tables = Self::default();
        let mut offset = descriptor.session.data_offset;
        for LoggedRecord { record, .. } in records {
            match record.track {
                TrackTag::Video => {
                    tables.video.push(offset, record.size, record.delta_us, timescale)?;
                    if record.kind == SampleKind::Sync {
                        tables.video.sync_samples.push(tables.video.count() as u32);
                    }
                }
                TrackTag::Metadata => {
                    if descriptor.metadata.is_none() {
                        return Err(EncapsulerError::DescriptorMismatch(
                            "metadata record without a metadata track".into(),
                        ));
                    }
                    tables.metadata.push(offset, record.size, record.delta_us, timescale)?;
                }
                TrackTag::Audio => {
                    if descriptor.audio.is_none() {
                        return Err(EncapsulerError::DescriptorMismatch(
                            "audio record without an audio track".into(),
                        ));
                    }
                    tables.audio.chunk_offsets.push(offset);
                    tables.audio.chunk_sizes.push(record.size);
                    tables.audio.total_bytes += record.size;
                }
            }
            offset += record.size;
        }
        tables.data_len = offset - descriptor.session.data_offset;
        Ok(tables)
    }

    /// Largest chunk offset of any track.
    fn max_offset(&self) -> u64 {
        [&self.video.offsets, &self.metadata.offsets, &self.audio.chunk_offsets]
            .into_iter()
            .filter_map(|offsets| offsets.last().copied())
            .max()
            .unwrap_or(0)
    }
}

fn stbl(stsd: Atom, stts: Atom, stss: Option<Atom>, stsc: Atom, stsz: Atom, stco: Atom) -> Atom {
    Atom::container(b"stbl")
        .with(stsd)
        .with(stts)
        .with_opt(stss)
        .with(stsc)
        .with(stsz)
        .with(stco)
}

const ONE_SAMPLE_PER_CHUNK: [StscEntry; 1] = [StscEntry {
    first_chunk: 1,
    samples_per_chunk: 1,
    description_index: 1,
}];

/// Track boxes and the movie duration in movie timescale units.
struct MovieTracks {
    traks: Vec<Atom>,
    duration: u64,
}

fn video_trak(descriptor: &Descriptor, tables: &TrackTables, wide: bool) -> (Atom, u64) {
    let session = &descriptor.session;
    let video = &descriptor.video;
    let default = to_timescale(video.default_frame_duration_us as u64, session.timescale);
    let runs = tables.durations.clone().finish(default);
    let duration = runs_duration(&runs);

    let (stsd, stss, data_handler) = match video.codec {
        VideoCodec::Mjpeg => (builders::stsd_jpeg(video.width, video.height), None, None),
        _ => (
            builders::stsd_avc(video.width, video.height, &descriptor.sps, &descriptor.pps),
            Some(builders::stss(&tables.sync_samples)),
            Some(builders::hdlr_data()),
        ),
    };
    let minf = Atom::container(b"minf")
        .with(builders::vmhd())
        .with_opt(data_handler)
        .with(builders::dinf())
        .with(stbl(
            stsd,
            builders::stts(&runs),
            stss,
            builders::stsc(&ONE_SAMPLE_PER_CHUNK),
            builders::stsz(&SampleSizes::from_sizes(tables.sizes.clone())),
            builders::chunk_offsets(&tables.offsets, wide),
        ));
    let mdia = Atom::container(b"mdia")
        .with(builders::mdhd(session.timescale, clamp_u32(duration), session.creation_time))
        .with(builders::hdlr_media(MediaType::Video))
        .with(minf);
    let trak = Atom::container(b"trak")
        .with(builders::tkhd(
            MediaType::Video,
            video.width,
            video.height,
            clamp_u32(duration),
            session.creation_time,
        ))
        .with(mdia);
    (trak, duration)
}

fn metadata_trak(descriptor: &Descriptor, tables: &TrackTables, wide: bool) -> Option<(Atom, u64)> {
    let info = descriptor.metadata.as_ref()?;
    if tables.count() == 0 {
        return None;
    }
    let session = &descriptor.session;
    let default = to_timescale(descriptor.video.default_frame_duration_us as u64, session.timescale);
    let runs = tables.durations.clone().finish(default);
    let duration = runs_duration(&runs);

    let minf = Atom::container(b"minf")
        .with(builders::nmhd())
        .with(builders::dinf())
        .with(stbl(
            builders::stsd_mett(&info.content_encoding, &info.mime_format),
            builders::stts(&runs),
            None,
            builders::stsc(&ONE_SAMPLE_PER_CHUNK),
            builders::stsz(&SampleSizes::from_sizes(tables.sizes.clone())),
            builders::chunk_offsets(&tables.offsets, wide),
        ));
    let mdia = Atom::container(b"mdia")
        .with(builders::mdhd(session.timescale, clamp_u32(duration), session.creation_time))
        .with(builders::hdlr_media(MediaType::Metadata))
        .with(minf);
    let trak = Atom::container(b"trak")
        .with(builders::tkhd(MediaType::Metadata, 0, 0, clamp_u32(duration), session.creation_time))
        .with(builders::tref_cdsc(&[MediaType::Video.track_id()]))
        .with(mdia);
    Some((trak, duration))
}

fn audio_trak(descriptor: &Descriptor, tables: &AudioTables, wide: bool) -> Option<(Atom, u64)> {
    let block = descriptor.audio.as_ref()?;
    if tables.chunk_sizes.is_empty() {
        return None;
    }
    let session = &descriptor.session;
    let samples = tables.sample_count(block);
    let movie_duration = samples * session.timescale as u64 / block.sample_rate as u64;

    let minf = Atom::container(b"minf")
        .with(builders::smhd())
        .with(builders::dinf())
        .with(stbl(
            builders::stsd_pcm(block.format, block.channels, block.sample_rate as u16),
            builders::stts(&[(clamp_u32(samples), 1)]),
            None,
            builders::stsc(&tables.stsc_entries(block)),
            builders::stsz(&SampleSizes::Uniform {
                size: block.frame_bytes() as u32,
                count: clamp_u32(samples),
            }),
            builders::chunk_offsets(&tables.chunk_offsets, wide),
        ));
    let mdia = Atom::container(b"mdia")
        .with(builders::mdhd(block.sample_rate, clamp_u32(samples), session.creation_time))
        .with(builders::hdlr_media(MediaType::Sound))
        .with(minf);
    let trak = Atom::container(b"trak")
        .with(builders::tkhd(MediaType::Sound, 0, 0, clamp_u32(movie_duration), session.creation_time))
        .with(mdia);
    Some((trak, movie_duration))
}

fn build_tracks(descriptor: &Descriptor, tables: &SampleTables) -> MovieTracks {
    let wide = descriptor.session.extras.config.offsets == OffsetMode::Always64
        || tables.max_offset() > u32::MAX as u64;

    let (video, mut duration) = video_trak(descriptor, &tables.video, wide);
    let mut traks = vec![video];
    for (trak, track_duration) in [
        metadata_trak(descriptor, &tables.metadata, wide),
        audio_trak(descriptor, &tables.audio, wide),
    ]
    .into_iter()
    .flatten()
    {
        duration = duration.max(track_duration);
        traks.push(trak);
    }
    MovieTracks { traks, duration }
}

/// Untimed metadata, with the session GPS fix as take-off location when
/// the metadata carries none.
fn effective_untimed(descriptor: &Descriptor) -> Option<UntimedMetadata> {
    let extras = &descriptor.session.extras;
    let mut untimed = extras.untimed.clone();
    if extras.gps.is_set() {
        let md = untimed.get_or_insert_with(UntimedMetadata::default);
        if !md.takeoff.is_set() {
            md.takeoff = extras.gps;
        }
    }
    untimed
}

/// Complete `moov` for a replayed session.
pub fn build_moov(descriptor: &Descriptor, tables: &SampleTables, logger: &Logger) -> EncapsulerResult<Atom> {
    if tables.video.count() == 0 {
        return Err(EncapsulerError::BadParameter("no video sample to finalize".into()));
    }
    let session = &descriptor.session;
    let MovieTracks { traks, duration } = build_tracks(descriptor, tables);

    let mut moov = Atom::container(b"moov").with(builders::mvhd(
        session.timescale,
        clamp_u32(duration),
        session.creation_time,
    ));
    for trak in traks {
        moov.attach(trak);
    }

    let untimed = effective_untimed(descriptor);
    if let Some((udta, meta)) = metadata::untimed_boxes(
        untimed.as_ref(),
        session.extras.thumbnail.as_deref(),
        session.extras.config.udta_free_space,
        logger,
    ) {
        moov.attach(udta);
        moov.attach(meta);
    }
    Ok(moov)
}

fn pvat_json(descriptor: &Descriptor, paths: &SessionPaths, logger: &Logger) -> EncapsulerResult<String> {
    let session = &descriptor.session;
    let mut description = PvatDescription::new(session.product_id)
        .with_uuid(&session.run_uuid)
        .with_run_date(&session.run_date)
        .with_filename(&paths.output);
    match pvat::format_local_date(session.creation_time, &session.extras.config.media_date_format) {
        Ok(date) => description = description.with_media_date(date),
        Err(e) => logger.warn(format_args!("pvat media date omitted: {e}")),
    }
    description.to_json()
}

/// Write `moov` and the head boxes into the temp file, then move it to the
/// output path. The info file is removed once the data file is durable.
pub(crate) fn finalize(
    descriptor: &Descriptor,
    mut data: File,
    mut info: File,
    paths: &SessionPaths,
    logger: &Logger,
) -> EncapsulerResult<PathBuf> {
    info.seek(SeekFrom::Start(descriptor.records_offset()))?;
    let (records, _) = info_log::read_records(BufReader::new(&mut info))?;
    drop(info);
    let tables = SampleTables::replay(&records, descriptor)?;
    let moov = build_moov(descriptor, &tables, logger)?;

    let session = &descriptor.session;
    let data_end = session.data_offset + tables.data_len;
    let moov_len = moov.serialized_len();
    data.seek(SeekFrom::Start(data_end))?;
    {
        let mut writer = BufWriter::new(&mut data);
        moov.serialize(&mut writer)?;
        writer.flush()?;
    }
    data.set_len(data_end + moov_len)?;

    data.seek(SeekFrom::Start(session.mdat_offset))?;
    builders::mdat_header(tables.data_len).serialize(&mut data)?;

    let slot_len = u32::try_from(session.mdat_offset - session.pvat_offset)
        .map_err(|_| EncapsulerError::DescriptorMismatch("pvat slot too large".into()))?;
    let region = pvat::pvat_region(&pvat_json(descriptor, paths, logger)?, slot_len, logger);
    data.seek(SeekFrom::Start(session.pvat_offset))?;
    data.write_all(&region)?;
    data.sync_all()?;
    drop(data);

    if let Err(e) = fs::remove_file(&paths.info) {
        logger.warn(format_args!("could not remove {}: {e}", paths.info.display()));
    }
    fs::rename(&paths.temp, &paths.output)?;
    if session.creation_time >= 0 {
        let mtime: SystemTime = UNIX_EPOCH + Duration::from_secs(session.creation_time as u64);
        let result = OpenOptions::new()
            .write(true)
            .open(&paths.output)
            .and_then(|file| file.set_modified(mtime));
        if let Err(e) = result {
            logger.warn(format_args!("could not set mtime of {}: {e}", paths.output.display()));
        }
    }

    logger.info(format_args!(
        "finalized {}: {} video frames, {} audio chunks, {} metadata blocks, {} media bytes",
        paths.output.display(),
        tables.video.count(),
        tables.audio.chunk_sizes.len(),
        tables.metadata.count(),
        tables.data_len
    ));
    Ok(paths.output.clone())
}
