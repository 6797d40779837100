//! Appending video frames, timed metadata and audio to a session.

use std::borrow::Cow;
use std::io::Write;

use super::h264;
use super::info_log::{AudioBlock, InfoRecord, SampleKind, TrackTag};
use super::VideoEncapsuler;
use crate::atom::builders;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::media::{AudioSample, FramePayload, FrameType, VideoCodec, VideoFrame};

const ZEROS: [u8; 4096] = [0; 4096];

fn clamp_delta(delta_us: u64) -> u32 {
    u32::try_from(delta_us).unwrap_or(u32::MAX)
}

impl VideoEncapsuler {
    /// Append one video frame and, when a metadata track is declared, its
    /// metadata block.
    pub fn add_frame(&mut self, frame: &VideoFrame<'_>, metadata: Option<&[u8]>) -> EncapsulerResult<()> {
        if frame.payload.is_empty() {
            return Ok(());
        }
        let max_frames = self.config().max_frames;
        if self.video.frames_count >= max_frames {
            return Err(EncapsulerError::EncapsulerFull(max_frames));
        }
        if self.anchored {
            self.check_locked_format(frame)?;
        } else {
            self.check_first_frame(frame)?;
        }
        let metadata = self.check_metadata_block(metadata)?;

        let payload = self.frame_bytes(frame)?;
        let timestamp_us = match frame.timestamp_us {
            0 => self.video.last_timestamp_us + self.descriptor.video.default_frame_duration_us as u64,
            ts => ts,
        };
        let delta_us = if self.video.frames_count == 0 {
            0
        } else {
            clamp_delta(timestamp_us.saturating_sub(self.video.last_timestamp_us))
        };

        if !self.anchored {
            self.anchor(frame, timestamp_us)?;
        }

        let kind = match frame.codec {
            VideoCodec::H264 if frame.frame_type == FrameType::I => SampleKind::Sync,
            VideoCodec::H264 => SampleKind::Delta,
            _ => SampleKind::Sync,
        };
        let sync_now = match frame.codec {
            VideoCodec::H264 => kind == SampleKind::Sync,
            _ => self.video.frames_count % self.config().mjpeg_sync_interval == 0,
        };
        if sync_now {
            self.sync()?;
        }

        let record = InfoRecord {
            track: TrackTag::Video,
            size: payload.len() as u64,
            kind,
            delta_us,
        };
        self.info.write_all(record.encode().as_bytes())?;
        self.data.write_all(&payload)?;
        self.video.frames_count += 1;
        self.video.total_size += payload.len() as u64;
        self.video.last_timestamp_us = timestamp_us;

        if let Some(block) = metadata {
            self.append_metadata(block, timestamp_us)?;
        }
        Ok(())
    }

    fn check_first_frame(&mut self, frame: &VideoFrame<'_>) -> EncapsulerResult<()> {
        match frame.codec {
            VideoCodec::H264 => {
                if frame.frame_type != FrameType::I {
                    return Err(EncapsulerError::WaitingForIFrame);
                }
                if self.descriptor.sps.is_empty() || self.descriptor.pps.is_empty() {
                    let sets = match frame.payload {
                        FramePayload::Raw(data) => h264::extract_parameter_sets(data),
                        FramePayload::Nalus(nalus) => h264::extract_parameter_sets_split(nalus),
                    };
                    let (sps, pps) = sets
                        .ok_or_else(|| EncapsulerError::BadVideoFrame("no SPS/PPS in the first I-frame".into()))?;
                    if sps.len() > u16::MAX as usize || pps.len() > u16::MAX as usize {
                        return Err(EncapsulerError::BadVideoFrame("oversized SPS/PPS".into()));
                    }
                    self.descriptor.sps = sps;
                    self.descriptor.pps = pps;
                }
                Ok(())
            }
            VideoCodec::Mjpeg => Ok(()),
            other => Err(EncapsulerError::UnsupportedCodec(format!("{other:?}"))),
        }
    }

    fn check_locked_format(&self, frame: &VideoFrame<'_>) -> EncapsulerResult<()> {
        let video = &self.descriptor.video;
        if frame.codec != video.codec || frame.width != video.width || frame.height != video.height {
            return Err(EncapsulerError::BadVideoFrame(format!(
                "{:?} {}x{} does not match the recording ({:?} {}x{})",
                frame.codec, frame.width, frame.height, video.codec, video.width, video.height
            )));
        }
        Ok(())
    }

    fn check_metadata_block<'m>(&self, metadata: Option<&'m [u8]>) -> EncapsulerResult<Option<&'m [u8]>> {
        let Some(block) = metadata else {
            return Ok(None);
        };
        match &self.descriptor.metadata {
            Some(info) if block.len() == info.block_size as usize => Ok(Some(block)),
            Some(info) => Err(EncapsulerError::BadParameter(format!(
                "metadata block is {} bytes, track expects {}",
                block.len(),
                info.block_size
            ))),
            None => {
                self.logger
                    .debug(format_args!("metadata block ignored: no metadata track declared"));
                Ok(None)
            }
        }
    }

    /// Sample bytes as stored in the file.
    fn frame_bytes<'f>(&self, frame: &VideoFrame<'f>) -> EncapsulerResult<Cow<'f, [u8]>> {
        match frame.codec {
            VideoCodec::H264 => {
                let sets = frame
                    .insert_parameter_sets
                    .then(|| (self.descriptor.sps.as_slice(), self.descriptor.pps.as_slice()));
                match frame.payload {
                    FramePayload::Raw(data) => h264::annexb_to_avcc(data, sets).map(Cow::Owned),
                    FramePayload::Nalus(nalus) => Ok(Cow::Owned(h264::nalus_to_avcc(nalus, sets))),
                }
            }
            _ => match frame.payload {
                FramePayload::Raw(data) => Ok(Cow::Borrowed(data)),
                FramePayload::Nalus(_) => Err(EncapsulerError::BadVideoFrame(
                    "MJPEG frames must be a single buffer".into(),
                )),
            },
        }
    }

    /// Lay out the file head and write the descriptor.
    fn anchor(&mut self, frame: &VideoFrame<'_>, first_timestamp_us: u64) -> EncapsulerResult<()> {
        let ftyp = builders::ftyp(frame.codec);
        let ftyp_len = ftyp.serialized_len();
        let slot_len = self.config().pvat_slot_len();
        ftyp.serialize(&mut self.data)?;
        builders::free(slot_len as u32).serialize(&mut self.data)?;
        let mdat_header = builders::mdat_header_open();
        let mdat_header_len = mdat_header.serialized_len();
        mdat_header.serialize(&mut self.data)?;

        let session = &mut self.descriptor.session;
        session.pvat_offset = ftyp_len;
        session.mdat_offset = ftyp_len + slot_len;
        session.data_offset = session.mdat_offset + mdat_header_len;

        let video = &mut self.descriptor.video;
        video.codec = frame.codec;
        video.width = frame.width;
        video.height = frame.height;
        video.first_frame_timestamp_us = first_timestamp_us;

        let (descriptor, reduced) = self.descriptor.encode()?;
        if reduced {
            self.logger
                .warn(format_args!("untimed metadata too large to persist; it will be lost on recovery"));
        }
        self.info.write_all(&descriptor)?;
        self.anchored = true;
        self.logger.info(format_args!(
            "recording {:?} {}x{}, media data at offset {}",
            frame.codec, frame.width, frame.height, self.descriptor.session.data_offset
        ));
        Ok(())
    }

    fn append_metadata(&mut self, block: &[u8], timestamp_us: u64) -> EncapsulerResult<()> {
        let delta_us = if self.metadata.count == 0 {
            0
        } else {
            clamp_delta(timestamp_us.saturating_sub(self.metadata.last_timestamp_us))
        };
        let record = InfoRecord {
            track: TrackTag::Metadata,
            size: block.len() as u64,
            kind: SampleKind::Media,
            delta_us,
        };
        self.info.write_all(record.encode().as_bytes())?;
        self.data.write_all(block)?;
        self.metadata.count += 1;
        self.metadata.total_size += block.len() as u64;
        self.metadata.last_timestamp_us = timestamp_us;
        Ok(())
    }

    /// Append one buffer of interleaved PCM. Drift against the running
    /// theoretical timestamp beyond the configured threshold is absorbed by
    /// inserting silence or dropping leading samples.
    pub fn add_sample(&mut self, sample: &AudioSample<'_>) -> EncapsulerResult<()> {
        if !self.anchored {
            return Err(EncapsulerError::WaitingForIFrame);
        }
        if sample.data.is_empty() {
            return Ok(());
        }

        let first = self.descriptor.audio.is_none();
        let block = match self.descriptor.audio {
            Some(block) => {
                if sample.codec != block.codec
                    || sample.format != block.format
                    || sample.channels != block.channels
                    || sample.sample_rate != block.sample_rate
                {
                    return Err(EncapsulerError::BadAudioSample(format!(
                        "{} ch {} Hz {}-bit does not match the track ({} ch {} Hz {}-bit)",
                        sample.channels,
                        sample.sample_rate,
                        sample.format.bits(),
                        block.channels,
                        block.sample_rate,
                        block.format.bits()
                    )));
                }
                block
            }
            None => audio_block_for(sample)?,
        };
        if sample.data.len() as u64 % block.frame_bytes() != 0 {
            return Err(EncapsulerError::BadAudioSample(format!(
                "{} bytes is not a whole number of {}-byte frames",
                sample.data.len(),
                block.frame_bytes()
            )));
        }

        let mut theoretical_us = if first {
            self.descriptor.video.first_frame_timestamp_us as i64
        } else {
            self.audio.theoretical_timestamp_us
        };
        let timestamp_us = match sample.timestamp_us {
            0 if first => theoretical_us.max(0) as u64,
            0 => self.audio.last_timestamp_us + block.default_sample_duration_us as u64,
            ts => ts,
        };

        let frame_bytes = block.frame_bytes();
        let diff_us = timestamp_us as i64 - theoretical_us;
        let mut zero_fill = 0u64;
        let mut skip = 0usize;
        if diff_us.abs() > self.config().drift_threshold_us {
            let frames = (diff_us as f64 * block.sample_rate as f64 / 1_000_000.0).round() as i64;
            let len = frames.unsigned_abs() * frame_bytes;
            if diff_us > 0 {
                zero_fill = len;
            } else if len >= sample.data.len() as u64 {
                return Err(EncapsulerError::BadTimestamp(format!(
                    "audio is {}us early, more than the whole {}-byte buffer",
                    -diff_us,
                    sample.data.len()
                )));
            } else {
                skip = len as usize;
            }
            self.logger.debug(format_args!(
                "audio drift {diff_us}us: {zero_fill} bytes of silence, {skip} bytes skipped"
            ));
            theoretical_us += diff_us;
        }
        let payload = &sample.data[skip..];
        let chunk_size = zero_fill + payload.len() as u64;

        if first {
            self.descriptor.audio = Some(block);
            let encoded = self.descriptor.encode_audio()?;
            self.rewrite_info(self.descriptor.audio_block_offset(), &encoded)?;
            self.logger.info(format_args!(
                "audio track: {} ch, {} Hz, {}-bit",
                block.channels,
                block.sample_rate,
                block.format.bits()
            ));
        }

        let delta_us = if first {
            0
        } else {
            clamp_delta(timestamp_us.saturating_sub(self.audio.last_timestamp_us))
        };
        let record = InfoRecord {
            track: TrackTag::Audio,
            size: chunk_size,
            kind: SampleKind::Media,
            delta_us,
        };
        self.info.write_all(record.encode().as_bytes())?;
        let mut remaining = zero_fill;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len() as u64) as usize;
            self.data.write_all(&ZEROS[..n])?;
            remaining -= n as u64;
        }
        self.data.write_all(payload)?;

        let samples_per_chunk = chunk_size / frame_bytes;
        if self.audio.chunk_count == 0 || samples_per_chunk != self.audio.last_chunk_size / frame_bytes {
            self.audio.stsc_entries += 1;
        }
        self.audio.chunk_count += 1;
        self.audio.total_size += chunk_size;
        self.audio.last_chunk_size = chunk_size;
        self.audio.last_timestamp_us = timestamp_us;
        self.audio.theoretical_timestamp_us = theoretical_us + block.default_sample_duration_us as i64;
        Ok(())
    }
}

/// Validate the first sample and derive the track format from it.
fn audio_block_for(sample: &AudioSample<'_>) -> EncapsulerResult<AudioBlock> {
    if sample.channels == 0 {
        return Err(EncapsulerError::BadAudioSample("zero channels".into()));
    }
    if sample.sample_rate == 0 || sample.sample_rate > u16::MAX as u32 {
        return Err(EncapsulerError::BadAudioSample(format!(
            "unsupported sample rate {}",
            sample.sample_rate
        )));
    }
    let bits_per_frame = sample.channels as u64 * sample.format.bits() as u64;
    let default_sample_duration_us =
        sample.data.len() as u64 * 8_000_000 / bits_per_frame / sample.sample_rate as u64;
    Ok(AudioBlock {
        codec: sample.codec,
        format: sample.format,
        channels: sample.channels,
        sample_rate: sample.sample_rate,
        default_sample_duration_us: clamp_delta(default_sample_duration_us),
    })
}
