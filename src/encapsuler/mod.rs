//! Incremental recording session.
//!
//! A [`VideoEncapsuler`] appends media to `<output>.tmp` and logs every
//! sample to `<output>.meta`. Nothing describing the samples is kept in the
//! data file until [`VideoEncapsuler::finish`] builds `moov`, so a session
//! killed mid-recording can be completed later by
//! [`recovery::try_fix_media_file`].

pub mod finalize;
pub mod h264;
pub mod info_log;
mod ingest;
pub mod recovery;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::atom::metadata::{Location, UntimedMetadata};
use crate::config::EncapsulerConfig;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::logging::Logger;
use crate::media::VideoCodec;

use info_log::{Descriptor, MetadataBlock, SessionBlock, SessionExtras, VideoBlock, ID_FIELD_LEN, STSD_INFO_LEN};

/// BufWriter capacity for the data file.
const DATA_BUF_SIZE: usize = 256 * 1024;
/// BufWriter capacity for the info file.
const INFO_BUF_SIZE: usize = 8 * 1024;

pub const TEMP_SUFFIX: &str = ".tmp";
pub const INFO_SUFFIX: &str = ".meta";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// The three files belonging to one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub output: PathBuf,
    pub temp: PathBuf,
    pub info: PathBuf,
}

impl SessionPaths {
    pub fn for_output(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            temp: with_suffix(output, TEMP_SUFFIX),
            info: with_suffix(output, INFO_SUFFIX),
        }
    }

    /// Paths derived from an info file: `<output>.meta` names `<output>`.
    pub fn from_info(info: &Path) -> EncapsulerResult<Self> {
        let name = info
            .to_str()
            .ok_or_else(|| EncapsulerError::BadParameter(format!("non UTF-8 path {}", info.display())))?;
        let output = name
            .strip_suffix(INFO_SUFFIX)
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| EncapsulerError::BadParameter(format!("{name} is not a {INFO_SUFFIX} file")))?;
        Ok(Self::for_output(Path::new(output)))
    }

    /// Best-effort removal of the temp and info files.
    pub(crate) fn remove_artifacts(&self, logger: &Logger) {
        for path in [&self.temp, &self.info] {
            match fs::remove_file(path) {
                Ok(()) => logger.debug(format_args!("removed {}", path.display())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => logger.warn(format_args!("could not remove {}: {e}", path.display())),
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct VideoProgress {
    frames_count: u32,
    total_size: u64,
    last_timestamp_us: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct AudioProgress {
    chunk_count: u32,
    total_size: u64,
    last_timestamp_us: u64,
    theoretical_timestamp_us: i64,
    last_chunk_size: u64,
    stsc_entries: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct MetadataProgress {
    count: u32,
    total_size: u64,
    last_timestamp_us: u64,
}

/// Running totals of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_count: u32,
    pub video_bytes: u64,
    pub audio_chunks: u32,
    pub audio_bytes: u64,
    /// Number of `stsc` entries the audio track will need.
    pub audio_chunk_runs: u32,
    pub metadata_blocks: u32,
    pub metadata_bytes: u64,
}

pub struct VideoEncapsuler {
    paths: SessionPaths,
    logger: Logger,
    data: BufWriter<File>,
    info: BufWriter<File>,
    /// Persisted session state; written to the info file on the first frame.
    descriptor: Descriptor,
    /// Set once the first key frame is on disk.
    anchored: bool,
    video: VideoProgress,
    audio: AudioProgress,
    metadata: MetadataProgress,
}

impl VideoEncapsuler {
    /// Start a session for `path`. The temp and info files are created
    /// empty; nothing else is written until the first key frame.
    pub fn new(
        path: &Path,
        fps: u32,
        run_uuid: &str,
        run_date: &str,
        product_id: u16,
        config: EncapsulerConfig,
        logger: Logger,
    ) -> EncapsulerResult<Self> {
        if fps == 0 {
            return Err(EncapsulerError::BadParameter("fps must be positive".into()));
        }
        let timescale = fps
            .checked_mul(2000)
            .ok_or_else(|| EncapsulerError::BadParameter(format!("{fps} fps is out of range")))?;
        if run_uuid.len() > ID_FIELD_LEN || run_date.len() > ID_FIELD_LEN {
            return Err(EncapsulerError::BadParameter(format!(
                "run uuid and run date are limited to {ID_FIELD_LEN} bytes"
            )));
        }
        if config.max_frames == 0 || config.mjpeg_sync_interval == 0 {
            return Err(EncapsulerError::BadParameter("frame limits must be positive".into()));
        }
        if config.pvat_slot_len() > u32::MAX as u64 {
            return Err(EncapsulerError::BadParameter("pvat slot too large".into()));
        }

        let paths = SessionPaths::for_output(path);
        let data = File::create(&paths.temp)?;
        // Read back at finish time to replay the sample log.
        let info = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&paths.info)
        {
            Ok(info) => info,
            Err(e) => {
                paths.remove_artifacts(&logger);
                return Err(e.into());
            }
        };

        let descriptor = Descriptor {
            session: SessionBlock {
                timescale,
                fps,
                creation_time: chrono::Utc::now().timestamp(),
                product_id,
                pvat_offset: 0,
                mdat_offset: 0,
                data_offset: 0,
                run_uuid: run_uuid.to_string(),
                run_date: run_date.to_string(),
                extras: SessionExtras {
                    config,
                    ..Default::default()
                },
            },
            video: VideoBlock {
                codec: VideoCodec::H264,
                width: 0,
                height: 0,
                default_frame_duration_us: 1_000_000 / fps,
                first_frame_timestamp_us: 0,
            },
            sps: Vec::new(),
            pps: Vec::new(),
            metadata: None,
            audio: None,
        };

        logger.info(format_args!("encapsuler started: {} at {fps} fps", paths.output.display()));
        Ok(Self {
            paths,
            logger,
            data: BufWriter::with_capacity(DATA_BUF_SIZE, data),
            info: BufWriter::with_capacity(INFO_BUF_SIZE, info),
            descriptor,
            anchored: false,
            video: VideoProgress::default(),
            audio: AudioProgress::default(),
            metadata: MetadataProgress::default(),
        })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn config(&self) -> &EncapsulerConfig {
        &self.descriptor.session.extras.config
    }

    pub fn timescale(&self) -> u32 {
        self.descriptor.session.timescale
    }

    /// Seconds since the Unix epoch; also the finished file's mtime.
    pub fn creation_time(&self) -> i64 {
        self.descriptor.session.creation_time
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_count: self.video.frames_count,
            video_bytes: self.video.total_size,
            audio_chunks: self.audio.chunk_count,
            audio_bytes: self.audio.total_size,
            audio_chunk_runs: self.audio.stsc_entries,
            metadata_blocks: self.metadata.count,
            metadata_bytes: self.metadata.total_size,
        }
    }

    /// Use these parameter sets instead of parsing them from the first
    /// key frame. Only valid before the first frame.
    pub fn set_avc_parameter_sets(&mut self, sps: &[u8], pps: &[u8]) -> EncapsulerResult<()> {
        if self.anchored {
            return Err(EncapsulerError::BadParameter("parameter sets are locked after the first frame".into()));
        }
        if sps.is_empty() || pps.is_empty() || sps.len() > u16::MAX as usize || pps.len() > u16::MAX as usize {
            return Err(EncapsulerError::BadParameter("invalid SPS/PPS length".into()));
        }
        self.descriptor.sps = sps.to_vec();
        self.descriptor.pps = pps.to_vec();
        Ok(())
    }

    /// Declare a timed-metadata track of fixed `block_size` blocks. Only
    /// valid before the first frame.
    pub fn set_metadata_info(&mut self, content_encoding: &str, mime_format: &str, block_size: u32) -> EncapsulerResult<()> {
        if self.anchored {
            return Err(EncapsulerError::BadParameter("metadata track must be declared before the first frame".into()));
        }
        if block_size == 0 {
            return Err(EncapsulerError::BadParameter("metadata block size must be positive".into()));
        }
        if content_encoding.len() >= STSD_INFO_LEN || mime_format.len() >= STSD_INFO_LEN {
            return Err(EncapsulerError::BadParameter(format!(
                "content encoding and MIME type are limited to {} bytes",
                STSD_INFO_LEN - 1
            )));
        }
        self.descriptor.metadata = Some(MetadataBlock {
            block_size,
            content_encoding: content_encoding.to_string(),
            mime_format: mime_format.to_string(),
        });
        Ok(())
    }

    pub fn set_untimed_metadata(&mut self, metadata: UntimedMetadata) -> EncapsulerResult<()> {
        self.descriptor.session.extras.untimed = Some(metadata);
        self.persist_session()
    }

    /// JPEG embedded as cover art at finish time.
    pub fn set_video_thumbnail(&mut self, path: &Path) -> EncapsulerResult<()> {
        self.descriptor.session.extras.thumbnail = Some(path.to_path_buf());
        self.persist_session()
    }

    /// Take-off location, used when untimed metadata carries none.
    pub fn set_gps_infos(&mut self, location: Location) -> EncapsulerResult<()> {
        self.descriptor.session.extras.gps = location;
        self.persist_session()
    }

    /// Rewrite the session block in place once the descriptor is on disk.
    fn persist_session(&mut self) -> EncapsulerResult<()> {
        if !self.anchored {
            return Ok(());
        }
        let (block, reduced) = self.descriptor.encode_session()?;
        if reduced {
            self.logger
                .warn(format_args!("untimed metadata too large to persist; it will be lost on recovery"));
        }
        self.rewrite_info(Descriptor::session_block_offset(), &block)
    }

    /// Overwrite bytes inside the descriptor and return to the append point.
    fn rewrite_info(&mut self, offset: u64, bytes: &[u8]) -> EncapsulerResult<()> {
        self.info.seek(SeekFrom::Start(offset))?;
        self.info.write_all(bytes)?;
        self.info.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Flush both writers and push them to durable storage.
    fn sync(&mut self) -> EncapsulerResult<()> {
        self.info.flush()?;
        self.data.flush()?;
        self.info.get_ref().sync_data()?;
        self.data.get_ref().sync_data()?;
        Ok(())
    }

    /// Abort the recording and delete its files.
    pub fn cleanup(self) {
        let Self {
            paths, logger, data, info, ..
        } = self;
        drop(data);
        drop(info);
        paths.remove_artifacts(&logger);
        logger.info(format_args!("encapsuler aborted: {}", paths.output.display()));
    }

    /// Complete the file and move it to its final path. On any failure the
    /// temp and info files are deleted.
    pub fn finish(self) -> EncapsulerResult<PathBuf> {
        let paths = self.paths.clone();
        let logger = self.logger.clone();
        self.finish_inner().inspect_err(|e| {
            logger.error(format_args!("finish failed for {}: {e}", paths.output.display()));
            paths.remove_artifacts(&logger);
        })
    }

    fn finish_inner(mut self) -> EncapsulerResult<PathBuf> {
        if !self.anchored {
            return Err(EncapsulerError::BadParameter("no video frame was recorded".into()));
        }
        self.sync()?;
        let data = self.data.into_inner().map_err(|e| e.into_error())?;
        let info = self.info.into_inner().map_err(|e| e.into_error())?;
        finalize::finalize(&self.descriptor, data, info, &self.paths, &self.logger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FramePayload, FrameType, VideoFrame};
    use tempfile::tempdir;

    #[test]
    fn suffixed_paths() {
        let paths = SessionPaths::for_output(Path::new("/media/video.mp4"));
        assert_eq!(paths.temp, PathBuf::from("/media/video.mp4.tmp"));
        assert_eq!(paths.info, PathBuf::from("/media/video.mp4.meta"));
        assert_eq!(SessionPaths::from_info(&paths.info).unwrap(), paths);
        assert!(SessionPaths::from_info(Path::new("/media/video.mp4")).is_err());
        assert!(SessionPaths::from_info(Path::new(".meta")).is_err());
    }

    #[test]
    fn new_creates_empty_files() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a.mp4");
        let enc = VideoEncapsuler::new(&out, 30, "u", "d", 0x0901, EncapsulerConfig::default(), Logger::global())
            .unwrap();
        assert_eq!(enc.timescale(), 60_000);
        assert_eq!(fs::metadata(&enc.paths().temp).unwrap().len(), 0);
        assert_eq!(fs::metadata(&enc.paths().info).unwrap().len(), 0);
        enc.cleanup();
        assert!(!dir.path().join("a.mp4.tmp").exists());
        assert!(!dir.path().join("a.mp4.meta").exists());
    }

    #[test]
    fn rejects_bad_arguments() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a.mp4");
        let config = EncapsulerConfig::default();
        assert!(matches!(
            VideoEncapsuler::new(&out, 0, "", "", 0, config.clone(), Logger::global()),
            Err(EncapsulerError::BadParameter(_))
        ));
        let long = "x".repeat(ID_FIELD_LEN + 1);
        assert!(matches!(
            VideoEncapsuler::new(&out, 30, &long, "", 0, config.clone(), Logger::global()),
            Err(EncapsulerError::BadParameter(_))
        ));
        assert!(matches!(
            VideoEncapsuler::new(&out, u32::MAX / 1000, "", "", 0, config, Logger::global()),
            Err(EncapsulerError::BadParameter(_))
        ));
    }

    #[test]
    fn finish_keeps_the_recording() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("kept.mp4");
        let mut enc = VideoEncapsuler::new(&out, 30, "", "", 0, EncapsulerConfig::default(), Logger::global())
            .unwrap();
        let idr: [u8; 20] = [0, 0, 0, 1, 0x67, 0x42, 0x80, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88];
        let frame = VideoFrame {
            codec: VideoCodec::H264,
            width: 320,
            height: 240,
            frame_type: FrameType::I,
            payload: FramePayload::Raw(&idr),
            timestamp_us: 0,
            insert_parameter_sets: false,
        };
        enc.add_frame(&frame, None).unwrap();
        let paths = enc.paths().clone();

        assert_eq!(enc.finish().unwrap(), out);
        assert!(out.exists());
        assert!(!paths.temp.exists());
        assert!(!paths.info.exists());
    }

    #[test]
    fn finish_without_video_cleans_up() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("empty.mp4");
        let enc = VideoEncapsuler::new(&out, 25, "", "", 0, EncapsulerConfig::default(), Logger::global()).unwrap();
        let paths = enc.paths().clone();
        assert!(matches!(enc.finish(), Err(EncapsulerError::BadParameter(_))));
        assert!(!paths.temp.exists());
        assert!(!paths.info.exists());
        assert!(!out.exists());
    }

    #[test]
    fn metadata_info_limits() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("m.mp4");
        let mut enc = VideoEncapsuler::new(&out, 30, "", "", 0, EncapsulerConfig::default(), Logger::global()).unwrap();
        assert!(enc.set_metadata_info("", "application/octet-stream", 0).is_err());
        assert!(enc.set_metadata_info(&"e".repeat(STSD_INFO_LEN), "x", 16).is_err());
        assert!(enc.set_metadata_info("", "application/octet-stream", 16).is_ok());
        enc.cleanup();
    }
}
