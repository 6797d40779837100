//! Completing sessions left behind by a process that died mid-recording.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::info_log::{self, Descriptor, TrackTag};
use super::{finalize, SessionPaths, INFO_SUFFIX};
use crate::error::EncapsulerResult;
use crate::logging::Logger;

/// Counts of what survived in a recovered session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Recovered {
    frames: u32,
    audio_chunks: u32,
    metadata_blocks: u32,
    dropped_records: usize,
    media_bytes: u64,
}

/// Finalize the session whose info file is `info_path`. The output path is
/// `info_path` without its `.meta` suffix. On failure every artifact of the
/// session is deleted.
pub fn try_fix_media_file(info_path: &Path, logger: &Logger) -> EncapsulerResult<PathBuf> {
    let paths = SessionPaths::from_info(info_path)?;
    logger.info(format_args!("recovering {}", paths.output.display()));
    recover(&paths, logger).inspect_err(|e| {
        logger.error(format_args!("recovery of {} failed: {e}", paths.output.display()));
        paths.remove_artifacts(logger);
    })
}

fn recover(paths: &SessionPaths, logger: &Logger) -> EncapsulerResult<PathBuf> {
    let mut info = OpenOptions::new().read(true).write(true).open(&paths.info)?;
    let descriptor = Descriptor::decode(&mut BufReader::new(&mut info))?;

    let data = OpenOptions::new().read(true).write(true).open(&paths.temp)?;
    let data_len = data.metadata()?.len();

    let records_offset = descriptor.records_offset();
    info.seek(SeekFrom::Start(records_offset))?;
    let (records, _) = info_log::read_records(BufReader::new(&mut info))?;

    let available = data_len.saturating_sub(descriptor.session.data_offset);
    let mut counts = Recovered::default();
    let mut info_len = records_offset;
    for logged in &records {
        if counts.media_bytes + logged.record.size > available {
            break;
        }
        counts.media_bytes += logged.record.size;
        info_len = records_offset + logged.line_end;
        match logged.record.track {
            TrackTag::Video => counts.frames += 1,
            TrackTag::Audio => counts.audio_chunks += 1,
            TrackTag::Metadata => counts.metadata_blocks += 1,
        }
    }
    let kept = (counts.frames + counts.audio_chunks + counts.metadata_blocks) as usize;
    counts.dropped_records = records.len() - kept;

    info.set_len(info_len)?;
    data.set_len(descriptor.session.data_offset + counts.media_bytes)?;
    logger.info(format_args!(
        "recovered {} frames, {} audio chunks, {} metadata blocks ({} bytes); {} trailing records dropped",
        counts.frames, counts.audio_chunks, counts.metadata_blocks, counts.media_bytes, counts.dropped_records
    ));

    finalize::finalize(&descriptor, data, info, paths, logger)
}

/// Info files of unfinished sessions in `dir`, sorted by path.
pub fn find_orphaned_sessions(dir: &Path) -> EncapsulerResult<Vec<PathBuf>> {
    let suffix = INFO_SUFFIX.trim_start_matches('.');
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == suffix) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncapsulerError;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn lists_only_info_files() {
        let dir = tempdir().unwrap();
        for name in ["b.mp4.meta", "a.mp4.meta", "a.mp4.tmp", "c.mp4"] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("d.meta")).unwrap();
        let found = find_orphaned_sessions(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("a.mp4.meta"), dir.path().join("b.mp4.meta")]);
    }

    #[test]
    fn unreadable_descriptor_removes_artifacts() {
        let dir = tempdir().unwrap();
        let paths = SessionPaths::for_output(&dir.path().join("v.mp4"));
        fs::write(&paths.info, b"XXXX\0\0\0\x05").unwrap();
        fs::write(&paths.temp, [0u8; 64]).unwrap();

        assert!(matches!(
            try_fix_media_file(&paths.info, &Logger::global()),
            Err(EncapsulerError::DescriptorMismatch(_))
        ));
        assert!(!paths.info.exists());
        assert!(!paths.temp.exists());
        assert!(!paths.output.exists());
    }

    #[test]
    fn empty_info_file_is_unrecoverable() {
        let dir = tempdir().unwrap();
        let paths = SessionPaths::for_output(&dir.path().join("v.mp4"));
        File::create(&paths.info).unwrap();
        File::create(&paths.temp).unwrap();
        assert!(try_fix_media_file(&paths.info, &Logger::global()).is_err());
        assert!(!paths.info.exists());
        assert!(!paths.temp.exists());
    }
}
