//! Crash-tolerant MP4/QuickTime recording.
//!
//! A [`VideoEncapsuler`] appends H.264 or MJPEG video, PCM audio and fixed-size
//! timed metadata to a temp file while logging every sample to a side info
//! file. [`VideoEncapsuler::finish`] builds the `moov` index and moves the file
//! into place; [`try_fix_media_file`] does the same for a session whose
//! process died before it could finish.

pub mod atom;
pub mod config;
pub mod encapsuler;
pub mod error;
pub mod logging;
pub mod media;
pub mod pvat;
pub mod query;

pub use atom::metadata::{CustomEntry, Location, UntimedMetadata};
pub use config::{EncapsulerConfig, OffsetMode};
pub use encapsuler::recovery::{find_orphaned_sessions, try_fix_media_file};
pub use encapsuler::{SessionPaths, SessionStats, VideoEncapsuler};
pub use error::{EncapsulerError, EncapsulerResult};
pub use logging::Logger;
pub use media::{AudioCodec, AudioFormat, AudioSample, FramePayload, FrameType, VideoCodec, VideoFrame};
pub use query::{add_pvat_atom, get_atom, get_pvat_string, rewrite_pvat_dates, video_timescale};
