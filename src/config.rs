//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::error::EncapsulerResult;

/// How chunk offsets are stored in the sample tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetMode {
    /// `stco` unless the file outgrows 32-bit addressing, then `co64`.
    #[default]
    Auto,
    /// Always `co64`.
    Always64,
}

/// Tunables for a recording session. Every field has a default, so a JSON
/// config only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncapsulerConfig {
    /// Hard ceiling on accepted video frames.
    pub max_frames: u32,
    /// MJPEG streams are synced to disk every this many frames.
    pub mjpeg_sync_interval: u32,
    /// Largest pvat JSON payload; the reserved slot is this plus a box header.
    pub pvat_max_len: u32,
    /// Audio drift tolerated before silence is inserted or data is skipped.
    pub drift_threshold_us: i64,
    pub offsets: OffsetMode,
    /// Trailing free space in udta and meta for later in-place edits.
    pub udta_free_space: u32,
    /// strftime format for the pvat `media_date` field.
    pub media_date_format: String,
}

pub const DEFAULT_MAX_FRAMES: u32 = 131_072 * 16;
pub const DEFAULT_PVAT_MAX_LEN: u32 = 512;
pub const DEFAULT_MEDIA_DATE_FORMAT: &str = "%Y-%m-%dT%H%M%S%z";

impl Default for EncapsulerConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            mjpeg_sync_interval: 10,
            pvat_max_len: DEFAULT_PVAT_MAX_LEN,
            drift_threshold_us: 10_000,
            offsets: OffsetMode::Auto,
            udta_free_space: 1024,
            media_date_format: DEFAULT_MEDIA_DATE_FORMAT.to_string(),
        }
    }
}

impl EncapsulerConfig {
    pub fn from_json(json: &str) -> EncapsulerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Bytes reserved after `ftyp` for the pvat box and its trailing free box.
    pub fn pvat_slot_len(&self) -> u64 {
        self.pvat_max_len as u64 + 8
    }
}
