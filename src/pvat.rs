//! `pvat` provenance box: a JSON object placed right after `ftyp` so that
//! tools can identify a recording without parsing `moov`.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::atom::builders;
use crate::atom::{Atom, HEADER_LEN};
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::logging::Logger;

pub const PVAT_TAG: &[u8; 4] = b"pvat";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PvatDescription {
    /// Product identifier as four upper-case hex digits.
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_date: Option<String>,
    /// Fields written by other tools, kept across rewrites.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PvatDescription {
    pub fn new(product_id: u16) -> Self {
        Self {
            product_id: format!("{product_id:04X}"),
            ..Default::default()
        }
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = (!uuid.is_empty()).then(|| uuid.to_string());
        self
    }

    pub fn with_run_date(mut self, run_date: &str) -> Self {
        self.run_date = (!run_date.is_empty()).then(|| run_date.to_string());
        self
    }

    /// Store only the final path component.
    pub fn with_filename(mut self, path: &Path) -> Self {
        self.filename = path.file_name().map(|name| name.to_string_lossy().into_owned());
        self
    }

    pub fn with_media_date(mut self, media_date: String) -> Self {
        self.media_date = Some(media_date);
        self
    }

    pub fn to_json(&self) -> EncapsulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> EncapsulerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Format a Unix timestamp in local time with a strftime pattern.
pub fn format_local_date(unix_seconds: i64, format: &str) -> EncapsulerResult<String> {
    let date = Local
        .timestamp_opt(unix_seconds, 0)
        .single()
        .ok_or_else(|| EncapsulerError::BadParameter(format!("invalid timestamp {unix_seconds}")))?;
    let mut out = String::new();
    write!(out, "{}", date.format(format))
        .map_err(|_| EncapsulerError::BadParameter(format!("invalid date format {format:?}")))?;
    Ok(out)
}

/// The pvat box itself. The payload is the raw JSON text without terminator.
pub fn pvat_atom(json: &str) -> Atom {
    Atom::leaf(PVAT_TAG, json.as_bytes().to_vec())
}

/// Bytes for a reserved region of `slot_len` bytes: the pvat box followed by
/// a `free` box covering the rest. When the JSON does not fit, the whole
/// region becomes a single `free` box.
pub fn pvat_region(json: &str, slot_len: u32, logger: &Logger) -> Vec<u8> {
    let pvat_len = json.len() as u64 + HEADER_LEN as u64;
    let slot = slot_len as u64;
    if pvat_len + HEADER_LEN as u64 > slot && pvat_len != slot {
        logger.warn(format_args!(
            "pvat omitted: {} bytes of JSON do not fit a {slot_len}-byte slot",
            json.len()
        ));
        return builders::free(slot_len).into_bytes();
    }
    let mut region = pvat_atom(json).into_bytes();
    let rest = (slot - pvat_len) as u32;
    if rest > 0 {
        region.extend(builders::free(rest).into_bytes());
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_and_hex_product() {
        let desc = PvatDescription::new(0x0901)
            .with_uuid("A1B2")
            .with_run_date("2015-04-01T120000+0200")
            .with_filename(Path::new("/sdcard/media/video_01.mp4"))
            .with_media_date("2015-04-01T120105+0200".into());
        assert_eq!(
            desc.to_json().unwrap(),
            r#"{"product_id":"0901","uuid":"A1B2","run_date":"2015-04-01T120000+0200","filename":"video_01.mp4","media_date":"2015-04-01T120105+0200"}"#
        );
    }

    #[test]
    fn empty_optionals_are_skipped() {
        let desc = PvatDescription::new(0x90c).with_uuid("").with_run_date("");
        assert_eq!(desc.to_json().unwrap(), r#"{"product_id":"090C"}"#);
    }

    #[test]
    fn unknown_fields_survive() {
        let desc = PvatDescription::from_json(r#"{"product_id":"0901","gps":"none"}"#).unwrap();
        assert_eq!(desc.extra.get("gps").and_then(|v| v.as_str()), Some("none"));
        assert!(desc.to_json().unwrap().contains(r#""gps":"none""#));
    }

    #[test]
    fn region_fills_slot() {
        let logger = Logger::global();
        let region = pvat_region(r#"{"product_id":"0901"}"#, 520, &logger);
        assert_eq!(region.len(), 520);
        assert_eq!(&region[4..8], b"pvat");
        let pvat_len = u32::from_be_bytes([region[0], region[1], region[2], region[3]]) as usize;
        assert_eq!(&region[pvat_len + 4..pvat_len + 8], b"free");
    }

    #[test]
    fn oversized_json_leaves_free_slot() {
        let json = "x".repeat(600);
        let region = pvat_region(&json, 520, &Logger::global());
        assert_eq!(region.len(), 520);
        assert_eq!(&region[4..8], b"free");
    }

    #[test]
    fn local_date_format() {
        let date = format_local_date(0, "%Y").unwrap();
        assert!(date == "1970" || date == "1969");
    }
}
