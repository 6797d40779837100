//! Untimed (file-level) metadata.
//!
//! The same record is written twice: as iTunes-style items under
//! `udta/meta/ilst` for players that only read four-character tags, and as
//! reverse-DNS keys under `moov/meta` (`keys` + `ilst`).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::builders::{self, DATA_CLASS_JPEG, DATA_CLASS_UTF8};
use super::Atom;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::logging::Logger;

pub const KEY_LOCATION: &str = "com.apple.quicktime.location.ISO6709";
pub const KEY_ARTIST: &str = "com.apple.quicktime.artist";
pub const KEY_TITLE: &str = "com.apple.quicktime.title";
pub const KEY_CREATION_DATE: &str = "com.apple.quicktime.creationdate";
pub const KEY_COMMENT: &str = "com.apple.quicktime.comment";
pub const KEY_COPYRIGHT: &str = "com.apple.quicktime.copyright";
pub const KEY_MAKER: &str = "com.apple.quicktime.make";
pub const KEY_MODEL: &str = "com.apple.quicktime.model";
pub const KEY_SOFTWARE: &str = "com.apple.quicktime.software";
pub const KEY_ARTWORK: &str = "com.apple.quicktime.artwork";
pub const KEY_SERIAL: &str = "com.parrot.serial";
pub const KEY_MODEL_ID: &str = "com.parrot.model.id";
pub const KEY_BUILD_ID: &str = "com.parrot.build.id";
pub const KEY_RUN_ID: &str = "com.parrot.run.id";
pub const KEY_RUN_DATE: &str = "com.parrot.run.date";
pub const KEY_PICTURE_HFOV: &str = "com.parrot.picture.hfov";
pub const KEY_PICTURE_VFOV: &str = "com.parrot.picture.vfov";

/// Largest cover image: a 32-bit box minus the item, `data` and class headers.
pub const MAX_COVER_LEN: u64 = u32::MAX as u64 - 24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl Location {
    /// Coordinate value meaning "no fix".
    pub const UNSET: f64 = 500.0;

    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    pub fn unset() -> Self {
        Self::new(Self::UNSET, Self::UNSET, Self::UNSET)
    }

    pub fn is_set(&self) -> bool {
        self.latitude != Self::UNSET && self.longitude != Self::UNSET
    }

    /// ISO 6709 Annex H short form used by `©xyz`.
    pub fn iso6709_short(&self) -> String {
        format!("{:+08.4}{:+09.4}/", self.latitude, self.longitude)
    }

    /// ISO 6709 form with altitude used by the keyed location.
    pub fn iso6709_long(&self) -> String {
        format!("{:+012.8}{:+013.8}{:+.2}/", self.latitude, self.longitude, self.altitude)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::unset()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomEntry {
    pub key: String,
    pub value: String,
}

/// File-level descriptive metadata. Empty strings and zero angles are
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UntimedMetadata {
    pub maker: String,
    pub model: String,
    pub model_id: String,
    pub serial_number: String,
    pub software_version: String,
    pub build_id: String,
    pub artist: String,
    pub title: String,
    pub comment: String,
    pub copyright: String,
    pub media_date: String,
    pub run_date: String,
    pub run_uuid: String,
    pub takeoff: Location,
    pub picture_hfov: f32,
    pub picture_vfov: f32,
    pub custom: Vec<CustomEntry>,
}

impl UntimedMetadata {
    fn artist_or_device(&self) -> Option<String> {
        if !self.artist.is_empty() {
            return Some(self.artist.clone());
        }
        let device = format!("{} {}", self.maker, self.model);
        let device = device.trim();
        (!device.is_empty()).then(|| device.to_string())
    }

    fn title_or_run_date(&self) -> Option<&str> {
        [self.title.as_str(), self.run_date.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
    }
}

/// Read a cover image for embedding.
pub fn read_cover(path: &Path) -> EncapsulerResult<Vec<u8>> {
    let len = fs::metadata(path)?.len();
    if len == 0 {
        return Err(EncapsulerError::BadParameter(format!("empty cover file {}", path.display())));
    }
    if len > MAX_COVER_LEN {
        return Err(EncapsulerError::BadParameter(format!(
            "cover file {} is too large to fit into an atom ({len} bytes)",
            path.display()
        )));
    }
    Ok(fs::read(path)?)
}

/// Accumulates the parallel udta items and keyed items.
struct MetaBuilder {
    udta_items: Atom,
    keyed_items: Atom,
    keys: Vec<String>,
}

impl MetaBuilder {
    fn new() -> Self {
        Self {
            udta_items: Atom::container(b"ilst"),
            keyed_items: Atom::container(b"ilst"),
            keys: Vec::new(),
        }
    }

    fn keyed(&mut self, key: &str, class: u8, value: &[u8]) {
        self.keys.push(key.to_string());
        let index = self.keys.len() as u32;
        self.keyed_items.attach(builders::keyed_item(index, class, value));
    }

    fn both(&mut self, udta_tag: &[u8; 4], key: &str, value: &str) {
        self.udta_items
            .attach(builders::ilst_item(udta_tag, DATA_CLASS_UTF8, value.as_bytes()));
        self.keyed(key, DATA_CLASS_UTF8, value.as_bytes());
    }

    fn both_if(&mut self, udta_tag: &[u8; 4], key: &str, value: &str) {
        if !value.is_empty() {
            self.both(udta_tag, key, value);
        }
    }

    fn keyed_if(&mut self, key: &str, value: &str) {
        if !value.is_empty() {
            self.keyed(key, DATA_CLASS_UTF8, value.as_bytes());
        }
    }
}

/// Build the `udta` and `moov/meta` boxes, or `None` when there is nothing
/// to write. A cover that cannot be read is logged and left out.
pub fn untimed_boxes(
    metadata: Option<&UntimedMetadata>,
    cover: Option<&Path>,
    free_space: u32,
    logger: &Logger,
) -> Option<(Atom, Atom)> {
    if metadata.is_none() && cover.is_none() {
        return None;
    }

    let mut udta = Atom::container(b"udta");
    let mut items = MetaBuilder::new();

    if let Some(md) = metadata {
        if let Some(artist) = md.artist_or_device() {
            items.both(b"\xA9ART", KEY_ARTIST, &artist);
        }
        if let Some(title) = md.title_or_run_date() {
            items.both(b"\xA9nam", KEY_TITLE, title);
        }
        items.both_if(b"\xA9day", KEY_CREATION_DATE, &md.media_date);
        if md.takeoff.is_set() {
            udta.attach(builders::xyz(&md.takeoff.iso6709_short()));
            items.keyed(KEY_LOCATION, DATA_CLASS_UTF8, md.takeoff.iso6709_long().as_bytes());
        }
        items.both_if(b"\xA9mak", KEY_MAKER, &md.maker);
        items.both_if(b"\xA9mod", KEY_MODEL, &md.model);
        items.keyed_if(KEY_MODEL_ID, &md.model_id);
        items.keyed_if(KEY_BUILD_ID, &md.build_id);
        items.both_if(b"\xA9swr", KEY_SOFTWARE, &md.software_version);
        items.both_if(b"\xA9too", KEY_SERIAL, &md.serial_number);
        items.both_if(b"\xA9cmt", KEY_COMMENT, &md.comment);
        items.both_if(b"\xA9cpy", KEY_COPYRIGHT, &md.copyright);
        items.keyed_if(KEY_RUN_ID, &md.run_uuid);
        items.keyed_if(KEY_RUN_DATE, &md.run_date);
        if md.picture_hfov != 0.0 {
            items.keyed(KEY_PICTURE_HFOV, DATA_CLASS_UTF8, format!("{:.2}", md.picture_hfov).as_bytes());
        }
        if md.picture_vfov != 0.0 {
            items.keyed(KEY_PICTURE_VFOV, DATA_CLASS_UTF8, format!("{:.2}", md.picture_vfov).as_bytes());
        }
        for entry in md.custom.iter().filter(|e| !e.key.is_empty() && !e.value.is_empty()) {
            items.keyed(&entry.key, DATA_CLASS_UTF8, entry.value.as_bytes());
        }
    }

    if let Some(path) = cover {
        match read_cover(path) {
            Ok(jpeg) => {
                items.udta_items.attach(builders::ilst_item(b"covr", DATA_CLASS_JPEG, &jpeg));
                items.keyed(KEY_ARTWORK, DATA_CLASS_JPEG, &jpeg);
            }
            Err(e) => logger.warn(format_args!("cover omitted: {e}")),
        }
    }

    let udta_meta = Atom::leaf(b"meta", vec![0; 4])
        .with(builders::hdlr_udta_meta())
        .with(items.udta_items);
    udta.attach(udta_meta);
    udta.attach(builders::free(free_space));

    let meta = Atom::container(b"meta")
        .with(builders::hdlr_keyed_meta())
        .with(builders::keys(&items.keys))
        .with(items.keyed_items)
        .with(builders::free(free_space));

    Some((udta, meta))
}
