//! Read and patch helpers for finished files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::atom::builders;
use crate::atom::reader::{self, AtomLocation};
use crate::atom::HEADER_LEN;
use crate::error::{EncapsulerError, EncapsulerResult};
use crate::pvat::{pvat_atom, PvatDescription};

/// Payload of the box at `atom_path`, e.g. `moov/2:trak/mdia/mdhd`.
pub fn get_atom(path: &Path, atom_path: &str) -> EncapsulerResult<Vec<u8>> {
    let mut file = File::open(path)?;
    reader::read_atom(&mut file, atom_path)
}

/// The pvat JSON text.
pub fn get_pvat_string(path: &Path) -> EncapsulerResult<String> {
    let payload = get_atom(path, "pvat")?;
    String::from_utf8(payload).map_err(|_| EncapsulerError::MalformedAtom("pvat payload is not UTF-8".into()))
}

/// Length of a compact `free` box starting at `pos`, if there is one.
fn following_free_len(file: &mut File, pos: u64, file_len: u64) -> EncapsulerResult<u64> {
    if file_len < pos + HEADER_LEN as u64 {
        return Ok(0);
    }
    file.seek(SeekFrom::Start(pos))?;
    let size = file.read_u32::<BigEndian>()? as u64;
    let mut tag = [0u8; 4];
    file.read_exact(&mut tag)?;
    if &tag != b"free" || size < HEADER_LEN as u64 || pos + size > file_len {
        return Ok(0);
    }
    Ok(size)
}

/// Replace `media_date` and `run_date` in the pvat JSON in place.
///
/// The new box may spill into a `free` box directly after pvat; whatever
/// room is left becomes a new `free` box. The file never grows.
pub fn rewrite_pvat_dates(path: &Path, new_date: &str) -> EncapsulerResult<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let location: AtomLocation = reader::locate(&mut file, "pvat")?;
    let mut json = vec![0u8; location.size as usize];
    file.seek(SeekFrom::Start(location.offset))?;
    file.read_exact(&mut json)?;
    let json = String::from_utf8(json).map_err(|_| EncapsulerError::MalformedAtom("pvat payload is not UTF-8".into()))?;

    let mut description = PvatDescription::from_json(&json)?;
    description.media_date = Some(new_date.to_string());
    description.run_date = Some(new_date.to_string());
    let patched = description.to_json()?;

    let file_len = file.metadata()?.len();
    let budget = location.end() - location.start + following_free_len(&mut file, location.end(), file_len)?;
    let needed = patched.len() as u64 + HEADER_LEN as u64;
    if needed > budget {
        return Err(EncapsulerError::BadParameter(format!(
            "patched pvat needs {needed} bytes, {budget} available"
        )));
    }
    let rest = budget - needed;
    if rest != 0 && rest < HEADER_LEN as u64 {
        return Err(EncapsulerError::BadParameter(format!(
            "{rest} leftover bytes cannot hold a free box"
        )));
    }

    let mut region = pvat_atom(&patched).into_bytes();
    if rest > 0 {
        region.extend(builders::free(rest as u32).into_bytes());
    }
    file.seek(SeekFrom::Start(location.start))?;
    file.write_all(&region)?;
    file.sync_data()?;
    Ok(())
}

/// Write a standalone pvat box and return its length.
pub fn add_pvat_atom<W: Write>(
    writer: &mut W,
    product_id: u16,
    run_date: &str,
    media_date: &str,
) -> EncapsulerResult<u64> {
    let mut description = PvatDescription::new(product_id).with_run_date(run_date);
    if !media_date.is_empty() {
        description = description.with_media_date(media_date.to_string());
    }
    let atom = pvat_atom(&description.to_json()?);
    let len = atom.serialized_len();
    atom.serialize(writer)?;
    Ok(len)
}

/// Timescale of the first video track's `mdhd`.
pub fn video_timescale(path: &Path) -> EncapsulerResult<u32> {
    let mut file = File::open(path)?;
    for index in 1.. {
        let hdlr = match reader::read_atom(&mut file, &format!("moov/{index}:trak/mdia/hdlr")) {
            Ok(hdlr) => hdlr,
            Err(EncapsulerError::AtomNotFound(_)) => break,
            Err(e) => return Err(e),
        };
        if hdlr.get(8..12) != Some(b"vide".as_slice()) {
            continue;
        }
        let mdhd = reader::read_atom(&mut file, &format!("moov/{index}:trak/mdia/mdhd"))?;
        let at = if mdhd.first() == Some(&1) { 20 } else { 12 };
        let raw = mdhd
            .get(at..at + 4)
            .ok_or_else(|| EncapsulerError::MalformedAtom("short mdhd".into()))?;
        return Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
    }
    Err(EncapsulerError::AtomNotFound("video track".into()))
}
