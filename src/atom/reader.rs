//! Atom-path lookup over seekable sources and in-memory buffers.
//!
//! A path is a slash-separated list of segments. Each segment is a
//! four-character tag, optionally prefixed with a 1-based occurrence index:
//! `moov/2:trak/tkhd` is the `tkhd` of the second `trak` inside `moov`.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};

use super::{HEADER_LEN, LARGE_SIZE_SENTINEL};
use crate::error::{EncapsulerError, EncapsulerResult};

/// Payload bounds of a located box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomLocation {
    /// Offset of the box header.
    pub start: u64,
    /// Offset of the first payload byte.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
}

impl AtomLocation {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSegment {
    pub tag: [u8; 4],
    /// 1-based occurrence at this nesting level.
    pub occurrence: u32,
}

/// Reverse the byte order of a 64-bit value (network <-> little-endian host).
pub fn swap_u64(value: u64) -> u64 {
    value.swap_bytes()
}

/// Map a path tag to its four bytes. Characters up to U+00FF map to a single
/// byte, so `©xyz` names the `\xA9xyz` box.
pub fn tag_bytes(tag: &str) -> EncapsulerResult<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut len = 0;
    for c in tag.chars() {
        let code = c as u32;
        if code > 0xff || len == 4 {
            return Err(EncapsulerError::BadParameter(format!("invalid atom tag {tag:?}")));
        }
        out[len] = code as u8;
        len += 1;
    }
    if len != 4 {
        return Err(EncapsulerError::BadParameter(format!("invalid atom tag {tag:?}")));
    }
    Ok(out)
}

pub fn parse_path(path: &str) -> EncapsulerResult<Vec<PathSegment>> {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| match segment.split_once(':') {
            Some((index, tag)) => {
                let occurrence: u32 = index
                    .parse()
                    .map_err(|_| EncapsulerError::BadParameter(format!("invalid atom index in {segment:?}")))?;
                if occurrence == 0 {
                    return Err(EncapsulerError::BadParameter(format!("atom index is 1-based in {segment:?}")));
                }
                Ok(PathSegment {
                    tag: tag_bytes(tag)?,
                    occurrence,
                })
            }
            None => Ok(PathSegment {
                tag: tag_bytes(segment)?,
                occurrence: 1,
            }),
        })
        .collect::<EncapsulerResult<Vec<_>>>()?;
    if segments.is_empty() {
        return Err(EncapsulerError::BadParameter("empty atom path".into()));
    }
    Ok(segments)
}

/// Resolve a box header found at `pos` given its raw 32-bit size and the
/// optional 64-bit size. Returns `(header_len, box_len)`.
fn box_extent(pos: u64, limit: u64, size32: u32, large: Option<u64>) -> EncapsulerResult<(u64, u64)> {
    let (header_len, box_len) = match size32 {
        0 => (HEADER_LEN as u64, limit - pos),
        LARGE_SIZE_SENTINEL => {
            let large = large.ok_or_else(|| EncapsulerError::MalformedAtom(format!("truncated 64-bit size at {pos}")))?;
            (HEADER_LEN as u64 + 8, large)
        }
        size => (HEADER_LEN as u64, size as u64),
    };
    if box_len < header_len || box_len > limit - pos {
        return Err(EncapsulerError::MalformedAtom(format!(
            "box at {pos} declares {box_len} bytes, {} available",
            limit - pos
        )));
    }
    Ok((header_len, box_len))
}

/// Scan one nesting level `[start, limit)` for the segment's occurrence.
fn scan_level<R: Read + Seek>(
    source: &mut R,
    start: u64,
    limit: u64,
    segment: &PathSegment,
) -> EncapsulerResult<Option<AtomLocation>> {
    let mut pos = start;
    let mut remaining = segment.occurrence;
    while limit - pos >= HEADER_LEN as u64 {
        source.seek(SeekFrom::Start(pos))?;
        let size32 = source.read_u32::<BigEndian>()?;
        let mut tag = [0u8; 4];
        source.read_exact(&mut tag)?;
        let large = if size32 == LARGE_SIZE_SENTINEL && limit - pos >= 16 {
            Some(source.read_u64::<BigEndian>()?)
        } else {
            None
        };
        let (header_len, box_len) = box_extent(pos, limit, size32, large)?;

        if tag == segment.tag {
            remaining -= 1;
            if remaining == 0 {
                return Ok(Some(AtomLocation {
                    start: pos,
                    offset: pos + header_len,
                    size: box_len - header_len,
                }));
            }
        }
        pos += box_len;
    }
    Ok(None)
}

/// Locate the box named by `path` in a seekable source.
pub fn locate<R: Read + Seek>(source: &mut R, path: &str) -> EncapsulerResult<AtomLocation> {
    let segments = parse_path(path)?;
    let mut start = 0;
    let mut limit = source.seek(SeekFrom::End(0))?;
    let mut found = None;
    for segment in &segments {
        let location = scan_level(source, start, limit, segment)?
            .ok_or_else(|| EncapsulerError::AtomNotFound(path.to_string()))?;
        start = location.offset;
        limit = location.end();
        found = Some(location);
    }
    found.ok_or_else(|| EncapsulerError::AtomNotFound(path.to_string()))
}

/// Locate `path` and read its payload.
pub fn read_atom<R: Read + Seek>(source: &mut R, path: &str) -> EncapsulerResult<Vec<u8>> {
    let location = locate(source, path)?;
    source.seek(SeekFrom::Start(location.offset))?;
    let mut payload = vec![0u8; location.size as usize];
    source.read_exact(&mut payload)?;
    Ok(payload)
}

/// Single-level lookup of `tag` among the boxes laid out in `buf`.
/// Offsets in the returned location are relative to `buf`.
pub fn locate_in_buffer(buf: &[u8], tag: &[u8; 4]) -> EncapsulerResult<Option<AtomLocation>> {
    let limit = buf.len() as u64;
    let mut pos = 0u64;
    while limit - pos >= HEADER_LEN as u64 {
        let at = pos as usize;
        let size32 = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let large = if size32 == LARGE_SIZE_SENTINEL && limit - pos >= 16 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at + 8..at + 16]);
            Some(u64::from_be_bytes(raw))
        } else {
            None
        };
        let (header_len, box_len) = box_extent(pos, limit, size32, large)?;
        if &buf[at + 4..at + 8] == tag {
            return Ok(Some(AtomLocation {
                start: pos,
                offset: pos + header_len,
                size: box_len - header_len,
            }));
        }
        pos += box_len;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use std::io::Cursor;

    fn two_track_file() -> Vec<u8> {
        let trak = |id: u8| {
            Atom::container(b"trak")
                .with(Atom::leaf(b"tkhd", vec![id; 4]))
                .with(Atom::container(b"mdia"))
        };
        let mut file = Atom::leaf(b"ftyp", b"isom".to_vec()).into_bytes();
        file.extend(
            Atom::container(b"moov")
                .with(Atom::leaf(b"mvhd", vec![0; 8]))
                .with(trak(1))
                .with(trak(2))
                .into_bytes(),
        );
        file
    }

    #[test]
    fn parses_indexed_segments() {
        let segments = parse_path("moov/2:trak/tkhd").unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1], PathSegment { tag: *b"trak", occurrence: 2 });
        assert_eq!(parse_path("udta/©xyz").unwrap()[1].tag, *b"\xA9xyz");
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(parse_path("").is_err());
        assert!(parse_path("moo").is_err());
        assert!(parse_path("0:trak").is_err());
        assert!(parse_path("x:trak").is_err());
    }

    #[test]
    fn first_and_second_track() {
        let mut file = Cursor::new(two_track_file());
        assert_eq!(read_atom(&mut file, "moov/trak/tkhd").unwrap(), vec![1; 4]);
        assert_eq!(read_atom(&mut file, "moov/2:trak/tkhd").unwrap(), vec![2; 4]);
        assert_eq!(read_atom(&mut file, "ftyp").unwrap(), b"isom");
    }

    #[test]
    fn missing_occurrence_is_not_found() {
        let mut file = Cursor::new(two_track_file());
        assert!(matches!(
            locate(&mut file, "moov/3:trak"),
            Err(EncapsulerError::AtomNotFound(_))
        ));
        assert!(matches!(locate(&mut file, "moov/udta"), Err(EncapsulerError::AtomNotFound(_))));
    }

    #[test]
    fn large_size_and_open_ended_boxes() {
        let mut file = Vec::new();
        file.extend_from_slice(&1u32.to_be_bytes());
        file.extend_from_slice(b"mdat");
        file.extend_from_slice(&20u64.to_be_bytes());
        file.extend_from_slice(&[9, 9, 9, 9]);
        file.extend_from_slice(&0u32.to_be_bytes());
        file.extend_from_slice(b"moov");
        file.extend_from_slice(&[7; 5]);

        let mut cursor = Cursor::new(file);
        let mdat = locate(&mut cursor, "mdat").unwrap();
        assert_eq!((mdat.offset, mdat.size), (16, 4));
        assert_eq!(read_atom(&mut cursor, "moov").unwrap(), vec![7; 5]);
    }

    #[test]
    fn overrunning_box_is_malformed() {
        let mut file = Vec::new();
        file.extend_from_slice(&100u32.to_be_bytes());
        file.extend_from_slice(b"moov");
        assert!(matches!(
            locate(&mut Cursor::new(file), "moov"),
            Err(EncapsulerError::MalformedAtom(_))
        ));
    }

    #[test]
    fn buffer_lookup_single_level() {
        let file = two_track_file();
        let moov = locate_in_buffer(&file, b"moov").unwrap().unwrap();
        assert_eq!(moov.start, 12);
        let inner = &file[moov.offset as usize..moov.end() as usize];
        assert!(locate_in_buffer(inner, b"trak").unwrap().is_some());
        assert!(locate_in_buffer(&file, b"trak").unwrap().is_none());
    }

    #[test]
    fn swap_reverses_bytes() {
        assert_eq!(swap_u64(0x0102030405060708), 0x0807060504030201);
        assert_eq!(swap_u64(swap_u64(42)), 42);
    }
}
