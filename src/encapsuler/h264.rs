//! Annex-B helpers: start-code scanning, parameter-set extraction and
//! conversion to 4-byte length-prefixed NAL units.

use crate::error::{EncapsulerError, EncapsulerResult};

pub mod nal_type {
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
}

/// Next start code at or after `from`, as `(position, length)`.
/// Four-byte codes are tried first so `00 00 00 01` is not read as a
/// three-byte code preceded by a stray zero.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            return Some((i, 4));
        }
        if data[i..i + 3] == [0, 0, 1] {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// NAL units of an Annex-B buffer without their start codes. Bytes before
/// the first start code are skipped.
pub struct AnnexBNalIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> AnnexBNalIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }
}

impl<'a> Iterator for AnnexBNalIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (pos, len) = find_start_code(self.data, self.cursor)?;
        let start = pos + len;
        let end = find_start_code(self.data, start).map_or(self.data.len(), |(next, _)| next);
        self.cursor = end;
        Some(&self.data[start..end])
    }
}

/// SPS and PPS of a key frame. The first two NAL units are taken when they
/// are a parameter-set pair; otherwise the first SPS and PPS found anywhere.
pub fn extract_parameter_sets(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let nal_kind = |nal: &[u8]| nal.first().map(|b| b & 0x1f);
    let mut nals = AnnexBNalIter::new(data).filter(|nal| !nal.is_empty());
    if let (Some(first), Some(second)) = (nals.next(), nals.next()) {
        if nal_kind(first) == Some(nal_type::SPS) && nal_kind(second) == Some(nal_type::PPS) {
            return Some((first.to_vec(), second.to_vec()));
        }
    }

    let mut sps = None;
    let mut pps = None;
    for nal in AnnexBNalIter::new(data) {
        match nal_kind(nal) {
            Some(nal_type::SPS) if sps.is_none() => sps = Some(nal),
            Some(nal_type::PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
        if sps.is_some() && pps.is_some() {
            break;
        }
    }
    Some((sps?.to_vec(), pps?.to_vec()))
}

/// SPS and PPS from pre-split NAL units, with the same first-pair rule as
/// [`extract_parameter_sets`].
pub fn extract_parameter_sets_split(nalus: &[&[u8]]) -> Option<(Vec<u8>, Vec<u8>)> {
    let nal_kind = |nal: &[u8]| nal.first().map(|b| b & 0x1f);
    if let [first, second, ..] = nalus {
        if nal_kind(first) == Some(nal_type::SPS) && nal_kind(second) == Some(nal_type::PPS) {
            return Some((first.to_vec(), second.to_vec()));
        }
    }
    let find = |kind: u8| nalus.iter().find(|nal| nal_kind(nal) == Some(kind)).map(|nal| nal.to_vec());
    Some((find(nal_type::SPS)?, find(nal_type::PPS)?))
}

fn push_length_prefixed(out: &mut Vec<u8>, nal: &[u8]) {
    out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
    out.extend_from_slice(nal);
}

/// Length-prefixed form of an Annex-B access unit, optionally preceded by
/// the parameter sets.
pub fn annexb_to_avcc(data: &[u8], parameter_sets: Option<(&[u8], &[u8])>) -> EncapsulerResult<Vec<u8>> {
    if find_start_code(data, 0).is_none() {
        return Err(EncapsulerError::BadVideoFrame("no start code in H.264 frame".into()));
    }
    let mut out = Vec::with_capacity(data.len() + 16);
    if let Some((sps, pps)) = parameter_sets {
        push_length_prefixed(&mut out, sps);
        push_length_prefixed(&mut out, pps);
    }
    for nal in AnnexBNalIter::new(data) {
        push_length_prefixed(&mut out, nal);
    }
    Ok(out)
}

/// Length-prefixed form of NAL units supplied without start codes.
pub fn nalus_to_avcc(nalus: &[&[u8]], parameter_sets: Option<(&[u8], &[u8])>) -> Vec<u8> {
    let total: usize = nalus.iter().map(|nal| nal.len() + 4).sum();
    let mut out = Vec::with_capacity(total + 16);
    if let Some((sps, pps)) = parameter_sets {
        push_length_prefixed(&mut out, sps);
        push_length_prefixed(&mut out, pps);
    }
    for nal in nalus {
        push_length_prefixed(&mut out, nal);
    }
    out
}
