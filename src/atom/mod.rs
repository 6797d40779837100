//! In-memory box (atom) tree.
//!
//! An [`Atom`] is either a leaf carrying raw payload bytes or a container
//! whose payload is the concatenation of its serialized children. Attaching
//! a child moves it into the parent, so a consumed child cannot be written
//! twice. All numeric fields are big-endian.

pub mod builders;
pub mod metadata;
pub mod reader;

use std::io::{self, Write};

/// Size of a compact box header: be32 size + 4-byte tag.
pub const HEADER_LEN: u32 = 8;

/// Size field value meaning "a 64-bit size follows the tag".
pub const LARGE_SIZE_SENTINEL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    size: u32,
    tag: [u8; 4],
    payload: Option<Vec<u8>>,
    /// Declared size does not describe the payload (mdat header forms).
    wide: bool,
}

impl Atom {
    /// A box with raw payload bytes.
    pub fn leaf(tag: &[u8; 4], payload: Vec<u8>) -> Self {
        Self {
            size: HEADER_LEN + payload.len() as u32,
            tag: *tag,
            payload: Some(payload),
            wide: false,
        }
    }

    /// An empty box that children get attached to.
    pub fn container(tag: &[u8; 4]) -> Self {
        Self {
            size: HEADER_LEN,
            tag: *tag,
            payload: None,
            wide: false,
        }
    }

    /// A box whose declared size is written verbatim and whose payload is
    /// exactly 8 bytes: either the `free` placeholder carrying a compact mdat
    /// header, or an mdat with the 64-bit size sentinel.
    pub fn wide(tag: &[u8; 4], declared_size: u32, payload: [u8; 8]) -> Self {
        Self {
            size: declared_size,
            tag: *tag,
            payload: Some(payload.to_vec()),
            wide: true,
        }
    }

    /// Move `child` into this box, growing the payload by its serialized size.
    pub fn attach(&mut self, child: Atom) {
        let bytes = child.into_bytes();
        self.size += bytes.len() as u32;
        self.payload.get_or_insert_with(Vec::new).extend_from_slice(&bytes);
    }

    /// Chaining form of [`Atom::attach`].
    pub fn with(mut self, child: Atom) -> Self {
        self.attach(child);
        self
    }

    /// Attach `child` when present.
    pub fn with_opt(mut self, child: Option<Atom>) -> Self {
        if let Some(child) = child {
            self.attach(child);
        }
        self
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn tag(&self) -> &[u8; 4] {
        &self.tag
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    pub fn is_wide(&self) -> bool {
        self.wide
    }

    /// Number of bytes [`Atom::serialize`] writes.
    pub fn serialized_len(&self) -> u64 {
        HEADER_LEN as u64 + self.payload().len() as u64
    }

    /// Write header and payload to `w`, consuming the box.
    pub fn serialize<W: Write>(self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.size.to_be_bytes())?;
        w.write_all(&self.tag)?;
        if let Some(payload) = &self.payload {
            w.write_all(payload)?;
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len() as usize);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.tag);
        if let Some(payload) = self.payload {
            buf.extend_from_slice(&payload);
        }
        buf
    }

    /// Drop the box without writing it.
    pub fn free(self) {}
}
