//! Encapsuler error types.

use thiserror::Error;

/// Errors that can occur while recording, finalizing, recovering or reading
/// a media file.
#[derive(Error, Debug)]
pub enum EncapsulerError {
    /// A required input was empty or out of range.
    #[error("Bad parameters: {0}")]
    BadParameter(String),

    /// The first frame used a codec the encapsuler cannot mux.
    #[error("Codec non-supported: {0}")]
    UnsupportedCodec(String),

    /// No key frame has been accepted yet. Keep feeding frames.
    #[error("Encapsuler waiting for i-frame")]
    WaitingForIFrame,

    /// A video frame does not match the locked stream parameters.
    #[error("Error in video frame header: {0}")]
    BadVideoFrame(String),

    /// An audio sample does not match the locked stream parameters.
    #[error("Error in audio sample header: {0}")]
    BadAudioSample(String),

    /// A sample starts before the previous one ended.
    #[error("Timestamp is before previous sample: {0}")]
    BadTimestamp(String),

    /// The frame-count ceiling has been reached.
    #[error("Encapsuler full: {0} frames")]
    EncapsulerFull(u32),

    /// Any I/O failure on the data or info file.
    #[error("File error while encapsulating: {0}")]
    FileError(#[from] std::io::Error),

    /// The info file was written by an incompatible descriptor version.
    #[error("Descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// No atom matches the requested path.
    #[error("Atom not found: {0}")]
    AtomNotFound(String),

    /// An atom header is inconsistent with its container.
    #[error("Malformed atom: {0}")]
    MalformedAtom(String),

    /// The pvat JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EncapsulerError {
    /// Whether the caller is expected to keep going past this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WaitingForIFrame)
    }
}

/// Convenience Result type for encapsuler operations.
pub type EncapsulerResult<T> = Result<T, EncapsulerError>;
