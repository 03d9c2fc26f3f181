use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid archive signature (expected RREDATA )")]
    BadSignature,
    #[error("Implausible entry count in archive tail: {0}")]
    InsaneCount(u32),
    #[error("Archive too short: need {needed} bytes, have {available}")]
    ShortFile { needed: u64, available: u64 },
    #[error("Entry {name:?} extends beyond the data region (offset {offset}, size {size})")]
    BadPlacement { name: String, offset: u32, size: u32 },
    #[error("Corrupt cipher routine: {0}")]
    CorruptRoutine(String),
    #[error("Bad payload for {name:?}: expected {expected} bytes, decoded {actual}")]
    BadPayload {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("LZSS compression got no input data")]
    NoData,
    #[error("LZSS frame size must be a power of two, got {0}")]
    BadFrameSize(u32),
    #[error("Failed to decode entry name (CP932): {0:?}")]
    NameDecodeError(Vec<u8>),
    #[error("Failed to encode entry name (CP932): {0}")]
    NameEncodeError(String),
    #[error("Bad archive key: {0}")]
    BadKey(String),
    #[error("Sidecar metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Walkdir error: {0}")]
    WalkdirError(#[from] walkdir::Error),
    #[error("Output path is not specified and cannot be derived from input: {0:?}")]
    CannotDeriveOutputPath(PathBuf),
    #[error("{0} entries failed to extract")]
    PartialExtract(usize),
}
