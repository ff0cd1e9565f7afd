// Error types shared across the kbit crates

use thiserror::Error;

/// All failure kinds the toolkit reports. These are returned, never panicked.
#[derive(Debug, Error)]
pub enum KbitError {
    #[error("bad magic: not a KBITv1 file")]
    BadMagic,

    #[error("truncated header: got {0} bytes, need 64")]
    TruncatedHeader(usize),

    #[error("truncated payload: expected {expected} bytes, got {got}")]
    TruncatedPayload { expected: u64, got: u64 },

    #[error("unexpected payload flags {found} (expected {expected})")]
    FlagMismatch { expected: u64, found: u64 },

    #[error("failed to parse shard index: {0}")]
    IndexParse(String),

    #[error("shard manifest incomplete: missing {0}")]
    ManifestIncomplete(&'static str),

    #[error("gc histogram k={hist_k} does not match index k={index_k}")]
    HistogramMismatch { hist_k: u8, index_k: u8 },

    #[error("malformed cursor token")]
    BadCursor,

    #[error("cursor does not match request: {0}")]
    CursorMismatch(&'static str),

    #[error("invalid base {0:?}")]
    InvalidBase(char),

    #[error("k-mer length {got} does not match k={expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("unsupported expansion: {0}")]
    UnsupportedExpansion(String),

    #[error("compressed bitmap deserialization failed: {0}")]
    Deserialization(String),

    #[error("generator finished with {0} ones unplaced")]
    OnesMismatch(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KbitError>;
