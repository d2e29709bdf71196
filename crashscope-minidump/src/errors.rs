//! Error types for the snapshot model

/// Errors produced while reading a minidump or DWFC context file.
///
/// Only header-level problems are fatal; malformed individual streams are
/// recovered locally by the reader and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum MinidumpError {
    #[error("truncated file: need {needed} bytes at offset 0x{offset:x}, have {available}")]
    Truncated {
        offset: u64,
        needed: usize,
        available: usize,
    },
    #[error("bad signature 0x{actual:08x}, expected 0x{expected:08x}")]
    Signature { expected: u32, actual: u32 },
    #[error("unsupported version {actual}, expected {expected}")]
    Version { expected: u16, actual: u16 },
    #[error("stream directory too large: {count} streams")]
    TooManyStreams { count: u32 },
    #[error("list stream too large: {count} items")]
    TooManyItems { count: u32 },
    #[error("bad magic in context file: {0:?}")]
    ContextMagic([u8; 4]),
    #[error("unknown CPU context layout: data_size={data_size}, context_flags=0x{flags:08x}")]
    UnknownContext { data_size: u32, flags: u32 },
}

pub type Result<T> = std::result::Result<T, MinidumpError>;
