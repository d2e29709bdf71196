//! Error types for the DWARF analysis library

use std::path::PathBuf;

/// Library-level failures: bad inputs, decode problems, missing sections.
/// Expression evaluation has its own typed error (`EvalError`); it never
/// flows through here.
#[derive(Debug, thiserror::Error)]
pub enum DwarfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DWARF parsing error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("object file error: {0}")]
    Object(#[from] object::Error),
    #[error("executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },
    #[error("no DIE at offset 0x{offset:x}")]
    NoSuchDie { offset: u64 },
    #[error("invalid DWARF expression at byte {offset}")]
    InvalidExpression { offset: usize },
    #[error("no call frame information for pc 0x{pc:x}")]
    NoFrameInfo { pc: u64 },
}

/// Result type used throughout the library.
pub type Result<T> = anyhow::Result<T>;
