//! Minidump snapshot model for crashscope
//!
//! Parses a minidump file into an immutable snapshot: threads, modules,
//! memory ranges, the exception record, and per-thread CPU contexts. On top
//! of the snapshot it exposes the two providers the DWARF expression
//! pipeline consumes: `read_register(id) -> Option<u64>` and
//! `read_memory(addr, len) -> Option<&[u8]>`.
//!
//! The auxiliary DWFC context file (a synthetic per-frame register/stack
//! capture used when no snapshot is available) lives in [`dwfc`] and exposes
//! the same provider shapes.

pub mod context;
pub mod dwfc;
pub mod errors;
pub mod format;
pub mod minidump;
pub mod read;
pub mod strings;

pub use context::CpuContext;
pub use dwfc::{DwfcFile, DwfcFrame, DwfcThread};
pub use errors::{MinidumpError, Result};
pub use format::{
    exception_name, Directory, ExceptionStream, Header, LocationDescriptor, MemoryDescriptor,
    RawModule, RawSystemInfo, RawThread,
};
pub use minidump::{DebugInfoRecord, MemoryRange, Minidump};
pub use strings::utf16le_to_string;
