//! Crashscope DWARF analysis library
//!
//! Resolves post-mortem queries against an executable's debug info: for a
//! crash-time PC it finds the enclosing function, source file and line, the
//! locals and parameters in scope, and recovers their values by evaluating
//! DWARF location expressions against registers and memory captured in a
//! snapshot.
//!
//! The pipeline, leaves first: [`expr`] interprets location and CFI
//! expressions over a signed 64-bit stack; [`location`] picks the active
//! expression for a PC out of a location list; [`frames`] computes the CFA
//! from `.eh_frame`/`.debug_frame` with the same evaluator; [`vars`] turns
//! (type, location, memory) into printable values. [`attrs`], [`searcher`]
//! and [`lines`] wrap the gimli decoder behind the small DIE/attribute
//! surface the pipeline consumes.

pub mod core;

// Main entry point
pub mod analyzer;

pub mod attrs;
pub mod demangle;
pub mod expr;
pub mod frames;
pub mod lines;
pub mod loader;
pub mod location;
pub mod searcher;
pub mod types;
pub mod vars;

// Re-exported so tool frontends name attributes and tags without pinning
// their own gimli version.
pub use gimli;

pub use analyzer::{
    AddressReport, CrashAnalyzer, QueryOptions, SnapshotSource, VariableReport,
};
pub use crate::core::{
    DwarfError, EvalContext, EvalError, EvalErrorKind, FunctionInfo, Location, Result,
    SourceLocation,
};
pub use expr::{DwarfExpression, DwarfOp};
pub use frames::DwarfFrames;
pub use loader::{DwarfData, Reader};
pub use location::{DwarfLocation, LocationRange};
pub use searcher::FoundFunction;
pub use types::DwarfType;
pub use vars::DwarfVar;
