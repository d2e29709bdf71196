//! Evaluation outcome types and the per-query context
//!
//! An expression either names where a value lives (`Location::Address`) or
//! produces the value itself (`Location::Value`). Failures are typed and
//! carry the byte offset of the offending op, so a caller can report exactly
//! which op in which expression went wrong.

use std::fmt;

/// Successful result of evaluating a location or CFI expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The value lives in memory at this address.
    Address(u64),
    /// The expression produced the value itself (bare register contents,
    /// `DW_OP_stack_value`).
    Value(u64),
}

impl Location {
    /// The carried number, whichever side of the address/value split it is
    /// on. Frame-base and CFA consumers treat both the same way.
    pub fn raw(&self) -> u64 {
        match self {
            Location::Address(v) | Location::Value(v) => *v,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Address(a) => write!(f, "@0x{a:x}"),
            Location::Value(v) => write!(f, "=0x{v:x}"),
        }
    }
}

/// Why an evaluation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    MemoryInvalid,
    RegisterInvalid,
    FrameBaseInvalid,
    IllegalState,
    IllegalOp,
    IllegalOpd,
    StackIndexInvalid,
    CfaInvalid,
    NotImplemented,
    AddressInvalid,
    Unknown,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvalErrorKind::MemoryInvalid => "memory invalid",
            EvalErrorKind::RegisterInvalid => "register invalid",
            EvalErrorKind::FrameBaseInvalid => "frame base invalid",
            EvalErrorKind::IllegalState => "illegal state",
            EvalErrorKind::IllegalOp => "illegal op",
            EvalErrorKind::IllegalOpd => "illegal operand",
            EvalErrorKind::StackIndexInvalid => "stack index invalid",
            EvalErrorKind::CfaInvalid => "cfa invalid",
            EvalErrorKind::NotImplemented => "not implemented",
            EvalErrorKind::AddressInvalid => "address invalid",
            EvalErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A typed evaluation failure: the error kind plus the byte offset of the
/// op that failed (for `AddressInvalid`, the query PC instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at offset 0x{offset:x}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub offset: u64,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, offset: u64) -> Self {
        Self { kind, offset }
    }
}

/// Register provider: DWARF register number to value.
pub type RegisterProvider<'a> = &'a dyn Fn(u16) -> Option<u64>;
/// Memory provider: borrowed bytes for `[addr, addr+len)`, or `None`.
pub type MemoryProvider<'a> = &'a dyn Fn(u64, usize) -> Option<&'a [u8]>;
/// CFA provider: Canonical Frame Address for a PC.
pub type CfaProvider<'a> = &'a dyn Fn(u64) -> Option<u64>;

/// Recursion bound for `fbreg`/`call_frame_cfa` re-entry. Well-formed debug
/// info nests location descriptions one or two deep; past this cap the
/// chain is cyclic.
pub const MAX_EVAL_DEPTH: usize = 16;

/// Everything one evaluation needs, borrowed for the duration of a query.
///
/// `frame_base` and `cfa` call back into the same evaluator; CFI expression
/// evaluation constructs a child context with `cfa: None` to break the
/// `cfa -> expr -> cfa` cycle.
#[derive(Clone, Copy, Default)]
pub struct EvalContext<'a> {
    /// Low PC of the compilation unit; location-list ranges are CU-relative.
    pub cu_low: u64,
    /// High PC of the compilation unit.
    pub cu_high: u64,
    /// Frame-base location of the enclosing function, for `DW_OP_fbreg`.
    pub frame_base: Option<&'a crate::location::DwarfLocation>,
    pub registers: Option<RegisterProvider<'a>>,
    pub memory: Option<MemoryProvider<'a>>,
    pub cfa: Option<CfaProvider<'a>>,
}

impl<'a> EvalContext<'a> {
    /// The context used for CFI expressions: same providers, no CFA, no
    /// frame base.
    pub fn without_cfa(&self) -> EvalContext<'a> {
        EvalContext {
            cu_low: self.cu_low,
            cu_high: self.cu_high,
            frame_base: None,
            registers: self.registers,
            memory: self.memory,
            cfa: None,
        }
    }
}

impl fmt::Debug for EvalContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("cu_low", &format_args!("0x{:x}", self.cu_low))
            .field("cu_high", &format_args!("0x{:x}", self.cu_high))
            .field("frame_base", &self.frame_base.is_some())
            .field("registers", &self.registers.is_some())
            .field("memory", &self.memory.is_some())
            .field("cfa", &self.cfa.is_some())
            .finish()
    }
}
