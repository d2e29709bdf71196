//! Call Frame Information engine
//!
//! Answers `cfa(pc)` and recovers per-register values from the unwind row
//! covering a PC. `.eh_frame` is preferred (with the `.eh_frame_hdr`
//! binary-search table when parseable), `.debug_frame` is the fallback.
//!
//! Rows are resolved into section-independent rules up front: embedded
//! unwind expressions are fetched and decoded at lookup time, so rule
//! application below is pure computation over providers.

use std::collections::HashMap;

use object::{Object, ObjectSection};
use tracing::{debug, warn};

use gimli::{BaseAddresses, CfaRule, ParsedEhFrameHdr, RegisterRule, UnwindSection};

use crate::core::{EvalContext, EvalError, EvalErrorKind, MemoryProvider};
use crate::expr::DwarfExpression;
use crate::loader::Reader;

/// CFA rule of one unwind row, with expressions already decoded.
#[derive(Debug, Clone)]
pub enum FrameCfaRule {
    RegisterAndOffset { register: u16, offset: i64 },
    Expression(DwarfExpression),
}

/// Register rule of one unwind row.
#[derive(Debug, Clone)]
pub enum FrameRegisterRule {
    Undefined,
    SameValue,
    /// Value stored at `cfa + offset`.
    Offset(i64),
    /// Value is `cfa + offset` itself.
    ValOffset(i64),
    /// Value preserved in another register.
    Register(u16),
    /// Value stored at the address the expression computes.
    Expression(DwarfExpression),
    /// Value is what the expression computes.
    ValExpression(DwarfExpression),
    /// Anything this engine cannot recover.
    Unsupported,
}

/// One resolved unwind row: `[start, end)` and the rules in force there.
#[derive(Debug, Clone)]
pub struct FrameRow {
    pub start: u64,
    pub end: u64,
    pub cfa: FrameCfaRule,
    /// Column holding the caller's return address, from the CIE.
    pub ra_register: u16,
    /// Rules for the DWARF register columns the caller asked for.
    pub registers: Vec<(u16, FrameRegisterRule)>,
}

impl std::fmt::Display for FrameCfaRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameCfaRule::RegisterAndOffset { register, offset } => {
                if *offset >= 0 {
                    write!(f, "r{register}+{offset}")
                } else {
                    write!(f, "r{register}-{}", -offset)
                }
            }
            FrameCfaRule::Expression(_) => write!(f, "expr"),
        }
    }
}

impl std::fmt::Display for FrameRegisterRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRegisterRule::Undefined => write!(f, "undef"),
            FrameRegisterRule::SameValue => write!(f, "same"),
            FrameRegisterRule::Offset(offset) => {
                if *offset >= 0 {
                    write!(f, "[cfa+{offset}]")
                } else {
                    write!(f, "[cfa-{}]", -offset)
                }
            }
            FrameRegisterRule::ValOffset(offset) => {
                if *offset >= 0 {
                    write!(f, "cfa+{offset}")
                } else {
                    write!(f, "cfa-{}", -offset)
                }
            }
            FrameRegisterRule::Register(reg) => write!(f, "r{reg}"),
            FrameRegisterRule::Expression(_) => write!(f, "[expr]"),
            FrameRegisterRule::ValExpression(_) => write!(f, "expr"),
            FrameRegisterRule::Unsupported => write!(f, "?"),
        }
    }
}

/// Recovered machine state at a PC, for frame dumps.
#[derive(Debug, Clone)]
pub struct FrameState {
    pub cfa: u64,
    /// `(column, value)`; `None` when the column's rule does not produce a
    /// value (undefined, same-value, or a failed read).
    pub registers: Vec<(u16, Option<u64>)>,
}

/// The CFI engine over a loaded executable.
pub struct DwarfFrames {
    eh_frame: Option<gimli::EhFrame<Reader>>,
    eh_bases: BaseAddresses,
    eh_frame_hdr: Option<ParsedEhFrameHdr<Reader>>,
    debug_frame: Option<gimli::DebugFrame<Reader>>,
    debug_bases: BaseAddresses,
    address_size: u8,
}

impl DwarfFrames {
    /// Wire up the unwind sections of an executable. Absent sections are
    /// tolerated; lookups just fail over or return nothing.
    pub fn load(
        object: &object::File<'static>,
        endian: gimli::RunTimeEndian,
        address_size: u8,
    ) -> Self {
        let section_data = |name: &str| -> Option<(&'static [u8], u64)> {
            let section = object.section_by_name(name)?;
            let data = section.data().ok()?;
            Some((data, section.address()))
        };
        let text_addr = section_data(".text").map(|(_, addr)| addr).unwrap_or(0);

        let mut eh_bases = BaseAddresses::default().set_text(text_addr);
        let mut eh_frame = None;
        let mut eh_frame_hdr = None;
        if let Some((data, addr)) = section_data(".eh_frame") {
            let mut section = gimli::EhFrame::new(data, endian);
            section.set_address_size(address_size);
            eh_bases = eh_bases.set_eh_frame(addr);
            eh_frame = Some(section);

            if let Some((hdr_data, hdr_addr)) = section_data(".eh_frame_hdr") {
                eh_bases = eh_bases.set_eh_frame_hdr(hdr_addr);
                let hdr = gimli::EhFrameHdr::new(hdr_data, endian);
                match hdr.parse(&eh_bases, address_size) {
                    Ok(parsed) => {
                        debug!("parsed .eh_frame_hdr for binary FDE search");
                        eh_frame_hdr = Some(parsed);
                    }
                    Err(e) => {
                        warn!(".eh_frame_hdr unusable, falling back to linear search: {}", e);
                    }
                }
            }
        }

        let debug_bases = BaseAddresses::default().set_text(text_addr);
        let debug_frame = section_data(".debug_frame").map(|(data, _)| {
            let mut section = gimli::DebugFrame::new(data, endian);
            section.set_address_size(address_size);
            section
        });

        Self {
            eh_frame,
            eh_bases,
            eh_frame_hdr,
            debug_frame,
            debug_bases,
            address_size,
        }
    }

    /// The Canonical Frame Address at `pc`.
    pub fn cfa(&self, context: &EvalContext<'_>, pc: u64) -> Result<u64, EvalError> {
        let row = self
            .row_for_pc(pc, &[])
            .ok_or(EvalError::new(EvalErrorKind::CfaInvalid, pc))?;
        compute_cfa(&row.cfa, context, pc)
    }

    /// CFA plus per-column recovered registers at `pc`. `columns` is the
    /// architecture's register-column count.
    pub fn frame_state(
        &self,
        context: &EvalContext<'_>,
        pc: u64,
        columns: u16,
    ) -> Result<FrameState, EvalError> {
        let wanted: Vec<u16> = (0..columns).collect();
        let row = self
            .row_for_pc(pc, &wanted)
            .ok_or(EvalError::new(EvalErrorKind::CfaInvalid, pc))?;
        let cfa = compute_cfa(&row.cfa, context, pc)?;

        let registers = row
            .registers
            .iter()
            .map(|(column, rule)| (*column, apply_register_rule(rule, cfa, context, pc)))
            .collect();

        Ok(FrameState { cfa, registers })
    }

    /// The resolved unwind row covering `pc`, trying `.eh_frame` first.
    pub fn row_for_pc(&self, pc: u64, columns: &[u16]) -> Option<FrameRow> {
        if let Some(eh_frame) = &self.eh_frame {
            if let Some(fde) = self.eh_fde(eh_frame, pc) {
                if let Some(row) =
                    resolve_row(eh_frame, &self.eh_bases, &fde, pc, columns, self.address_size)
                {
                    return Some(row);
                }
            }
        }
        if let Some(debug_frame) = &self.debug_frame {
            let fde = find_fde(debug_frame, &self.debug_bases, pc)?;
            return resolve_row(debug_frame, &self.debug_bases, &fde, pc, columns, self.address_size);
        }
        None
    }

    /// Every row of the FDE covering `pc`, in address order. The dump mode
    /// walks these to show how the rules evolve across the function.
    pub fn rows_for_pc(&self, pc: u64, columns: &[u16]) -> Vec<FrameRow> {
        if let Some(eh_frame) = &self.eh_frame {
            if let Some(fde) = self.eh_fde(eh_frame, pc) {
                let rows =
                    resolve_fde_rows(eh_frame, &self.eh_bases, &fde, columns, self.address_size);
                if !rows.is_empty() {
                    return rows;
                }
            }
        }
        if let Some(debug_frame) = &self.debug_frame {
            if let Some(fde) = find_fde(debug_frame, &self.debug_bases, pc) {
                return resolve_fde_rows(
                    debug_frame,
                    &self.debug_bases,
                    &fde,
                    columns,
                    self.address_size,
                );
            }
        }
        Vec::new()
    }

    /// Walk the call stack from the captured machine state, innermost frame
    /// first. The walk ends when CFI coverage runs out, the return address
    /// is null, or it stops making progress.
    pub fn walk_stack(
        &self,
        initial_pc: u64,
        initial_registers: &HashMap<u16, u64>,
        memory: Option<MemoryProvider<'_>>,
        sp_column: u16,
        columns: u16,
    ) -> Vec<StackFrame> {
        let wanted: Vec<u16> = (0..columns).collect();
        let mut frames = Vec::new();
        let mut registers = initial_registers.clone();
        let mut pc = initial_pc;

        for depth in 0..MAX_WALK_FRAMES {
            // Return addresses point after the call site; look up caller
            // rows one byte back.
            let lookup_pc = if depth == 0 { pc } else { pc.saturating_sub(1) };
            let Some(row) = self.row_for_pc(lookup_pc, &wanted) else {
                break;
            };
            let Some(step) = unwind_step(&row, &registers, memory, sp_column, lookup_pc) else {
                break;
            };
            frames.push(StackFrame { pc, cfa: step.cfa });

            let Some(return_address) = step.return_address else {
                break;
            };
            if return_address == 0 || return_address == pc {
                break;
            }
            registers = step.caller_registers;
            pc = return_address;
        }

        frames
    }

    /// FDE lookup in `.eh_frame`, via the `.eh_frame_hdr` binary-search
    /// table when available.
    fn eh_fde(
        &self,
        eh_frame: &gimli::EhFrame<Reader>,
        pc: u64,
    ) -> Option<gimli::FrameDescriptionEntry<Reader>> {
        let fde = match &self.eh_frame_hdr {
            Some(hdr) => hdr.table().and_then(|table| {
                table
                    .fde_for_address(eh_frame, &self.eh_bases, pc, |section, bases, offset| {
                        section.cie_from_offset(bases, offset)
                    })
                    .ok()
            }),
            None => None,
        };
        fde.or_else(|| find_fde(eh_frame, &self.eh_bases, pc))
    }
}

/// One walked stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub pc: u64,
    pub cfa: u64,
}

/// What one unwind row yields for the walk: the frame's CFA, the caller's
/// PC, and the caller's recovered register file.
#[derive(Debug, Clone)]
pub struct UnwindStep {
    pub cfa: u64,
    pub return_address: Option<u64>,
    pub caller_registers: HashMap<u16, u64>,
}

/// Runaway-walk guard; deeper stacks than this are cyclic in practice.
const MAX_WALK_FRAMES: usize = 256;

/// Apply one row to a register file: compute the CFA, recover the caller's
/// registers, and pick out the return address. `None` only when the CFA
/// itself cannot be computed.
pub fn unwind_step(
    row: &FrameRow,
    registers: &HashMap<u16, u64>,
    memory: Option<MemoryProvider<'_>>,
    sp_column: u16,
    pc: u64,
) -> Option<UnwindStep> {
    let read_register = |reg: u16| registers.get(&reg).copied();
    let context = EvalContext {
        registers: Some(&read_register),
        memory,
        ..Default::default()
    };

    let cfa = match compute_cfa(&row.cfa, &context, pc) {
        Ok(cfa) => cfa,
        Err(e) => {
            debug!("cfa unavailable during unwind at 0x{:x}: {}", pc, e);
            return None;
        }
    };

    let mut caller_registers = HashMap::new();
    for (column, rule) in &row.registers {
        match rule {
            // Preserved across the call.
            FrameRegisterRule::SameValue => {
                if let Some(value) = registers.get(column) {
                    caller_registers.insert(*column, *value);
                }
            }
            FrameRegisterRule::Undefined => {}
            _ => {
                if let Some(value) = apply_register_rule(rule, cfa, &context, pc) {
                    caller_registers.insert(*column, value);
                }
            }
        }
    }
    // By definition the caller's stack pointer is the CFA.
    caller_registers.entry(sp_column).or_insert(cfa);

    let return_address = caller_registers.get(&row.ra_register).copied();
    Some(UnwindStep {
        cfa,
        return_address,
        caller_registers,
    })
}

/// Linear FDE scan, used when no search table is available.
fn find_fde<S: UnwindSection<Reader>>(
    section: &S,
    bases: &BaseAddresses,
    pc: u64,
) -> Option<gimli::FrameDescriptionEntry<Reader>> {
    match section.fde_for_address(bases, pc, |section, bases, offset| {
        section.cie_from_offset(bases, offset)
    }) {
        Ok(fde) => Some(fde),
        Err(e) => {
            debug!("no FDE for pc 0x{:x}: {}", pc, e);
            None
        }
    }
}

/// Find the unwind row covering `pc` within `fde` and resolve its rules.
fn resolve_row<S: UnwindSection<Reader>>(
    section: &S,
    bases: &BaseAddresses,
    fde: &gimli::FrameDescriptionEntry<Reader>,
    pc: u64,
    columns: &[u16],
    address_size: u8,
) -> Option<FrameRow> {
    let mut ctx = gimli::UnwindContext::new();
    let row = match fde.unwind_info_for_address(section, bases, &mut ctx, pc) {
        Ok(row) => row.clone(),
        Err(e) => {
            warn!("unwind info unavailable for pc 0x{:x}: {}", pc, e);
            return None;
        }
    };
    convert_row(section, fde, &row, columns, address_size)
}

/// Resolve every row of one FDE, in address order.
fn resolve_fde_rows<S: UnwindSection<Reader>>(
    section: &S,
    bases: &BaseAddresses,
    fde: &gimli::FrameDescriptionEntry<Reader>,
    columns: &[u16],
    address_size: u8,
) -> Vec<FrameRow> {
    let mut ctx = gimli::UnwindContext::new();
    let mut table = match fde.rows(section, bases, &mut ctx) {
        Ok(table) => table,
        Err(e) => {
            warn!("unwind table unavailable: {}", e);
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    loop {
        match table.next_row() {
            Ok(Some(row)) => {
                let row = row.clone();
                if let Some(resolved) = convert_row(section, fde, &row, columns, address_size) {
                    rows.push(resolved);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("unwind table iteration failed: {}", e);
                break;
            }
        }
    }
    rows
}

/// Convert one gimli unwind row into the resolved, section-independent
/// form.
fn convert_row<S: UnwindSection<Reader>>(
    section: &S,
    fde: &gimli::FrameDescriptionEntry<Reader>,
    row: &gimli::UnwindTableRow<usize>,
    columns: &[u16],
    address_size: u8,
) -> Option<FrameRow> {
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => FrameCfaRule::RegisterAndOffset {
            register: register.0,
            offset: *offset,
        },
        CfaRule::Expression(unwind_expr) => {
            let expr = decode_unwind_expression(section, unwind_expr, address_size)?;
            FrameCfaRule::Expression(expr)
        }
    };

    let mut registers = Vec::with_capacity(columns.len());
    for &column in columns {
        let rule = match row.register(gimli::Register(column)) {
            RegisterRule::Undefined => FrameRegisterRule::Undefined,
            RegisterRule::SameValue => FrameRegisterRule::SameValue,
            RegisterRule::Offset(offset) => FrameRegisterRule::Offset(offset),
            RegisterRule::ValOffset(offset) => FrameRegisterRule::ValOffset(offset),
            RegisterRule::Register(reg) => FrameRegisterRule::Register(reg.0),
            RegisterRule::Expression(unwind_expr) => {
                match decode_unwind_expression(section, &unwind_expr, address_size) {
                    Some(expr) => FrameRegisterRule::Expression(expr),
                    None => FrameRegisterRule::Unsupported,
                }
            }
            RegisterRule::ValExpression(unwind_expr) => {
                match decode_unwind_expression(section, &unwind_expr, address_size) {
                    Some(expr) => FrameRegisterRule::ValExpression(expr),
                    None => FrameRegisterRule::Unsupported,
                }
            }
            _ => FrameRegisterRule::Unsupported,
        };
        registers.push((column, rule));
    }

    Some(FrameRow {
        start: row.start_address(),
        end: row.end_address(),
        cfa,
        ra_register: fde.cie().return_address_register().0,
        registers,
    })
}

fn decode_unwind_expression<S: UnwindSection<Reader>>(
    section: &S,
    unwind_expr: &gimli::UnwindExpression<usize>,
    address_size: u8,
) -> Option<DwarfExpression> {
    let expression = match unwind_expr.get(section) {
        Ok(expression) => expression,
        Err(e) => {
            warn!("unreadable CFI expression: {}", e);
            return None;
        }
    };
    match DwarfExpression::parse(expression.0.slice(), address_size) {
        Ok(expr) => Some(expr),
        Err(e) => {
            warn!("undecodable CFI expression: {}", e);
            None
        }
    }
}

/// Compute the CFA from a row's rule. Expression rules run in a child
/// context with the CFA provider removed, cutting the `cfa -> expr -> cfa`
/// recursion.
pub fn compute_cfa(
    rule: &FrameCfaRule,
    context: &EvalContext<'_>,
    pc: u64,
) -> Result<u64, EvalError> {
    match rule {
        FrameCfaRule::RegisterAndOffset { register, offset } => {
            let registers = context
                .registers
                .ok_or(EvalError::new(EvalErrorKind::CfaInvalid, pc))?;
            let value = registers(*register)
                .ok_or(EvalError::new(EvalErrorKind::CfaInvalid, pc))?;
            Ok((value as i64).wrapping_add(*offset) as u64)
        }
        FrameCfaRule::Expression(expr) => {
            let child = context.without_cfa();
            expr.evaluate(&child, pc).map(|location| location.raw())
        }
    }
}

/// Apply one register column's rule. `None` means the column has no
/// recoverable value at this row; a register or memory read failure is
/// reported the same way and never fails the frame as a whole.
pub fn apply_register_rule(
    rule: &FrameRegisterRule,
    cfa: u64,
    context: &EvalContext<'_>,
    pc: u64,
) -> Option<u64> {
    match rule {
        FrameRegisterRule::Undefined | FrameRegisterRule::SameValue => None,
        FrameRegisterRule::Offset(offset) => {
            let addr = (cfa as i64).wrapping_add(*offset) as u64;
            read_addr(context, addr)
        }
        FrameRegisterRule::ValOffset(offset) => Some((cfa as i64).wrapping_add(*offset) as u64),
        FrameRegisterRule::Register(reg) => context.registers.and_then(|read| read(*reg)),
        FrameRegisterRule::Expression(expr) => {
            let addr = eval_with_cfa_seed(expr, cfa, context, pc)?;
            read_addr(context, addr)
        }
        FrameRegisterRule::ValExpression(expr) => eval_with_cfa_seed(expr, cfa, context, pc),
        FrameRegisterRule::Unsupported => None,
    }
}

/// Register-rule expressions start with the CFA on the stack.
fn eval_with_cfa_seed(
    expr: &DwarfExpression,
    cfa: u64,
    context: &EvalContext<'_>,
    pc: u64,
) -> Option<u64> {
    let child = context.without_cfa();
    let mut stack = vec![cfa as i64];
    match expr.evaluate_on_stack(&child, pc, &mut stack) {
        Ok(location) => Some(location.raw()),
        Err(e) => {
            debug!("register rule expression failed: {}", e);
            None
        }
    }
}

fn read_addr(context: &EvalContext<'_>, addr: u64) -> Option<u64> {
    let memory = context.memory?;
    let bytes = memory(addr, 8)?;
    if bytes.len() < 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    Some(u64::from_le_bytes(buf))
}
