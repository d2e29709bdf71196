//! Crash query entry point
//!
//! `CrashAnalyzer` owns the loaded executable (debug info plus unwind
//! sections) and answers per-PC queries: enclosing function, source line,
//! parameter and local values, and the frame's CFA. Register and memory
//! access is abstracted behind [`SnapshotSource`], so a minidump, a DWFC
//! capture, or a test fixture all plug in the same way.

use std::path::Path;

use tracing::debug;

use crate::attrs;
use crate::core::{EvalContext, FunctionInfo, Result, SourceLocation};
use crate::frames::DwarfFrames;
use crate::lines;
use crate::loader::DwarfData;
use crate::location::DwarfLocation;
use crate::searcher;
use crate::types::UNRESOLVED_SIZE;
use crate::vars;

/// Runtime state a query reads registers and memory from.
pub trait SnapshotSource {
    /// Value of DWARF register `reg`, if captured.
    fn register(&self, reg: u16) -> Option<u64>;
    /// Borrowed bytes for `[addr, addr+len)`, if captured.
    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]>;
}

/// What a query should compute.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub functions: bool,
    pub demangle: bool,
    pub locals: bool,
    pub params: bool,
    pub frames: bool,
}

/// One variable's recovered state.
#[derive(Debug, Clone)]
pub struct VariableReport {
    pub name: String,
    pub type_name: String,
    /// `None` when the type chain never resolves to a size.
    pub size: Option<u64>,
    /// `None` when no snapshot was supplied; sentinels otherwise.
    pub value: Option<String>,
    /// Scalar rendering through the type encoding, when decodable.
    pub decoded: Option<String>,
    /// The location description, rendered for verbose output.
    pub location: Option<String>,
    pub is_parameter: bool,
}

/// Everything resolved for one queried PC.
#[derive(Debug, Clone)]
pub struct AddressReport {
    pub pc: u64,
    pub function: Option<FunctionInfo>,
    pub source: Option<SourceLocation>,
    pub params: Vec<VariableReport>,
    pub locals: Vec<VariableReport>,
    /// CFA at the PC, when CFI covers it and the rule's inputs are
    /// available.
    pub cfa: Option<u64>,
}

/// The analyzer over one executable.
pub struct CrashAnalyzer {
    data: DwarfData,
    frames: DwarfFrames,
}

impl CrashAnalyzer {
    /// Load an executable and its unwind sections.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = DwarfData::load(path)?;
        let frames = DwarfFrames::load(data.object(), data.endian(), data.address_size());
        Ok(Self { data, frames })
    }

    pub fn data(&self) -> &DwarfData {
        &self.data
    }

    pub fn frames(&self) -> &DwarfFrames {
        &self.frames
    }

    /// Resolve one PC. `Ok(None)` when no compilation unit claims the
    /// address.
    pub fn resolve(
        &self,
        pc: u64,
        options: &QueryOptions,
        source: Option<&dyn SnapshotSource>,
    ) -> Result<Option<AddressReport>> {
        let dwarf = self.data.dwarf();

        let Some(found) = searcher::find_function(dwarf, pc)? else {
            debug!("no function covers pc 0x{:x}", pc);
            return Ok(None);
        };
        let unit = &found.unit;

        let function = if options.functions {
            Some(found.info(dwarf, options.demangle)?)
        } else {
            None
        };
        let source_location = lines::line_for_pc(dwarf, unit, pc)?;

        let mut report = AddressReport {
            pc,
            function,
            source: source_location,
            params: Vec::new(),
            locals: Vec::new(),
            cfa: None,
        };
        if !(options.locals || options.params || options.frames) {
            return Ok(Some(report));
        }

        // Providers for this query; without a snapshot, locations still
        // resolve but reads come back empty.
        let reg_fn = |reg: u16| source.and_then(|s| s.register(reg));
        let mem_fn = |addr: u64, len: usize| source.and_then(|s| s.memory(addr, len));

        let (cu_low, cu_high) = {
            let mut entries = unit.entries();
            match entries.next_dfs()? {
                Some((_, root)) => attrs::pc_range(dwarf, unit, root).unwrap_or((0, 0)),
                None => (0, 0),
            }
        };

        let func_die = unit.entry(found.die_offset)?;
        let frame_base = match attrs::attr(&func_die, gimli::DW_AT_frame_base) {
            Some(value) => {
                DwarfLocation::from_attr(dwarf, unit, value, cu_low, self.data.address_size())?
            }
            None => None,
        };

        let base_ctx = EvalContext {
            cu_low,
            cu_high,
            frame_base: frame_base.as_ref(),
            registers: Some(&reg_fn),
            memory: Some(&mem_fn),
            cfa: None,
        };
        let frames = &self.frames;
        let cfa_fn = |query_pc: u64| frames.cfa(&base_ctx, query_pc).ok();
        let ctx = EvalContext {
            cfa: Some(&cfa_fn),
            ..base_ctx
        };

        if options.locals || options.params {
            let all = vars::variables_of_function(
                dwarf,
                unit,
                found.die_offset,
                cu_low,
                self.data.address_size(),
            )?;
            for var in &all {
                let report_entry = VariableReport {
                    name: var.name.clone(),
                    type_name: var.ty.name(),
                    size: match var.ty.size() {
                        UNRESOLVED_SIZE => None,
                        size => Some(size),
                    },
                    value: source.is_some().then(|| var.value(&ctx, pc)),
                    decoded: source.and_then(|_| var.decoded_value(&ctx, pc)),
                    location: var.location().map(describe_location),
                    is_parameter: var.is_parameter,
                };
                if var.is_parameter && options.params {
                    report.params.push(report_entry);
                } else if !var.is_parameter && options.locals {
                    report.locals.push(report_entry);
                }
            }
        }

        if options.frames {
            report.cfa = frames.cfa(&base_ctx, pc).ok();
        }

        Ok(Some(report))
    }
}

/// Render a location description's ranges and op streams on one line.
fn describe_location(location: &DwarfLocation) -> String {
    location
        .ranges()
        .iter()
        .map(|range| {
            if range.low == 0 && range.high == u64::MAX {
                range.expr.dump()
            } else {
                format!("[0x{:x} - 0x{:x}): {}", range.low, range.high, range.expr.dump())
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
