//! PC to (compilation unit, function DIE) search
//!
//! Walks the compilation units, matches the CU whose PC ranges cover the
//! query address, then searches that CU's DIE tree for the subprogram (or
//! inlined subroutine) containing the PC. The first concrete match wins;
//! nested inlined subroutines are reported in favor of their enclosing
//! subprogram only when the subprogram itself does not match.

use tracing::debug;

use crate::attrs::{self, Dwarf, Unit};
use crate::core::{FunctionInfo, Result};

/// A located function: the owning unit plus the DIE's unit-local offset.
pub struct FoundFunction {
    pub unit: Unit,
    pub die_offset: gimli::UnitOffset,
}

impl FoundFunction {
    /// Summarize the function for display: name, PC range and declaration
    /// coordinates.
    pub fn info(&self, dwarf: &Dwarf, demangle: bool) -> Result<FunctionInfo> {
        let die = self.unit.entry(self.die_offset)?;
        let name = attrs::function_name(dwarf, &self.unit, &die, demangle, "?");
        let (low_pc, high_pc) = match attrs::pc_range(dwarf, &self.unit, &die) {
            Some((low, high)) => (low, Some(high)),
            None => (0, None),
        };
        Ok(FunctionInfo {
            name,
            low_pc,
            high_pc,
            decl_file: attrs::decl_file(dwarf, &self.unit, &die),
            decl_line: attrs::decl_line(&die),
        })
    }
}

/// Find the function containing `pc`, if any CU claims the address.
pub fn find_function(dwarf: &Dwarf, pc: u64) -> Result<Option<FoundFunction>> {
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;

        let cu_matches = {
            let mut entries = unit.entries();
            match entries.next_dfs()? {
                Some((_, root)) => attrs::die_contains_pc(dwarf, &unit, root, pc)?,
                None => false,
            }
        };
        if !cu_matches {
            continue;
        }
        debug!(
            "pc 0x{:x} inside CU at 0x{:x}",
            pc,
            unit.header.offset().as_debug_info_offset().map_or(0, |o| o.0 as u64)
        );

        if let Some(die_offset) = search_unit(dwarf, &unit, pc)? {
            return Ok(Some(FoundFunction { unit, die_offset }));
        }
        // The CU claimed the PC but no subprogram matched; other CUs
        // cannot do better (ranges do not overlap between CUs).
        return Ok(None);
    }
    Ok(None)
}

/// Depth-first search for the subprogram covering `pc` within one unit.
fn search_unit(dwarf: &Dwarf, unit: &Unit, pc: u64) -> Result<Option<gimli::UnitOffset>> {
    let mut entries = unit.entries();
    let mut best: Option<gimli::UnitOffset> = None;

    while let Some((_, entry)) = entries.next_dfs()? {
        match entry.tag() {
            gimli::DW_TAG_subprogram | gimli::DW_TAG_inlined_subroutine => {
                if attrs::die_contains_pc(dwarf, unit, entry, pc)? {
                    debug!(
                        "pc 0x{:x} inside {} at 0x{:x}",
                        pc,
                        entry.tag(),
                        entry.offset().0
                    );
                    if entry.tag() == gimli::DW_TAG_subprogram {
                        return Ok(Some(entry.offset()));
                    }
                    // Remember an inlined match but keep scanning for the
                    // concrete subprogram.
                    if best.is_none() {
                        best = Some(entry.offset());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(best)
}
