//! Line table lookup
//!
//! Maps a PC to `file:line` through the unit's line program, and resolves
//! DWARF file indices to full paths. Rows inside one sequence are
//! address-ordered; a PC belongs to the last row at or before it, bounded
//! by the next row's address.

use tracing::debug;

use crate::attrs::{Dwarf, Unit};
use crate::core::{Result, SourceLocation};

/// Resolve a file index from the unit's file table to a printable path.
/// gimli applies the 1-based adjustment for DWARF versions before 5.
pub fn file_path(dwarf: &Dwarf, unit: &Unit, index: u64) -> Option<String> {
    let program = unit.line_program.as_ref()?;
    let header = program.header();
    let file = header.file(index)?;

    let name = dwarf
        .attr_string(unit, file.path_name())
        .ok()?
        .to_string_lossy()
        .into_owned();
    if name.starts_with('/') {
        return Some(name);
    }

    let dir = file
        .directory(header)
        .and_then(|value| dwarf.attr_string(unit, value).ok())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let comp_dir = unit
        .comp_dir
        .as_ref()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let joined = if dir.starts_with('/') {
        format!("{dir}/{name}")
    } else {
        [comp_dir.as_str(), dir.as_str(), name.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("/")
    };
    Some(joined)
}

/// All source files referenced by the unit's line table, in file-number
/// order.
pub fn source_files(dwarf: &Dwarf, unit: &Unit) -> Vec<String> {
    let Some(program) = unit.line_program.as_ref() else {
        return Vec::new();
    };
    let header = program.header();
    let first = if header.encoding().version >= 5 { 0 } else { 1 };
    let count = header.file_names().len() as u64;
    let last = if first == 0 { count } else { count + 1 };

    (first..last)
        .filter_map(|index| file_path(dwarf, unit, index))
        .collect()
}

/// Source coordinates for a PC within this unit, if its line table covers
/// the address.
pub fn line_for_pc(dwarf: &Dwarf, unit: &Unit, pc: u64) -> Result<Option<SourceLocation>> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(None);
    };

    let mut rows = program.rows();
    // (address, file index, line) of the last non-terminal row seen in the
    // current sequence.
    let mut prev: Option<(u64, u64, Option<u64>)> = None;

    while let Some((_, row)) = rows.next_row()? {
        let addr = row.address();

        if let Some((prev_addr, file_index, line)) = prev {
            if prev_addr <= pc && pc < addr {
                debug!(
                    "line match: pc 0x{:x} in row [0x{:x}, 0x{:x})",
                    pc, prev_addr, addr
                );
                let file = file_path(dwarf, unit, file_index).unwrap_or_else(|| "?".to_string());
                return Ok(Some(SourceLocation { file, line }));
            }
        }

        if row.end_sequence() {
            prev = None;
        } else {
            prev = Some((addr, row.file_index(), row.line().map(|l| l.get())));
        }
    }

    Ok(None)
}
