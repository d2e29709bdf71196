//! Typed attribute extraction over gimli DIEs
//!
//! The rest of the pipeline never touches gimli attribute forms directly:
//! it asks for an address, a number, a string or a DIE reference and always
//! passes an explicit default for the missing case. Form handling and the
//! `abstract_origin`/`specification` indirections live here.

use tracing::warn;

use crate::core::Result;
use crate::loader::Reader;

pub type Die<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, Reader>;
pub type Unit = gimli::Unit<Reader>;
pub type Dwarf = gimli::Dwarf<Reader>;

/// A DIE reference attribute: unit-local or global.
#[derive(Debug, Clone, Copy)]
pub enum DieReference {
    Unit(gimli::UnitOffset),
    Global(gimli::DebugInfoOffset),
}

/// Raw attribute lookup; missing or unreadable both come back as `None`.
pub fn attr(die: &Die<'_, '_>, code: gimli::DwAt) -> Option<gimli::AttributeValue<Reader>> {
    match die.attr_value(code) {
        Ok(value) => value,
        Err(e) => {
            warn!("unreadable attribute {}: {}", code, e);
            None
        }
    }
}

/// Address-class attribute, with `.debug_addr` indexing resolved.
pub fn attr_addr(
    dwarf: &Dwarf,
    unit: &Unit,
    die: &Die<'_, '_>,
    code: gimli::DwAt,
    default: u64,
) -> u64 {
    match attr(die, code) {
        Some(gimli::AttributeValue::Addr(addr)) => addr,
        Some(gimli::AttributeValue::DebugAddrIndex(index)) => {
            dwarf.address(unit, index).unwrap_or(default)
        }
        _ => default,
    }
}

/// Constant-class attribute as unsigned.
pub fn attr_unsigned(die: &Die<'_, '_>, code: gimli::DwAt, default: u64) -> u64 {
    match attr(die, code) {
        Some(value) => value
            .udata_value()
            .or_else(|| value.sdata_value().map(|v| v as u64))
            .unwrap_or(default),
        None => default,
    }
}

/// Constant-class attribute as signed.
pub fn attr_signed(die: &Die<'_, '_>, code: gimli::DwAt, default: i64) -> i64 {
    match attr(die, code) {
        Some(value) => value
            .sdata_value()
            .or_else(|| value.udata_value().map(|v| v as i64))
            .unwrap_or(default),
        None => default,
    }
}

/// Flag-class attribute.
pub fn attr_flag(die: &Die<'_, '_>, code: gimli::DwAt, default: bool) -> bool {
    match attr(die, code) {
        Some(gimli::AttributeValue::Flag(flag)) => flag,
        Some(_) => default,
        None => default,
    }
}

/// String-class attribute, following `.debug_str`/`.debug_line_str` refs.
pub fn attr_string(
    dwarf: &Dwarf,
    unit: &Unit,
    die: &Die<'_, '_>,
    code: gimli::DwAt,
    default: &str,
) -> String {
    match attr(die, code) {
        Some(value) => match dwarf.attr_string(unit, value) {
            Ok(s) => s.to_string_lossy().into_owned(),
            Err(_) => default.to_string(),
        },
        None => default.to_string(),
    }
}

/// Reference-class attribute.
pub fn attr_die_ref(die: &Die<'_, '_>, code: gimli::DwAt) -> Option<DieReference> {
    match attr(die, code)? {
        gimli::AttributeValue::UnitRef(offset) => Some(DieReference::Unit(offset)),
        gimli::AttributeValue::DebugInfoRef(offset) => Some(DieReference::Global(offset)),
        _ => None,
    }
}

/// Resolve a global `.debug_info` offset to its unit and unit-local offset.
/// The lookup is idempotent; units are re-parsed from the section on every
/// call, which the query volume of a post-mortem tool tolerates.
pub fn die_of_global_offset(
    dwarf: &Dwarf,
    offset: gimli::DebugInfoOffset,
) -> Result<Option<(Unit, gimli::UnitOffset)>> {
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        if let Some(unit_offset) = offset.to_unit_offset(&unit.header) {
            return Ok(Some((unit, unit_offset)));
        }
    }
    Ok(None)
}

/// `[low_pc, high_pc)` of a DIE, from the address pair only. `high_pc` in
/// constant form is an offset from `low_pc` (DWARF 4+).
pub fn pc_range(dwarf: &Dwarf, unit: &Unit, die: &Die<'_, '_>) -> Option<(u64, u64)> {
    let low = match attr(die, gimli::DW_AT_low_pc)? {
        gimli::AttributeValue::Addr(addr) => addr,
        gimli::AttributeValue::DebugAddrIndex(index) => dwarf.address(unit, index).ok()?,
        _ => return None,
    };
    let high = match attr(die, gimli::DW_AT_high_pc)? {
        gimli::AttributeValue::Addr(addr) => addr,
        gimli::AttributeValue::DebugAddrIndex(index) => dwarf.address(unit, index).ok()?,
        value => low + value.udata_value()?,
    };
    Some((low, high))
}

/// Whether `pc` falls inside any of the DIE's PC ranges, `DW_AT_ranges`
/// included (DWARF 5 range lists handled by gimli).
pub fn die_contains_pc(dwarf: &Dwarf, unit: &Unit, die: &Die<'_, '_>, pc: u64) -> Result<bool> {
    if let Some((low, high)) = pc_range(dwarf, unit, die) {
        return Ok(pc >= low && pc < high);
    }
    let mut ranges = dwarf.die_ranges(unit, die)?;
    while let Some(range) = ranges.next()? {
        if pc >= range.begin && pc < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Follow `DW_AT_specification`/`DW_AT_abstract_origin` one hop and read an
/// attribute there. Used for names of out-of-line definitions.
fn attr_via_origin(
    dwarf: &Dwarf,
    unit: &Unit,
    die: &Die<'_, '_>,
    code: gimli::DwAt,
) -> Option<String> {
    for origin_attr in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Some(DieReference::Unit(offset)) = attr_die_ref(die, origin_attr) {
            if let Ok(origin) = unit.entry(offset) {
                let value = attr_string(dwarf, unit, &origin, code, "");
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Function name for display: prefers the linkage name (demangled on
/// request), falls back to `DW_AT_name`, then to origin DIEs.
pub fn function_name(
    dwarf: &Dwarf,
    unit: &Unit,
    die: &Die<'_, '_>,
    demangle: bool,
    default: &str,
) -> String {
    let language = unit_language(unit);

    let linkage = attr_string(dwarf, unit, die, gimli::DW_AT_linkage_name, "");
    if !linkage.is_empty() {
        if demangle {
            if let Some(demangled) = crate::demangle::demangle(&linkage, language) {
                return demangled;
            }
        }
        // A mangled name is noise when plain names were asked for.
        if !demangle {
            let plain = attr_string(dwarf, unit, die, gimli::DW_AT_name, "");
            if !plain.is_empty() {
                return plain;
            }
        }
        return linkage;
    }

    let plain = attr_string(dwarf, unit, die, gimli::DW_AT_name, "");
    if !plain.is_empty() {
        return plain;
    }

    attr_via_origin(dwarf, unit, die, gimli::DW_AT_name)
        .or_else(|| attr_via_origin(dwarf, unit, die, gimli::DW_AT_linkage_name))
        .unwrap_or_else(|| default.to_string())
}

/// The unit's `DW_AT_language`, for demangler dispatch.
pub fn unit_language(unit: &Unit) -> Option<gimli::DwLang> {
    let mut entries = unit.entries();
    let (_, root) = entries.next_dfs().ok()??;
    match attr(root, gimli::DW_AT_language)? {
        gimli::AttributeValue::Language(lang) => Some(lang),
        _ => None,
    }
}

/// Declaration file of a DIE, resolved through the unit's file table.
pub fn decl_file(dwarf: &Dwarf, unit: &Unit, die: &Die<'_, '_>) -> Option<String> {
    let index = match attr(die, gimli::DW_AT_decl_file)? {
        gimli::AttributeValue::FileIndex(index) => index,
        value => value.udata_value()?,
    };
    crate::lines::file_path(dwarf, unit, index)
}

/// Declaration line of a DIE.
pub fn decl_line(die: &Die<'_, '_>) -> Option<u64> {
    let value = attr_unsigned(die, gimli::DW_AT_decl_line, u64::MAX);
    (value != u64::MAX).then_some(value)
}
