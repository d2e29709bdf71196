//! Variable loading and value reification
//!
//! A `DwarfVar` ties a variable or parameter DIE to its type and location
//! description. `value()` runs the location through the evaluator, fetches
//! the bytes (from memory for addresses, from the computed number for
//! values) and formats them: pointers as `nullptr`/`0x...`, everything
//! else as a lowercase hex dump. `decoded_value()` additionally renders
//! scalars through the type's encoding for verbose output.
//!
//! All failure modes collapse to the user-facing sentinels: `unknown` when
//! the location cannot be resolved, `unknown(addr=0x...)` when the bytes at
//! a known address cannot be read.

use tracing::debug;

use crate::attrs::{self, DieReference, Dwarf, Unit};
use crate::core::{EvalContext, Location, Result};
use crate::location::DwarfLocation;
use crate::types::{DwarfType, UNRESOLVED_SIZE};

#[derive(Debug, Clone)]
pub struct DwarfVar {
    pub name: String,
    pub ty: DwarfType,
    pub is_parameter: bool,
    location: Option<DwarfLocation>,
}

/// Outcome of recovering a variable's backing bytes.
enum Fetched {
    Bytes(Vec<u8>),
    Unknown,
    UnknownAt(u64),
}

impl DwarfVar {
    /// Load a variable, constant or formal parameter DIE. `None` for DIEs
    /// that do not carry enough to query (no name, no resolvable type, or
    /// an unrelated tag).
    pub fn load(
        dwarf: &Dwarf,
        unit: &Unit,
        offset: gimli::UnitOffset,
        cu_low: u64,
        address_size: u8,
    ) -> Result<Option<Self>> {
        let die = unit.entry(offset)?;
        let tag = die.tag();
        let is_parameter = match tag {
            gimli::DW_TAG_formal_parameter => true,
            gimli::DW_TAG_variable | gimli::DW_TAG_constant => false,
            _ => return Ok(None),
        };

        let name = attrs::attr_string(dwarf, unit, &die, gimli::DW_AT_name, "");
        if name.is_empty() {
            debug!("skipping unnamed {} at 0x{:x}", tag, offset.0);
            return Ok(None);
        }

        let ty = match attrs::attr_die_ref(&die, gimli::DW_AT_type) {
            Some(DieReference::Unit(type_offset)) => {
                DwarfType::load(dwarf, unit, type_offset, address_size)?
            }
            Some(DieReference::Global(global)) => match attrs::die_of_global_offset(dwarf, global)? {
                Some((other_unit, type_offset)) => {
                    DwarfType::load(dwarf, &other_unit, type_offset, address_size)?
                }
                None => None,
            },
            None => None,
        };
        let Some(ty) = ty else {
            debug!("variable {} has no loadable type", name);
            return Ok(None);
        };

        let location = match attrs::attr(&die, gimli::DW_AT_location) {
            Some(value) => DwarfLocation::from_attr(dwarf, unit, value, cu_low, address_size)?,
            None => None,
        };

        Ok(Some(Self {
            name,
            ty,
            is_parameter,
            location,
        }))
    }

    pub fn location(&self) -> Option<&DwarfLocation> {
        self.location.as_ref()
    }

    /// Recover and format the variable's value at `pc`.
    pub fn value(&self, context: &EvalContext<'_>, pc: u64) -> String {
        match self.fetch(context, pc) {
            Fetched::Bytes(bytes) => self.format_bytes(&bytes),
            Fetched::Unknown => "unknown".to_string(),
            Fetched::UnknownAt(addr) => format!("unknown(addr=0x{addr:x})"),
        }
    }

    /// Scalar rendering through the type's encoding (`-7`, `true`,
    /// `STATE_RUNNING`). `None` when the value is unrecoverable or the
    /// type is not a decodable scalar.
    pub fn decoded_value(&self, context: &EvalContext<'_>, pc: u64) -> Option<String> {
        match self.fetch(context, pc) {
            Fetched::Bytes(bytes) => self.ty.decode_scalar(&bytes),
            _ => None,
        }
    }

    fn fetch(&self, context: &EvalContext<'_>, pc: u64) -> Fetched {
        let Some(location) = &self.location else {
            return Fetched::Unknown;
        };

        match location.resolve(context, pc) {
            Err(e) => {
                debug!("{}: location unresolved: {}", self.name, e);
                Fetched::Unknown
            }
            Ok(Location::Value(value)) => {
                // The value already is the variable; clip its little-endian
                // bytes to the type's width.
                let bytes = value.to_le_bytes();
                let size = self.ty.size().min(8) as usize;
                Fetched::Bytes(bytes[..size].to_vec())
            }
            Ok(Location::Address(addr)) => {
                let size = self.ty.size();
                if size == UNRESOLVED_SIZE {
                    return Fetched::UnknownAt(addr);
                }
                let Some(read) = context.memory else {
                    return Fetched::UnknownAt(addr);
                };
                match read(addr, size as usize) {
                    Some(bytes) => Fetched::Bytes(bytes[..(size as usize).min(bytes.len())].to_vec()),
                    None => Fetched::UnknownAt(addr),
                }
            }
        }
    }

    fn format_bytes(&self, bytes: &[u8]) -> String {
        if self.ty.is_pointer() {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            let value = u64::from_le_bytes(buf);
            if value == 0 {
                "nullptr".to_string()
            } else {
                format!("0x{value:x}")
            }
        } else {
            hexstring(bytes)
        }
    }
}

/// Lowercase, space-separated hex dump.
fn hexstring(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collect the parameters and locals of a function DIE: its direct
/// children with variable-class tags, parameters first.
pub fn variables_of_function(
    dwarf: &Dwarf,
    unit: &Unit,
    function: gimli::UnitOffset,
    cu_low: u64,
    address_size: u8,
) -> Result<Vec<DwarfVar>> {
    let mut vars = Vec::new();

    let mut tree = unit.entries_tree(Some(function))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let offset = child.entry().offset();
        if let Some(var) = DwarfVar::load(dwarf, unit, offset, cu_low, address_size)? {
            vars.push(var);
        }
    }

    vars.sort_by_key(|v| !v.is_parameter);
    Ok(vars)
}
