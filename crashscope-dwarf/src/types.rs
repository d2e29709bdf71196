//! Type nodes
//!
//! `DwarfType` is a small tagged tree over the type DIEs a variable query
//! touches: base types, pointers, typedefs, enums, structs and classes.
//! `name()` and `size()` are pure functions of the tag; typedef chains are
//! followed until a concrete size appears. Base-type encodings and enum
//! enumerators are kept so scalar values can be decoded for display.

use tracing::warn;

use crate::attrs::{self, DieReference, Dwarf, Unit};
use crate::core::Result;

/// Sentinel for "size not recorded on this node".
pub const UNRESOLVED_SIZE: u64 = u64::MAX;

/// Guard against reference cycles in malformed type chains.
const MAX_TYPE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct DwarfType {
    pub(crate) tag: gimli::DwTag,
    pub(crate) type_name: String,
    pub(crate) byte_size: u64,
    pub(crate) inner: Option<Box<DwarfType>>,
    pub(crate) declaration: bool,
    /// `DW_AT_encoding` of a base type.
    pub(crate) encoding: Option<gimli::DwAte>,
    /// `(name, value)` pairs of an enumeration's enumerators.
    pub(crate) enumerators: Vec<(String, i64)>,
}

impl DwarfType {
    /// Load the type DIE at `offset`, following `DW_AT_type` links for
    /// pointers and typedefs. Returns `None` for tags outside the
    /// supported set.
    pub fn load(
        dwarf: &Dwarf,
        unit: &Unit,
        offset: gimli::UnitOffset,
        address_size: u8,
    ) -> Result<Option<Self>> {
        Self::load_at_depth(dwarf, unit, offset, address_size, 0)
    }

    fn load_at_depth(
        dwarf: &Dwarf,
        unit: &Unit,
        offset: gimli::UnitOffset,
        address_size: u8,
        depth: usize,
    ) -> Result<Option<Self>> {
        if depth > MAX_TYPE_DEPTH {
            warn!("type chain deeper than {} links, giving up", MAX_TYPE_DEPTH);
            return Ok(None);
        }

        let die = unit.entry(offset)?;
        let tag = die.tag();
        let type_name = attrs::attr_string(dwarf, unit, &die, gimli::DW_AT_name, "unknown");

        // Bit-sized types are rounded down to bytes; otherwise byte_size
        // applies and an absent size stays unresolved.
        let bit_size = attrs::attr_unsigned(&die, gimli::DW_AT_bit_size, UNRESOLVED_SIZE);
        let byte_size = if bit_size != UNRESOLVED_SIZE {
            bit_size / 8
        } else {
            attrs::attr_unsigned(&die, gimli::DW_AT_byte_size, UNRESOLVED_SIZE)
        };

        let mut node = Self {
            tag,
            type_name,
            byte_size,
            inner: None,
            declaration: false,
            encoding: None,
            enumerators: Vec::new(),
        };

        match tag {
            gimli::DW_TAG_base_type => {
                node.encoding = match attrs::attr(&die, gimli::DW_AT_encoding) {
                    Some(gimli::AttributeValue::Encoding(encoding)) => Some(encoding),
                    _ => None,
                };
                Ok(Some(node))
            }

            gimli::DW_TAG_enumeration_type => {
                node.enumerators = load_enumerators(dwarf, unit, offset)?;
                Ok(Some(node))
            }

            gimli::DW_TAG_structure_type => Ok(Some(node)),

            gimli::DW_TAG_class_type => {
                node.declaration = attrs::attr_flag(&die, gimli::DW_AT_declaration, false);
                Ok(Some(node))
            }

            gimli::DW_TAG_pointer_type | gimli::DW_TAG_typedef => {
                node.inner =
                    Self::load_inner(dwarf, unit, &die, address_size, depth)?.map(Box::new);
                if tag == gimli::DW_TAG_pointer_type {
                    node.byte_size = u64::from(address_size);
                }
                Ok(Some(node))
            }

            other => {
                warn!("unsupported type tag {} at 0x{:x}", other, offset.0);
                Ok(None)
            }
        }
    }

    fn load_inner(
        dwarf: &Dwarf,
        unit: &Unit,
        die: &attrs::Die<'_, '_>,
        address_size: u8,
        depth: usize,
    ) -> Result<Option<Self>> {
        match attrs::attr_die_ref(die, gimli::DW_AT_type) {
            Some(DieReference::Unit(offset)) => {
                Self::load_at_depth(dwarf, unit, offset, address_size, depth + 1)
            }
            Some(DieReference::Global(offset)) => {
                match attrs::die_of_global_offset(dwarf, offset)? {
                    Some((other_unit, unit_offset)) => Self::load_at_depth(
                        dwarf,
                        &other_unit,
                        unit_offset,
                        address_size,
                        depth + 1,
                    ),
                    None => Ok(None),
                }
            }
            // No DW_AT_type: a void pointer or an opaque typedef.
            None => Ok(None),
        }
    }

    pub fn tag(&self) -> gimli::DwTag {
        self.tag
    }

    pub fn is_pointer(&self) -> bool {
        self.tag == gimli::DW_TAG_pointer_type
    }

    pub fn is_declaration(&self) -> bool {
        self.declaration
    }

    /// Display name. Pointers render as `inner*`, anonymous pointees as
    /// `void*`.
    pub fn name(&self) -> String {
        match self.tag {
            gimli::DW_TAG_pointer_type => match &self.inner {
                Some(inner) => format!("{}*", inner.name()),
                None => "void*".to_string(),
            },
            _ => self.type_name.clone(),
        }
    }

    /// Size in bytes; [`UNRESOLVED_SIZE`] when no node in the chain
    /// records one. Typedefs defer to the first sized inner type.
    pub fn size(&self) -> u64 {
        match self.tag {
            gimli::DW_TAG_typedef => {
                let mut cur = self.inner.as_deref();
                while let Some(ty) = cur {
                    if ty.size() != UNRESOLVED_SIZE {
                        return ty.size();
                    }
                    cur = ty.inner.as_deref();
                }
                UNRESOLVED_SIZE
            }
            _ => self.byte_size,
        }
    }

    /// The concrete type behind any typedef links.
    pub fn strip_typedefs(&self) -> &DwarfType {
        let mut cur = self;
        while cur.tag == gimli::DW_TAG_typedef {
            match cur.inner.as_deref() {
                Some(inner) => cur = inner,
                None => break,
            }
        }
        cur
    }

    /// Decode raw little-endian bytes into a human-readable scalar, when
    /// the type supports it: signed/unsigned integers, booleans, chars,
    /// floats, and enum values by enumerator name. `None` for aggregates
    /// and unknown encodings; callers fall back to the hex dump.
    pub fn decode_scalar(&self, bytes: &[u8]) -> Option<String> {
        let concrete = self.strip_typedefs();
        if bytes.is_empty() || bytes.len() > 8 {
            return None;
        }

        match concrete.tag {
            gimli::DW_TAG_enumeration_type => {
                let value = sign_extend(bytes);
                match concrete
                    .enumerators
                    .iter()
                    .find(|(_, enum_value)| *enum_value == value)
                {
                    Some((name, _)) => Some(name.clone()),
                    None => Some(format!("{value}")),
                }
            }
            gimli::DW_TAG_base_type => match concrete.encoding? {
                gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => {
                    Some(format!("{}", sign_extend(bytes)))
                }
                gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char => {
                    Some(format!("{}", zero_extend(bytes)))
                }
                gimli::DW_ATE_boolean => Some(if zero_extend(bytes) != 0 {
                    "true".to_string()
                } else {
                    "false".to_string()
                }),
                gimli::DW_ATE_float => match bytes.len() {
                    4 => {
                        let mut buf = [0u8; 4];
                        buf.copy_from_slice(bytes);
                        Some(format!("{}", f32::from_le_bytes(buf)))
                    }
                    8 => {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(bytes);
                        Some(format!("{}", f64::from_le_bytes(buf)))
                    }
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        }
    }
}

/// Collect the enumerators of an enumeration DIE's children.
fn load_enumerators(
    dwarf: &Dwarf,
    unit: &Unit,
    offset: gimli::UnitOffset,
) -> Result<Vec<(String, i64)>> {
    let mut enumerators = Vec::new();
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let die = child.entry();
        if die.tag() != gimli::DW_TAG_enumerator {
            continue;
        }
        let name = attrs::attr_string(dwarf, unit, die, gimli::DW_AT_name, "");
        if name.is_empty() {
            continue;
        }
        let value = attrs::attr_signed(die, gimli::DW_AT_const_value, 0);
        enumerators.push((name, value));
    }
    Ok(enumerators)
}

/// Little-endian bytes to i64 with sign extension from the top bit.
fn sign_extend(bytes: &[u8]) -> i64 {
    let value = zero_extend(bytes);
    let bits = bytes.len() * 8;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Little-endian bytes to u64.
fn zero_extend(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: gimli::DwTag, name: &str, size: u64) -> DwarfType {
        DwarfType {
            tag,
            type_name: name.to_string(),
            byte_size: size,
            inner: None,
            declaration: false,
            encoding: None,
            enumerators: Vec::new(),
        }
    }

    fn base(name: &str, size: u64, encoding: gimli::DwAte) -> DwarfType {
        DwarfType {
            encoding: Some(encoding),
            ..leaf(gimli::DW_TAG_base_type, name, size)
        }
    }

    fn typedef(name: &str, inner: Option<DwarfType>) -> DwarfType {
        DwarfType {
            inner: inner.map(Box::new),
            ..leaf(gimli::DW_TAG_typedef, name, UNRESOLVED_SIZE)
        }
    }

    fn pointer(inner: Option<DwarfType>) -> DwarfType {
        DwarfType {
            inner: inner.map(Box::new),
            ..leaf(gimli::DW_TAG_pointer_type, "unknown", 8)
        }
    }

    #[test]
    fn base_type_size_and_name() {
        let ty = base("int", 4, gimli::DW_ATE_signed);
        assert_eq!(ty.name(), "int");
        assert_eq!(ty.size(), 4);
        assert!(!ty.is_pointer());
    }

    #[test]
    fn typedef_chains_to_first_concrete_size() {
        // uintptr_t -> unsigned long (8 bytes), two links deep.
        let chain = typedef(
            "uintptr_t",
            Some(typedef(
                "__uintptr_t",
                Some(base("unsigned long", 8, gimli::DW_ATE_unsigned)),
            )),
        );
        assert_eq!(chain.size(), 8);
        assert_eq!(chain.name(), "uintptr_t");
        assert_eq!(chain.strip_typedefs().name(), "unsigned long");

        let opaque = typedef("opaque_t", None);
        assert_eq!(opaque.size(), UNRESOLVED_SIZE);
    }

    #[test]
    fn pointer_naming_and_size() {
        let p = pointer(Some(base("char", 1, gimli::DW_ATE_signed_char)));
        assert_eq!(p.name(), "char*");
        assert_eq!(p.size(), 8);

        let void = pointer(None);
        assert_eq!(void.name(), "void*");
        assert_eq!(void.size(), 8);

        let pp = pointer(Some(pointer(Some(base(
            "char",
            1,
            gimli::DW_ATE_signed_char,
        )))));
        assert_eq!(pp.name(), "char**");
    }

    #[test]
    fn scalar_decoding_by_encoding() {
        let int = base("int", 4, gimli::DW_ATE_signed);
        assert_eq!(int.decode_scalar(&(-7i32).to_le_bytes()), Some("-7".to_string()));
        assert_eq!(int.decode_scalar(&42i32.to_le_bytes()), Some("42".to_string()));

        let uint = base("unsigned int", 4, gimli::DW_ATE_unsigned);
        assert_eq!(
            uint.decode_scalar(&u32::MAX.to_le_bytes()),
            Some("4294967295".to_string())
        );

        let flag = base("bool", 1, gimli::DW_ATE_boolean);
        assert_eq!(flag.decode_scalar(&[1]), Some("true".to_string()));
        assert_eq!(flag.decode_scalar(&[0]), Some("false".to_string()));

        let double = base("double", 8, gimli::DW_ATE_float);
        assert_eq!(
            double.decode_scalar(&1.5f64.to_le_bytes()),
            Some("1.5".to_string())
        );

        // Aggregates and unknown encodings decline.
        let s = leaf(gimli::DW_TAG_structure_type, "point", 16);
        assert_eq!(s.decode_scalar(&[0; 8]), None);
        let no_encoding = leaf(gimli::DW_TAG_base_type, "odd", 4);
        assert_eq!(no_encoding.decode_scalar(&[0; 4]), None);
    }

    #[test]
    fn enum_values_decode_to_enumerator_names() {
        let mut state = leaf(gimli::DW_TAG_enumeration_type, "state_t", 4);
        state.enumerators = vec![
            ("STATE_IDLE".to_string(), 0),
            ("STATE_RUNNING".to_string(), 1),
            ("STATE_DONE".to_string(), 2),
        ];
        assert_eq!(
            state.decode_scalar(&1i32.to_le_bytes()),
            Some("STATE_RUNNING".to_string())
        );
        // Out-of-range values fall back to the number.
        assert_eq!(state.decode_scalar(&9i32.to_le_bytes()), Some("9".to_string()));
    }

    #[test]
    fn typedef_decoding_follows_the_chain() {
        let wrapped = typedef("my_int", Some(base("int", 4, gimli::DW_ATE_signed)));
        assert_eq!(
            wrapped.decode_scalar(&(-1i32).to_le_bytes()),
            Some("-1".to_string())
        );
    }

    #[test]
    fn sign_extension_is_width_aware() {
        assert_eq!(sign_extend(&[0xff]), -1);
        assert_eq!(sign_extend(&[0x7f]), 127);
        assert_eq!(sign_extend(&[0x00, 0x80]), i16::MIN as i64);
        assert_eq!(zero_extend(&[0xff]), 255);
    }
}
