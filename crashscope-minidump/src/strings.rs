//! UTF-16LE string decoding
//!
//! Minidump strings are a `u32` byte length followed by UTF-16LE code units
//! with no terminator. Conversion is strict: a lone surrogate or truncated
//! pair makes the whole string decode to "" rather than partial output, so
//! a corrupt module name cannot smuggle garbage into tool output.

use crate::errors::Result;
use crate::read::Cursor;

/// Read a length-prefixed UTF-16LE string at the cursor position.
pub fn read_string(cursor: &mut Cursor<'_>) -> Result<String> {
    let byte_size = cursor.u32()? as usize;
    let bytes = cursor.bytes(byte_size)?;
    Ok(utf16le_to_string(bytes))
}

/// Decode UTF-16LE bytes to UTF-8, yielding "" for any ill-formed input.
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    // An odd byte count cannot be a UTF-16 sequence.
    if bytes.len() % 2 != 0 {
        return String::new();
    }

    let mut out = String::with_capacity(bytes.len() / 2);
    let mut units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    while let Some(unit) = units.next() {
        match unit {
            // Basic Multilingual Plane, encoded directly.
            0x0000..=0xd7ff | 0xe000..=0xffff => {
                match char::from_u32(u32::from(unit)) {
                    Some(c) => out.push(c),
                    None => return String::new(),
                }
            }
            // High surrogate: must be followed by a low surrogate.
            0xd800..=0xdbff => {
                let low = match units.next() {
                    Some(low @ 0xdc00..=0xdfff) => low,
                    _ => return String::new(),
                };
                let code = 0x10000
                    + ((u32::from(unit) - 0xd800) << 10)
                    + (u32::from(low) - 0xdc00);
                match char::from_u32(code) {
                    Some(c) => out.push(c),
                    None => return String::new(),
                }
            }
            // Lone low surrogate.
            0xdc00..=0xdfff => return String::new(),
        }
    }

    out
}

/// Encode a string back to UTF-16LE bytes. Exists for the dump tooling and
/// to keep the round-trip property testable.
pub fn string_to_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}
