//! Decoder for raw DWARF expression bytes
//!
//! Decodes an opcode stream into [`DwarfOp`]s, recording each op's byte
//! offset. Operand forms follow DWARF 5 §7.7.1; LEB128-encoded operands are
//! expanded here so the evaluator only ever sees full-width values.

use super::{op, DwarfExpression, DwarfOp};
use crate::core::DwarfError;

impl DwarfExpression {
    /// Decode an expression from its encoded bytes.
    ///
    /// `address_size` is the target address width in bytes and sizes the
    /// operand of `DW_OP_addr`.
    pub fn parse(bytes: &[u8], address_size: u8) -> Result<Self, DwarfError> {
        let mut expr = DwarfExpression::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            let offset = pos as u64;
            let opcode = bytes[pos];
            pos += 1;

            let mut dwarf_op = DwarfOp {
                opcode,
                offset,
                ..Default::default()
            };

            match opcode {
                // No-operand ops: stack, arithmetic, comparison, deref,
                // terminators and the not-implemented markers without
                // operands.
                op::DEREF
                | op::DUP
                | op::DROP
                | op::OVER
                | op::SWAP
                | op::ROT
                | op::XDEREF
                | op::ABS
                | op::AND
                | op::DIV
                | op::MINUS
                | op::MOD
                | op::MUL
                | op::NEG
                | op::NOT
                | op::OR
                | op::PLUS
                | op::SHL
                | op::SHR
                | op::SHRA
                | op::XOR
                | op::EQ
                | op::GE
                | op::GT
                | op::LE
                | op::LT
                | op::NE
                | op::NOP
                | op::PUSH_OBJECT_ADDRESS
                | op::FORM_TLS_ADDRESS
                | op::CALL_FRAME_CFA
                | op::STACK_VALUE => {}

                _ if (op::LIT0..=op::LIT31).contains(&opcode) => {}
                _ if (op::REG0..=op::REG31).contains(&opcode) => {}

                op::ADDR => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, usize::from(address_size))?;
                }

                op::CONST1U => dwarf_op.op1 = read_fixed(bytes, &mut pos, 1)?,
                op::CONST2U => dwarf_op.op1 = read_fixed(bytes, &mut pos, 2)?,
                op::CONST4U => dwarf_op.op1 = read_fixed(bytes, &mut pos, 4)?,
                op::CONST8U => dwarf_op.op1 = read_fixed(bytes, &mut pos, 8)?,
                op::CONST1S => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, 1)? as u8 as i8 as i64 as u64;
                }
                op::CONST2S => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, 2)? as u16 as i16 as i64 as u64;
                }
                op::CONST4S => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, 4)? as u32 as i32 as i64 as u64;
                }
                op::CONST8S => dwarf_op.op1 = read_fixed(bytes, &mut pos, 8)?,
                op::CONSTU => dwarf_op.op1 = read_uleb128(bytes, &mut pos)?,
                op::CONSTS => dwarf_op.op1 = read_sleb128(bytes, &mut pos)? as u64,

                op::PICK | op::DEREF_SIZE | op::XDEREF_SIZE => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, 1)?;
                }

                op::PLUS_UCONST | op::REGX | op::PIECE => {
                    dwarf_op.op1 = read_uleb128(bytes, &mut pos)?;
                }

                op::FBREG => dwarf_op.op1 = read_sleb128(bytes, &mut pos)? as u64,
                _ if (op::BREG0..=op::BREG31).contains(&opcode) => {
                    dwarf_op.op1 = read_sleb128(bytes, &mut pos)? as u64;
                }
                op::BREGX => {
                    dwarf_op.op1 = read_uleb128(bytes, &mut pos)?;
                    dwarf_op.op2 = read_sleb128(bytes, &mut pos)? as u64;
                }

                op::SKIP | op::BRA => {
                    dwarf_op.op1 = read_fixed(bytes, &mut pos, 2)? as u16 as i16 as i64 as u64;
                }

                op::CALL2 => dwarf_op.op1 = read_fixed(bytes, &mut pos, 2)?,
                op::CALL4 => dwarf_op.op1 = read_fixed(bytes, &mut pos, 4)?,
                // DWARF32 section offset.
                op::CALL_REF => dwarf_op.op1 = read_fixed(bytes, &mut pos, 4)?,

                op::BIT_PIECE => {
                    dwarf_op.op1 = read_uleb128(bytes, &mut pos)?;
                    dwarf_op.op2 = read_uleb128(bytes, &mut pos)?;
                }
                op::IMPLICIT_VALUE => {
                    let len = read_uleb128(bytes, &mut pos)?;
                    dwarf_op.op1 = len;
                    // The literal block is skipped; the evaluator reports
                    // the op as not implemented either way.
                    let len = usize::try_from(len)
                        .map_err(|_| DwarfError::InvalidExpression { offset: pos })?;
                    if bytes.len() - pos < len {
                        return Err(DwarfError::InvalidExpression { offset: pos });
                    }
                    pos += len;
                }

                _ => return Err(DwarfError::InvalidExpression { offset: offset as usize }),
            }

            expr.push(dwarf_op);
        }

        Ok(expr)
    }
}

fn read_fixed(bytes: &[u8], pos: &mut usize, len: usize) -> Result<u64, DwarfError> {
    if bytes.len() - *pos < len {
        return Err(DwarfError::InvalidExpression { offset: *pos });
    }
    let mut buf = [0u8; 8];
    buf[..len].copy_from_slice(&bytes[*pos..*pos + len]);
    *pos += len;
    Ok(u64::from_le_bytes(buf))
}

fn read_uleb128(bytes: &[u8], pos: &mut usize) -> Result<u64, DwarfError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or(DwarfError::InvalidExpression { offset: *pos })?;
        *pos += 1;
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        }
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn read_sleb128(bytes: &[u8], pos: &mut usize) -> Result<i64, DwarfError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    let mut byte;
    loop {
        byte = *bytes
            .get(*pos)
            .ok_or(DwarfError::InvalidExpression { offset: *pos })?;
        *pos += 1;
        if shift < 64 {
            result |= i64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    if shift < 64 && byte & 0x40 != 0 {
        result |= -(1i64 << shift);
    }
    Ok(result)
}
