//! DWARF expression machinery
//!
//! An expression is an ordered list of decoded ops. Each op keeps the byte
//! offset it occupied in the encoded stream; control flow (`DW_OP_skip`,
//! `DW_OP_bra`) jumps by those offsets, so they are part of the data model,
//! not a decoding artifact.

mod decode;
mod eval;

use gimli::constants as dw;

/// Opcode bytes the decoder and evaluator dispatch on. Taken from gimli's
/// constants so the names stay authoritative.
pub(crate) mod op {
    use super::dw;

    pub const ADDR: u8 = dw::DW_OP_addr.0;
    pub const DEREF: u8 = dw::DW_OP_deref.0;
    pub const CONST1U: u8 = dw::DW_OP_const1u.0;
    pub const CONST1S: u8 = dw::DW_OP_const1s.0;
    pub const CONST2U: u8 = dw::DW_OP_const2u.0;
    pub const CONST2S: u8 = dw::DW_OP_const2s.0;
    pub const CONST4U: u8 = dw::DW_OP_const4u.0;
    pub const CONST4S: u8 = dw::DW_OP_const4s.0;
    pub const CONST8U: u8 = dw::DW_OP_const8u.0;
    pub const CONST8S: u8 = dw::DW_OP_const8s.0;
    pub const CONSTU: u8 = dw::DW_OP_constu.0;
    pub const CONSTS: u8 = dw::DW_OP_consts.0;
    pub const DUP: u8 = dw::DW_OP_dup.0;
    pub const DROP: u8 = dw::DW_OP_drop.0;
    pub const OVER: u8 = dw::DW_OP_over.0;
    pub const PICK: u8 = dw::DW_OP_pick.0;
    pub const SWAP: u8 = dw::DW_OP_swap.0;
    pub const ROT: u8 = dw::DW_OP_rot.0;
    pub const XDEREF: u8 = dw::DW_OP_xderef.0;
    pub const ABS: u8 = dw::DW_OP_abs.0;
    pub const AND: u8 = dw::DW_OP_and.0;
    pub const DIV: u8 = dw::DW_OP_div.0;
    pub const MINUS: u8 = dw::DW_OP_minus.0;
    pub const MOD: u8 = dw::DW_OP_mod.0;
    pub const MUL: u8 = dw::DW_OP_mul.0;
    pub const NEG: u8 = dw::DW_OP_neg.0;
    pub const NOT: u8 = dw::DW_OP_not.0;
    pub const OR: u8 = dw::DW_OP_or.0;
    pub const PLUS: u8 = dw::DW_OP_plus.0;
    pub const PLUS_UCONST: u8 = dw::DW_OP_plus_uconst.0;
    pub const SHL: u8 = dw::DW_OP_shl.0;
    pub const SHR: u8 = dw::DW_OP_shr.0;
    pub const SHRA: u8 = dw::DW_OP_shra.0;
    pub const XOR: u8 = dw::DW_OP_xor.0;
    pub const BRA: u8 = dw::DW_OP_bra.0;
    pub const EQ: u8 = dw::DW_OP_eq.0;
    pub const GE: u8 = dw::DW_OP_ge.0;
    pub const GT: u8 = dw::DW_OP_gt.0;
    pub const LE: u8 = dw::DW_OP_le.0;
    pub const LT: u8 = dw::DW_OP_lt.0;
    pub const NE: u8 = dw::DW_OP_ne.0;
    pub const SKIP: u8 = dw::DW_OP_skip.0;
    pub const LIT0: u8 = dw::DW_OP_lit0.0;
    pub const LIT31: u8 = dw::DW_OP_lit31.0;
    pub const REG0: u8 = dw::DW_OP_reg0.0;
    pub const REG31: u8 = dw::DW_OP_reg31.0;
    pub const BREG0: u8 = dw::DW_OP_breg0.0;
    pub const BREG31: u8 = dw::DW_OP_breg31.0;
    pub const REGX: u8 = dw::DW_OP_regx.0;
    pub const FBREG: u8 = dw::DW_OP_fbreg.0;
    pub const BREGX: u8 = dw::DW_OP_bregx.0;
    pub const PIECE: u8 = dw::DW_OP_piece.0;
    pub const DEREF_SIZE: u8 = dw::DW_OP_deref_size.0;
    pub const XDEREF_SIZE: u8 = dw::DW_OP_xderef_size.0;
    pub const NOP: u8 = dw::DW_OP_nop.0;
    pub const PUSH_OBJECT_ADDRESS: u8 = dw::DW_OP_push_object_address.0;
    pub const CALL2: u8 = dw::DW_OP_call2.0;
    pub const CALL4: u8 = dw::DW_OP_call4.0;
    pub const CALL_REF: u8 = dw::DW_OP_call_ref.0;
    pub const FORM_TLS_ADDRESS: u8 = dw::DW_OP_form_tls_address.0;
    pub const CALL_FRAME_CFA: u8 = dw::DW_OP_call_frame_cfa.0;
    pub const BIT_PIECE: u8 = dw::DW_OP_bit_piece.0;
    pub const IMPLICIT_VALUE: u8 = dw::DW_OP_implicit_value.0;
    pub const STACK_VALUE: u8 = dw::DW_OP_stack_value.0;
}

/// A single decoded operation.
///
/// `op1`..`op3` hold the operands with zero/sign extension already applied
/// per the opcode's form; `offset` is the byte offset of the opcode within
/// its expression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DwarfOp {
    pub opcode: u8,
    pub op1: u64,
    pub op2: u64,
    pub op3: u64,
    pub offset: u64,
}

impl DwarfOp {
    pub fn name(&self) -> &'static str {
        gimli::DwOp(self.opcode).static_string().unwrap_or("DW_OP_<unknown>")
    }
}

/// A decoded DWARF expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DwarfExpression {
    ops: Vec<DwarfOp>,
}

impl DwarfExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<DwarfOp>) -> Self {
        Self { ops }
    }

    pub fn push(&mut self, op: DwarfOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[DwarfOp] {
        &self.ops
    }

    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Index of the op at byte offset `off`, the jump-target lookup for
    /// `skip`/`bra`. Offsets are unique within a well-formed expression.
    pub fn find_op_index_by_offset(&self, off: u64) -> Option<usize> {
        self.ops.iter().position(|op| op.offset == off)
    }

    /// Render the op list for verbose output.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!(
                "{}(op1=0x{:x}, op2=0x{:x}, off=0x{:x})",
                op.name(),
                op.op1,
                op.op2,
                op.offset
            ));
        }
        out
    }
}
