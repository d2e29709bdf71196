//! The expression stack machine
//!
//! Interprets a decoded op list over a signed 64-bit stack. Register,
//! memory and CFA access go through the providers in [`EvalContext`];
//! `DW_OP_fbreg` re-enters the evaluator through the frame-base location,
//! bounded by [`MAX_EVAL_DEPTH`].
//!
//! Arithmetic is two's-complement on `i64`; every unsigned/signed
//! reinterpretation is an explicit cast, never an aliasing read.

use tracing::{debug, trace};

use super::{op, DwarfExpression, DwarfOp};
use crate::core::{
    EvalContext, EvalError, EvalErrorKind, Location, MemoryProvider, MAX_EVAL_DEPTH,
};

/// Step budget per evaluation. A malformed backward branch must terminate
/// the query, not hang it.
const MAX_STEPS: usize = 0x1_0000;

impl DwarfExpression {
    /// Evaluate with a fresh stack.
    pub fn evaluate(&self, context: &EvalContext<'_>, pc: u64) -> Result<Location, EvalError> {
        let mut stack = Vec::new();
        self.evaluate_on_stack(context, pc, &mut stack)
    }

    /// Evaluate on a caller-provided stack. CFI register-rule expressions
    /// seed the stack with the CFA; tests use it to observe final state.
    pub fn evaluate_on_stack(
        &self,
        context: &EvalContext<'_>,
        pc: u64,
        stack: &mut Vec<i64>,
    ) -> Result<Location, EvalError> {
        self.evaluate_with_depth(context, pc, stack, 0)
    }

    pub(crate) fn evaluate_with_depth(
        &self,
        context: &EvalContext<'_>,
        pc: u64,
        stack: &mut Vec<i64>,
        depth: usize,
    ) -> Result<Location, EvalError> {
        if self.is_empty() {
            return Err(EvalError::new(EvalErrorKind::IllegalState, 0));
        }

        let ops = self.ops();
        let mut index = 0usize;
        let mut steps = 0usize;
        let mut cur_off = 0u64;

        while index < ops.len() {
            let a = &ops[index];
            cur_off = a.offset;

            steps += 1;
            if steps > MAX_STEPS {
                return Err(EvalError::new(EvalErrorKind::IllegalState, cur_off));
            }

            trace!(
                "exec {} op1=0x{:x} op2=0x{:x} off=0x{:x} depth={}",
                a.name(),
                a.op1,
                a.op2,
                a.offset,
                depth
            );

            // Bare register ops name the value's home and end the
            // expression on the spot.
            if (op::REG0..=op::REG31).contains(&a.opcode) || a.opcode == op::REGX {
                let registers = context
                    .registers
                    .ok_or(EvalError::new(EvalErrorKind::RegisterInvalid, cur_off))?;
                let reg_num = if a.opcode == op::REGX {
                    a.op1 as u16
                } else {
                    u16::from(a.opcode - op::REG0)
                };
                let reg_val = registers(reg_num)
                    .ok_or(EvalError::new(EvalErrorKind::RegisterInvalid, cur_off))?;
                debug!("{}: reg{} = 0x{:x}", a.name(), reg_num, reg_val);
                stack.push(reg_val as i64);
                return Ok(Location::Value(reg_val));
            }

            match a.opcode {
                // Literal encodings.
                _ if (op::LIT0..=op::LIT31).contains(&a.opcode) => {
                    stack.push(i64::from(a.opcode - op::LIT0));
                }

                // Constants, already extended by the decoder.
                op::ADDR
                | op::CONST1U
                | op::CONST1S
                | op::CONST2U
                | op::CONST2S
                | op::CONST4U
                | op::CONST4S
                | op::CONST8U
                | op::CONST8S
                | op::CONSTU
                | op::CONSTS => {
                    stack.push(a.op1 as i64);
                }

                // Register-based addressing.
                op::FBREG => {
                    let frame_base = context
                        .frame_base
                        .ok_or(EvalError::new(EvalErrorKind::FrameBaseInvalid, cur_off))?;
                    if depth >= MAX_EVAL_DEPTH {
                        return Err(EvalError::new(EvalErrorKind::FrameBaseInvalid, cur_off));
                    }
                    let base = frame_base
                        .resolve_with_depth(context, pc, depth + 1)
                        .map_err(|_| EvalError::new(EvalErrorKind::FrameBaseInvalid, cur_off))?;
                    stack.push((base.raw() as i64).wrapping_add(a.op1 as i64));
                }

                _ if (op::BREG0..=op::BREG31).contains(&a.opcode) => {
                    let reg_num = u16::from(a.opcode - op::BREG0);
                    let reg_val = read_register(context, reg_num, cur_off)?;
                    stack.push((reg_val as i64).wrapping_add(a.op1 as i64));
                }
                op::BREGX => {
                    let reg_val = read_register(context, a.op1 as u16, cur_off)?;
                    stack.push((reg_val as i64).wrapping_add(a.op2 as i64));
                }

                // Stack operations.
                op::DUP => {
                    let top = *stack
                        .last()
                        .ok_or(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off))?;
                    stack.push(top);
                }
                op::DROP => {
                    stack
                        .pop()
                        .ok_or(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off))?;
                }
                op::PICK => {
                    let idx = a.op1 as usize;
                    if stack.len() < idx + 1 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let picked = stack[stack.len() - 1 - idx];
                    stack.push(picked);
                }
                op::OVER => {
                    if stack.len() < 2 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let second = stack[stack.len() - 2];
                    stack.push(second);
                }
                op::SWAP => {
                    if stack.len() < 2 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let len = stack.len();
                    stack.swap(len - 1, len - 2);
                }
                op::ROT => {
                    if stack.len() < 3 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let e1 = pop(stack, cur_off)?;
                    let e2 = pop(stack, cur_off)?;
                    let e3 = pop(stack, cur_off)?;
                    stack.push(e1);
                    stack.push(e3);
                    stack.push(e2);
                }

                // Memory.
                op::DEREF => {
                    let memory = context
                        .memory
                        .ok_or(EvalError::new(EvalErrorKind::MemoryInvalid, cur_off))?;
                    let addr = pop(stack, cur_off)? as u64;
                    let value = read_memory_u64(memory, addr, 8)
                        .ok_or(EvalError::new(EvalErrorKind::MemoryInvalid, cur_off))?;
                    stack.push(value as i64);
                }
                op::DEREF_SIZE => {
                    let memory = context
                        .memory
                        .ok_or(EvalError::new(EvalErrorKind::MemoryInvalid, cur_off))?;
                    if stack.is_empty() {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let size = a.op1 as usize;
                    if size == 0 || size > 8 {
                        return Err(EvalError::new(EvalErrorKind::IllegalOpd, cur_off));
                    }
                    let addr = pop(stack, cur_off)? as u64;
                    // Zero-extended to the full stack width.
                    let value = read_memory_u64(memory, addr, size)
                        .ok_or(EvalError::new(EvalErrorKind::MemoryInvalid, cur_off))?;
                    stack.push(value as i64);
                }

                // CFI bridge.
                op::CALL_FRAME_CFA => {
                    let cfa = context
                        .cfa
                        .ok_or(EvalError::new(EvalErrorKind::CfaInvalid, cur_off))?;
                    let addr =
                        cfa(pc).ok_or(EvalError::new(EvalErrorKind::CfaInvalid, cur_off))?;
                    stack.push(addr as i64);
                }

                // Unary arithmetic.
                op::ABS | op::NEG | op::NOT | op::PLUS_UCONST => {
                    let top = pop(stack, cur_off)?;
                    let result = match a.opcode {
                        op::ABS => top.wrapping_abs(),
                        op::NEG => top.wrapping_neg(),
                        op::NOT => !top,
                        op::PLUS_UCONST => top.wrapping_add(a.op1 as i64),
                        _ => unreachable!(),
                    };
                    stack.push(result);
                }

                // Binary arithmetic: e2 <op> e1 with e1 the popped top.
                op::AND
                | op::DIV
                | op::MINUS
                | op::MOD
                | op::MUL
                | op::OR
                | op::PLUS
                | op::SHL
                | op::SHR
                | op::SHRA
                | op::XOR => {
                    if stack.len() < 2 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let e1 = pop(stack, cur_off)?;
                    let e2 = pop(stack, cur_off)?;
                    let result = match a.opcode {
                        op::AND => e2 & e1,
                        op::OR => e2 | e1,
                        op::XOR => e2 ^ e1,
                        op::PLUS => e2.wrapping_add(e1),
                        op::MINUS => e2.wrapping_sub(e1),
                        op::MUL => e2.wrapping_mul(e1),
                        op::DIV => e2
                            .checked_div(e1)
                            .ok_or(EvalError::new(EvalErrorKind::IllegalOpd, cur_off))?,
                        op::MOD => e2
                            .checked_rem(e1)
                            .ok_or(EvalError::new(EvalErrorKind::IllegalOpd, cur_off))?,
                        // Shift counts outside 0..64 drain the value out of
                        // the 64-bit lane.
                        op::SHL => {
                            if (0..64).contains(&e1) {
                                ((e2 as u64) << e1) as i64
                            } else {
                                0
                            }
                        }
                        op::SHR => {
                            if (0..64).contains(&e1) {
                                ((e2 as u64) >> e1) as i64
                            } else {
                                0
                            }
                        }
                        op::SHRA => {
                            if (0..64).contains(&e1) {
                                e2 >> e1
                            } else if e2 < 0 {
                                -1
                            } else {
                                0
                            }
                        }
                        _ => unreachable!(),
                    };
                    stack.push(result);
                }

                // Comparisons: push 1 or 0 for e2 <cmp> e1.
                op::LE | op::GE | op::EQ | op::LT | op::GT | op::NE => {
                    if stack.len() < 2 {
                        return Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off));
                    }
                    let e1 = pop(stack, cur_off)?;
                    let e2 = pop(stack, cur_off)?;
                    let result = match a.opcode {
                        op::LE => e2 <= e1,
                        op::GE => e2 >= e1,
                        op::EQ => e2 == e1,
                        op::LT => e2 < e1,
                        op::GT => e2 > e1,
                        op::NE => e2 != e1,
                        _ => unreachable!(),
                    };
                    stack.push(i64::from(result));
                }

                // Control flow.
                op::SKIP => {
                    index = self.branch_target(a, cur_off)?;
                    continue;
                }
                op::BRA => {
                    let condition = pop(stack, cur_off)?;
                    if condition != 0 {
                        index = self.branch_target(a, cur_off)?;
                        continue;
                    }
                }

                // Special.
                op::NOP => {}
                op::STACK_VALUE => {
                    let value = pop(stack, cur_off)?;
                    return Ok(Location::Value(value as u64));
                }

                // Composite and call-class descriptions are outside this
                // machine's scope.
                op::PIECE
                | op::BIT_PIECE
                | op::IMPLICIT_VALUE
                | op::XDEREF
                | op::XDEREF_SIZE
                | op::PUSH_OBJECT_ADDRESS
                | op::FORM_TLS_ADDRESS
                | op::CALL2
                | op::CALL4
                | op::CALL_REF => {
                    debug!("op {} not implemented", a.name());
                    return Err(EvalError::new(EvalErrorKind::NotImplemented, cur_off));
                }

                _ => {
                    // An opcode gimli can name is merely unimplemented;
                    // anything else is not a DWARF expression.
                    let kind = if gimli::DwOp(a.opcode).static_string().is_some() {
                        EvalErrorKind::NotImplemented
                    } else {
                        EvalErrorKind::IllegalOp
                    };
                    return Err(EvalError::new(kind, cur_off));
                }
            }

            index += 1;
        }

        match stack.last() {
            Some(top) => Ok(Location::Address(*top as u64)),
            None => Err(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off)),
        }
    }

    /// Resolve a `skip`/`bra` target: own offset plus the signed 16-bit
    /// operand must name exactly one op.
    fn branch_target(&self, a: &DwarfOp, cur_off: u64) -> Result<usize, EvalError> {
        let delta = a.op1 as u16 as i16;
        let target = a.offset.wrapping_add(delta as i64 as u64);
        self.find_op_index_by_offset(target)
            .ok_or(EvalError::new(EvalErrorKind::IllegalOp, cur_off))
    }
}

fn pop(stack: &mut Vec<i64>, cur_off: u64) -> Result<i64, EvalError> {
    stack
        .pop()
        .ok_or(EvalError::new(EvalErrorKind::StackIndexInvalid, cur_off))
}

fn read_register(context: &EvalContext<'_>, reg: u16, cur_off: u64) -> Result<u64, EvalError> {
    let registers = context
        .registers
        .ok_or(EvalError::new(EvalErrorKind::RegisterInvalid, cur_off))?;
    registers(reg).ok_or(EvalError::new(EvalErrorKind::RegisterInvalid, cur_off))
}

/// Read `size` bytes little-endian and zero-extend to u64.
fn read_memory_u64(memory: MemoryProvider<'_>, addr: u64, size: usize) -> Option<u64> {
    let bytes = memory(addr, size)?;
    if bytes.len() < size {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[..size]);
    Some(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EvalContext, EvalErrorKind, Location};
    use crate::expr::{op, DwarfExpression, DwarfOp};

    const ILLEGAL_OPCODE: u8 = 0x01;

    fn op0(opcode: u8, offset: u64) -> DwarfOp {
        DwarfOp {
            opcode,
            offset,
            ..Default::default()
        }
    }

    fn op1(opcode: u8, op1: u64, offset: u64) -> DwarfOp {
        DwarfOp {
            opcode,
            op1,
            offset,
            ..Default::default()
        }
    }

    fn expr(ops: &[DwarfOp]) -> DwarfExpression {
        DwarfExpression::from_ops(ops.to_vec())
    }

    fn eval(e: &DwarfExpression, ctx: &EvalContext<'_>) -> Result<Location, EvalError> {
        e.evaluate(ctx, 0)
    }

    fn eval_on(
        e: &DwarfExpression,
        ctx: &EvalContext<'_>,
        stack: &mut Vec<i64>,
    ) -> Result<Location, EvalError> {
        e.evaluate_on_stack(ctx, 0, stack)
    }

    fn assert_err(result: Result<Location, EvalError>, kind: EvalErrorKind, offset: u64) {
        match result {
            Err(e) => {
                assert_eq!(e.kind, kind);
                assert_eq!(e.offset, offset);
            }
            Ok(v) => panic!("expected {kind:?}, got {v:?}"),
        }
    }

    #[test]
    fn empty_expression_is_illegal_state() {
        let e = DwarfExpression::new();
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::IllegalState,
            0,
        );
    }

    #[test]
    fn not_implemented_carries_op_offset() {
        let e = expr(&[op0(op::NOP, 0), op0(op::NOP, 1), op0(op::PIECE, 2)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::NotImplemented,
            2,
        );
    }

    #[test]
    fn illegal_opcodes_carry_their_offset() {
        for (i, bad) in [0x00u8, 0x01, 0x02, 0x04, 0x05, 0x07].into_iter().enumerate() {
            let mut ops = Vec::new();
            for l in 0..6u64 {
                if l == i as u64 {
                    ops.push(op0(bad, l));
                } else {
                    ops.push(op0(op::NOP, l));
                }
            }
            let e = expr(&ops);
            assert_err(
                eval(&e, &EvalContext::default()),
                EvalErrorKind::IllegalOp,
                i as u64,
            );
        }
    }

    #[test]
    fn op_addr_pushes_address() {
        let e = expr(&[op1(op::ADDR, 0x4534_2312, 0)]);
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Address(0x4534_2312)
        );

        let e = expr(&[op1(op::ADDR, 0x8978_6756_4534_2312, 0)]);
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Address(0x8978_6756_4534_2312)
        );
    }

    #[test]
    fn unsigned_constants() {
        for (opcode, value) in [
            (op::CONST1U, 0x12u64),
            (op::CONST2U, 0x1245),
            (op::CONST4U, 0x4534_2312),
            (op::CONST8U, 0x0102_0304_0506_0708),
            (op::CONSTU, 0x4534_2312),
        ] {
            let e = expr(&[op1(opcode, value, 0)]);
            assert_eq!(
                eval(&e, &EvalContext::default()).unwrap(),
                Location::Address(value)
            );
        }
    }

    #[test]
    fn signed_constants() {
        for (opcode, value) in [
            (op::CONST1S, -1i64),
            (op::CONST2S, -248),
            (op::CONST4S, -16_580_095),
            (op::CONST8S, -4_521_264_810_949_884),
            (op::CONSTS, -16_580_095),
        ] {
            let e = expr(&[op1(opcode, value as u64, 0)]);
            assert_eq!(
                eval(&e, &EvalContext::default()).unwrap(),
                Location::Address(value as u64)
            );
        }
    }

    #[test]
    fn op_dup_and_underflow() {
        let e = expr(&[op0(op::DUP, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );

        let mut stack = Vec::new();
        let e = expr(&[op1(op::CONST1U, 0x15, 0), op0(op::DUP, 1)]);
        let ret = eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(ret, Location::Address(0x15));
        assert_eq!(stack, vec![0x15, 0x15]);
    }

    #[test]
    fn op_drop_and_underflow() {
        let mut stack = Vec::new();
        let e = expr(&[op1(op::CONST1U, 0x10, 0), op1(op::CONST1U, 0x20, 1)]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0x10, 0x20]);

        let e = expr(&[op0(op::DROP, 2), op0(op::DROP, 3)]);
        // Dropping both leaves an empty stack, which then fails the
        // fall-through result rule.
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            3,
        );
        assert!(stack.is_empty());

        let e = expr(&[op0(op::DROP, 4)]);
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            4,
        );
    }

    #[test]
    fn op_over_copies_second_entry() {
        let mut stack = Vec::new();
        let e = expr(&[
            op1(op::CONST1U, 0x1a, 0),
            op1(op::CONST1U, 0xed, 1),
            op0(op::OVER, 2),
        ]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0x1a, 0xed, 0x1a]);

        let mut stack = Vec::new();
        let e = expr(&[op1(op::CONST1U, 0x1a, 0), op0(op::OVER, 1)]);
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            1,
        );
    }

    #[test]
    fn op_pick_copies_by_index() {
        let e = expr(&[op1(op::PICK, 0, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );

        let mut stack = Vec::new();
        let e = expr(&[
            op1(op::CONST1U, 0x1a, 0),
            op1(op::CONST1U, 0xed, 1),
            op1(op::CONST1U, 0x34, 2),
            op1(op::PICK, 1, 3),
        ]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0x1a, 0xed, 0x34, 0xed]);

        let e = expr(&[op1(op::PICK, 3, 4)]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0x1a, 0xed, 0x34, 0xed, 0x1a]);

        let e = expr(&[op1(op::PICK, 0x10, 5)]);
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            5,
        );
    }

    #[test]
    fn op_swap_exchanges_top_two() {
        let mut stack = Vec::new();
        let e = expr(&[
            op1(op::CONST1U, 0x26, 0),
            op1(op::CONST1U, 0xab, 1),
            op0(op::SWAP, 2),
        ]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0xab, 0x26]);

        let mut stack = Vec::new();
        let e = expr(&[op1(op::CONST1U, 0x26, 0), op0(op::SWAP, 1)]);
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            1,
        );
    }

    #[test]
    fn op_rot_rotates_top_three() {
        let e = expr(&[op0(op::ROT, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );

        let mut stack = vec![0x10, 0x20];
        let e = expr(&[op0(op::ROT, 1)]);
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            1,
        );

        let mut stack = vec![0x10, 0x20, 0x30];
        let e = expr(&[op0(op::ROT, 2)]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        // The old top rotates to third place; the old second is the new top.
        assert_eq!(stack, vec![0x30, 0x10, 0x20]);
    }

    #[test]
    fn op_deref_reads_eight_bytes() {
        // 0x0011223344556677 little-endian.
        static MEM: [u8; 8] = [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
        let memory = |addr: u64, len: usize| -> Option<&[u8]> {
            if addr == 0x2010 && len <= 8 {
                Some(&MEM[..len])
            } else {
                None
            }
        };
        let ctx = EvalContext {
            memory: Some(&memory),
            ..Default::default()
        };

        // Underflow first.
        let e = expr(&[op0(op::NOP, 0), op0(op::DEREF, 1)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::StackIndexInvalid, 1);

        let e = expr(&[op1(op::CONST2U, 0x2010, 0), op0(op::DEREF, 2)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Address(0x0011_2233_4455_6677));

        // Unmapped address.
        let e = expr(&[op1(op::CONST2U, 0x2011, 0), op0(op::DEREF, 2)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::MemoryInvalid, 2);

        // No provider at all.
        let e = expr(&[op1(op::CONST2U, 0x2010, 0), op0(op::DEREF, 2)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::MemoryInvalid,
            2,
        );
    }

    #[test]
    fn op_deref_size_zero_extends() {
        static MEM: [u8; 8] = [0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22, 0x33, 0x44];
        let memory = |addr: u64, len: usize| -> Option<&[u8]> {
            if addr == 0x2010 && len <= 8 {
                Some(&MEM[..len])
            } else {
                None
            }
        };
        let ctx = EvalContext {
            memory: Some(&memory),
            ..Default::default()
        };

        for (size, expected) in [
            (1u64, 0xaa_u64),
            (2, 0xbbaa),
            (3, 0x00cc_bbaa),
            (8, 0x4433_2211_ddcc_bbaa),
        ] {
            let e = expr(&[
                op1(op::CONST2U, 0x2010, 0),
                op1(op::DEREF_SIZE, size, 2),
            ]);
            let result = eval(&e, &ctx).unwrap();
            assert_eq!(result, Location::Address(expected), "size {size}");
            // Upper 8-size bytes are zero.
            if size < 8 {
                assert_eq!(result.raw() >> (size * 8), 0);
            }
        }

        // Size zero and oversize are operand errors.
        let e = expr(&[op1(op::CONST2U, 0x2010, 0), op1(op::DEREF_SIZE, 0, 2)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::IllegalOpd, 2);
        let e = expr(&[op1(op::CONST2U, 0x2010, 0), op1(op::DEREF_SIZE, 9, 2)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::IllegalOpd, 2);

        // Bad memory.
        let e = expr(&[op1(op::CONST2U, 0x4010, 0), op1(op::DEREF_SIZE, 1, 2)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::MemoryInvalid, 2);
    }

    #[test]
    fn bare_register_terminates_with_value() {
        let registers = |reg: u16| -> Option<u64> {
            if reg == 5 {
                Some(0xdead_beef)
            } else {
                None
            }
        };
        let ctx = EvalContext {
            registers: Some(&registers),
            ..Default::default()
        };

        let e = expr(&[op0(op::REG0 + 5, 0)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Value(0xdead_beef));

        // A trailing op is never reached.
        let e = expr(&[op0(op::REG0 + 5, 0), op0(op::PIECE, 1)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Value(0xdead_beef));

        // regx addresses the register by operand.
        let e = expr(&[op1(op::REGX, 5, 0)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Value(0xdead_beef));

        // Unknown register and missing provider both fail.
        let e = expr(&[op0(op::REG0 + 6, 0)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::RegisterInvalid, 0);
        let e = expr(&[op0(op::REG0 + 5, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::RegisterInvalid,
            0,
        );
    }

    #[test]
    fn reg_then_stack_value_is_equivalent_to_bare_reg() {
        let registers = |reg: u16| (reg == 3).then_some(0x1234u64);
        let ctx = EvalContext {
            registers: Some(&registers),
            ..Default::default()
        };
        let bare = expr(&[op0(op::REG0 + 3, 0)]);
        let explicit = expr(&[op0(op::REG0 + 3, 0), op0(op::STACK_VALUE, 1)]);
        assert_eq!(eval(&bare, &ctx).unwrap(), eval(&explicit, &ctx).unwrap());
    }

    #[test]
    fn breg_applies_signed_offset() {
        let registers = |reg: u16| (reg == 7).then_some(0x1000u64);
        let ctx = EvalContext {
            registers: Some(&registers),
            ..Default::default()
        };

        let e = expr(&[op1(op::BREG0 + 7, 0x10, 0)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Address(0x1010));

        let e = expr(&[op1(op::BREG0 + 7, (-16i64) as u64, 0)]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Address(0xff0));

        // bregx: register in op1, offset in op2.
        let e = expr(&[DwarfOp {
            opcode: op::BREGX,
            op1: 7,
            op2: (-8i64) as u64,
            offset: 0,
            ..Default::default()
        }]);
        assert_eq!(eval(&e, &ctx).unwrap(), Location::Address(0xff8));

        let e = expr(&[op1(op::BREG0 + 3, 0, 0)]);
        assert_err(eval(&e, &ctx), EvalErrorKind::RegisterInvalid, 0);
    }

    #[test]
    fn breg_deref_composes() {
        // Scenario: [breg7 +0x10; deref] with memory at 0x1010.
        static MEM: [u8; 8] = [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
        let registers = |reg: u16| (reg == 7).then_some(0x1000u64);
        let memory = |addr: u64, len: usize| -> Option<&[u8]> {
            (addr == 0x1010 && len == 8).then_some(&MEM[..])
        };
        let ctx = EvalContext {
            registers: Some(&registers),
            memory: Some(&memory),
            ..Default::default()
        };
        let e = expr(&[op1(op::BREG0 + 7, 0x10, 0), op0(op::DEREF, 2)]);
        assert_eq!(
            eval(&e, &ctx).unwrap(),
            Location::Address(0x0011_2233_4455_6677)
        );
    }

    #[test]
    fn unary_arithmetic() {
        for (opcode, operand, input, expected) in [
            (op::ABS, 0u64, -5i64, 5i64),
            (op::ABS, 0, 5, 5),
            (op::NEG, 0, 5, -5),
            (op::NEG, 0, -5, 5),
            (op::NOT, 0, 0, -1),
            (op::PLUS_UCONST, 7, 5, 12),
        ] {
            let mut stack = vec![input];
            let e = expr(&[op1(opcode, operand, 0)]);
            eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
            assert_eq!(stack, vec![expected]);
        }

        let e = expr(&[op0(op::ABS, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );
    }

    #[test]
    fn binary_arithmetic_operand_order() {
        // Each case pushes X then Y, so the result is X <op> Y.
        for (opcode, x, y, expected) in [
            (op::PLUS, 3i64, 4i64, 7i64),
            (op::MINUS, 10, 4, 6),
            (op::MUL, 6, 7, 42),
            (op::DIV, -84, 2, -42),
            (op::MOD, 7, 3, 1),
            (op::AND, 0xff, 0x0f, 0x0f),
            (op::OR, 0xf0, 0x0f, 0xff),
            (op::XOR, 0xff, 0x0f, 0xf0),
            (op::SHL, 1, 8, 256),
            (op::SHR, 256, 8, 1),
            (op::SHRA, -256, 4, -16),
        ] {
            let mut stack = vec![x, y];
            let e = expr(&[op0(opcode, 0)]);
            eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
            assert_eq!(stack, vec![expected], "op 0x{opcode:x}");
        }
    }

    #[test]
    fn swap_minus_computes_y_minus_x() {
        // [const X; const Y; swap; minus] = Y - X. Without the swap the
        // same ops compute X - Y.
        let e = expr(&[
            op1(op::CONST1U, 30, 0),
            op1(op::CONST1U, 100, 1),
            op0(op::SWAP, 2),
            op0(op::MINUS, 3),
        ]);
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Address(70)
        );

        let e = expr(&[
            op1(op::CONST1U, 30, 0),
            op1(op::CONST1U, 100, 1),
            op0(op::MINUS, 2),
        ]);
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Address(30u64.wrapping_sub(100))
        );
    }

    #[test]
    fn dup_plus_doubles() {
        // [const1u X; dup; plus] = 2X.
        let e = expr(&[op1(op::CONST1U, 0x21, 0), op0(op::DUP, 1), op0(op::PLUS, 2)]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Address(0x42));
    }

    #[test]
    fn logical_vs_arithmetic_shift_right() {
        let mut stack = vec![-1i64, 60];
        let e = expr(&[op0(op::SHR, 0)]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![0xf]);

        let mut stack = vec![-1i64, 60];
        let e = expr(&[op0(op::SHRA, 0)]);
        eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(stack, vec![-1]);
    }

    #[test]
    fn oversized_shift_counts_saturate() {
        for (opcode, value, expected) in [
            (op::SHL, 1i64, 0i64),
            (op::SHR, -1, 0),
            (op::SHRA, -1, -1),
            (op::SHRA, 1, 0),
        ] {
            let mut stack = vec![value, 64];
            let e = expr(&[op0(opcode, 0)]);
            eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
            assert_eq!(stack, vec![expected], "op 0x{opcode:x}");
        }
    }

    #[test]
    fn division_by_zero_is_an_operand_error() {
        for opcode in [op::DIV, op::MOD] {
            let mut stack = vec![42, 0];
            let e = expr(&[op0(opcode, 0)]);
            assert_err(
                eval_on(&e, &EvalContext::default(), &mut stack),
                EvalErrorKind::IllegalOpd,
                0,
            );
        }
    }

    #[test]
    fn comparisons_push_zero_or_one() {
        for (opcode, x, y, expected) in [
            (op::LE, 3i64, 4i64, 1i64),
            (op::LE, 4, 4, 1),
            (op::LE, 5, 4, 0),
            (op::GE, 5, 4, 1),
            (op::GE, 3, 4, 0),
            (op::EQ, 4, 4, 1),
            (op::EQ, 3, 4, 0),
            (op::LT, 3, 4, 1),
            (op::LT, 4, 4, 0),
            (op::GT, 5, 4, 1),
            (op::GT, 4, 4, 0),
            (op::NE, 3, 4, 1),
            (op::NE, 4, 4, 0),
        ] {
            let mut stack = vec![x, y];
            let e = expr(&[op0(opcode, 0)]);
            eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
            assert_eq!(stack, vec![expected], "op 0x{opcode:x} {x} {y}");
        }

        let e = expr(&[op1(op::CONST1U, 1, 0), op0(op::EQ, 1)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            1,
        );
    }

    #[test]
    fn skip_jumps_forward() {
        // 0: const1u 1; 2: skip +3 -> 5; 4: const1u 99; 5: nop
        let e = expr(&[
            op1(op::CONST1U, 1, 0),
            op1(op::SKIP, 3, 2),
            op1(op::CONST1U, 99, 4),
            op0(op::NOP, 5),
        ]);
        let mut stack = Vec::new();
        let ret = eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(ret, Location::Address(1));
        // The skipped const never ran.
        assert_eq!(stack, vec![1]);
    }

    #[test]
    fn skip_to_missing_target_is_illegal() {
        let e = expr(&[op1(op::CONST1U, 1, 0), op1(op::SKIP, 100, 2)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::IllegalOp,
            2,
        );
    }

    #[test]
    fn bra_taken_when_nonzero() {
        // 0: const1u 1; 2: bra +3 -> 5; 4: const1u 99; 5: nop
        let e = expr(&[
            op1(op::CONST1U, 1, 0),
            op1(op::BRA, 3, 2),
            op1(op::CONST1U, 99, 4),
            op0(op::NOP, 5),
        ]);
        let mut stack = Vec::new();
        // Branch consumed the condition, leaving an empty stack at the end.
        assert_err(
            eval_on(&e, &EvalContext::default(), &mut stack),
            EvalErrorKind::StackIndexInvalid,
            5,
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn bra_not_taken_when_zero() {
        // 0: const1u 0; 2: bra +3 -> 5; 4: const1u 99; 5: nop
        let e = expr(&[
            op1(op::CONST1U, 0, 0),
            op1(op::BRA, 3, 2),
            op1(op::CONST1U, 99, 4),
            op0(op::NOP, 5),
        ]);
        let ret = eval(&e, &EvalContext::default()).unwrap();
        // Fall-through path executed the const.
        assert_eq!(ret, Location::Address(99));
    }

    #[test]
    fn bra_on_empty_stack_underflows() {
        let e = expr(&[op1(op::BRA, 1, 0), op0(op::NOP, 1)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );
    }

    #[test]
    fn backward_branch_loop_computes_a_sum() {
        // sum = 0; n = 5; while n != 0 { sum += n; n -= 1 } -> 15.
        // Stack discipline per iteration: [sum, n].
        //
        //  0: lit0              push sum = 0
        //  1: lit5              push n = 5
        //  2: dup               loop head: [sum, n, n]
        //  3: rot               [n, sum, n]  (old top to third place)
        //  4: plus              [n, sum+n]
        //  5: swap              [sum', n]
        //  6: lit1
        //  7: minus             [sum', n-1]
        //  8: dup               [sum', n', n']
        //  9: bra -7 -> 2       loop while n' != 0
        // 12: drop              [sum']
        let e = expr(&[
            op0(op::LIT0, 0),
            op0(op::LIT0 + 5, 1),
            op0(op::DUP, 2),
            op0(op::ROT, 3),
            op0(op::PLUS, 4),
            op0(op::SWAP, 5),
            op0(op::LIT0 + 1, 6),
            op0(op::MINUS, 7),
            op0(op::DUP, 8),
            op1(op::BRA, (-7i64) as u64, 9),
            op0(op::DROP, 12),
        ]);
        let mut stack = Vec::new();
        let ret = eval_on(&e, &EvalContext::default(), &mut stack).unwrap();
        assert_eq!(ret, Location::Address(15));
        assert_eq!(stack, vec![15]);
    }

    #[test]
    fn backward_branch_loop_terminates() {
        // 0: lit1; 1: bra -1 -> 0 ... lit1 pushes truthy forever.
        let e = expr(&[op0(op::LIT0 + 1, 0), op1(op::BRA, (-1i64) as u64, 1)]);
        let err = eval(&e, &EvalContext::default()).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::IllegalState);
    }

    #[test]
    fn stack_value_terminates_early() {
        // [const1u 0x42; stack_value; nop]; the nop would otherwise turn
        // the result into Address.
        let e = expr(&[
            op1(op::CONST1U, 0x42, 0),
            op0(op::STACK_VALUE, 2),
            op0(op::NOP, 3),
        ]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Value(0x42));

        // Even a would-be error after it is unreachable.
        let e = expr(&[
            op1(op::CONST1U, 0x42, 0),
            op0(op::STACK_VALUE, 2),
            op0(op::PIECE, 3),
        ]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Value(0x42));

        let e = expr(&[op0(op::STACK_VALUE, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::StackIndexInvalid,
            0,
        );
    }

    #[test]
    fn lit_range_pushes_literal() {
        let e = expr(&[op0(op::LIT0, 0)]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Address(0));
        let e = expr(&[op0(op::LIT31, 0)]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Address(31));
    }

    #[test]
    fn call_frame_cfa_uses_provider() {
        let cfa = |pc: u64| -> Option<u64> { (pc == 0x40_1000).then_some(0x7fff_ff00) };
        let ctx = EvalContext {
            cfa: Some(&cfa),
            ..Default::default()
        };
        let e = expr(&[op0(op::CALL_FRAME_CFA, 0), op1(op::PLUS_UCONST, 0x10, 1)]);
        assert_eq!(
            e.evaluate(&ctx, 0x40_1000).unwrap(),
            Location::Address(0x7fff_ff10)
        );

        assert_err(
            e.evaluate(&EvalContext::default(), 0x40_1000),
            EvalErrorKind::CfaInvalid,
            0,
        );
    }

    #[test]
    fn fbreg_without_frame_base_fails() {
        let e = expr(&[op1(op::FBREG, 0x10, 0)]);
        assert_err(
            eval(&e, &EvalContext::default()),
            EvalErrorKind::FrameBaseInvalid,
            0,
        );
    }

    #[test]
    fn determinism_with_fixed_providers() {
        let registers = |reg: u16| (reg == 7).then_some(0x1000u64);
        static MEM: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let memory = |addr: u64, len: usize| -> Option<&[u8]> {
            (addr == 0x1010 && len == 8).then_some(&MEM[..])
        };
        let ctx = EvalContext {
            registers: Some(&registers),
            memory: Some(&memory),
            ..Default::default()
        };
        let e = expr(&[op1(op::BREG0 + 7, 0x10, 0), op0(op::DEREF, 2)]);
        let first = eval(&e, &ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(eval(&e, &ctx).unwrap(), first);
        }
    }

    #[test]
    fn lit_and_reg_cover_their_full_ranges() {
        for n in 0..32u8 {
            let e = expr(&[op0(op::LIT0 + n, 0)]);
            assert_eq!(
                eval(&e, &EvalContext::default()).unwrap(),
                Location::Address(u64::from(n))
            );
        }

        let registers = |reg: u16| Some(0x9000 + u64::from(reg));
        let ctx = EvalContext {
            registers: Some(&registers),
            ..Default::default()
        };
        for n in 0..32u8 {
            let e = expr(&[op0(op::REG0 + n, 0)]);
            assert_eq!(
                eval(&e, &ctx).unwrap(),
                Location::Value(0x9000 + u64::from(n))
            );
            let e = expr(&[op1(op::BREG0 + n, 4, 0)]);
            assert_eq!(
                eval(&e, &ctx).unwrap(),
                Location::Address(0x9004 + u64::from(n))
            );
        }
    }

    #[test]
    fn skip_jumps_backward() {
        // 0: skip +4 -> 4; 2: skip +4 -> 6; 4: skip -2 -> 2; 6: lit7
        // Order of execution: 0, 4, 2, 6.
        let e = expr(&[
            op1(op::SKIP, 4, 0),
            op1(op::SKIP, 4, 2),
            op1(op::SKIP, (-2i64) as u64, 4),
            op0(op::LIT0 + 7, 6),
        ]);
        assert_eq!(eval(&e, &EvalContext::default()).unwrap(), Location::Address(7));
    }

    #[test]
    fn parsed_bytes_run_through_the_machine() {
        // fbreg-style arithmetic written as raw bytes:
        // [const2u 0x2000; constu 0x110; plus; stack_value]
        let bytes = [
            op::CONST2U,
            0x00,
            0x20,
            op::CONSTU,
            0x90,
            0x02, // ULEB128 0x110
            op::PLUS,
            op::STACK_VALUE,
        ];
        let e = DwarfExpression::parse(&bytes, 8).unwrap();
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Value(0x2110)
        );

        // A parsed conditional: [lit1; bra +3 -> skip the const; lit2]
        // 0: lit1; 1: bra(+4 -> 5); 4: lit0; 5: lit2
        let bytes = [
            op::LIT0 + 1,
            op::BRA,
            0x04,
            0x00,
            op::LIT0,
            op::LIT0 + 2,
        ];
        let e = DwarfExpression::parse(&bytes, 8).unwrap();
        assert_eq!(
            eval(&e, &EvalContext::default()).unwrap(),
            Location::Address(2)
        );
    }

    #[test]
    fn decoded_bytes_and_hand_built_ops_agree() {
        // [lit5; lit3; plus; stack_value] both ways.
        let bytes = [op::LIT0 + 5, op::LIT0 + 3, op::PLUS, op::STACK_VALUE];
        let decoded = DwarfExpression::parse(&bytes, 8).unwrap();
        let built = expr(&[
            op0(op::LIT0 + 5, 0),
            op0(op::LIT0 + 3, 1),
            op0(op::PLUS, 2),
            op0(op::STACK_VALUE, 3),
        ]);
        let ctx = EvalContext::default();
        assert_eq!(eval(&decoded, &ctx).unwrap(), eval(&built, &ctx).unwrap());
        assert_eq!(eval(&decoded, &ctx).unwrap(), Location::Value(8));
    }
}
