//! CPU context decoding
//!
//! A thread's CPU context is stored out-of-line, referenced by a location
//! descriptor. Layout detection is two-step: AMD64 and legacy ARM64 have
//! unique on-disk sizes; every other layout starts with a `context_flags`
//! word whose CPU mask picks the architecture.
//!
//! Legacy ARM64 contexts are converted to the modern layout on read: the
//! integer registers, `cpsr` and the FPU state carry over, the breakpoint
//! and watchpoint shadow registers are zeroed.

use crate::errors::{MinidumpError, Result};
use crate::format::{
    CONTEXT_AMD64_SIZE, CONTEXT_ARM, CONTEXT_ARM64, CONTEXT_ARM64_OLD_SIZE, CONTEXT_ARM64_SIZE,
    CONTEXT_ARM_SIZE, CONTEXT_CPU_MASK, CONTEXT_X86, CONTEXT_X86_SIZE,
};
use crate::read::Cursor;
use crashscope_platform::Arch;
use tracing::debug;

/// x86 integer state. Debug, FPU and extended areas are parsed past but not
/// retained; nothing downstream reads them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextX86 {
    pub context_flags: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// AMD64 integer state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAmd64 {
    pub context_flags: u32,
    pub eflags: u32,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

/// 32-bit ARM state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextArm {
    pub context_flags: u32,
    pub iregs: [u32; 16],
    pub cpsr: u32,
}

/// AArch64 state in the modern layout. `iregs[0..=30]` are x0..x30,
/// `iregs[31]` the stack pointer, `iregs[32]` the program counter.
#[derive(Debug, Clone, Copy)]
pub struct ContextArm64 {
    pub context_flags: u32,
    pub cpsr: u32,
    pub iregs: [u64; 33],
    pub fpsr: u32,
    pub fpcr: u32,
    pub float_regs: [(u64, u64); 32],
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

impl Default for ContextArm64 {
    fn default() -> Self {
        Self {
            context_flags: 0,
            cpsr: 0,
            iregs: [0; 33],
            fpsr: 0,
            fpcr: 0,
            float_regs: [(0, 0); 32],
            bcr: [0; 8],
            bvr: [0; 8],
            wcr: [0; 2],
            wvr: [0; 2],
        }
    }
}

/// A decoded per-thread CPU context.
#[derive(Debug, Clone, Copy)]
pub enum CpuContext {
    X86(ContextX86),
    Amd64(ContextAmd64),
    Arm(ContextArm),
    Arm64(ContextArm64),
}

impl CpuContext {
    /// Decode a context from its raw payload. `bytes` must be exactly the
    /// stream's `data_size` long; the size is part of layout detection.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            CONTEXT_AMD64_SIZE => return read_amd64(bytes).map(CpuContext::Amd64),
            CONTEXT_ARM64_OLD_SIZE => {
                debug!("legacy ARM64 context, converting to modern layout");
                return read_arm64_old(bytes).map(CpuContext::Arm64);
            }
            _ => {}
        }

        let mut cursor = Cursor::new(bytes);
        let flags = cursor.u32()?;
        match (flags & CONTEXT_CPU_MASK, bytes.len()) {
            (CONTEXT_X86, CONTEXT_X86_SIZE) => read_x86(bytes).map(CpuContext::X86),
            (CONTEXT_ARM, CONTEXT_ARM_SIZE) => read_arm(bytes).map(CpuContext::Arm),
            (CONTEXT_ARM64, CONTEXT_ARM64_SIZE) => read_arm64(bytes).map(CpuContext::Arm64),
            _ => Err(MinidumpError::UnknownContext {
                data_size: bytes.len() as u32,
                flags,
            }),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            CpuContext::X86(_) => Arch::X86,
            CpuContext::Amd64(_) => Arch::Amd64,
            CpuContext::Arm(_) => Arch::Arm,
            CpuContext::Arm64(_) => Arch::Arm64,
        }
    }

    /// CPU selector bits of the context flags word.
    pub fn cpu_type(&self) -> u32 {
        let flags = match self {
            CpuContext::X86(c) => c.context_flags,
            CpuContext::Amd64(c) => c.context_flags,
            CpuContext::Arm(c) => c.context_flags,
            CpuContext::Arm64(c) => c.context_flags,
        };
        flags & CONTEXT_CPU_MASK
    }

    /// Value of a register by its DWARF number (§4.B numbering).
    pub fn register(&self, reg: u16) -> Option<u64> {
        match self {
            CpuContext::X86(c) => {
                let v = match reg {
                    0 => c.eax,
                    1 => c.ecx,
                    2 => c.edx,
                    3 => c.ebx,
                    4 => c.esp,
                    5 => c.ebp,
                    6 => c.esi,
                    7 => c.edi,
                    8 => c.eip,
                    _ => return None,
                };
                Some(u64::from(v))
            }
            CpuContext::Amd64(c) => Some(match reg {
                0 => c.rax,
                1 => c.rdx,
                2 => c.rcx,
                3 => c.rbx,
                4 => c.rsi,
                5 => c.rdi,
                6 => c.rbp,
                7 => c.rsp,
                8 => c.r8,
                9 => c.r9,
                10 => c.r10,
                11 => c.r11,
                12 => c.r12,
                13 => c.r13,
                14 => c.r14,
                15 => c.r15,
                16 => c.rip,
                _ => return None,
            }),
            CpuContext::Arm(c) => {
                let idx = usize::from(reg);
                c.iregs.get(idx).map(|v| u64::from(*v))
            }
            CpuContext::Arm64(c) => {
                let idx = usize::from(reg);
                c.iregs.get(idx).copied()
            }
        }
    }

    pub fn instruction_pointer(&self) -> Option<u64> {
        self.register(crashscope_platform::pc_register(self.arch()))
    }

    pub fn stack_pointer(&self) -> Option<u64> {
        self.register(crashscope_platform::sp_register(self.arch()))
    }

    pub fn frame_pointer(&self) -> Option<u64> {
        self.register(crashscope_platform::frame_pointer_register(self.arch()))
    }
}

fn read_x86(bytes: &[u8]) -> Result<ContextX86> {
    let mut c = Cursor::new(bytes);
    let context_flags = c.u32()?;
    c.skip(6 * 4)?; // dr0-dr3, dr6, dr7
    c.skip(112)?; // float save area
    c.skip(4 * 4)?; // gs, fs, es, ds
    let edi = c.u32()?;
    let esi = c.u32()?;
    let ebx = c.u32()?;
    let edx = c.u32()?;
    let ecx = c.u32()?;
    let eax = c.u32()?;
    let ebp = c.u32()?;
    let eip = c.u32()?;
    let cs = c.u32()?;
    let eflags = c.u32()?;
    let esp = c.u32()?;
    let ss = c.u32()?;
    // 512 bytes of extended registers follow; nothing to keep.
    Ok(ContextX86 {
        context_flags,
        edi,
        esi,
        ebx,
        edx,
        ecx,
        eax,
        ebp,
        eip,
        cs,
        eflags,
        esp,
        ss,
    })
}

fn read_amd64(bytes: &[u8]) -> Result<ContextAmd64> {
    let mut c = Cursor::new(bytes);
    c.skip(6 * 8)?; // parameter home slots
    let context_flags = c.u32()?;
    c.skip(4)?; // mx_csr
    c.skip(6 * 2)?; // segment selectors
    let eflags = c.u32()?;
    c.skip(6 * 8)?; // debug registers
    let rax = c.u64()?;
    let rcx = c.u64()?;
    let rdx = c.u64()?;
    let rbx = c.u64()?;
    let rsp = c.u64()?;
    let rbp = c.u64()?;
    let rsi = c.u64()?;
    let rdi = c.u64()?;
    let r8 = c.u64()?;
    let r9 = c.u64()?;
    let r10 = c.u64()?;
    let r11 = c.u64()?;
    let r12 = c.u64()?;
    let r13 = c.u64()?;
    let r14 = c.u64()?;
    let r15 = c.u64()?;
    let rip = c.u64()?;
    // SSE save area, vector registers and branch records follow.
    Ok(ContextAmd64 {
        context_flags,
        eflags,
        rax,
        rcx,
        rdx,
        rbx,
        rsp,
        rbp,
        rsi,
        rdi,
        r8,
        r9,
        r10,
        r11,
        r12,
        r13,
        r14,
        r15,
        rip,
    })
}

fn read_arm(bytes: &[u8]) -> Result<ContextArm> {
    let mut c = Cursor::new(bytes);
    let context_flags = c.u32()?;
    let mut iregs = [0u32; 16];
    for slot in iregs.iter_mut() {
        *slot = c.u32()?;
    }
    let cpsr = c.u32()?;
    Ok(ContextArm {
        context_flags,
        iregs,
        cpsr,
    })
}

fn read_arm64(bytes: &[u8]) -> Result<ContextArm64> {
    let mut c = Cursor::new(bytes);
    let context_flags = c.u32()?;
    let cpsr = c.u32()?;
    let mut ctx = ContextArm64 {
        context_flags,
        cpsr,
        ..Default::default()
    };
    for slot in ctx.iregs.iter_mut() {
        *slot = c.u64()?;
    }
    ctx.fpsr = c.u32()?;
    ctx.fpcr = c.u32()?;
    for slot in ctx.float_regs.iter_mut() {
        *slot = c.u128_pair()?;
    }
    for slot in ctx.bcr.iter_mut() {
        *slot = c.u32()?;
    }
    for slot in ctx.bvr.iter_mut() {
        *slot = c.u64()?;
    }
    for slot in ctx.wcr.iter_mut() {
        *slot = c.u32()?;
    }
    for slot in ctx.wvr.iter_mut() {
        *slot = c.u64()?;
    }
    Ok(ctx)
}

/// Legacy layout: 64-bit flags word first, no debug registers.
fn read_arm64_old(bytes: &[u8]) -> Result<ContextArm64> {
    let mut c = Cursor::new(bytes);
    let context_flags = c.u64()? as u32;
    let mut ctx = ContextArm64 {
        // Re-tag as the modern ARM64 context while keeping the non-CPU bits.
        context_flags: (context_flags & !CONTEXT_CPU_MASK) | CONTEXT_ARM64,
        ..Default::default()
    };
    for slot in ctx.iregs.iter_mut() {
        *slot = c.u64()?;
    }
    ctx.cpsr = c.u32()?;
    ctx.fpsr = c.u32()?;
    ctx.fpcr = c.u32()?;
    for slot in ctx.float_regs.iter_mut() {
        *slot = c.u128_pair()?;
    }
    // bcr/bvr/wcr/wvr stay zero: the legacy layout never carried them.
    Ok(ctx)
}
