//! DWARF register numbering per architecture
//!
//! DWARF register numbers are defined by each architecture's psABI, not by
//! DWARF itself. The snapshot side hands us raw register files; everything
//! above it (expression evaluation, CFI, output formatting) speaks DWARF
//! numbers, so this module is the single place the two meet.
//!
//! References:
//! - System V AMD64 psABI, figure 3.36 (DWARF register number mapping)
//! - DWARF for the ARM 64-bit architecture (AArch64), section 4.1

use tracing::warn;

/// CPU architecture of a crash snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    Amd64,
    Arm,
    Arm64,
}

/// Dedicated column number for the CFA pseudo-register.
///
/// Real DWARF register numbers are small; the CFI engine needs one column
/// that can never collide with them.
pub const CFA_COLUMN: u16 = u16::MAX;

/// Number of DWARF register columns the CFI engine scans for an architecture.
pub fn register_count(arch: Arch) -> u16 {
    match arch {
        Arch::X86 => 9,    // eax..edi + eip
        Arch::Amd64 => 17, // rax..r15 + rip
        Arch::Arm => 16,   // r0..r15
        Arch::Arm64 => 33, // x0..x30 + sp + pc
    }
}

/// DWARF register number holding the program counter.
pub fn pc_register(arch: Arch) -> u16 {
    match arch {
        Arch::X86 => 8,
        Arch::Amd64 => 16,
        Arch::Arm => 15,
        Arch::Arm64 => 32,
    }
}

/// DWARF register number holding the stack pointer.
pub fn sp_register(arch: Arch) -> u16 {
    match arch {
        Arch::X86 => 4,
        Arch::Amd64 => 7,
        Arch::Arm => 13,
        Arch::Arm64 => 31,
    }
}

/// DWARF register number holding the conventional frame pointer.
pub fn frame_pointer_register(arch: Arch) -> u16 {
    match arch {
        Arch::X86 => 5,
        Arch::Amd64 => 6,
        Arch::Arm => 11,
        Arch::Arm64 => 29,
    }
}

/// Convert a DWARF register number to its conventional name.
///
/// Returns `None` (with a warning) for numbers outside the architecture's
/// integer register file; floating point and vector registers are not
/// recoverable from the snapshots we consume.
pub fn dwarf_reg_to_name(arch: Arch, reg: u16) -> Option<&'static str> {
    let name = match arch {
        Arch::X86 => dwarf_reg_to_name_x86(reg),
        Arch::Amd64 => dwarf_reg_to_name_amd64(reg),
        Arch::Arm => dwarf_reg_to_name_arm(reg),
        Arch::Arm64 => dwarf_reg_to_name_arm64(reg),
    };
    if name.is_none() {
        warn!("unknown DWARF register {} for {:?}", reg, arch);
    }
    name
}

fn dwarf_reg_to_name_x86(reg: u16) -> Option<&'static str> {
    // i386 psABI numbering.
    Some(match reg {
        0 => "eax",
        1 => "ecx",
        2 => "edx",
        3 => "ebx",
        4 => "esp",
        5 => "ebp",
        6 => "esi",
        7 => "edi",
        8 => "eip",
        _ => return None,
    })
}

fn dwarf_reg_to_name_amd64(reg: u16) -> Option<&'static str> {
    // System V AMD64 psABI numbering. Note rdx/rcx come before rbx.
    Some(match reg {
        0 => "rax",
        1 => "rdx",
        2 => "rcx",
        3 => "rbx",
        4 => "rsi",
        5 => "rdi",
        6 => "rbp",
        7 => "rsp",
        8 => "r8",
        9 => "r9",
        10 => "r10",
        11 => "r11",
        12 => "r12",
        13 => "r13",
        14 => "r14",
        15 => "r15",
        16 => "rip",
        _ => return None,
    })
}

fn dwarf_reg_to_name_arm(reg: u16) -> Option<&'static str> {
    Some(match reg {
        0 => "r0",
        1 => "r1",
        2 => "r2",
        3 => "r3",
        4 => "r4",
        5 => "r5",
        6 => "r6",
        7 => "r7",
        8 => "r8",
        9 => "r9",
        10 => "r10",
        11 => "fp",
        12 => "ip",
        13 => "sp",
        14 => "lr",
        15 => "pc",
        _ => return None,
    })
}

fn dwarf_reg_to_name_arm64(reg: u16) -> Option<&'static str> {
    Some(match reg {
        0 => "x0",
        1 => "x1",
        2 => "x2",
        3 => "x3",
        4 => "x4",
        5 => "x5",
        6 => "x6",
        7 => "x7",
        8 => "x8",
        9 => "x9",
        10 => "x10",
        11 => "x11",
        12 => "x12",
        13 => "x13",
        14 => "x14",
        15 => "x15",
        16 => "x16",
        17 => "x17",
        18 => "x18",
        19 => "x19",
        20 => "x20",
        21 => "x21",
        22 => "x22",
        23 => "x23",
        24 => "x24",
        25 => "x25",
        26 => "x26",
        27 => "x27",
        28 => "x28",
        29 => "x29",
        30 => "x30",
        31 => "sp",
        32 => "pc",
        _ => return None,
    })
}

/// Human-readable name for a CFI column, including the CFA sentinel.
pub fn column_name(arch: Arch, col: u16) -> String {
    if col == CFA_COLUMN {
        return "cfa".to_string();
    }
    match dwarf_reg_to_name(arch, col) {
        Some(name) => name.to_string(),
        None => format!("r{col}"),
    }
}

/// Reverse lookup: conventional register name to DWARF number. Accepts the
/// names `dwarf_reg_to_name` produces, case-insensitively.
pub fn name_to_dwarf_reg(arch: Arch, name: &str) -> Option<u16> {
    let lowered = name.to_ascii_lowercase();
    (0..register_count(arch)).find(|reg| dwarf_reg_to_name(arch, *reg) == Some(lowered.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd64_numbering_follows_psabi() {
        // The psABI order is a classic source of off-by-ones: 1 is rdx, not rcx.
        assert_eq!(dwarf_reg_to_name(Arch::Amd64, 1), Some("rdx"));
        assert_eq!(dwarf_reg_to_name(Arch::Amd64, 2), Some("rcx"));
        assert_eq!(dwarf_reg_to_name(Arch::Amd64, 7), Some("rsp"));
        assert_eq!(dwarf_reg_to_name(Arch::Amd64, 16), Some("rip"));
        assert_eq!(dwarf_reg_to_name(Arch::Amd64, 17), None);
    }

    #[test]
    fn arm64_special_registers() {
        assert_eq!(dwarf_reg_to_name(Arch::Arm64, 29), Some("x29"));
        assert_eq!(dwarf_reg_to_name(Arch::Arm64, 31), Some("sp"));
        assert_eq!(dwarf_reg_to_name(Arch::Arm64, 32), Some("pc"));
        assert_eq!(pc_register(Arch::Arm64), 32);
        assert_eq!(sp_register(Arch::Arm64), 31);
        assert_eq!(frame_pointer_register(Arch::Arm64), 29);
    }

    #[test]
    fn every_register_number_has_a_unique_name() {
        for arch in [Arch::X86, Arch::Amd64, Arch::Arm, Arch::Arm64] {
            let mut seen = std::collections::HashSet::new();
            for reg in 0..register_count(arch) {
                let name = dwarf_reg_to_name(arch, reg)
                    .unwrap_or_else(|| panic!("{arch:?} register {reg} unnamed"));
                assert!(seen.insert(name), "{arch:?}: duplicate name {name}");
            }
        }
    }

    #[test]
    fn name_lookup_round_trips() {
        for arch in [Arch::X86, Arch::Amd64, Arch::Arm, Arch::Arm64] {
            for reg in 0..register_count(arch) {
                let name = dwarf_reg_to_name(arch, reg).unwrap();
                assert_eq!(name_to_dwarf_reg(arch, name), Some(reg));
            }
        }
        assert_eq!(name_to_dwarf_reg(Arch::Amd64, "RSP"), Some(7));
        assert_eq!(name_to_dwarf_reg(Arch::Arm64, "nosuch"), None);
    }

    #[test]
    fn cfa_column_never_collides() {
        for arch in [Arch::X86, Arch::Amd64, Arch::Arm, Arch::Arm64] {
            assert!(register_count(arch) < CFA_COLUMN);
        }
        assert_eq!(column_name(Arch::Arm64, CFA_COLUMN), "cfa");
        assert_eq!(column_name(Arch::Arm64, 31), "sp");
        assert_eq!(column_name(Arch::Arm64, 200), "r200");
    }
}
