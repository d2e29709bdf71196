//! Platform-specific register numbering for crashscope
//!
//! This crate owns the mapping between DWARF register numbers and the
//! architectures a crash snapshot can carry:
//! - Register names for human-readable output
//! - The dedicated CFA column sentinel used by the CFI engine
//! - Program counter / stack pointer / frame pointer register numbers

pub mod register_mapping;

pub use register_mapping::{
    dwarf_reg_to_name, frame_pointer_register, name_to_dwarf_reg, pc_register, register_count,
    sp_register, Arch, CFA_COLUMN,
};
