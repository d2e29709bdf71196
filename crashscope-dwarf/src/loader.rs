//! Executable and DWARF section loading
//!
//! Loads the target executable once, leaks the file bytes to `'static`
//! (the data must outlive every borrow handed out for the process
//! lifetime), and wires the DWARF sections into a gimli context.

use std::path::Path;

use anyhow::Context as _;
use object::{Object, ObjectSection};
use tracing::debug;

use crate::core::{DwarfError, Result};

/// The reader type used for every gimli structure in this crate.
pub type Reader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// Parsed executable plus its DWARF sections.
pub struct DwarfData {
    object: object::File<'static>,
    dwarf: gimli::Dwarf<Reader>,
    endian: gimli::RunTimeEndian,
    address_size: u8,
}

impl DwarfData {
    /// Load an executable with debug info from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_data = std::fs::read(path).map_err(|_| DwarfError::ExecutableNotFound {
            path: path.to_path_buf(),
        })?;

        // gimli wants one lifetime for all section borrows; the file data
        // lives as long as the process does.
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object = object::File::parse(file_data)
            .with_context(|| format!("failed to parse object file {}", path.display()))?;

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let address_size: u8 = if object.is_64() { 8 } else { 4 };

        let load_section = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        debug!(
            "loaded {}: {} endian, {}-bit",
            path.display(),
            if object.is_little_endian() { "little" } else { "big" },
            address_size * 8
        );

        Ok(Self {
            object,
            dwarf,
            endian,
            address_size,
        })
    }

    pub fn dwarf(&self) -> &gimli::Dwarf<Reader> {
        &self.dwarf
    }

    pub fn object(&self) -> &object::File<'static> {
        &self.object
    }

    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    /// Target address width in bytes (8 on 64-bit targets).
    pub fn address_size(&self) -> u8 {
        self.address_size
    }
}
