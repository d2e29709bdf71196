//! Raw minidump structures and constants
//!
//! Field layout follows the Breakpad rendition of the Microsoft minidump
//! format. Everything on disk is little-endian; structure sizes below are
//! exact on-disk sizes, not host `size_of` values.

use crate::errors::Result;
use crate::read::Cursor;

/// Header signature: "MDMP" read as a little-endian u32.
pub const HEADER_SIGNATURE: u32 = 0x504d_444d;
/// Low 16 bits of the header version word.
pub const HEADER_VERSION: u16 = 42899;
/// Upper bound on the stream directory; anything larger is a corrupt file.
pub const MAX_STREAM_COUNT: u32 = 1000;
/// Upper bound on per-stream item counts (threads, modules, memory ranges).
pub const MAX_LIST_COUNT: u32 = 10_000;

// Stream types.
pub const THREAD_LIST_STREAM: u32 = 3;
pub const MODULE_LIST_STREAM: u32 = 4;
pub const MEMORY_LIST_STREAM: u32 = 5;
pub const EXCEPTION_STREAM: u32 = 6;
pub const SYSTEM_INFO_STREAM: u32 = 7;
/// Breakpad's Linux extension streams (cpuinfo, maps, environ, ...).
/// Recognized so they do not show up as "unknown", but carry nothing the
/// core needs.
pub const LINUX_STREAM_FIRST: u32 = 0x4767_0001;
pub const LINUX_STREAM_LAST: u32 = 0x4767_000a;

// On-disk record sizes.
pub const HEADER_SIZE: usize = 32;
pub const DIRECTORY_SIZE: usize = 12;
pub const THREAD_SIZE: usize = 48;
pub const MODULE_SIZE: usize = 108;
pub const MEMORY_DESCRIPTOR_SIZE: usize = 16;
pub const EXCEPTION_STREAM_SIZE: usize = 168;
pub const SYSTEM_INFO_SIZE: usize = 56;

// CPU type selection. AMD64 and legacy ARM64 contexts are identified by
// their unique sizes; the rest by the context_flags CPU mask.
pub const CONTEXT_CPU_MASK: u32 = 0xffff_ff00;
pub const CONTEXT_X86: u32 = 0x0001_0000;
pub const CONTEXT_AMD64: u32 = 0x0010_0000;
pub const CONTEXT_ARM: u32 = 0x4000_0000;
pub const CONTEXT_ARM64: u32 = 0x0040_0000;

pub const CONTEXT_X86_SIZE: usize = 716;
pub const CONTEXT_AMD64_SIZE: usize = 1232;
pub const CONTEXT_ARM_SIZE: usize = 368;
pub const CONTEXT_ARM64_SIZE: usize = 912;
pub const CONTEXT_ARM64_OLD_SIZE: usize = 796;

// Processor architecture values from the SYSTEM_INFO stream.
pub const PROCESSOR_ARCHITECTURE_X86: u16 = 0;
pub const PROCESSOR_ARCHITECTURE_ARM: u16 = 5;
pub const PROCESSOR_ARCHITECTURE_AMD64: u16 = 9;
pub const PROCESSOR_ARCHITECTURE_ARM64: u16 = 12;
/// Breakpad-era ARM64 value, paired with the legacy context layout.
pub const PROCESSOR_ARCHITECTURE_ARM64_OLD: u16 = 0x8003;

/// Conventional name for a Linux exception code (the delivering signal
/// number, as Breakpad records it).
pub fn exception_name(code: u32) -> Option<&'static str> {
    Some(match code {
        1 => "SIGHUP",
        2 => "SIGINT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        31 => "SIGSYS",
        _ => return None,
    })
}

/// MDRawHeader
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

impl Header {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            signature: cursor.u32()?,
            version: cursor.u32()?,
            stream_count: cursor.u32()?,
            stream_directory_rva: cursor.u32()?,
            checksum: cursor.u32()?,
            time_date_stamp: cursor.u32()?,
            flags: cursor.u64()?,
        })
    }
}

/// MDLocationDescriptor: where a stream's payload lives in the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationDescriptor {
    pub data_size: u32,
    pub rva: u32,
}

impl LocationDescriptor {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            data_size: cursor.u32()?,
            rva: cursor.u32()?,
        })
    }
}

/// MDRawDirectory
#[derive(Debug, Clone, Copy)]
pub struct Directory {
    pub stream_type: u32,
    pub location: LocationDescriptor,
}

impl Directory {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            stream_type: cursor.u32()?,
            location: LocationDescriptor::read(cursor)?,
        })
    }
}

/// MDMemoryDescriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDescriptor {
    pub start_of_memory_range: u64,
    pub memory: LocationDescriptor,
}

impl MemoryDescriptor {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            start_of_memory_range: cursor.u64()?,
            memory: LocationDescriptor::read(cursor)?,
        })
    }
}

/// MDRawThread
#[derive(Debug, Clone, Copy, Default)]
pub struct RawThread {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MemoryDescriptor,
    pub thread_context: LocationDescriptor,
}

impl RawThread {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            thread_id: cursor.u32()?,
            suspend_count: cursor.u32()?,
            priority_class: cursor.u32()?,
            priority: cursor.u32()?,
            teb: cursor.u64()?,
            stack: MemoryDescriptor::read(cursor)?,
            thread_context: LocationDescriptor::read(cursor)?,
        })
    }
}

/// MDRawModule. The 52-byte VS_FIXEDFILEINFO blob is kept opaque; nothing
/// in the query pipeline reads it.
#[derive(Debug, Clone, Copy)]
pub struct RawModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub cv_record: LocationDescriptor,
    pub misc_record: LocationDescriptor,
}

impl RawModule {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let base_of_image = cursor.u64()?;
        let size_of_image = cursor.u32()?;
        let checksum = cursor.u32()?;
        let time_date_stamp = cursor.u32()?;
        let module_name_rva = cursor.u32()?;
        cursor.skip(52)?; // VS_FIXEDFILEINFO
        let cv_record = LocationDescriptor::read(cursor)?;
        let misc_record = LocationDescriptor::read(cursor)?;
        cursor.skip(16)?; // reserved0, reserved1
        Ok(Self {
            base_of_image,
            size_of_image,
            checksum,
            time_date_stamp,
            module_name_rva,
            cv_record,
            misc_record,
        })
    }

    /// [base, base + size) of the mapped image.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_of_image && addr < self.base_of_image + u64::from(self.size_of_image)
    }
}

/// MDException + enclosing MDRawExceptionStream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionStream {
    pub thread_id: u32,
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub exception_information: [u64; 15],
    pub thread_context: LocationDescriptor,
}

impl ExceptionStream {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let thread_id = cursor.u32()?;
        cursor.skip(4)?; // alignment
        let exception_code = cursor.u32()?;
        let exception_flags = cursor.u32()?;
        let exception_record = cursor.u64()?;
        let exception_address = cursor.u64()?;
        let number_parameters = cursor.u32()?;
        cursor.skip(4)?; // alignment
        let mut exception_information = [0u64; 15];
        for slot in exception_information.iter_mut() {
            *slot = cursor.u64()?;
        }
        let thread_context = LocationDescriptor::read(cursor)?;
        Ok(Self {
            thread_id,
            exception_code,
            exception_flags,
            exception_record,
            exception_address,
            number_parameters,
            exception_information,
            thread_context,
        })
    }
}

/// MDRawSystemInfo
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSystemInfo {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
}

impl RawSystemInfo {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let info = Self {
            processor_architecture: cursor.u16()?,
            processor_level: cursor.u16()?,
            processor_revision: cursor.u16()?,
            number_of_processors: cursor.u8()?,
            product_type: cursor.u8()?,
            major_version: cursor.u32()?,
            minor_version: cursor.u32()?,
            build_number: cursor.u32()?,
            platform_id: cursor.u32()?,
            csd_version_rva: cursor.u32()?,
            suite_mask: cursor.u16()?,
        };
        cursor.skip(2)?; // reserved2
        cursor.skip(24)?; // cpu info union
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_layout() {
        // 4*4 + 8 + 16 + 8
        assert_eq!(THREAD_SIZE, 16 + 8 + MEMORY_DESCRIPTOR_SIZE + 8);
        // 8 + 4*4 + 52 + 8 + 8 + 16
        assert_eq!(MODULE_SIZE, 8 + 16 + 52 + 8 + 8 + 16);
        // 4 + 4 + (4+4+8+8+4+4+120) + 8
        assert_eq!(EXCEPTION_STREAM_SIZE, 8 + 152 + 8);
    }

    #[test]
    fn thread_record_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&42u32.to_le_bytes()); // thread_id
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0xdead_0000u64.to_le_bytes()); // teb
        bytes.extend_from_slice(&0x7fff_1000u64.to_le_bytes()); // stack base
        bytes.extend_from_slice(&0x100u32.to_le_bytes()); // stack size
        bytes.extend_from_slice(&0x400u32.to_le_bytes()); // stack rva
        bytes.extend_from_slice(&CONTEXT_ARM64_SIZE.to_le_bytes()[..4]); // ctx size
        bytes.extend_from_slice(&0x800u32.to_le_bytes()); // ctx rva
        assert_eq!(bytes.len(), THREAD_SIZE);

        let mut cursor = Cursor::new(&bytes);
        let thread = RawThread::read(&mut cursor).unwrap();
        assert_eq!(thread.thread_id, 42);
        assert_eq!(thread.stack.start_of_memory_range, 0x7fff_1000);
        assert_eq!(thread.stack.memory.data_size, 0x100);
        assert_eq!(thread.thread_context.rva, 0x800);
    }
}
