//! Minidump reader
//!
//! Owns the raw file bytes and the decoded directory: threads, modules,
//! memory ranges, exception, system info and per-thread CPU contexts.
//! Stream-level corruption is contained: the offending stream decodes to
//! empty and the rest of the file is still usable. Only a bad header is
//! fatal.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::context::CpuContext;
use crate::errors::{MinidumpError, Result};
use crate::format::{
    Directory, ExceptionStream, Header, LocationDescriptor, MemoryDescriptor, RawModule,
    RawSystemInfo, RawThread, EXCEPTION_STREAM, HEADER_SIGNATURE, HEADER_VERSION,
    LINUX_STREAM_FIRST, LINUX_STREAM_LAST, MAX_LIST_COUNT, MAX_STREAM_COUNT, MEMORY_LIST_STREAM,
    MODULE_LIST_STREAM, SYSTEM_INFO_STREAM, THREAD_LIST_STREAM,
};
use crate::read::Cursor;
use crate::strings;

/// A contiguous range of captured memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub base: u64,
    /// Offset and length of the bytes within the dump file.
    pub file_offset: u64,
    pub len: u64,
}

impl MemoryRange {
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base
            && addr.wrapping_add(len) >= addr
            && addr + len <= self.base + self.len
    }
}

/// An immutable crash snapshot parsed from a minidump file.
#[derive(Debug, Default)]
pub struct Minidump {
    data: Vec<u8>,
    header: Header,
    directories: Vec<Directory>,
    threads: Vec<RawThread>,
    modules: Vec<RawModule>,
    memories: Vec<MemoryRange>,
    exception: Option<ExceptionStream>,
    system_info: Option<RawSystemInfo>,
    contexts: HashMap<u32, CpuContext>,
}

impl Minidump {
    /// Read a minidump from a file path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref()).map_err(|_| MinidumpError::Truncated {
            offset: 0,
            needed: crate::format::HEADER_SIZE,
            available: 0,
        })?;
        Self::read(data)
    }

    /// Read a minidump from an in-memory byte buffer.
    pub fn read(data: Vec<u8>) -> Result<Self> {
        let mut dump = Minidump {
            data,
            ..Default::default()
        };

        dump.read_header()?;
        dump.read_directory_list()?;

        for i in 0..dump.directories.len() {
            let directory = dump.directories[i];
            debug!(
                "directory: stream_type={}, rva=0x{:x}, data_size=0x{:x}",
                directory.stream_type, directory.location.rva, directory.location.data_size
            );
            let result = match directory.stream_type {
                THREAD_LIST_STREAM => dump.read_thread_list(&directory.location),
                MODULE_LIST_STREAM => dump.read_module_list(&directory.location),
                MEMORY_LIST_STREAM => dump.read_memory_list(&directory.location),
                EXCEPTION_STREAM => dump.read_exception(&directory.location),
                SYSTEM_INFO_STREAM => dump.read_system_info(&directory.location),
                LINUX_STREAM_FIRST..=LINUX_STREAM_LAST => {
                    debug!("skipping Linux auxiliary stream {}", directory.stream_type);
                    Ok(())
                }
                other => {
                    debug!("skipping unknown stream type {}", other);
                    Ok(())
                }
            };
            // Stream-local failure: drop the stream, keep the snapshot.
            if let Err(e) = result {
                warn!(
                    "malformed stream {} at rva 0x{:x}: {}",
                    directory.stream_type, directory.location.rva, e
                );
            }
        }

        // Decode the remaining thread contexts; the exception stream may
        // have already decoded the crashed thread's.
        for i in 0..dump.threads.len() {
            let thread = dump.threads[i];
            if dump.contexts.contains_key(&thread.thread_id) {
                continue;
            }
            match dump.read_context(&thread.thread_context) {
                Ok(ctx) => {
                    dump.contexts.insert(thread.thread_id, ctx);
                }
                Err(e) => {
                    warn!("thread {}: unreadable CPU context: {}", thread.thread_id, e);
                }
            }
        }

        Ok(dump)
    }

    fn read_header(&mut self) -> Result<()> {
        let mut cursor = Cursor::new(&self.data);
        let header = Header::read(&mut cursor)?;

        if header.signature != HEADER_SIGNATURE {
            return Err(MinidumpError::Signature {
                expected: HEADER_SIGNATURE,
                actual: header.signature,
            });
        }
        let version = (header.version & 0xffff) as u16;
        if version != HEADER_VERSION {
            return Err(MinidumpError::Version {
                expected: HEADER_VERSION,
                actual: version,
            });
        }

        debug!(
            "header: version={}, stream_count={}, stream_directory_rva=0x{:x}",
            version, header.stream_count, header.stream_directory_rva
        );
        self.header = header;
        Ok(())
    }

    fn read_directory_list(&mut self) -> Result<()> {
        if self.header.stream_count > MAX_STREAM_COUNT {
            return Err(MinidumpError::TooManyStreams {
                count: self.header.stream_count,
            });
        }
        let mut cursor = Cursor::at(&self.data, u64::from(self.header.stream_directory_rva))?;
        let mut directories = Vec::with_capacity(self.header.stream_count as usize);
        for _ in 0..self.header.stream_count {
            directories.push(Directory::read(&mut cursor)?);
        }
        self.directories = directories;
        Ok(())
    }

    /// Common shape of the list streams: u32 count, optional 4-byte
    /// alignment pad, then `count` fixed-size records.
    fn read_list_stream<T>(
        &self,
        location: &LocationDescriptor,
        item_size: usize,
        read_item: impl Fn(&mut Cursor<'_>) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut cursor = Cursor::at(&self.data, u64::from(location.rva))?;
        let count = cursor.u32()?;
        if count > MAX_LIST_COUNT {
            return Err(MinidumpError::TooManyItems { count });
        }

        let expected = 4 + count as usize * item_size;
        let padded = expected + 4;
        let data_size = location.data_size as usize;
        if data_size == padded {
            cursor.skip(4)?;
        } else if data_size != expected {
            return Err(MinidumpError::Truncated {
                offset: u64::from(location.rva),
                needed: expected,
                available: data_size,
            });
        }

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(read_item(&mut cursor)?);
        }
        Ok(items)
    }

    fn read_thread_list(&mut self, location: &LocationDescriptor) -> Result<()> {
        self.threads =
            self.read_list_stream(location, crate::format::THREAD_SIZE, RawThread::read)?;
        debug!("{} threads", self.threads.len());
        Ok(())
    }

    fn read_module_list(&mut self, location: &LocationDescriptor) -> Result<()> {
        self.modules =
            self.read_list_stream(location, crate::format::MODULE_SIZE, RawModule::read)?;
        debug!("{} modules", self.modules.len());
        Ok(())
    }

    fn read_memory_list(&mut self, location: &LocationDescriptor) -> Result<()> {
        let descriptors = self.read_list_stream(
            location,
            crate::format::MEMORY_DESCRIPTOR_SIZE,
            MemoryDescriptor::read,
        )?;
        let mut memories = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let range = MemoryRange {
                base: descriptor.start_of_memory_range,
                file_offset: u64::from(descriptor.memory.rva),
                len: u64::from(descriptor.memory.data_size),
            };
            // Validate the payload window once so lookups can slice freely.
            if range.file_offset + range.len > self.data.len() as u64 {
                warn!(
                    "memory range at 0x{:x} points past end of file, dropping",
                    range.base
                );
                continue;
            }
            memories.push(range);
        }
        self.memories = memories;
        debug!("{} memory ranges", self.memories.len());
        Ok(())
    }

    fn read_exception(&mut self, location: &LocationDescriptor) -> Result<()> {
        let mut cursor = Cursor::at(&self.data, u64::from(location.rva))?;
        let exception = ExceptionStream::read(&mut cursor)?;
        // Decode the crashed thread's context eagerly; it is the one every
        // query starts from.
        match self.read_context(&exception.thread_context) {
            Ok(ctx) => {
                self.contexts.insert(exception.thread_id, ctx);
            }
            Err(e) => warn!(
                "exception thread {}: unreadable CPU context: {}",
                exception.thread_id, e
            ),
        }
        self.exception = Some(exception);
        Ok(())
    }

    fn read_system_info(&mut self, location: &LocationDescriptor) -> Result<()> {
        let mut cursor = Cursor::at(&self.data, u64::from(location.rva))?;
        self.system_info = Some(RawSystemInfo::read(&mut cursor)?);
        Ok(())
    }

    fn read_context(&self, location: &LocationDescriptor) -> Result<CpuContext> {
        let mut cursor = Cursor::at(&self.data, u64::from(location.rva))?;
        let bytes = cursor.bytes(location.data_size as usize)?;
        CpuContext::read(bytes)
    }

    // Accessors. The snapshot is immutable once read.

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn directories(&self) -> &[Directory] {
        &self.directories
    }

    pub fn threads(&self) -> &[RawThread] {
        &self.threads
    }

    pub fn modules(&self) -> &[RawModule] {
        &self.modules
    }

    pub fn memories(&self) -> &[MemoryRange] {
        &self.memories
    }

    pub fn exception(&self) -> Option<&ExceptionStream> {
        self.exception.as_ref()
    }

    pub fn system_info(&self) -> Option<&RawSystemInfo> {
        self.system_info.as_ref()
    }

    pub fn thread(&self, thread_id: u32) -> Option<&RawThread> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }

    /// The thread named by the exception stream.
    pub fn crash_thread(&self) -> Option<&RawThread> {
        self.thread(self.exception.as_ref()?.thread_id)
    }

    pub fn context(&self, thread_id: u32) -> Option<&CpuContext> {
        self.contexts.get(&thread_id)
    }

    /// CPU context of the crashed thread, as captured at the exception.
    pub fn crash_context(&self) -> Option<&CpuContext> {
        self.context(self.exception.as_ref()?.thread_id)
    }

    /// Borrow `len` bytes of captured memory at `addr`, if a single range
    /// covers the whole request. Never copies.
    pub fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let len64 = len as u64;
        let range = self.memories.iter().find(|r| r.contains(addr, len64))?;
        let start = (range.file_offset + (addr - range.base)) as usize;
        Some(&self.data[start..start + len])
    }

    /// Module covering `addr`, if any.
    pub fn module_for_address(&self, addr: u64) -> Option<&RawModule> {
        self.modules.iter().find(|m| m.contains(addr))
    }

    /// Decode a module's UTF-16 name.
    pub fn module_name(&self, module: &RawModule) -> String {
        match Cursor::at(&self.data, u64::from(module.module_name_rva)) {
            Ok(mut cursor) => strings::read_string(&mut cursor).unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    /// Debug identifier from a module's CodeView record, when it carries
    /// one in the PDB 7.0 shape (signature "RSDS", 16-byte GUID, age, and
    /// the NUL-terminated debug file name).
    pub fn module_debug_info(&self, module: &RawModule) -> Option<DebugInfoRecord> {
        let mut cursor = Cursor::at(&self.data, u64::from(module.cv_record.rva)).ok()?;
        let bytes = cursor.bytes(module.cv_record.data_size as usize).ok()?;
        parse_cv_record(bytes)
    }
}

/// Identity of a module's debug file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfoRecord {
    /// GUID + age, breakpad-style uppercase hex.
    pub id: String,
    /// Name of the matching debug file.
    pub file: String,
}

/// Parse a CodeView PDB 7.0 record.
fn parse_cv_record(bytes: &[u8]) -> Option<DebugInfoRecord> {
    if bytes.len() < 24 || &bytes[0..4] != b"RSDS" {
        return None;
    }
    let mut cursor = Cursor::new(&bytes[4..]);
    let data1 = cursor.u32().ok()?;
    let data2 = cursor.u16().ok()?;
    let data3 = cursor.u16().ok()?;
    let data4 = cursor.bytes(8).ok()?;
    let age = cursor.u32().ok()?;

    let mut id = format!("{data1:08X}{data2:04X}{data3:04X}");
    for byte in data4 {
        id.push_str(&format!("{byte:02X}"));
    }
    id.push_str(&format!("{age:x}"));

    let name_bytes = &bytes[24..];
    let name_end = name_bytes
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(name_bytes.len());
    let file = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

    Some(DebugInfoRecord { id, file })
}
