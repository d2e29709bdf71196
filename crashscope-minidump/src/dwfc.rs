//! DWFC auxiliary context files
//!
//! A DWFC file is a synthetic capture of per-frame register values and stack
//! memory, produced offline from a stackwalk listing. It stands in for a
//! real snapshot when none is available: frame 0 of thread 0 provides the
//! same register/memory views a minidump context would.
//!
//! Layout (all little-endian):
//! ```text
//! "DWFC"  magic
//! u16     version
//! u16     arch (0 = 32-bit, 1 = 64-bit)
//! u32     thread count
//! per thread:
//!   u32 tid, u32 crashed, u32 frame count
//!   per frame:
//!     u32 frame_num
//!     u32 func_len, UTF-8 function name
//!     u32 regs_len, u64 x regs_len register values
//!     u64 stack_base, u32 stack_len, stack bytes
//! ```

use std::path::Path;

use tracing::debug;

use crate::errors::{MinidumpError, Result};
use crate::read::Cursor;

pub const DWFC_MAGIC: [u8; 4] = *b"DWFC";

/// One stack frame of a captured thread.
#[derive(Debug, Clone, Default)]
pub struct DwfcFrame {
    pub frame_num: u32,
    pub function: String,
    /// Register file indexed by DWARF register number.
    pub regs: Vec<u64>,
    pub stack_base: u64,
    pub stack: Vec<u8>,
}

impl DwfcFrame {
    /// Register value by DWARF number.
    pub fn register(&self, reg: u16) -> Option<u64> {
        self.regs.get(usize::from(reg)).copied()
    }

    /// Borrow stack memory, bounds-checked against the captured window.
    pub fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let end = self.stack_base + self.stack.len() as u64;
        let len64 = len as u64;
        if addr < self.stack_base || addr.wrapping_add(len64) < addr || addr + len64 > end {
            return None;
        }
        let start = (addr - self.stack_base) as usize;
        Some(&self.stack[start..start + len])
    }
}

#[derive(Debug, Clone, Default)]
pub struct DwfcThread {
    pub tid: u32,
    pub crashed: bool,
    pub frames: Vec<DwfcFrame>,
}

/// A parsed DWFC context file.
#[derive(Debug, Clone, Default)]
pub struct DwfcFile {
    pub version: u16,
    /// 0 = 32-bit, 1 = 64-bit.
    pub arch: u16,
    pub threads: Vec<DwfcThread>,
}

impl DwfcFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref()).map_err(|_| MinidumpError::Truncated {
            offset: 0,
            needed: 12,
            available: 0,
        })?;
        Self::read(&data)
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let magic = cursor.bytes(4)?;
        if magic != DWFC_MAGIC {
            return Err(MinidumpError::ContextMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }

        let version = cursor.u16()?;
        let arch = cursor.u16()?;
        let thread_count = cursor.u32()?;
        debug!(
            "dwfc: version={}, arch={}, threads={}",
            version, arch, thread_count
        );

        let mut threads = Vec::with_capacity(thread_count as usize);
        for _ in 0..thread_count {
            let tid = cursor.u32()?;
            let crashed = cursor.u32()? != 0;
            let frame_count = cursor.u32()?;

            let mut frames = Vec::with_capacity(frame_count as usize);
            for _ in 0..frame_count {
                frames.push(Self::read_frame(&mut cursor)?);
            }
            threads.push(DwfcThread {
                tid,
                crashed,
                frames,
            });
        }

        Ok(DwfcFile {
            version,
            arch,
            threads,
        })
    }

    fn read_frame(cursor: &mut Cursor<'_>) -> Result<DwfcFrame> {
        let frame_num = cursor.u32()?;

        let func_len = cursor.u32()? as usize;
        let function = String::from_utf8_lossy(cursor.bytes(func_len)?).into_owned();

        let regs_len = cursor.u32()? as usize;
        let mut regs = Vec::with_capacity(regs_len);
        for _ in 0..regs_len {
            regs.push(cursor.u64()?);
        }

        let stack_base = cursor.u64()?;
        let stack_len = cursor.u32()? as usize;
        let stack = cursor.bytes(stack_len)?.to_vec();

        Ok(DwfcFrame {
            frame_num,
            function,
            regs,
            stack_base,
            stack,
        })
    }

    /// The frame queries read registers and memory from: frame 0 of the
    /// first thread.
    pub fn first_frame(&self) -> Option<&DwfcFrame> {
        self.threads.first()?.frames.first()
    }

    /// The first thread marked as crashed.
    pub fn crashed_thread(&self) -> Option<&DwfcThread> {
        self.threads.iter().find(|t| t.crashed)
    }

    /// Render the whole capture: every thread, frame, register file and
    /// stack window, for verbose output.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "dwfc context:");
        let _ = writeln!(
            out,
            "  version: {}, arch: {}, threads: {}",
            self.version,
            if self.arch == 0 { "32-bit" } else { "64-bit" },
            self.threads.len()
        );

        for thread in &self.threads {
            let _ = writeln!(
                out,
                "  thread {}{}",
                thread.tid,
                if thread.crashed { " (crashed)" } else { "" }
            );
            for frame in &thread.frames {
                let _ = writeln!(out, "    #{} {}", frame.frame_num, frame.function);
                for (i, reg) in frame.regs.iter().enumerate() {
                    let _ = write!(out, "      x{i:02} = 0x{reg:016x}");
                    if i % 2 == 1 || i == frame.regs.len() - 1 {
                        let _ = writeln!(out);
                    }
                }
                let _ = writeln!(
                    out,
                    "      stack base 0x{:x}, {} bytes",
                    frame.stack_base,
                    frame.stack.len()
                );
                for (i, byte) in frame.stack.iter().enumerate() {
                    if i % 16 == 0 {
                        let _ = write!(out, "      ");
                    }
                    let _ = write!(out, "{byte:02x} ");
                    if i % 16 == 15 || i == frame.stack.len() - 1 {
                        let _ = writeln!(out);
                    }
                }
            }
        }
        out
    }
}
