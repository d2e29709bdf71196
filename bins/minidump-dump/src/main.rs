//! minidump-dump: print every stream of a minidump file

use std::process::ExitCode;

use crashscope_minidump::{CpuContext, Minidump};
use crashscope_platform::{dwarf_reg_to_name, register_count};

const USAGE: &str = "Usage: minidump-dump <minidump_file>";

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("{USAGE}");
        return ExitCode::from(255);
    };

    let dump = match Minidump::open(&path) {
        Ok(dump) => dump,
        Err(e) => {
            eprintln!("Error: cannot read minidump {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    print_dump(&dump);
    ExitCode::SUCCESS
}

fn print_dump(dump: &Minidump) {
    let header = dump.header();
    println!("Header:");
    println!("  signature: 0x{:08x}", header.signature);
    println!("  version: {}", header.version & 0xffff);
    println!("  stream_count: {}", header.stream_count);
    println!("  stream_directory_rva: 0x{:x}", header.stream_directory_rva);
    println!("  time_date_stamp: {}", header.time_date_stamp);
    println!();

    println!("Directories:");
    for directory in dump.directories() {
        println!(
            "  stream_type={} rva=0x{:x} data_size=0x{:x}",
            directory.stream_type, directory.location.rva, directory.location.data_size
        );
    }
    println!();

    if let Some(info) = dump.system_info() {
        println!("SystemInfo:");
        println!("  processor_architecture: {}", info.processor_architecture);
        println!("  processor_level: {}", info.processor_level);
        println!("  number_of_processors: {}", info.number_of_processors);
        println!("  platform_id: {}", info.platform_id);
        println!(
            "  os version: {}.{}.{}",
            info.major_version, info.minor_version, info.build_number
        );
        println!();
    }

    println!("Threads ({}):", dump.threads().len());
    for thread in dump.threads() {
        println!(
            "  thread_id={} stack=[0x{:x} - 0x{:x}) context_size=0x{:x}",
            thread.thread_id,
            thread.stack.start_of_memory_range,
            thread.stack.start_of_memory_range + u64::from(thread.stack.memory.data_size),
            thread.thread_context.data_size
        );
    }
    println!();

    println!("Modules ({}):", dump.modules().len());
    for module in dump.modules() {
        let name = dump.module_name(module);
        println!(
            "  [0x{:x} - 0x{:x}) {}",
            module.base_of_image,
            module.base_of_image + u64::from(module.size_of_image),
            if name.is_empty() { "<unnamed>" } else { &name }
        );
        if let Some(debug_info) = dump.module_debug_info(module) {
            println!("    debug id: {} ({})", debug_info.id, debug_info.file);
        }
    }
    println!();

    println!("Memory ranges ({}):", dump.memories().len());
    for range in dump.memories() {
        println!(
            "  [0x{:x} - 0x{:x}) {} bytes",
            range.base,
            range.base + range.len,
            range.len
        );
    }
    println!();

    if let Some(exception) = dump.exception() {
        println!("Exception:");
        println!("  thread_id: {}", exception.thread_id);
        match crashscope_minidump::exception_name(exception.exception_code) {
            Some(name) => println!(
                "  exception_code: 0x{:x} ({})",
                exception.exception_code, name
            ),
            None => println!("  exception_code: 0x{:x}", exception.exception_code),
        }
        println!("  exception_address: 0x{:x}", exception.exception_address);
        if let Some(module) = dump.module_for_address(exception.exception_address) {
            println!("  faulting module: {}", dump.module_name(module));
        }
        println!();
    }

    let crashed_tid = dump.exception().map(|e| e.thread_id);
    for thread in dump.threads() {
        let Some(context) = dump.context(thread.thread_id) else {
            continue;
        };
        let marker = if Some(thread.thread_id) == crashed_tid {
            " (crashed)"
        } else {
            ""
        };
        println!(
            "Thread {} context ({:?}){}:",
            thread.thread_id,
            context.arch(),
            marker
        );
        print_context(context);
        println!();
    }

    if let Some(thread) = dump.crash_thread() {
        print_stack(dump, thread.stack.start_of_memory_range, thread.stack.memory.data_size);
    }
}

/// Hex dump of the crashed thread's captured stack, 16 bytes per line.
fn print_stack(dump: &Minidump, base: u64, len: u32) {
    const STACK_DUMP_LIMIT: usize = 256;

    let len = (len as usize).min(STACK_DUMP_LIMIT);
    let Some(bytes) = dump.memory(base, len) else {
        return;
    };
    println!("Stack at 0x{base:x}:");
    for (i, byte) in bytes.iter().enumerate() {
        if i % 16 == 0 {
            print!("  0x{:08x}  ", base + i as u64);
        }
        print!("{byte:02x} ");
        if i % 16 == 15 || i == bytes.len() - 1 {
            println!();
        }
    }
}

fn print_context(context: &CpuContext) {
    let arch = context.arch();
    for reg in 0..register_count(arch) {
        let name = dwarf_reg_to_name(arch, reg).unwrap_or("?");
        match context.register(reg) {
            Some(value) => println!("  {name:<4} = 0x{value:016x}"),
            None => println!("  {name:<4} = <unavailable>"),
        }
    }
}
