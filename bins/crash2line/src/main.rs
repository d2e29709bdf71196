//! crash2line: addr2line for crash snapshots
//!
//! For each PC given on the command line, resolves the enclosing function,
//! source file and line from the executable's DWARF, and — when a crash
//! context is supplied — the runtime values of parameters and locals plus
//! the frame's CFA.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tracing::debug;

use crashscope_dwarf::frames::FrameRegisterRule;
use crashscope_dwarf::{CrashAnalyzer, QueryOptions, SnapshotSource, VariableReport};
use crashscope_minidump::{CpuContext, DwfcFile, Minidump};
use crashscope_platform::Arch;

#[derive(Parser)]
#[command(name = "crash2line")]
#[command(about = "Resolve crash addresses to functions, lines and variable values")]
struct Cli {
    /// Input executable with debug info
    #[arg(short = 'e', long = "exe", value_name = "PATH")]
    exe: Option<PathBuf>,

    /// Crash context: a minidump or a DWFC context file.
    /// Implies --locals and --params.
    #[arg(short = 'c', long = "context", value_name = "PATH")]
    context: Option<PathBuf>,

    /// Show function names
    #[arg(short = 'f', long = "functions")]
    functions: bool,

    /// Demangle function names
    #[arg(short = 'C', long = "demangle")]
    demangle: bool,

    /// Show local variables
    #[arg(short = 'l', long = "locals")]
    locals: bool,

    /// Show function parameters
    #[arg(short = 'p', long = "params")]
    params: bool,

    /// Show call frame information
    #[arg(short = 'F', long = "frames")]
    frames: bool,

    /// Show debug logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Hex addresses to resolve
    #[arg(value_name = "ADDRESS")]
    addresses: Vec<String>,
}

/// Where registers and memory come from: a real snapshot or the synthetic
/// per-frame capture. Queries read the crashed thread (minidump) or frame 0
/// of the first thread (DWFC).
enum ContextSource {
    Minidump(Minidump),
    Dwfc(DwfcFile),
}

impl ContextSource {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("cannot read context file {}", path.display()))?;
        match data.get(0..4) {
            Some(magic) if magic == b"MDMP" => Ok(Self::Minidump(Minidump::read(data)?)),
            Some(magic) if magic == b"DWFC" => Ok(Self::Dwfc(DwfcFile::read(&data)?)),
            _ => anyhow::bail!("unrecognized context file format: {}", path.display()),
        }
    }

    fn cpu_context(&self) -> Option<&CpuContext> {
        match self {
            Self::Minidump(dump) => dump
                .crash_context()
                .or_else(|| dump.threads().first().and_then(|t| dump.context(t.thread_id))),
            Self::Dwfc(_) => None,
        }
    }

    fn arch(&self) -> Arch {
        match self {
            Self::Minidump(_) => self.cpu_context().map(|c| c.arch()).unwrap_or(Arch::Arm64),
            // The DWFC header only distinguishes word size.
            Self::Dwfc(file) => {
                if file.arch == 0 {
                    Arch::Arm
                } else {
                    Arch::Arm64
                }
            }
        }
    }

    fn register_columns(&self) -> u16 {
        match self {
            Self::Minidump(_) => crashscope_platform::register_count(self.arch()),
            Self::Dwfc(file) => file
                .first_frame()
                .map(|f| f.regs.len() as u16)
                .unwrap_or_else(|| crashscope_platform::register_count(self.arch())),
        }
    }
}

impl SnapshotSource for ContextSource {
    fn register(&self, reg: u16) -> Option<u64> {
        match self {
            Self::Minidump(_) => self.cpu_context()?.register(reg),
            Self::Dwfc(file) => file.first_frame()?.register(reg),
        }
    }

    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        match self {
            Self::Minidump(dump) => dump.memory(addr, len),
            Self::Dwfc(file) => file.first_frame()?.memory(addr, len),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(exe) = cli.exe.as_deref() else {
        eprintln!("Error: missing the input `-e` arg.");
        return ExitCode::from(255);
    };
    if cli.addresses.is_empty() {
        eprintln!("Error: missing address arg.");
        return ExitCode::from(255);
    }

    let mut addresses = Vec::with_capacity(cli.addresses.len());
    for text in &cli.addresses {
        let hex = text.trim_start_matches("0x");
        match u64::from_str_radix(hex, 16) {
            Ok(addr) => addresses.push(addr),
            Err(_) => {
                eprintln!("Error: bad address `{text}`.");
                return ExitCode::from(255);
            }
        }
    }

    match run(&cli, exe, &addresses) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, exe: &Path, addresses: &[u64]) -> anyhow::Result<()> {
    let analyzer = CrashAnalyzer::load(exe)?;

    let source = match cli.context.as_deref() {
        Some(path) => {
            let source = ContextSource::load(path)?;
            debug!("loaded crash context from {}", path.display());
            if cli.verbose {
                if let ContextSource::Dwfc(file) = &source {
                    print!("{}", file.dump());
                }
            }
            Some(source)
        }
        None => None,
    };

    // A context implies evaluating everything it makes recoverable.
    let options = QueryOptions {
        functions: cli.functions,
        demangle: cli.demangle,
        locals: cli.locals || source.is_some(),
        params: cli.params || source.is_some(),
        frames: cli.frames,
    };

    for &address in addresses {
        let snapshot = source.as_ref().map(|s| s as &dyn SnapshotSource);
        let Some(report) = analyzer.resolve(address, &options, snapshot)? else {
            println!("Not found.");
            continue;
        };

        if let Some(function) = &report.function {
            println!("{}", function.name);
            if cli.verbose {
                if let (Some(file), Some(line)) = (&function.decl_file, function.decl_line) {
                    debug!(
                        "{} declared at {}:{}, pc range [0x{:x} - 0x{:x}]",
                        function.name,
                        file,
                        line,
                        function.low_pc,
                        function.high_pc.unwrap_or(0)
                    );
                }
            }
        }
        match &report.source {
            Some(location) => println!("{location}"),
            None => println!("?:?"),
        }

        if options.params {
            println!("params:");
            for var in &report.params {
                print_var(var, cli.verbose);
            }
        }
        if options.locals {
            println!("locals:");
            for var in &report.locals {
                print_var(var, cli.verbose);
            }
        }

        if cli.frames {
            print_frame_info(cli, &analyzer, source.as_ref(), &report.cfa, address);
        }
    }
    Ok(())
}

fn print_var(var: &VariableReport, verbose: bool) {
    if verbose {
        if let Some(location) = &var.location {
            debug!("{}: location {}", var.name, location);
        }
    }
    let mut value = var.value.clone().unwrap_or_else(|| "..".to_string());
    if verbose {
        if let Some(decoded) = &var.decoded {
            value.push_str(&format!(" ({decoded})"));
        }
    }
    match var.size {
        Some(size) => println!("  {} {} ({} bytes) = {}", var.type_name, var.name, size, value),
        None => println!("  {} {} (? bytes) = {}", var.type_name, var.name, value),
    }
}

fn print_frame_info(
    cli: &Cli,
    analyzer: &CrashAnalyzer,
    source: Option<&ContextSource>,
    cfa: &Option<u64>,
    address: u64,
) {
    match cfa {
        Some(cfa) => println!("cfa: 0x{cfa:x}"),
        None => println!("cfa: unknown"),
    }
    let Some(source) = source else {
        return;
    };

    let arch = source.arch();
    let columns = source.register_columns();
    let frames = analyzer.frames();

    // Recovered register values at the query PC.
    if let Some(cfa) = cfa {
        let reg_fn = |reg: u16| source.register(reg);
        let mem_fn = |addr: u64, len: usize| source.memory(addr, len);
        let ctx = crashscope_dwarf::EvalContext {
            registers: Some(&reg_fn),
            memory: Some(&mem_fn),
            ..Default::default()
        };
        if let Some(row) = frames.row_for_pc(address, &(0..columns).collect::<Vec<_>>()) {
            for (column, rule) in &row.registers {
                if let Some(value) =
                    crashscope_dwarf::frames::apply_register_rule(rule, *cfa, &ctx, address)
                {
                    println!(
                        "  {} = 0x{:x}",
                        crashscope_platform::register_mapping::column_name(arch, *column),
                        value
                    );
                }
            }
        }
    }

    // Row-by-row rule table for the covering FDE.
    if cli.verbose {
        for row in frames.rows_for_pc(address, &(0..columns).collect::<Vec<_>>()) {
            let mut line = format!("  [0x{:x} - 0x{:x}) cfa={}", row.start, row.end, row.cfa);
            for (column, rule) in &row.registers {
                if matches!(rule, FrameRegisterRule::Undefined) {
                    continue;
                }
                line.push_str(&format!(
                    " {}={}",
                    crashscope_platform::register_mapping::column_name(arch, *column),
                    rule
                ));
            }
            println!("{line}");
        }
    }

    // Backtrace from the captured registers.
    let mut registers = std::collections::HashMap::new();
    for column in 0..columns {
        if let Some(value) = source.register(column) {
            registers.insert(column, value);
        }
    }
    let mem_fn = |addr: u64, len: usize| source.memory(addr, len);
    let walked = frames.walk_stack(
        address,
        &registers,
        Some(&mem_fn),
        crashscope_platform::sp_register(arch),
        columns,
    );
    if !walked.is_empty() {
        println!("backtrace:");
        for (depth, frame) in walked.iter().enumerate() {
            println!("  #{depth:<2} pc=0x{:x} cfa=0x{:x}", frame.pc, frame.cfa);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
