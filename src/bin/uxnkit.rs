//! The `uxnkit` command-line interface.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uxnkit_asm::symtab::{self, DebugSymKind};
use uxnkit_asm::{assemble, read_sym_file, write_sym_file, FsVfs, Output, Report, Severity};
use uxnkit_chess as chess;
use uxnkit_vm::{op, NullDevice, Reset, Vm, BANK_SIZE, RESET_VECTOR};

#[derive(Parser)]
#[command(name = "uxnkit", version, about = "Toolchain for the uxn stack machine")]
enum Uxnkit {
    /// Assemble a source file into a ROM image.
    ///
    /// Alongside the ROM, writes `<out>.sym` (address-prefixed label
    /// names) and `<out>.dbg` (debug symbol table) unless suppressed.
    Asm(AsmCommand),
    /// Execute a ROM image and exit with its exit state.
    Run(RunCommand),
    /// Print a listing of a ROM image.
    ///
    /// Uses the `.sym` and `.dbg` side files, when present, to name
    /// labels and to tell code from data.
    Objdump(ObjdumpCommand),
}

#[derive(Parser)]
struct AsmCommand {
    /// Source file to assemble.
    input: PathBuf,
    /// Output ROM path.
    output: PathBuf,
    /// Verify stack-effect annotations after assembling.
    #[arg(long)]
    check: bool,
    /// Skip the `.sym` side file.
    #[arg(long)]
    no_sym: bool,
    /// Skip the `.dbg` debug symbol table.
    #[arg(long)]
    no_dbg: bool,
}

#[derive(Parser)]
struct RunCommand {
    /// ROM image to execute.
    rom: PathBuf,
}

#[derive(Parser)]
struct ObjdumpCommand {
    /// ROM image to list.
    rom: PathBuf,
}

fn main() {
    env_logger::init();
    let exit_code = match Uxnkit::parse() {
        Uxnkit::Asm(cmd) => match cmd.execute() {
            Ok(ok) => {
                if ok {
                    0
                } else {
                    1
                }
            }
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
        Uxnkit::Run(cmd) => match cmd.execute() {
            Ok(code) => code as i32,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
        Uxnkit::Objdump(cmd) => match cmd.execute() {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
    };
    std::process::exit(exit_code);
}

fn print_report(severity: Severity, report: &Report) {
    let label = match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    match &report.region {
        Some(region) => eprintln!("{label}: {}: {}", region, report.message),
        None => eprintln!("{label}: {}", report.message),
    }
    if let (Some(message), Some(region)) = (&report.related_message, &report.related_region) {
        eprintln!("  note: {region}: {message}");
    }
}

/// Prints checker reports as they stream in.
struct ReportPrinter;

impl chess::Host for ReportPrinter {
    fn report(&mut self, trace_id: chess::TraceId, severity: Severity, report: &Report) {
        if trace_id != chess::NO_TRACE {
            log::debug!("trace {trace_id}: {}", report.message);
        }
        print_report(severity, report);
    }

    fn begin_trace(&mut self, trace_id: chess::TraceId, parent_id: chess::TraceId) {
        log::debug!("trace {trace_id} started (parent {parent_id})");
    }

    fn end_trace(&mut self, trace_id: chess::TraceId, success: bool) {
        log::debug!("trace {trace_id} ended (success: {success})");
    }
}

impl AsmCommand {
    fn execute(&self) -> Result<bool> {
        let root = self
            .input
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let filename = self
            .input
            .file_name()
            .context("input path has no file name")?
            .to_string_lossy()
            .into_owned();

        let mut vfs = FsVfs::new(root);
        let mut output = Output::default();
        let ok = assemble(&mut vfs, &mut output, &filename);

        for (severity, report) in &output.reports {
            print_report(*severity, report);
        }
        if !ok {
            return Ok(false);
        }

        let rom = output.rom();
        std::fs::write(&self.output, rom)
            .with_context(|| format!("could not write {}", self.output.display()))?;
        log::info!(
            "assembled {} in {} bytes, {} labels, {} macros",
            self.output.display(),
            rom.len(),
            output.num_labels,
            output.num_macros,
        );

        if !self.no_sym {
            let path = side_file(&self.output, "sym");
            let mut file = BufWriter::new(
                File::create(&path)
                    .with_context(|| format!("could not write {}", path.display()))?,
            );
            write_sym_file(&mut file, &output.labels)?;
            file.flush()?;
        }

        if !self.no_dbg {
            let path = side_file(&self.output, "dbg");
            let mut file = BufWriter::new(
                File::create(&path)
                    .with_context(|| format!("could not write {}", path.display()))?,
            );
            let debug = std::mem::take(&mut output.debug).finish();
            uxnkit_asm::symtab::write_symtab(&mut file, &debug)
                .with_context(|| format!("could not write {}", path.display()))?;
            file.flush()?;
        }

        if self.check {
            let ok = chess::check(&output.symbols, output.rom(), &mut ReportPrinter);
            return Ok(ok);
        }

        Ok(true)
    }
}

fn side_file(rom_path: &Path, extension: &str) -> PathBuf {
    let mut name = rom_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    rom_path.with_file_name(name)
}

impl ObjdumpCommand {
    fn execute(&self) -> Result<()> {
        let rom = std::fs::read(&self.rom)
            .with_context(|| format!("could not read {}", self.rom.display()))?;

        let mut labels: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        if let Ok(bytes) = std::fs::read(side_file(&self.rom, "sym")) {
            for (addr, name) in read_sym_file(&bytes)? {
                labels.entry(addr).or_default().push(name);
            }
        }

        // Addresses the assembler recorded as instructions
        let mut is_code = vec![false; 0x10000];
        if let Ok(file) = File::open(side_file(&self.rom, "dbg")) {
            let mut reader = std::io::BufReader::new(file);
            for sym in symtab::read_symtab(&mut reader)? {
                if sym.kind == DebugSymKind::Opcode {
                    for addr in sym.addr_min..=sym.addr_max {
                        is_code[addr as usize] = true;
                    }
                }
            }
        }

        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        let mut addr = RESET_VECTOR;
        for &byte in &rom {
            for name in labels.get(&addr).into_iter().flatten() {
                writeln!(out, "@{name}")?;
            }
            if is_code[addr as usize] {
                writeln!(out, "  0x{addr:04x}  {byte:02x}  {}", op::name(byte))?;
            } else {
                writeln!(out, "  0x{addr:04x}  {byte:02x}")?;
            }
            addr = addr.wrapping_add(1);
        }
        out.flush()?;
        Ok(())
    }
}

impl RunCommand {
    fn execute(&self) -> Result<u8> {
        let rom = std::fs::read(&self.rom)
            .with_context(|| format!("could not read {}", self.rom.display()))?;
        if rom.len() > uxnkit_asm::MAX_ROM_SIZE {
            bail!("ROM is larger than addressable memory");
        }

        let mut vm = Vm::new(BANK_SIZE);
        vm.reset(Reset::ALL);
        vm.load_rom(&rom);
        vm.execute(&mut NullDevice, RESET_VECTOR);
        Ok(vm.exit_code().unwrap_or(0))
    }
}
