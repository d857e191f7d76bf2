//! Command-line front end: `scan` extracts raw gadget candidates from a
//! binary into a gadget file, `compile` parses an intent program against a
//! gadget file (or a binary scanned on the fly) and prints a ROP chain.

mod error;
mod gadgets_file;
mod parser;

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use colored::Colorize;
use error::CliError;
use regex::Regex;
use ropcraft_core::arch::{Abi, Arch, System};
use ropcraft_core::constraint::{Constraint, GadgetFilter, MemSafety};
use ropcraft_core::expr::ExprArena;
use ropcraft_core::{CompilerTask, Error as CoreError, GadgetDb};
use ropcraft_x86::{X64, X86};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[clap(version)]
struct Opt {
	/// Emit tracing output on stderr (`-v` debug, `-vv` trace).
	#[clap(short, long, action = clap::ArgAction::Count)]
	verbose: u8,

	#[clap(subcommand)]
	command: Command,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum ArchName {
	X86,
	X64,
}

impl ArchName {
	fn arch(self) -> &'static dyn Arch {
		match self {
			ArchName::X86 => &X86,
			ArchName::X64 => &X64,
		}
	}
}

#[derive(Subcommand)]
enum Command {
	/// Scan a binary for raw ROP/JOP/syscall gadget candidates.
	Scan {
		binary: PathBuf,
		#[clap(long, value_enum, default_value = "x64")]
		arch: ArchName,
		/// Maximum number of instructions in a gadget.
		#[clap(short, long, default_value = "6")]
		max_instr: usize,
		/// Removes normal "ROP Gadgets" (plain `ret` tails).
		#[clap(short = 'r', long)]
		norop: bool,
		/// Removes syscall/int80 tails.
		#[clap(short = 's', long)]
		nosys: bool,
		/// Removes indirect-jump ("JOP") tails.
		#[clap(short = 'j', long)]
		nojop: bool,
		/// Skip the `.return_sites` kernel-return-thunk patch.
		#[clap(long)]
		no_patch_rets: bool,
		/// Write `HEXADDR$BYTES` lines here instead of stdout.
		#[clap(short, long)]
		output: Option<PathBuf>,
		/// Classify gadgets and print `addr: asm  ; GadgetType` lines to
		/// stdout instead of writing a raw gadget file.
		#[clap(long)]
		list: bool,
		/// With `--list`, keep only gadgets whose asm text matches this regex.
		#[clap(short = 'R', long, requires = "list")]
		include: Option<String>,
		/// With `--list`, drop gadgets whose asm text matches this regex.
		#[clap(short = 'N', long, requires = "list")]
		exclude: Option<String>,
	},
	/// Compile an intent program into a ROP chain.
	Compile {
		/// Gadget file in `HEXADDR$BYTES` form, as produced by `scan`.
		#[clap(long)]
		gadgets: PathBuf,
		/// Intent-language source file.
		intent: PathBuf,
		#[clap(long, value_enum, default_value = "x64")]
		arch: ArchName,
		#[clap(long, value_enum, default_value = "system-v")]
		abi: AbiName,
		#[clap(long, value_enum, default_value = "linux")]
		system: SystemName,
		/// Byte values forbidden in any emitted chain word, e.g. `00,0a`.
		#[clap(long, value_delimiter = ',')]
		bad_bytes: Vec<String>,
		/// Registers whose final value must not change, by name.
		#[clap(long, value_delimiter = ',')]
		keep_regs: Vec<String>,
		/// Reject gadgets that dereference a register outside `keep_regs`.
		#[clap(long)]
		mem_safety: bool,
		#[clap(long)]
		stack_pivot_only: bool,
		#[clap(long)]
		base_pivot_only: bool,
		#[clap(long)]
		max_gadget_instr: Option<u32>,
		#[clap(long, default_value = "3000")]
		try_budget: u32,
		#[clap(long, value_enum, default_value = "pretty")]
		format: OutputFormat,
		#[clap(short, long)]
		output: Option<PathBuf>,
		/// Forces pretty-mode colour on/off; default auto-detects a tty.
		#[clap(short, long)]
		colour: Option<bool>,
	},
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum AbiName {
	None,
	X86Cdecl,
	X86Stdcall,
	SystemV,
	Ms,
}

impl From<AbiName> for Abi {
	fn from(a: AbiName) -> Abi {
		match a {
			AbiName::None => Abi::None,
			AbiName::X86Cdecl => Abi::X86Cdecl,
			AbiName::X86Stdcall => Abi::X86Stdcall,
			AbiName::SystemV => Abi::X64SystemV,
			AbiName::Ms => Abi::X64Ms,
		}
	}
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum SystemName {
	None,
	Linux,
}

impl From<SystemName> for System {
	fn from(s: SystemName) -> System {
		match s {
			SystemName::None => System::None,
			SystemName::Linux => System::Linux,
		}
	}
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum OutputFormat {
	Pretty,
	Python,
	Binary,
}

fn main() -> ExitCode {
	let opt = Opt::parse();
	let level = match opt.verbose {
		0 => tracing::Level::WARN,
		1 => tracing::Level::DEBUG,
		_ => tracing::Level::TRACE,
	};
	tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

	match run(opt.command) {
		Ok(code) => code,
		Err(err) => {
			eprintln!("error: {err}");
			ExitCode::from(2)
		}
	}
}

fn run(command: Command) -> error::Result<ExitCode> {
	match command {
		Command::Scan { binary, arch, max_instr, norop, nosys, nojop, no_patch_rets, output, list, include, exclude } => {
			run_scan(binary, arch, max_instr, !norop, !nosys, !nojop, !no_patch_rets, output, list, include, exclude)
		}
		Command::Compile {
			gadgets,
			intent,
			arch,
			abi,
			system,
			bad_bytes,
			keep_regs,
			mem_safety,
			stack_pivot_only,
			base_pivot_only,
			max_gadget_instr,
			try_budget,
			format,
			output,
			colour,
		} => {
			if let Some(c) = colour {
				colored::control::set_override(c);
			}
			run_compile(gadgets, intent, arch, abi.into(), system.into(), bad_bytes, keep_regs, mem_safety, stack_pivot_only, base_pivot_only, max_gadget_instr, try_budget, format, output)
		}
	}
}

#[allow(clippy::too_many_arguments)]
fn run_scan(
	binary: PathBuf,
	arch_name: ArchName,
	max_instr: usize,
	rop: bool,
	sys: bool,
	jop: bool,
	patch_rets: bool,
	output: Option<PathBuf>,
	list: bool,
	include: Option<String>,
	exclude: Option<String>,
) -> error::Result<ExitCode> {
	let mut bin = ropcraft_x86::binary::Binary::new(&binary)?;
	if patch_rets {
		bin.apply_returnsites()?;
	}
	let raws = ropcraft_x86::binary::find_raw_gadgets(&bin, max_instr, rop, sys, jop)?;

	if list {
		let arch = arch_name.arch();
		let bits = arch.bits();
		let mut db = GadgetDb::new();
		let mut arena = ExprArena::new();
		let disasm = |addr: u64, bytes: &[u8]| ropcraft_x86::disasm::disasm(addr, bytes, bits);
		let asm = |addr: u64, bytes: &[u8]| ropcraft_x86::disasm::asm_str(addr, bytes, bits);
		db.analyse_raw_gadgets(arch, &mut arena, &raws, &disasm, &asm);

		let include = include.map(|p| Regex::new(&p)).transpose()?;
		let exclude = exclude.map(|p| Regex::new(&p)).transpose()?;
		let mut gadgets: Vec<_> = db.all.iter().collect();
		gadgets.sort_by_key(|g| g.addresses[0]);
		let mut out = std::io::stdout();
		let mut shown = 0usize;
		for g in &gadgets {
			if include.as_ref().is_some_and(|re| !re.is_match(&g.asm_str)) {
				continue;
			}
			if exclude.as_ref().is_some_and(|re| re.is_match(&g.asm_str)) {
				continue;
			}
			let line = format!("{:#x}: {}  ; {:?} sp+={:#x}", g.addresses[0], g.asm_str, g.branch_type, g.sp_inc);
			writeln!(out, "{}", if line.starts_with("0x") { colourize_addresses(&line).trim_end().to_string() } else { line })?;
			shown += 1;
		}
		eprintln!("==> {shown} of {} classified gadgets", gadgets.len());
		return Ok(ExitCode::SUCCESS);
	}

	match &output {
		Some(path) => gadgets_file::write(path, &raws)?,
		None => {
			let mut out = std::io::stdout();
			for (addr, bytes) in &raws {
				writeln!(out, "{addr:x}${}", hex_encode(bytes))?;
			}
		}
	}
	eprintln!("==> found {} gadget candidates", raws.len());
	Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
fn run_compile(
	gadgets_path: PathBuf,
	intent_path: PathBuf,
	arch_name: ArchName,
	abi: Abi,
	system: System,
	bad_bytes: Vec<String>,
	keep_regs: Vec<String>,
	mem_safety: bool,
	stack_pivot_only: bool,
	base_pivot_only: bool,
	max_gadget_instr: Option<u32>,
	try_budget: u32,
	format: OutputFormat,
	output: Option<PathBuf>,
) -> error::Result<ExitCode> {
	let arch = arch_name.arch();
	let bits = arch.bits();

	let raws = gadgets_file::read(&gadgets_path)?;
	if raws.is_empty() {
		eprintln!("error: no gadget candidates in {}", gadgets_path.display());
		return Ok(ExitCode::from(3));
	}

	let mut db = GadgetDb::new();
	let mut arena = ExprArena::new();
	let disasm = |addr: u64, bytes: &[u8]| ropcraft_x86::disasm::disasm(addr, bytes, bits);
	let asm = |addr: u64, bytes: &[u8]| ropcraft_x86::disasm::asm_str(addr, bytes, bits);
	db.analyse_raw_gadgets(arch, &mut arena, &raws, &disasm, &asm);

	let bad_bytes = bad_bytes
		.iter()
		.map(|s| u8::from_str_radix(s.trim().trim_start_matches("0x"), 16))
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|e| CliError::BadGadgetLine(0, format!("bad --bad-bytes value: {e}")))?;
	let keep_regs = keep_regs
		.iter()
		.map(|s| ropcraft_x86::reg_by_name(bits, s.trim()).ok_or_else(|| CliError::BadGadgetLine(0, format!("unknown register '{s}'"))))
		.collect::<std::result::Result<Vec<_>, _>>()?;

	let mut constraint = Constraint::new().with_bad_bytes(bad_bytes).with_keep_regs(keep_regs);
	if mem_safety {
		constraint = constraint.with_mem_safety(MemSafety::KeepRegs);
	}
	if stack_pivot_only {
		constraint = constraint.with_filter(GadgetFilter::StackPivotOnly);
	}
	if base_pivot_only {
		constraint = constraint.with_filter(GadgetFilter::BasePivotOnly);
	}
	if let Some(max) = max_gadget_instr {
		constraint = constraint.with_filter(GadgetFilter::MaxInstrCount(max));
	}

	let source = fs::read_to_string(&intent_path)?;
	let intent_parser = parser::Parser::new(bits, abi, system);
	let program = match intent_parser.parse(&intent_path.display().to_string(), &source) {
		Ok(p) => p,
		Err(CliError::Parse { path, line, message }) => {
			eprintln!("{path}:{line}: {message}");
			return Ok(ExitCode::from(2));
		}
		Err(other) => return Err(other),
	};

	let mut task = CompilerTask::new(&db, arch, constraint).with_try_budget(try_budget);
	let chain = match task.compile_program(&program) {
		Ok(chain) => chain,
		Err(CoreError::NoChain) | Err(CoreError::Cancelled) => {
			eprintln!("no chain found");
			return Ok(ExitCode::from(1));
		}
		Err(CoreError::IlSemantic(msg)) | Err(CoreError::Unbound(msg)) => {
			eprintln!("error: {msg}");
			return Ok(ExitCode::from(2));
		}
		Err(other) => return Err(other.into()),
	};

	let rendered = match format {
		OutputFormat::Pretty => colourize_addresses(&chain.to_pretty(arch)).into_bytes(),
		OutputFormat::Python => chain.to_python(arch).into_bytes(),
		OutputFormat::Binary => chain.to_binary(arch),
	};
	match output {
		Some(path) => fs::write(path, rendered)?,
		None => std::io::stdout().write_all(&rendered)?,
	}
	Ok(ExitCode::SUCCESS)
}

fn hex_encode(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Highlights each line's leading chain address; `colored` no-ops when
/// output isn't a tty and `--colour` wasn't forced.
fn colourize_addresses(pretty: &str) -> String {
	let addr_re = Regex::new(r"^(0x[0-9a-f]+)").unwrap();
	pretty.lines().map(|line| addr_re.replace(line, |c: &regex::Captures| c[1].cyan().to_string()).into_owned()).collect::<Vec<_>>().join("\n") + "\n"
}
