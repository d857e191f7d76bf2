//! `Arch` implementations for 32- and 64-bit x86, plugged into
//! `ropcraft-core` as the concrete external collaborator spec.md's §1
//! leaves out. Register ids are the canonical AMD64 GPR encoding order
//! (0=A, 1=C, 2=D, 3=B, 4=SP, 5=BP, 6=SI, 7=DI, 8..15=R8..R15); `X86` only
//! ever uses the first eight.

use ropcraft_core::arch::{Abi, Arch, RegId, System};
use ropcraft_core::error::{Error, Result};

pub const REG_PC: RegId = 16;

const REG_NAMES_64: [&str; 16] =
	["rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15"];
const REG_NAMES_32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

/// Reverse of `reg_name`, for the textual intent language (`ropcraft-cli`'s
/// parser): `bits` selects the 32- or 64-bit name table.
pub fn reg_by_name(bits: u32, name: &str) -> Option<RegId> {
	let table: &[&str] = if bits == 64 { &REG_NAMES_64 } else { &REG_NAMES_32 };
	table.iter().position(|&n| n == name).map(|i| i as RegId)
}

/// 32-bit x86 (protected mode, no REX registers).
pub struct X86;

impl Arch for X86 {
	fn word_size(&self) -> usize {
		4
	}
	fn sp(&self) -> RegId {
		4
	}
	fn pc(&self) -> RegId {
		REG_PC
	}
	fn nb_regs(&self) -> usize {
		8
	}
	fn reg_name(&self, reg: RegId) -> &str {
		REG_NAMES_32.get(reg as usize).copied().unwrap_or("?")
	}
	fn abi_arg_regs(&self, abi: Abi) -> Result<Vec<RegId>> {
		match abi {
			// cdecl/stdcall pass every argument on the stack; the compiler's
			// `Stmt::Call` seeding spills them itself, no registers to set.
			Abi::X86Cdecl | Abi::X86Stdcall => Ok(vec![]),
			_ => Err(Error::UnsupportedAbi(abi)),
		}
	}
	fn syscall_regs(&self, system: System) -> Result<(RegId, Vec<RegId>)> {
		match system {
			// int 0x80, Linux: eax = number, ebx/ecx/edx/esi/edi/ebp = args.
			System::Linux => Ok((0, vec![3, 1, 2, 6, 7, 5])),
			System::None => Err(Error::UnsupportedAbi(Abi::None)),
		}
	}
}

/// 64-bit x86 (long mode).
pub struct X64;

impl Arch for X64 {
	fn word_size(&self) -> usize {
		8
	}
	fn sp(&self) -> RegId {
		4
	}
	fn pc(&self) -> RegId {
		REG_PC
	}
	fn nb_regs(&self) -> usize {
		16
	}
	fn reg_name(&self, reg: RegId) -> &str {
		REG_NAMES_64.get(reg as usize).copied().unwrap_or("?")
	}
	fn abi_arg_regs(&self, abi: Abi) -> Result<Vec<RegId>> {
		match abi {
			// rdi, rsi, rdx, rcx, r8, r9.
			Abi::X64SystemV => Ok(vec![7, 6, 2, 1, 8, 9]),
			// rdx, rcx, r8, r9 (external-interface order; see DESIGN.md).
			Abi::X64Ms => Ok(vec![2, 1, 8, 9]),
			_ => Err(Error::UnsupportedAbi(abi)),
		}
	}
	fn syscall_regs(&self, system: System) -> Result<(RegId, Vec<RegId>)> {
		match system {
			// syscall, Linux: rax = number, rdi/rsi/rdx/r10/r8/r9 = args.
			System::Linux => Ok((0, vec![7, 6, 2, 10, 8, 9])),
			System::None => Err(Error::UnsupportedAbi(Abi::None)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn x64_system_v_args_are_rdi_rsi_rdx_rcx_r8_r9() {
		let regs = X64.abi_arg_regs(Abi::X64SystemV).unwrap();
		assert_eq!(regs, vec![7, 6, 2, 1, 8, 9]);
	}

	#[test]
	fn x86_cdecl_has_no_argument_registers() {
		assert_eq!(X86.abi_arg_regs(Abi::X86Cdecl).unwrap(), Vec::<RegId>::new());
	}

	#[test]
	fn x64_callee_does_not_clean_args() {
		assert!(!X64.callee_cleans_args(Abi::X64SystemV));
	}
}
