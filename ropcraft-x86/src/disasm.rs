//! `disasm(addr, bytes) -> IRBlock`: lifts a straight-line x86/x86-64
//! instruction sequence into the three-address IR `ropcraft-core::ir`
//! executes. Only `FlowControl::Next` instructions may appear before the
//! final one (the scanner in `binary.rs` never hands this function
//! anything else, mirroring `ropr::rules::is_rop_gadget_head`), and the
//! final instruction must be one of the recognised gadget tails.
//!
//! Memory operands are restricted to `base [+ disp]` — no scaled index, no
//! RIP-relative, no segment override — since the classifier in
//! `ropcraft-core::gadget` only understands that shape (`split_base_offset`).
//! Unsupported instructions or operand shapes simply return `None`: a
//! recoverable "can't lift this one" per the error-handling policy, not a
//! panic.

use iced_x86::{Code, Decoder, DecoderOptions, Formatter, Instruction, Mnemonic, OpKind, Register};
use ropcraft_core::ir::{BasicBlock, IRBlock, Instr, Op, Operand};

fn reg_info(reg: Register) -> Option<(u16, u32, bool)> {
	use Register::*;
	let (id, size) = match reg {
		RAX => (0, 64),
		EAX => (0, 32),
		AX => (0, 16),
		AL => (0, 8),
		AH => return Some((0, 8, true)),
		RCX => (1, 64),
		ECX => (1, 32),
		CX => (1, 16),
		CL => (1, 8),
		CH => return Some((1, 8, true)),
		RDX => (2, 64),
		EDX => (2, 32),
		DX => (2, 16),
		DL => (2, 8),
		DH => return Some((2, 8, true)),
		RBX => (3, 64),
		EBX => (3, 32),
		BX => (3, 16),
		BL => (3, 8),
		BH => return Some((3, 8, true)),
		RSP => (4, 64),
		ESP => (4, 32),
		SP => (4, 16),
		SPL => (4, 8),
		RBP => (5, 64),
		EBP => (5, 32),
		BP => (5, 16),
		BPL => (5, 8),
		RSI => (6, 64),
		ESI => (6, 32),
		SI => (6, 16),
		SIL => (6, 8),
		RDI => (7, 64),
		EDI => (7, 32),
		DI => (7, 16),
		DIL => (7, 8),
		R8 => (8, 64),
		R8D => (8, 32),
		R8W => (8, 16),
		R8L => (8, 8),
		R9 => (9, 64),
		R9D => (9, 32),
		R9W => (9, 16),
		R9L => (9, 8),
		R10 => (10, 64),
		R10D => (10, 32),
		R10W => (10, 16),
		R10L => (10, 8),
		R11 => (11, 64),
		R11D => (11, 32),
		R11W => (11, 16),
		R11L => (11, 8),
		R12 => (12, 64),
		R12D => (12, 32),
		R12W => (12, 16),
		R12L => (12, 8),
		R13 => (13, 64),
		R13D => (13, 32),
		R13W => (13, 16),
		R13L => (13, 8),
		R14 => (14, 64),
		R14D => (14, 32),
		R14W => (14, 16),
		R14L => (14, 8),
		R15 => (15, 64),
		R15D => (15, 32),
		R15W => (15, 16),
		R15L => (15, 8),
		_ => return Option::None,
	};
	Some((id, size, false))
}

/// A GP register read/written at its natural width (the width implied by
/// the mnemonic's own operand, e.g. `AL` is 8 bits even in 64-bit mode).
fn reg_operand(reg: Register) -> Option<Operand> {
	let (id, size, high8) = reg_info(reg)?;
	if high8 {
		Some(Operand::reg_slice(id, 15, 8))
	} else {
		Some(Operand::reg_slice(id, size - 1, 0))
	}
}

fn reg_id_width(reg: Register) -> Option<(u16, u32)> {
	let (id, size, _) = reg_info(reg)?;
	Some((id, size))
}

struct Lifter<'a> {
	bb: &'a mut BasicBlock,
	bits: u32,
	tmp_id: u32,
	deref: u64,
}

impl<'a> Lifter<'a> {
	fn fresh_tmp(&mut self, width: u32) -> Operand {
		let id = self.tmp_id;
		self.tmp_id += 1;
		Operand::tmp(id, width)
	}

	fn push(&mut self, op: Op, dst: Operand, src1: Operand, src2: Operand) {
		self.bb.instrs.push(Instr { op, dst, src1, src2, addr: None });
	}

	/// `reg [+ disp]` only: no index register, no RIP-relative, no segment
	/// override. Returns the operand holding the computed address (the base
	/// register directly when `disp == 0`, otherwise a fresh `Add` result).
	fn compute_addr(&mut self, instr: &Instruction) -> Option<Operand> {
		if instr.memory_index() != Register::None {
			return None;
		}
		if instr.segment_prefix() != Register::None {
			return None;
		}
		let base = instr.memory_base();
		if base == Register::None || matches!(base, Register::RIP | Register::EIP) {
			return None;
		}
		let (id, width) = reg_id_width(base)?;
		if width != self.bits {
			return None;
		}
		self.deref |= 1u64 << id.min(63);
		let disp = instr.memory_displacement64() as i64;
		if disp == 0 {
			Some(Operand::reg(id, self.bits))
		} else {
			let t = self.fresh_tmp(self.bits);
			self.push(Op::Add, t, Operand::reg(id, self.bits), Operand::cst(disp as u64, self.bits));
			Some(t)
		}
	}

	/// Read operand `idx` as a value, materialising a memory load into a
	/// fresh temporary when it's a `Memory` operand. `width` is the width
	/// the caller expects the value at (normally operand 0's natural width).
	fn read_operand(&mut self, instr: &Instruction, idx: u32, width: u32) -> Option<Operand> {
		match instr.op_kind(idx) {
			OpKind::Register => reg_operand(instr.op_register(idx)),
			OpKind::Memory => {
				let addr = self.compute_addr(instr)?;
				let t = self.fresh_tmp(width);
				self.push(Op::Ldm, t, addr, Operand::none());
				Some(t)
			}
			OpKind::Immediate8
			| OpKind::Immediate16
			| OpKind::Immediate32
			| OpKind::Immediate64
			| OpKind::Immediate8to16
			| OpKind::Immediate8to32
			| OpKind::Immediate8to64
			| OpKind::Immediate32to64 => Some(Operand::cst(instr.immediate(idx), width)),
			_ => None,
		}
	}

	/// Commit `value` into GP register `id` at `[lo, lo+width)`. Writing a
	/// 32-bit sub-register in 64-bit mode zero-extends the upper half
	/// (unlike 8/16-bit writes, which preserve it) — modelled as an extra
	/// zeroing `Mov` before the real write, which `ir::execute`'s
	/// preserve-merge `assemble()` then folds correctly.
	fn commit(&mut self, id: u16, width: u32, lo: u32, value: Operand) {
		if lo == 0 && width == 32 && self.bits == 64 {
			self.push(Op::Mov, Operand::reg_slice(id, 63, 32), Operand::cst(0, 32), Operand::none());
		}
		self.push(Op::Mov, Operand::reg_slice(id, lo + width - 1, lo), value, Operand::none());
	}

	/// Store `value` (already read) to the memory operand, which must be
	/// operand 0 (every supported store mnemonic writes to op0).
	fn store(&mut self, instr: &Instruction, value: Operand) -> Option<()> {
		let addr = self.compute_addr(instr)?;
		self.push(Op::Stm, addr, value, Operand::none());
		Some(())
	}

	fn lift_mov(&mut self, instr: &Instruction) -> Option<()> {
		match instr.op0_kind() {
			OpKind::Register => {
				let (id, width, high8) = reg_info(instr.op0_register())?;
				let lo = if high8 { 8 } else { 0 };
				let value = self.read_operand(instr, 1, width)?;
				self.commit(id, width, lo, value);
				Some(())
			}
			OpKind::Memory => {
				// width is implied by the memory operand's own size, which
				// iced exposes via the source register/immediate instead;
				// fall back to the architecture width for `mov [mem], imm`.
				let width = match instr.op1_kind() {
					OpKind::Register => reg_info(instr.op1_register())?.1,
					_ => self.bits,
				};
				let value = self.read_operand(instr, 1, width)?;
				self.store(instr, value)
			}
			_ => None,
		}
	}

	fn lift_lea(&mut self, instr: &Instruction) -> Option<()> {
		let (id, width, high8) = reg_info(instr.op0_register())?;
		if high8 {
			return None;
		}
		let addr = self.compute_addr(instr)?;
		self.commit(id, width, 0, addr);
		Some(())
	}

	fn lift_push(&mut self, instr: &Instruction) -> Option<()> {
		let value = self.read_operand(instr, 0, self.bits)?;
		let sp = Operand::reg(4, self.bits);
		self.push(Op::Sub, sp, sp, Operand::cst((self.bits / 8) as u64, self.bits));
		self.push(Op::Stm, sp, value, Operand::none());
		Some(())
	}

	fn lift_pop(&mut self, instr: &Instruction) -> Option<()> {
		let (id, width, high8) = reg_info(instr.op0_register())?;
		if high8 {
			return None;
		}
		let sp = Operand::reg(4, self.bits);
		let t = self.fresh_tmp(self.bits);
		self.push(Op::Ldm, t, sp, Operand::none());
		self.commit(id, width, 0, t);
		self.push(Op::Add, sp, sp, Operand::cst((self.bits / 8) as u64, self.bits));
		Some(())
	}

	fn lift_binop(&mut self, instr: &Instruction, op: Op) -> Option<()> {
		let (id, width, high8) = reg_info(instr.op0_register())?;
		let lo = if high8 { 8 } else { 0 };
		let a = reg_operand(instr.op0_register())?;
		let b = self.read_operand(instr, 1, width)?;
		let t = self.fresh_tmp(width);
		self.push(op, t, a, b);
		self.commit(id, width, lo, t);
		Some(())
	}

	fn lift_unop(&mut self, instr: &Instruction, op: Op) -> Option<()> {
		let (id, width, high8) = reg_info(instr.op0_register())?;
		let lo = if high8 { 8 } else { 0 };
		let a = reg_operand(instr.op0_register())?;
		let t = self.fresh_tmp(width);
		self.push(op, t, a, Operand::none());
		self.commit(id, width, lo, t);
		Some(())
	}

	fn lift_inc_dec(&mut self, instr: &Instruction, op: Op) -> Option<()> {
		let (id, width, high8) = reg_info(instr.op0_register())?;
		let lo = if high8 { 8 } else { 0 };
		let a = reg_operand(instr.op0_register())?;
		let t = self.fresh_tmp(width);
		self.push(op, t, a, Operand::cst(1, width));
		self.commit(id, width, lo, t);
		Some(())
	}

	fn lift_xchg(&mut self, instr: &Instruction) -> Option<()> {
		let (id0, w0, h0) = reg_info(instr.op0_register())?;
		let (id1, w1, h1) = reg_info(instr.op1_register())?;
		if w0 != w1 {
			return None;
		}
		let a = reg_operand(instr.op0_register())?;
		let b = reg_operand(instr.op1_register())?;
		let ta = self.fresh_tmp(w0);
		let tb = self.fresh_tmp(w1);
		self.push(Op::Mov, ta, a, Operand::none());
		self.push(Op::Mov, tb, b, Operand::none());
		self.commit(id0, w0, if h0 { 8 } else { 0 }, tb);
		self.commit(id1, w1, if h1 { 8 } else { 0 }, ta);
		Some(())
	}

	fn lift_leave(&mut self) -> Option<()> {
		let bp = Operand::reg(5, self.bits);
		let sp = Operand::reg(4, self.bits);
		self.push(Op::Mov, sp, bp, Operand::none());
		let t = self.fresh_tmp(self.bits);
		self.push(Op::Ldm, t, sp, Operand::none());
		self.push(Op::Mov, bp, t, Operand::none());
		self.push(Op::Add, sp, sp, Operand::cst((self.bits / 8) as u64, self.bits));
		Some(())
	}

	fn lift_body(&mut self, instr: &Instruction) -> Option<()> {
		match instr.mnemonic() {
			Mnemonic::Nop => Some(()),
			Mnemonic::Mov | Mnemonic::Movd | Mnemonic::Movq => self.lift_mov(instr),
			Mnemonic::Lea => self.lift_lea(instr),
			Mnemonic::Push => self.lift_push(instr),
			Mnemonic::Pop => self.lift_pop(instr),
			Mnemonic::Add => self.lift_binop(instr, Op::Add),
			Mnemonic::Sub => self.lift_binop(instr, Op::Sub),
			Mnemonic::And => self.lift_binop(instr, Op::And),
			Mnemonic::Or => self.lift_binop(instr, Op::Or),
			Mnemonic::Xor => self.lift_binop(instr, Op::Xor),
			Mnemonic::Shl | Mnemonic::Sal => self.lift_binop(instr, Op::Shl),
			Mnemonic::Shr => self.lift_binop(instr, Op::Shr),
			Mnemonic::Inc => self.lift_inc_dec(instr, Op::Add),
			Mnemonic::Dec => self.lift_inc_dec(instr, Op::Sub),
			Mnemonic::Neg => self.lift_unop(instr, Op::Neg),
			Mnemonic::Not => self.lift_unop(instr, Op::Not),
			Mnemonic::Xchg => self.lift_xchg(instr),
			Mnemonic::Leave => self.lift_leave(),
			_ => None,
		}
	}

	fn lift_ret(&mut self, instr: &Instruction) -> Option<()> {
		let sp = Operand::reg(4, self.bits);
		let t = self.fresh_tmp(self.bits);
		self.push(Op::Ldm, t, sp, Operand::none());
		let extra = if instr.op_count() > 0 { instr.immediate(0) } else { 0 };
		self.push(Op::Add, sp, sp, Operand::cst((self.bits / 8) as u64 + extra, self.bits));
		self.push(Op::Jcc, t, Operand::cst(1, 1), Operand::none());
		Some(())
	}

	fn lift_jmp(&mut self, instr: &Instruction) -> Option<()> {
		let target = match instr.op0_kind() {
			OpKind::Register => reg_operand(instr.op0_register())?,
			OpKind::Memory => {
				let addr = self.compute_addr(instr)?;
				let t = self.fresh_tmp(self.bits);
				self.push(Op::Ldm, t, addr, Operand::none());
				t
			}
			_ => return None,
		};
		self.push(Op::Jcc, target, Operand::cst(1, 1), Operand::none());
		Some(())
	}

	fn lift_tail(&mut self, instr: &Instruction) -> Option<()> {
		match instr.mnemonic() {
			Mnemonic::Ret | Mnemonic::Retf => self.lift_ret(instr),
			Mnemonic::Jmp => self.lift_jmp(instr),
			Mnemonic::Syscall | Mnemonic::Sysenter => {
				self.push(Op::Syscall, Operand::none(), Operand::none(), Operand::none());
				Some(())
			}
			Mnemonic::Int if instr.immediate8() == 0x80 => {
				self.push(Op::Int, Operand::none(), Operand::none(), Operand::none());
				Some(())
			}
			_ => None,
		}
	}
}

/// Decode the whole byte range as one straight-line gadget body ending at
/// whichever tail instruction the last bytes decode to. `bits` is 32 or 64.
pub fn disasm(addr: u64, bytes: &[u8], bits: u32) -> Option<IRBlock> {
	let mut decoder = Decoder::with_ip(bits, bytes, addr, DecoderOptions::NONE);
	let mut instrs = Vec::new();
	while decoder.can_decode() {
		let instr = decoder.decode();
		if instr.code() == Code::INVALID {
			return None;
		}
		instrs.push(instr);
	}
	if instrs.is_empty() {
		return None;
	}
	let mut bb = BasicBlock::default();
	let mut lifter = Lifter { bb: &mut bb, bits, tmp_id: 0, deref: 0 };
	let last = instrs.len() - 1;
	for (i, instr) in instrs.iter().enumerate() {
		let ok = if i == last { lifter.lift_tail(instr) } else { lifter.lift_body(instr) };
		ok?;
	}
	let deref = lifter.deref;
	Some(IRBlock { blocks: vec![bb], dereferenced_regs: deref })
}

/// Render the instruction sequence as a `;`-joined Intel-syntax string for
/// `Gadget::asm_str` (spec 3: "human-readable disassembly").
pub fn asm_str(addr: u64, bytes: &[u8], bits: u32) -> String {
	let mut decoder = Decoder::with_ip(bits, bytes, addr, DecoderOptions::NONE);
	let mut formatter = iced_x86::IntelFormatter::new();
	let mut out = String::new();
	let mut first = true;
	while decoder.can_decode() {
		let instr = decoder.decode();
		if !first {
			out.push_str(" ; ");
		}
		first = false;
		formatter.format(&instr, &mut out);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pop_rdi_ret_lifts_to_pop_then_terminal() {
		// 5f c3 = pop rdi; ret
		let block = disasm(0x1000, &[0x5f, 0xc3], 64).expect("should lift");
		assert_eq!(block.blocks.len(), 1);
		assert!(block.blocks[0].instrs.iter().any(|i| i.op == Op::Jcc));
	}

	#[test]
	fn unsupported_instruction_returns_none() {
		// 0f 05 = syscall as a BODY instruction (not the tail) is invalid:
		// the only instruction here is the tail itself, so decode it as
		// a body-mnemonic check instead: cpuid (0f a2) is unsupported.
		assert!(disasm(0x1000, &[0x0f, 0xa2], 64).is_none());
	}
}
