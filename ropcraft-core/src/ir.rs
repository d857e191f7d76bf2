//! C2: three-address IR and its symbolic executor.
//!
//! The IR itself is produced by an external `disasm(addr, bytes) -> IRBlock`
//! (spec §1 out-of-scope collaborator, see `ropcraft-x86::disasm`); this
//! module only defines the IR's shape and lifts a block to `Semantics`.

use crate::arch::{Arch, RegId};
use crate::expr::{self, BinOp, ExprArena, ExprId, UnOp, Width};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
	Add,
	Sub,
	Mul,
	Mulh,
	Smull,
	Smulh,
	Div,
	Sdiv,
	Neg,
	And,
	Or,
	Xor,
	Shl,
	Shr,
	Not,
	Mod,
	Smod,
	Mov,
	Ldm,
	Stm,
	Bcc,
	Jcc,
	Bisz,
	Concat,
	Int,
	Syscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
	None,
	Cst(u64),
	Var(RegId),
	/// Temporaries are always read/written at the full width they were
	/// first constructed with; the IR never sub-slices a temporary.
	Tmp(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
	pub kind: OperandKind,
	pub hi: u32,
	pub lo: u32,
}

impl Operand {
	pub fn none() -> Self {
		Operand { kind: OperandKind::None, hi: 0, lo: 0 }
	}
	pub fn cst(value: u64, width: Width) -> Self {
		Operand { kind: OperandKind::Cst(value), hi: width - 1, lo: 0 }
	}
	pub fn reg(reg: RegId, width: Width) -> Self {
		Operand { kind: OperandKind::Var(reg), hi: width - 1, lo: 0 }
	}
	pub fn reg_slice(reg: RegId, hi: u32, lo: u32) -> Self {
		Operand { kind: OperandKind::Var(reg), hi, lo }
	}
	pub fn tmp(id: u32, width: Width) -> Self {
		Operand { kind: OperandKind::Tmp(id), hi: width - 1, lo: 0 }
	}
	pub fn width(&self) -> Width {
		self.hi - self.lo + 1
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Instr {
	pub op: Op,
	pub dst: Operand,
	pub src1: Operand,
	pub src2: Operand,
	/// BCC: target basic-block index. JCC: unused (target is `dst`).
	pub addr: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
	pub instrs: Vec<Instr>,
}

#[derive(Debug, Clone, Default)]
pub struct IRBlock {
	pub blocks: Vec<BasicBlock>,
	pub dereferenced_regs: u64,
}

/// `Regs: reg# -> expression`, `Mem: addr_expression -> value_expression`.
#[derive(Debug, Clone, Default)]
pub struct Semantics {
	pub regs: FxHashMap<RegId, ExprId>,
	pub mem: Vec<(ExprId, ExprId)>,
	pub terminal: Option<Terminal>,
	pub sp_inc: Option<u64>,
	pub max_sp_inc: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
	Pc(ExprId),
	Syscall,
	Int80,
}

/// Recoverable rejects from lifting/execution/classification — discarded
/// silently per the error-handling policy (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	LiftFail,
	SymbolicFail,
	ClassifyReject,
}

const MAX_STEPS: usize = 4096;

struct ExecState {
	regs: FxHashMap<RegId, ExprId>,
	tmps: FxHashMap<u32, ExprId>,
}

impl ExecState {
	fn full_width(&self, arch: &dyn Arch, op: Operand) -> Width {
		match op.kind {
			OperandKind::Var(_) => arch.bits(),
			OperandKind::Tmp(_) | OperandKind::Cst(_) | OperandKind::None => op.hi + 1,
		}
	}

	fn read_full(&mut self, arena: &mut ExprArena, full_width: Width, kind: OperandKind) -> ExprId {
		match kind {
			OperandKind::None => arena.unknown(full_width),
			OperandKind::Cst(v) => arena.cst(full_width, v),
			OperandKind::Var(r) => *self
				.regs
				.entry(r)
				.or_insert_with(|| arena.var(full_width, reg_var_name(r), Some(r))),
			OperandKind::Tmp(t) => *self.tmps.entry(t).or_insert_with(|| arena.cst(full_width, 0)),
		}
	}

	fn read(&mut self, arena: &mut ExprArena, arch: &dyn Arch, op: Operand) -> ExprId {
		let full_width = self.full_width(arch, op);
		let full = self.read_full(arena, full_width, op.kind);
		if op.lo == 0 && op.hi + 1 == full_width {
			full
		} else {
			arena.extract(full, op.hi, op.lo)
		}
	}

	fn write(&mut self, arena: &mut ExprArena, arch: &dyn Arch, op: Operand, value: ExprId) {
		let full_width = self.full_width(arch, op);
		let old = self.read_full(arena, full_width, op.kind);
		let assembled = assemble(arena, old, value, op.hi, op.lo, full_width);
		let simplified = expr::simplify(arena, assembled);
		match op.kind {
			OperandKind::None | OperandKind::Cst(_) => {}
			OperandKind::Var(r) => {
				self.regs.insert(r, simplified);
			}
			OperandKind::Tmp(t) => {
				self.tmps.insert(t, simplified);
			}
		}
	}
}

/// Expand `value` (the slice written at `[hi:lo]`) back into `old_full`'s
/// full width, padding missing low bits with zero on a temporary's first
/// write (spec 4.2) — here represented by `old_full` itself already being
/// zero on first read of an unwritten temporary.
fn assemble(arena: &mut ExprArena, old_full: ExprId, value: ExprId, hi: u32, lo: u32, full_width: Width) -> ExprId {
	let mut parts = Vec::new();
	if hi + 1 < full_width {
		parts.push(arena.extract(old_full, full_width - 1, hi + 1));
	}
	parts.push(value);
	if lo > 0 {
		parts.push(arena.extract(old_full, lo - 1, 0));
	}
	let mut iter = parts.into_iter();
	let mut acc = iter.next().unwrap();
	for p in iter {
		acc = arena.concat(acc, p);
	}
	acc
}

pub fn reg_var_name(reg: RegId) -> String {
	format!("r{reg}")
}

fn eval_binop_expr(arena: &mut ExprArena, op: Op, a: ExprId, b: ExprId) -> ExprId {
	let binop = match op {
		Op::Add => BinOp::Add,
		Op::Mul => BinOp::Mul,
		Op::Mulh => BinOp::Mulh,
		Op::Smull => BinOp::Smull,
		Op::Smulh => BinOp::Smulh,
		Op::Div => BinOp::Div,
		Op::Sdiv => BinOp::Sdiv,
		Op::And => BinOp::And,
		Op::Or => BinOp::Or,
		Op::Xor => BinOp::Xor,
		Op::Shl => BinOp::Shl,
		Op::Shr => BinOp::Shr,
		Op::Mod => BinOp::Mod,
		Op::Smod => BinOp::Smod,
		Op::Sub => {
			let neg_b = arena.unop(UnOp::Neg, b);
			return arena.binop(BinOp::Add, a, neg_b);
		}
		_ => unreachable!("eval_binop_expr called with non-binary opcode"),
	};
	arena.binop(binop, a, b)
}

/// Symbolically execute `block`, producing its per-register/memory
/// semantics. Follows BCC to the constant-guarded target basic block,
/// stops at the first JCC whose guard simplifies to a nonzero constant
/// (the gadget's actual control transfer), and rejects non-constant guards
/// or runaway blocks as `SymbolicFail`.
pub fn execute(arena: &mut ExprArena, arch: &dyn Arch, block: &IRBlock) -> Result<Semantics, RejectReason> {
	if block.blocks.is_empty() {
		return Err(RejectReason::LiftFail);
	}
	let full_width = arch.bits();
	let mut state = ExecState { regs: FxHashMap::default(), tmps: FxHashMap::default() };
	let mut mem: Vec<(ExprId, ExprId)> = Vec::new();
	let sp = arch.sp();
	let sp0 = state.read_full(arena, full_width, OperandKind::Var(sp));
	let mut max_sp_inc: Option<u64> = Some(0);
	let mut bb_idx = 0usize;
	let mut steps = 0usize;
	let terminal;

	'outer: loop {
		steps += 1;
		if steps > MAX_STEPS {
			return Err(RejectReason::SymbolicFail);
		}
		let bb = block.blocks.get(bb_idx).ok_or(RejectReason::SymbolicFail)?;
		let mut i = 0usize;
		while i < bb.instrs.len() {
			let instr = bb.instrs[i];
			i += 1;
			match instr.op {
				Op::Bcc => {
					let guard = state.read(arena, arch, instr.src1);
					let guard = expr::simplify(arena, guard);
					match arena.as_cst(guard) {
						Some(0) => {}
						Some(_) => {
							bb_idx = instr.addr.ok_or(RejectReason::SymbolicFail)?;
							continue 'outer;
						}
						None => return Err(RejectReason::SymbolicFail),
					}
				}
				Op::Jcc => {
					let guard = state.read(arena, arch, instr.src1);
					let guard = expr::simplify(arena, guard);
					match arena.as_cst(guard) {
						Some(0) => {}
						Some(_) => {
							let target = state.read(arena, arch, instr.dst);
							terminal = Terminal::Pc(expr::simplify(arena, target));
							break 'outer;
						}
						None => return Err(RejectReason::SymbolicFail),
					}
				}
				Op::Int => {
					terminal = Terminal::Int80;
					break 'outer;
				}
				Op::Syscall => {
					terminal = Terminal::Syscall;
					break 'outer;
				}
				Op::Ldm => {
					let addr = state.read(arena, arch, instr.src1);
					let addr = expr::simplify(arena, addr);
					let width = instr.dst.width();
					let value = arena.mem(width, addr);
					state.write(arena, arch, instr.dst, value);
				}
				Op::Stm => {
					let addr = state.read(arena, arch, instr.dst);
					let addr = expr::simplify(arena, addr);
					let value = state.read(arena, arch, instr.src1);
					let value = expr::simplify(arena, value);
					mem.retain(|(a, _)| *a != addr);
					mem.push((addr, value));
				}
				Op::Mov => {
					let v = state.read(arena, arch, instr.src1);
					state.write(arena, arch, instr.dst, v);
				}
				Op::Neg | Op::Not => {
					let v = state.read(arena, arch, instr.src1);
					let unop = if instr.op == Op::Neg { UnOp::Neg } else { UnOp::Not };
					let r = arena.unop(unop, v);
					state.write(arena, arch, instr.dst, r);
				}
				Op::Bisz => {
					let v = state.read(arena, arch, instr.src1);
					let r = arena.bisz(v, true);
					let width = instr.dst.width();
					let r = if width > 1 {
						let zeros = arena.cst(width - 1, 0);
						arena.concat(zeros, r)
					} else {
						r
					};
					state.write(arena, arch, instr.dst, r);
				}
				Op::Concat => {
					let a = state.read(arena, arch, instr.src1);
					let b = state.read(arena, arch, instr.src2);
					let r = arena.concat(a, b);
					state.write(arena, arch, instr.dst, r);
				}
				binop_opcode => {
					let a = state.read(arena, arch, instr.src1);
					let b = state.read(arena, arch, instr.src2);
					let r = eval_binop_expr(arena, binop_opcode, a, b);
					state.write(arena, arch, instr.dst, r);
				}
			}
			update_max_sp_inc(arena, &mut state, arch, sp, sp0, &mut max_sp_inc);
		}
		return Err(RejectReason::SymbolicFail);
	}

	let sp_final = state.read_full(arena, full_width, OperandKind::Var(sp));
	let sp_inc = sp_delta(arena, sp_final, sp0);

	Ok(Semantics { regs: state.regs, mem, terminal: Some(terminal), sp_inc, max_sp_inc })
}

fn update_max_sp_inc(
	arena: &mut ExprArena,
	state: &mut ExecState,
	arch: &dyn Arch,
	sp: RegId,
	sp0: ExprId,
	max_sp_inc: &mut Option<u64>,
) {
	if max_sp_inc.is_none() {
		return;
	}
	let cur = state.read_full(arena, arch.bits(), OperandKind::Var(sp));
	match sp_delta(arena, cur, sp0) {
		Some(k) => *max_sp_inc = Some((*max_sp_inc).unwrap().max(k)),
		None => *max_sp_inc = None,
	}
}

/// If `sp_expr` simplifies to `sp0 + k` for a constant `k`, return `k`;
/// otherwise `None` (the "unknown, discard" case in spec 4.2).
fn sp_delta(arena: &mut ExprArena, sp_expr: ExprId, sp0: ExprId) -> Option<u64> {
	let simplified = expr::simplify(arena, sp_expr);
	if simplified == sp0 {
		return Some(0);
	}
	if let crate::expr::ExprKind::Binop(BinOp::Add, a, b) = arena.kind(simplified).clone() {
		if a == sp0 {
			return arena.as_cst(b);
		}
		if b == sp0 {
			return arena.as_cst(a);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::{ToyArch, REG_A, REG_B, REG_SP};

	fn ret_block(word: Width) -> IRBlock {
		// mov a, b ; ret  =>  pc = mem(sp) ; sp += word
		let mut bb = BasicBlock::default();
		bb.instrs.push(Instr {
			op: Op::Mov,
			dst: Operand::reg(REG_A, word),
			src1: Operand::reg(REG_B, word),
			src2: Operand::none(),
			addr: None,
		});
		bb.instrs.push(Instr {
			op: Op::Ldm,
			dst: Operand::tmp(0, word),
			src1: Operand::reg(REG_SP, word),
			src2: Operand::none(),
			addr: None,
		});
		bb.instrs.push(Instr {
			op: Op::Add,
			dst: Operand::reg(REG_SP, word),
			src1: Operand::reg(REG_SP, word),
			src2: Operand::cst(word as u64 / 8, word),
			addr: None,
		});
		bb.instrs.push(Instr {
			op: Op::Jcc,
			dst: Operand::tmp(0, word),
			src1: Operand::cst(1, 1),
			src2: Operand::none(),
			addr: None,
		});
		IRBlock { blocks: vec![bb], dereferenced_regs: 0 }
	}

	#[test]
	fn mov_reg_then_ret_classifies_sp_inc() {
		let mut arena = ExprArena::new();
		let arch = ToyArch;
		let block = ret_block(32);
		let sem = execute(&mut arena, &arch, &block).unwrap();
		assert_eq!(sem.sp_inc, Some(4));
		assert!(matches!(sem.terminal, Some(Terminal::Pc(_))));
		let a_expr = sem.regs[&REG_A];
		let (name, reg) = arena.as_var(a_expr).unwrap();
		assert_eq!(name, "r1");
		assert_eq!(reg, Some(REG_B));
	}
}
