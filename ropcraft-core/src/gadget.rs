//! C3: gadget classifier. Pattern-matches a gadget's simplified semantics
//! into the fixed `GadgetType` taxonomy and derives branch type, `sp_inc`
//! and clobbered registers.

use crate::arch::{Arch, RegId};
use crate::expr::{BinOp, ExprArena, ExprId, ExprKind};
use crate::ir::{RejectReason, Semantics, Terminal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchType {
	Ret,
	Jmp,
	Call,
	Syscall,
	Int80,
	Any,
}

/// The classification taxonomy (spec §1/§3). Each gadget produces zero or
/// more of these as database keys; `gadget_addr`/`sp_inc` are not part of
/// the key (they come from the selected `Gadget` itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GadgetType {
	MovCst { dst: RegId, cst: i64 },
	MovReg { dst: RegId, src: RegId },
	AMovCst { dst: RegId, src: RegId, op: BinOp, cst: i64 },
	AMovReg { dst: RegId, src1: RegId, op: BinOp, src2: RegId },
	Load { dst: RegId, addr_reg: RegId, offset: i64 },
	ALoad { dst: RegId, op: BinOp, addr_reg: RegId, offset: i64 },
	Store { addr_reg: RegId, offset: i64, src: RegId },
	AStore { addr_reg: RegId, offset: i64, op: BinOp, src: RegId },
	Jmp { reg: RegId },
	Syscall,
	Int80,
}

/// A method table on `GadgetType`, replacing the source's `switch`-by-type
/// dispatch (design notes: tagged dispatch). `TypeId` identifies a variant
/// without carrying its field values, for use as a map/table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
	MovCst,
	MovReg,
	AMovCst,
	AMovReg,
	Load,
	ALoad,
	Store,
	AStore,
	Jmp,
	Syscall,
	Int80,
}

/// The role a single parameter slot plays within a gadget-type tuple — the
/// "param-role to param-index mapping" the design notes ask for in place of
/// per-type `switch` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
	Dst,
	Src,
	Src1,
	Src2,
	AddrReg,
	Offset,
	Op,
	Cst,
	JmpReg,
}

impl TypeId {
	/// Ordered parameter shape for this gadget type; a `StrategyGraph` node
	/// allocates exactly one `Parameter` per role, in this order.
	pub fn param_roles(&self) -> &'static [ParamRole] {
		use ParamRole::*;
		match self {
			TypeId::MovCst => &[Dst, Cst],
			TypeId::MovReg => &[Dst, Src],
			TypeId::AMovCst => &[Dst, Src, Op, Cst],
			TypeId::AMovReg => &[Dst, Src1, Op, Src2],
			TypeId::Load => &[Dst, AddrReg, Offset],
			TypeId::ALoad => &[Dst, Op, AddrReg, Offset],
			TypeId::Store => &[AddrReg, Offset, Src],
			TypeId::AStore => &[AddrReg, Offset, Op, Src],
			TypeId::Jmp => &[JmpReg],
			TypeId::Syscall => &[],
			TypeId::Int80 => &[],
		}
	}
}

impl GadgetType {
	pub fn type_id(&self) -> TypeId {
		match self {
			GadgetType::MovCst { .. } => TypeId::MovCst,
			GadgetType::MovReg { .. } => TypeId::MovReg,
			GadgetType::AMovCst { .. } => TypeId::AMovCst,
			GadgetType::AMovReg { .. } => TypeId::AMovReg,
			GadgetType::Load { .. } => TypeId::Load,
			GadgetType::ALoad { .. } => TypeId::ALoad,
			GadgetType::Store { .. } => TypeId::Store,
			GadgetType::AStore { .. } => TypeId::AStore,
			GadgetType::Jmp { .. } => TypeId::Jmp,
			GadgetType::Syscall => TypeId::Syscall,
			GadgetType::Int80 => TypeId::Int80,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Gadget {
	pub id: u32,
	pub addresses: Vec<u64>,
	pub asm_str: String,
	pub semantics: Semantics,
	pub sp_inc: u64,
	pub max_sp_inc: u64,
	pub branch_type: BranchType,
	pub jmp_reg: Option<RegId>,
	pub modified_regs: u64,
	pub dereferenced_regs: u64,
	pub nb_instr: u32,
}

impl Gadget {
	/// Sort key shared by every exact-get result (spec 8: every gadget list
	/// returned by exact-get is sorted by `(nb_instr, sp_inc, id)`).
	pub fn sort_key(&self) -> (u32, u64, u32) {
		(self.nb_instr, self.sp_inc, self.id)
	}
}

fn reg_bit(reg: RegId) -> u64 {
	if reg < 64 {
		1u64 << reg
	} else {
		0
	}
}

/// Determine branch type, `jmp_reg`, and validate `sp_inc`/`max_sp_inc`.
/// Returns `ClassifyReject` when the terminal PC or stack delta is unknown
/// (spec 4.3/4.2).
fn classify_branch(
	arena: &ExprArena,
	arch: &dyn Arch,
	sem: &Semantics,
) -> Result<(BranchType, Option<RegId>, u64), RejectReason> {
	let sp_inc = sem.sp_inc.ok_or(RejectReason::ClassifyReject)?;
	let word = arch.word_size() as u64;
	if sp_inc % word != 0 {
		return Err(RejectReason::ClassifyReject);
	}
	match sem.terminal {
		Some(Terminal::Syscall) => Ok((BranchType::Syscall, None, sp_inc)),
		Some(Terminal::Int80) => Ok((BranchType::Int80, None, sp_inc)),
		Some(Terminal::Pc(pc)) => match arena.kind(pc) {
			ExprKind::Var(_, Some(reg)) => Ok((BranchType::Jmp, Some(*reg), sp_inc)),
			ExprKind::Mem(addr) => {
				if is_sp_plus(arena, *addr, arch) {
					Ok((BranchType::Ret, None, sp_inc))
				} else {
					Err(RejectReason::ClassifyReject)
				}
			}
			_ => Err(RejectReason::ClassifyReject),
		},
		None => Err(RejectReason::ClassifyReject),
	}
}

/// Any `sp0 + k` (including `k = 0`) counts: the classifier only needs to
/// know the terminal fetch came from the stack, the exact offset is
/// already reconciled against `sp_inc` by the executor.
fn is_sp_plus(arena: &ExprArena, addr: ExprId, arch: &dyn Arch) -> bool {
	let is_sp_var = |id: ExprId| matches!(arena.kind(id), ExprKind::Var(_, Some(r)) if *r == arch.sp());
	match arena.kind(addr) {
		ExprKind::Var(_, Some(r)) => *r == arch.sp(),
		ExprKind::Binop(BinOp::Add, a, b) => is_sp_var(*a) || is_sp_var(*b),
		_ => false,
	}
}

/// Emit every `GadgetType` classification entry implied by `sem`'s final
/// register values and memory writes (spec 4.3). The same gadget can
/// appear under several keys (e.g. one per clobbered register, plus the
/// branch-mechanism key for JMP/SYSCALL/INT80 terminals).
pub fn classify(
	arena: &mut ExprArena,
	arch: &dyn Arch,
	sem: &Semantics,
) -> Result<(Vec<GadgetType>, BranchType, Option<RegId>, u64, u64), RejectReason> {
	let (branch_type, jmp_reg, sp_inc) = classify_branch(arena, arch, sem)?;
	let mut entries = Vec::new();
	let mut modified: u64 = 0;

	for (&reg, &expr) in sem.regs.iter() {
		if reg == arch.sp() || reg == arch.pc() {
			continue;
		}
		let origin = arena.var(arch.bits(), crate::ir::reg_var_name(reg), Some(reg));
		if expr == origin {
			continue; // unmodified register, not a gadget effect
		}
		modified |= reg_bit(reg);
		entries.extend(classify_register(arena, arch, reg, expr));
	}

	for &(addr, value) in &sem.mem {
		if let Some(entry) = classify_store(arena, arch, addr, value) {
			entries.push(entry);
		}
	}

	match branch_type {
		BranchType::Jmp => entries.push(GadgetType::Jmp { reg: jmp_reg.unwrap() }),
		BranchType::Syscall => entries.push(GadgetType::Syscall),
		BranchType::Int80 => entries.push(GadgetType::Int80),
		_ => {}
	}

	// A plain `ret`/pivot with no side effects and no entries is still a
	// valid gadget (e.g. a pure stack pivot); the caller keeps it in `all`
	// even when it indexes into no per-type table.
	Ok((entries, branch_type, jmp_reg, sp_inc, modified))
}

fn classify_register(arena: &mut ExprArena, arch: &dyn Arch, dst: RegId, expr: ExprId) -> Vec<GadgetType> {
	match arena.kind(expr).clone() {
		ExprKind::Cst(v) => vec![GadgetType::MovCst { dst, cst: v as i64 }],
		ExprKind::Var(_, Some(src)) => vec![GadgetType::MovReg { dst, src }],
		ExprKind::Binop(op, a, b) => {
			let (reg_side, cst_side) = match (reg_of(arena, a), arena.as_cst(b)) {
				(Some(r), Some(c)) => (Some(r), Some(c)),
				_ => match (reg_of(arena, b), arena.as_cst(a)) {
					(Some(r), Some(c)) => (Some(r), Some(c)),
					_ => (None, None),
				},
			};
			if let (Some(src), Some(cst)) = (reg_side, cst_side) {
				return vec![GadgetType::AMovCst { dst, src, op, cst: cst as i64 }];
			}
			if let (Some(r1), Some(r2)) = (reg_of(arena, a), reg_of(arena, b)) {
				// spec 4.3: symmetric binops emit both argument orders, since
				// the intent program may fix either operand as src1/src2.
				if op.is_symmetric() {
					return vec![
						GadgetType::AMovReg { dst, src1: r1, op, src2: r2 },
						GadgetType::AMovReg { dst, src1: r2, op, src2: r1 },
					];
				}
				return vec![GadgetType::AMovReg { dst, src1: r1, op, src2: r2 }];
			}
			vec![]
		}
		ExprKind::Mem(addr) => classify_load(arena, arch, dst, addr, None).into_iter().collect(),
		_ => vec![],
	}
}

fn reg_of(arena: &ExprArena, id: ExprId) -> Option<RegId> {
	match arena.kind(id) {
		ExprKind::Var(_, Some(r)) => Some(*r),
		_ => None,
	}
}

fn classify_load(arena: &mut ExprArena, arch: &dyn Arch, dst: RegId, addr: ExprId, op: Option<BinOp>) -> Option<GadgetType> {
	let (addr_reg, offset) = split_base_offset(arena, arch, addr)?;
	match op {
		None => Some(GadgetType::Load { dst, addr_reg, offset }),
		Some(op) => Some(GadgetType::ALoad { dst, op, addr_reg, offset }),
	}
}

fn classify_store(arena: &mut ExprArena, arch: &dyn Arch, addr: ExprId, value: ExprId) -> Option<GadgetType> {
	let (addr_reg, offset) = split_base_offset(arena, arch, addr)?;
	match arena.kind(value).clone() {
		ExprKind::Var(_, Some(src)) => Some(GadgetType::Store { addr_reg, offset, src }),
		ExprKind::Binop(op, a, b) => {
			if let Some(src) = reg_of(arena, a) {
				if let ExprKind::Mem(maddr) = arena.kind(b) {
					if *maddr == addr {
						return Some(GadgetType::AStore { addr_reg, offset, op, src });
					}
				}
			}
			if let Some(src) = reg_of(arena, b) {
				if let ExprKind::Mem(maddr) = arena.kind(a) {
					if *maddr == addr {
						return Some(GadgetType::AStore { addr_reg, offset, op, src });
					}
				}
			}
			None
		}
		_ => None,
	}
}

/// Decompose `addr` into `(base register, constant offset)`, the shape
/// every LOAD/STORE pattern in the taxonomy requires.
fn split_base_offset(arena: &mut ExprArena, _arch: &dyn Arch, addr: ExprId) -> Option<(RegId, i64)> {
	match arena.kind(addr).clone() {
		ExprKind::Var(_, Some(r)) => Some((r, 0)),
		ExprKind::Binop(BinOp::Add, a, b) => {
			if let (Some(r), Some(c)) = (reg_of(arena, a), arena.as_cst(b)) {
				return Some((r, c as i64));
			}
			if let (Some(r), Some(c)) = (reg_of(arena, b), arena.as_cst(a)) {
				return Some((r, c as i64));
			}
			None
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::{ToyArch, REG_A, REG_B};
	use crate::expr::ExprArena;
	use rustc_hash::FxHashMap;

	#[test]
	fn classify_mov_reg() {
		let mut arena = ExprArena::new();
		let arch = ToyArch;
		let src = arena.var(32, "r1", Some(REG_B));
		let mut regs = FxHashMap::default();
		regs.insert(REG_A, src);
		let sp0 = arena.var(32, "r3", Some(arch.sp()));
		let sem = Semantics {
			regs,
			mem: vec![],
			terminal: Some(Terminal::Pc(arena.mem(32, sp0))),
			sp_inc: Some(4),
			max_sp_inc: Some(4),
		};
		let (entries, branch, _jmp, sp_inc, modified) = classify(&mut arena, &arch, &sem).unwrap();
		assert_eq!(branch, BranchType::Ret);
		assert_eq!(sp_inc, 4);
		assert_eq!(modified, reg_bit(REG_A));
		assert!(entries.contains(&GadgetType::MovReg { dst: REG_A, src: REG_B }));
	}
}
