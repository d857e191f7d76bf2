//! C4: multi-indexed gadget database. One map per `GadgetType`, keyed by
//! that type's parameter tuple; exact-get is O(1), possible-get enumerates
//! the (small) wildcard space and returns every matching concrete key.

use crate::arch::{Arch, RegId};
use crate::expr::{BinOp, ExprArena};
use crate::gadget::{classify, Gadget, GadgetType};
use crate::ir::{self, IRBlock, RejectReason};
use rustc_hash::FxHashSet;
use std::collections::HashMap;

/// The result of a partially-specified query: concrete key -> matching
/// gadgets, for every key consistent with the fixed coordinates.
pub type PossibleGadgets = Vec<(GadgetType, Vec<std::sync::Arc<Gadget>>)>;

#[derive(Default)]
pub struct GadgetDb {
	pub all: Vec<std::sync::Arc<Gadget>>,
	seen: FxHashSet<Vec<u8>>,
	mov_cst: HashMap<(RegId, i64), Vec<std::sync::Arc<Gadget>>>,
	mov_reg: HashMap<(RegId, RegId), Vec<std::sync::Arc<Gadget>>>,
	amov_cst: HashMap<(RegId, RegId, BinOp, i64), Vec<std::sync::Arc<Gadget>>>,
	amov_reg: HashMap<(RegId, RegId, BinOp, RegId), Vec<std::sync::Arc<Gadget>>>,
	load: HashMap<(RegId, RegId, i64), Vec<std::sync::Arc<Gadget>>>,
	aload: HashMap<(RegId, BinOp, RegId, i64), Vec<std::sync::Arc<Gadget>>>,
	store: HashMap<(RegId, i64, RegId), Vec<std::sync::Arc<Gadget>>>,
	astore: HashMap<(RegId, i64, BinOp, RegId), Vec<std::sync::Arc<Gadget>>>,
	jmp: HashMap<RegId, Vec<std::sync::Arc<Gadget>>>,
	syscall: Vec<std::sync::Arc<Gadget>>,
	int80: Vec<std::sync::Arc<Gadget>>,
}

fn sorted_insert(bucket: &mut Vec<std::sync::Arc<Gadget>>, g: std::sync::Arc<Gadget>) {
	let key = g.sort_key();
	let pos = bucket.partition_point(|existing| existing.sort_key() < key);
	bucket.insert(pos, g);
}

impl GadgetDb {
	pub fn new() -> Self {
		Self::default()
	}

	pub(crate) fn insert(&mut self, ty: GadgetType, g: std::sync::Arc<Gadget>) {
		match ty {
			GadgetType::MovCst { dst, cst } => sorted_insert(self.mov_cst.entry((dst, cst)).or_default(), g),
			GadgetType::MovReg { dst, src } => sorted_insert(self.mov_reg.entry((dst, src)).or_default(), g),
			GadgetType::AMovCst { dst, src, op, cst } => {
				sorted_insert(self.amov_cst.entry((dst, src, op, cst)).or_default(), g)
			}
			GadgetType::AMovReg { dst, src1, op, src2 } => {
				sorted_insert(self.amov_reg.entry((dst, src1, op, src2)).or_default(), g)
			}
			GadgetType::Load { dst, addr_reg, offset } => {
				sorted_insert(self.load.entry((dst, addr_reg, offset)).or_default(), g)
			}
			GadgetType::ALoad { dst, op, addr_reg, offset } => {
				sorted_insert(self.aload.entry((dst, op, addr_reg, offset)).or_default(), g)
			}
			GadgetType::Store { addr_reg, offset, src } => {
				sorted_insert(self.store.entry((addr_reg, offset, src)).or_default(), g)
			}
			GadgetType::AStore { addr_reg, offset, op, src } => {
				sorted_insert(self.astore.entry((addr_reg, offset, op, src)).or_default(), g)
			}
			GadgetType::Jmp { reg } => sorted_insert(self.jmp.entry(reg).or_default(), g),
			GadgetType::Syscall => sorted_insert(&mut self.syscall, g),
			GadgetType::Int80 => sorted_insert(&mut self.int80, g),
		}
	}

	// ---- exact get ----

	pub fn get_mov_cst(&self, dst: RegId, cst: i64) -> &[std::sync::Arc<Gadget>] {
		self.mov_cst.get(&(dst, cst)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_mov_reg(&self, dst: RegId, src: RegId) -> &[std::sync::Arc<Gadget>] {
		self.mov_reg.get(&(dst, src)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_amov_cst(&self, dst: RegId, src: RegId, op: BinOp, cst: i64) -> &[std::sync::Arc<Gadget>] {
		self.amov_cst.get(&(dst, src, op, cst)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_amov_reg(&self, dst: RegId, src1: RegId, op: BinOp, src2: RegId) -> &[std::sync::Arc<Gadget>] {
		self.amov_reg.get(&(dst, src1, op, src2)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_load(&self, dst: RegId, addr_reg: RegId, offset: i64) -> &[std::sync::Arc<Gadget>] {
		self.load.get(&(dst, addr_reg, offset)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_aload(&self, dst: RegId, op: BinOp, addr_reg: RegId, offset: i64) -> &[std::sync::Arc<Gadget>] {
		self.aload.get(&(dst, op, addr_reg, offset)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_store(&self, addr_reg: RegId, offset: i64, src: RegId) -> &[std::sync::Arc<Gadget>] {
		self.store.get(&(addr_reg, offset, src)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_astore(&self, addr_reg: RegId, offset: i64, op: BinOp, src: RegId) -> &[std::sync::Arc<Gadget>] {
		self.astore.get(&(addr_reg, offset, op, src)).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_jmp(&self, reg: RegId) -> &[std::sync::Arc<Gadget>] {
		self.jmp.get(&reg).map(Vec::as_slice).unwrap_or(&[])
	}
	pub fn get_syscall(&self) -> &[std::sync::Arc<Gadget>] {
		&self.syscall
	}
	pub fn get_int80(&self) -> &[std::sync::Arc<Gadget>] {
		&self.int80
	}

	/// `get_T(tuple) -> Vec<Gadget*>` for an already-built key, dispatching
	/// through the type-tagged enum (used by selection search once every
	/// parameter of a node is concrete).
	pub fn get_exact(&self, key: &GadgetType) -> &[std::sync::Arc<Gadget>] {
		match *key {
			GadgetType::MovCst { dst, cst } => self.get_mov_cst(dst, cst),
			GadgetType::MovReg { dst, src } => self.get_mov_reg(dst, src),
			GadgetType::AMovCst { dst, src, op, cst } => self.get_amov_cst(dst, src, op, cst),
			GadgetType::AMovReg { dst, src1, op, src2 } => self.get_amov_reg(dst, src1, op, src2),
			GadgetType::Load { dst, addr_reg, offset } => self.get_load(dst, addr_reg, offset),
			GadgetType::ALoad { dst, op, addr_reg, offset } => self.get_aload(dst, op, addr_reg, offset),
			GadgetType::Store { addr_reg, offset, src } => self.get_store(addr_reg, offset, src),
			GadgetType::AStore { addr_reg, offset, op, src } => self.get_astore(addr_reg, offset, op, src),
			GadgetType::Jmp { reg } => self.get_jmp(reg),
			GadgetType::Syscall => self.get_syscall(),
			GadgetType::Int80 => self.get_int80(),
		}
	}

	/// Possible-get: `query` is a key with `None` on every free coordinate.
	/// Returns one `(concrete key, gadgets)` entry per consistent binding
	/// of the free coordinates actually present in the database.
	pub fn get_possible(&self, query: &PartialKey, arch: &dyn Arch) -> PossibleGadgets {
		let nb_regs = arch.nb_regs() as RegId;
		let mut out = Vec::new();
		match query {
			PartialKey::MovCst { dst, cst } => {
				for_each_reg(*dst, nb_regs, |dst| {
					if let Some(g) = non_empty(self.get_mov_cst(dst, *cst)) {
						out.push((GadgetType::MovCst { dst, cst: *cst }, g));
					}
				});
			}
			PartialKey::MovReg { dst, src } => {
				for_each_reg(*dst, nb_regs, |dst| {
					for_each_reg(*src, nb_regs, |src| {
						if let Some(g) = non_empty(self.get_mov_reg(dst, src)) {
							out.push((GadgetType::MovReg { dst, src }, g));
						}
					});
				});
			}
			PartialKey::AMovCst { dst, src, op, cst } => {
				for_each_reg(*dst, nb_regs, |dst| {
					for_each_reg(*src, nb_regs, |src| {
						for_each_op(*op, |op| {
							if let Some(g) = non_empty(self.get_amov_cst(dst, src, op, *cst)) {
								out.push((GadgetType::AMovCst { dst, src, op, cst: *cst }, g));
							}
						});
					});
				});
			}
			PartialKey::AMovReg { dst, src1, op, src2 } => {
				for_each_reg(*dst, nb_regs, |dst| {
					for_each_reg(*src1, nb_regs, |src1| {
						for_each_reg(*src2, nb_regs, |src2| {
							for_each_op(*op, |op| {
								if let Some(g) = non_empty(self.get_amov_reg(dst, src1, op, src2)) {
									out.push((GadgetType::AMovReg { dst, src1, op, src2 }, g));
								}
							});
						});
					});
				});
			}
			PartialKey::Load { dst, addr_reg, offset } => {
				for_each_reg(*dst, nb_regs, |dst| {
					for_each_reg(*addr_reg, nb_regs, |addr_reg| {
						if let Some(g) = non_empty(self.get_load(dst, addr_reg, *offset)) {
							out.push((GadgetType::Load { dst, addr_reg, offset: *offset }, g));
						}
					});
				});
			}
			PartialKey::ALoad { dst, op, addr_reg, offset } => {
				for_each_reg(*dst, nb_regs, |dst| {
					for_each_reg(*addr_reg, nb_regs, |addr_reg| {
						for_each_op(*op, |op| {
							if let Some(g) = non_empty(self.get_aload(dst, op, addr_reg, *offset)) {
								out.push((GadgetType::ALoad { dst, op, addr_reg, offset: *offset }, g));
							}
						});
					});
				});
			}
			PartialKey::Store { addr_reg, offset, src } => {
				for_each_reg(*addr_reg, nb_regs, |addr_reg| {
					for_each_reg(*src, nb_regs, |src| {
						if let Some(g) = non_empty(self.get_store(addr_reg, *offset, src)) {
							out.push((GadgetType::Store { addr_reg, offset: *offset, src }, g));
						}
					});
				});
			}
			PartialKey::AStore { addr_reg, offset, op, src } => {
				for_each_reg(*addr_reg, nb_regs, |addr_reg| {
					for_each_reg(*src, nb_regs, |src| {
						for_each_op(*op, |op| {
							if let Some(g) = non_empty(self.get_astore(addr_reg, *offset, op, src)) {
								out.push((GadgetType::AStore { addr_reg, offset: *offset, op, src }, g));
							}
						});
					});
				});
			}
			PartialKey::Jmp { reg } => {
				for_each_reg(*reg, nb_regs, |reg| {
					if let Some(g) = non_empty(self.get_jmp(reg)) {
						out.push((GadgetType::Jmp { reg }, g));
					}
				});
			}
			PartialKey::Syscall => {
				if let Some(g) = non_empty(self.get_syscall()) {
					out.push((GadgetType::Syscall, g));
				}
			}
			PartialKey::Int80 => {
				if let Some(g) = non_empty(self.get_int80()) {
					out.push((GadgetType::Int80, g));
				}
			}
		}
		out
	}

	/// `analyse_raw_gadgets`: lift, symbolically execute, simplify,
	/// validate and classify each `(addr, bytes)`, deduplicating by raw
	/// bytes and silently discarding anything that fails lifting, symbolic
	/// execution or classification. Returns the number of gadgets added.
	pub fn analyse_raw_gadgets(
		&mut self,
		arch: &dyn Arch,
		arena: &mut ExprArena,
		raws: &[(u64, Vec<u8>)],
		disasm: &dyn Fn(u64, &[u8]) -> Option<IRBlock>,
		asm: &dyn Fn(u64, &[u8]) -> String,
	) -> usize {
		let span = tracing::debug_span!("analyse_raw_gadgets", count = raws.len());
		let _enter = span.enter();
		let mut added = 0usize;
		let mut next_id = self.all.len() as u32;
		for (addr, bytes) in raws {
			if *addr == 0 || bytes.is_empty() {
				continue;
			}
			if !self.seen.insert(bytes.clone()) {
				continue;
			}
			let Some(block) = disasm(*addr, bytes) else {
				tracing::trace!(addr, "LIFT-FAIL");
				continue;
			};
			let sem = match ir::execute(arena, arch, &block) {
				Ok(sem) => sem,
				Err(RejectReason::LiftFail | RejectReason::SymbolicFail) => {
					tracing::trace!(addr, "SYMBOLIC-FAIL");
					continue;
				}
				Err(RejectReason::ClassifyReject) => continue,
			};
			let (entries, branch_type, jmp_reg, sp_inc, modified) = match classify(arena, arch, &sem) {
				Ok(v) => v,
				Err(_) => {
					tracing::trace!(addr, "CLASSIFY-REJECT");
					continue;
				}
			};
			let nb_instr = block.blocks.iter().map(|b| b.instrs.len()).sum::<usize>() as u32;
			let max_sp_inc = sem.max_sp_inc.unwrap_or(sp_inc);
			let gadget = std::sync::Arc::new(Gadget {
				id: next_id,
				addresses: vec![*addr],
				asm_str: asm(*addr, bytes),
				semantics: sem,
				sp_inc,
				max_sp_inc,
				branch_type,
				jmp_reg,
				modified_regs: modified,
				dereferenced_regs: block.dereferenced_regs,
				nb_instr,
			});
			next_id += 1;
			for entry in entries {
				self.insert(entry, gadget.clone());
			}
			self.all.push(gadget);
			added += 1;
		}
		added
	}
}

fn non_empty(s: &[std::sync::Arc<Gadget>]) -> Option<Vec<std::sync::Arc<Gadget>>> {
	if s.is_empty() {
		None
	} else {
		Some(s.to_vec())
	}
}

fn for_each_reg(fixed: Option<RegId>, nb_regs: RegId, mut f: impl FnMut(RegId)) {
	match fixed {
		Some(r) => f(r),
		None => {
			for r in 0..nb_regs {
				f(r)
			}
		}
	}
}

const ALL_OPS: [BinOp; 14] = [
	BinOp::Add,
	BinOp::Mul,
	BinOp::Mulh,
	BinOp::Smull,
	BinOp::Smulh,
	BinOp::Div,
	BinOp::Sdiv,
	BinOp::And,
	BinOp::Or,
	BinOp::Xor,
	BinOp::Shl,
	BinOp::Shr,
	BinOp::Mod,
	BinOp::Smod,
];

fn for_each_op(fixed: Option<BinOp>, mut f: impl FnMut(BinOp)) {
	match fixed {
		Some(op) => f(op),
		None => {
			for op in ALL_OPS {
				f(op)
			}
		}
	}
}

/// A `GadgetType` tuple with `None` standing in for a free coordinate —
/// the query shape consumed by `get_possible`. Constants are never free
/// (spec 4.4: "constants are always fixed for lookup").
#[derive(Debug, Clone, Copy)]
pub enum PartialKey {
	MovCst { dst: Option<RegId>, cst: i64 },
	MovReg { dst: Option<RegId>, src: Option<RegId> },
	AMovCst { dst: Option<RegId>, src: Option<RegId>, op: Option<BinOp>, cst: i64 },
	AMovReg { dst: Option<RegId>, src1: Option<RegId>, op: Option<BinOp>, src2: Option<RegId> },
	Load { dst: Option<RegId>, addr_reg: Option<RegId>, offset: i64 },
	ALoad { dst: Option<RegId>, op: Option<BinOp>, addr_reg: Option<RegId>, offset: i64 },
	Store { addr_reg: Option<RegId>, offset: i64, src: Option<RegId> },
	AStore { addr_reg: Option<RegId>, offset: i64, op: Option<BinOp>, src: Option<RegId> },
	Jmp { reg: Option<RegId> },
	Syscall,
	Int80,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::{ToyArch, REG_A, REG_B};
	use crate::gadget::BranchType;
	use crate::ir::Semantics;
	use rustc_hash::FxHashMap;

	fn toy_gadget(id: u32, sp_inc: u64, nb_instr: u32) -> std::sync::Arc<Gadget> {
		std::sync::Arc::new(Gadget {
			id,
			addresses: vec![0x1000 + id as u64],
			asm_str: "mov".into(),
			semantics: Semantics { regs: FxHashMap::default(), mem: vec![], terminal: None, sp_inc: Some(sp_inc), max_sp_inc: Some(sp_inc) },
			sp_inc,
			max_sp_inc: sp_inc,
			branch_type: BranchType::Ret,
			jmp_reg: None,
			modified_regs: 0,
			dereferenced_regs: 0,
			nb_instr,
		})
	}

	#[test]
	fn exact_get_returns_sorted_by_nb_instr_sp_inc_id() {
		let mut db = GadgetDb::new();
		let g1 = toy_gadget(1, 4, 2);
		let g0 = toy_gadget(0, 4, 1);
		db.insert(GadgetType::MovReg { dst: REG_A, src: REG_B }, g1);
		db.insert(GadgetType::MovReg { dst: REG_A, src: REG_B }, g0);
		let got = db.get_mov_reg(REG_A, REG_B);
		assert_eq!(got[0].id, 0);
		assert_eq!(got[1].id, 1);
	}

	#[test]
	fn possible_get_enumerates_registers() {
		let mut db = GadgetDb::new();
		db.insert(GadgetType::MovReg { dst: REG_A, src: REG_B }, toy_gadget(0, 4, 1));
		let query = PartialKey::MovReg { dst: None, src: Some(REG_B) };
		let results = db.get_possible(&query, &ToyArch);
		assert_eq!(results.len(), 1);
		match results[0].0 {
			GadgetType::MovReg { dst, src } => {
				assert_eq!(dst, REG_A);
				assert_eq!(src, REG_B);
			}
			_ => panic!("wrong key shape"),
		}
	}
}
