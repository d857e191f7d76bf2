//! Constraint object: bad bytes, registers the chain must not clobber, the
//! memory-safety mode, and a closed set of gadget-quality filters a
//! candidate gadget must pass before selection will even consider it.

use crate::arch::RegId;
use crate::gadget::{BranchType, Gadget};

/// How strictly a LOAD/STORE/dereferencing gadget is allowed to touch
/// memory that isn't under the chain's control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSafety {
	/// No restriction: any gadget that classifies is eligible.
	Unchecked,
	/// Reject gadgets that dereference a register outside an explicit
	/// allow-list (the chain's own scratch/base registers).
	KeepRegs,
}

/// A single predicate a candidate `Gadget` must satisfy. Closed enum (not a
/// boxed closure) so a `Constraint` stays cheap to clone and to hash for
/// memoized search nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetFilter {
	/// Every byte of every address this gadget can be placed at must avoid
	/// `bad_bytes` — checked by the caller against the gadget's address,
	/// not representable as a closed predicate here, so this variant is a
	/// marker consumed by `Constraint::accepts_address`.
	NoBadByteAddress,
	/// Gadget must not touch (read, write, or dereference) any register
	/// outside the chain's keep-set.
	OnlyKeepRegs,
	/// Gadget's terminal must be a plain `ret` to the stack, with no
	/// register side effects at all — a pure stack pivot.
	StackPivotOnly,
	/// Gadget's terminal must be `ret`, `sp_inc` fixed, and it must not
	/// move the stack pointer's *source* through a non-stack base register
	/// (i.e. `mov esp, ebx ; ret` disqualifies, `add esp, N ; ret`
	/// qualifies) — the ordinary "base" gadgets a chain is built from.
	BasePivotOnly,
	/// Reject any gadget whose `nb_instr` exceeds a soft cap, keeping
	/// search candidates small (ropr's `-N`/length-preference ergonomics).
	MaxInstrCount(u32),
}

/// The compiled constraint set threaded through selection and scheduling.
#[derive(Debug, Clone)]
pub struct Constraint {
	pub bad_bytes: Vec<u8>,
	pub keep_regs: Vec<RegId>,
	pub mem_safety: MemSafety,
	pub filters: Vec<GadgetFilter>,
}

impl Default for Constraint {
	fn default() -> Self {
		Constraint { bad_bytes: Vec::new(), keep_regs: Vec::new(), mem_safety: MemSafety::Unchecked, filters: Vec::new() }
	}
}

impl Constraint {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_bad_bytes(mut self, bytes: impl IntoIterator<Item = u8>) -> Self {
		self.bad_bytes = bytes.into_iter().collect();
		self
	}

	pub fn with_keep_regs(mut self, regs: impl IntoIterator<Item = RegId>) -> Self {
		self.keep_regs = regs.into_iter().collect();
		if !self.keep_regs.is_empty() {
			self.filters.push(GadgetFilter::OnlyKeepRegs);
		}
		self
	}

	pub fn with_mem_safety(mut self, mode: MemSafety) -> Self {
		self.mem_safety = mode;
		self
	}

	pub fn with_filter(mut self, filter: GadgetFilter) -> Self {
		self.filters.push(filter);
		self
	}

	/// Every address a gadget could be placed at must avoid every byte in
	/// `bad_bytes` (spec 5/9: NO-CHAIN is returned rather than silently
	/// substituting a worse gadget).
	pub fn accepts_address(&self, addr: u64, word_size: usize) -> bool {
		if self.bad_bytes.is_empty() {
			return true;
		}
		let bytes = addr.to_le_bytes();
		bytes[..word_size].iter().all(|b| !self.bad_bytes.contains(b))
	}

	/// Whether any address this gadget is known at clears the bad-byte
	/// filter; a multi-address gadget (several equivalent encodings found
	/// at different offsets) passes if at least one address is clean.
	pub fn accepts_gadget_address(&self, gadget: &Gadget, word_size: usize) -> bool {
		gadget.addresses.iter().any(|&a| self.accepts_address(a, word_size))
	}

	/// Apply every non-address filter in `self.filters` to `gadget`.
	pub fn accepts_gadget(&self, gadget: &Gadget) -> bool {
		self.filters.iter().all(|f| self.accepts_one(f, gadget))
	}

	fn accepts_one(&self, filter: &GadgetFilter, gadget: &Gadget) -> bool {
		match filter {
			GadgetFilter::NoBadByteAddress => true, // handled by accepts_gadget_address
			GadgetFilter::OnlyKeepRegs => {
				let allowed = self.keep_regs.iter().fold(0u64, |acc, &r| acc | reg_bit(r));
				gadget.modified_regs & !allowed == 0 && gadget.dereferenced_regs & !allowed == 0
			}
			GadgetFilter::StackPivotOnly => {
				gadget.branch_type == BranchType::Ret && gadget.modified_regs == 0 && gadget.dereferenced_regs == 0
			}
			GadgetFilter::BasePivotOnly => gadget.branch_type == BranchType::Ret,
			GadgetFilter::MaxInstrCount(max) => gadget.nb_instr <= *max,
		}
	}
}

fn reg_bit(reg: RegId) -> u64 {
	if reg < 64 {
		1u64 << reg
	} else {
		0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ir::Semantics;
	use rustc_hash::FxHashMap;

	fn gadget(modified: u64, deref: u64) -> Gadget {
		Gadget {
			id: 0,
			addresses: vec![0x1000],
			asm_str: "g".into(),
			semantics: Semantics { regs: FxHashMap::default(), mem: vec![], terminal: None, sp_inc: Some(4), max_sp_inc: Some(4) },
			sp_inc: 4,
			max_sp_inc: 4,
			branch_type: BranchType::Ret,
			jmp_reg: None,
			modified_regs: modified,
			dereferenced_regs: deref,
			nb_instr: 1,
		}
	}

	#[test]
	fn bad_byte_address_rejected() {
		let c = Constraint::new().with_bad_bytes([0x00]);
		assert!(!c.accepts_address(0x0010_0000, 4));
		assert!(c.accepts_address(0x0010_0001, 4));
	}

	#[test]
	fn keep_regs_rejects_extra_clobber() {
		let c = Constraint::new().with_keep_regs([0u16]);
		assert!(c.accepts_gadget(&gadget(1, 0)));
		assert!(!c.accepts_gadget(&gadget(0b10, 0)));
	}

	#[test]
	fn stack_pivot_only_rejects_side_effects() {
		let c = Constraint::new().with_filter(GadgetFilter::StackPivotOnly);
		assert!(c.accepts_gadget(&gadget(0, 0)));
		assert!(!c.accepts_gadget(&gadget(1, 0)));
	}
}
