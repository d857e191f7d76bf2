//! C6: the fixed catalogue of strategy-graph rewrites. Each rule is a pure
//! transformation of a single node that may add nodes, reroute edges, and
//! disable the original — never destroying semantic intent (spec 4.6).

use crate::arch::RegId;
use crate::gadget::{BranchType, ParamRole, TypeId};
use crate::strategy::graph::{NodeId, ParamSlot, ParamValue, StrategyConstraint, StrategyGraph};

/// A single catalogue entry. Returns `false` (graph untouched by contract —
/// callers copy the graph before attempting a rule) when inapplicable to
/// `n`.
pub type Rule = fn(&mut StrategyGraph, NodeId) -> bool;

pub const CATALOGUE: &[Rule] = &[
	generic_transitivity,
	mov_cst_via_pop,
	adjust_jmp,
	adjust_load_store,
	generic_src_transitivity,
	mba_set_cst,
];

fn is_transitivity_eligible(type_id: TypeId) -> bool {
	matches!(
		type_id,
		TypeId::MovCst | TypeId::MovReg | TypeId::AMovCst | TypeId::AMovReg | TypeId::Load | TypeId::ALoad
	)
}

/// Rule 1: clone `n` into `n1` producing into a fresh register `R`, then
/// add `n2: MOV_REG(dst, R)`. `n`'s original consumers are redirected to
/// read from `n2`'s output instead.
pub fn generic_transitivity(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled || !is_transitivity_eligible(g.node(n).type_id) {
		return false;
	}
	let Some(dst_idx) = g.node(n).param_index(ParamRole::Dst) else { return false };
	// scratch register: pick one not already referenced as a fixed reg
	// parameter on this node (a real implementation asks the Arch for a
	// free scratch register; here any distinct id leaves it to selection
	// to find a concrete gadget using it).
	let scratch: RegId = 0xffff;

	let type_id = g.node(n).type_id;
	let branch_type = g.node(n).branch_type;
	let n1 = g.new_node(type_id, branch_type);
	let n2 = g.new_node(TypeId::MovReg, BranchType::Ret);

	// n1 keeps every parameter of n except it writes into `scratch`.
	g.node_mut(n1).params = g.node(n).params.clone();
	g.node_mut(n1).params[dst_idx] = crate::strategy::graph::Parameter::fixed(ParamRole::Dst, ParamValue::Reg(scratch), g.new_name("scratch"));

	let dst_param = g.node(n).params[dst_idx].clone();
	g.node_mut(n2).params[0] = dst_param; // MovReg::Dst takes n's original destination
	g.node_mut(n2).params[1] = crate::strategy::graph::Parameter::dependent(ParamRole::Src, n1, dst_idx, g.new_name("scratch_src"));
	g.node_mut(n2).params[1].is_data_link = true;

	g.add_strategy_edge(n1, n2);
	g.redirect_node(n, n2);
	g.disable_node(n);
	true
}

/// Rule 2: replace `MOV_CST(dst, K)` with `LOAD(dst, SP + off)` plus a
/// special padding at `off` carrying `K`, `0 <= off < min(160, sp_inc)`.
pub fn mov_cst_via_pop(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled || g.node(n).type_id != TypeId::MovCst {
		return false;
	}
	let dst_idx = g.node(n).param_index(ParamRole::Dst).unwrap();
	let cst_idx = g.node(n).param_index(ParamRole::Cst).unwrap();
	let dst_param = g.node(n).params[dst_idx].clone();
	let cst_param = g.node(n).params[cst_idx].clone();

	let load = g.new_node(TypeId::Load, BranchType::Ret);
	g.node_mut(load).params[0] = dst_param; // Dst
	let sp_name = g.new_name("sp");
	g.node_mut(load).params[1] = crate::strategy::graph::Parameter::fixed(ParamRole::AddrReg, ParamValue::Reg(SP_PLACEHOLDER), sp_name);
	let off_name = g.new_name("pop_off");
	g.node_mut(load).params[2] = crate::strategy::graph::Parameter::free(ParamRole::Offset, off_name);
	g.node_mut(load).strategy_constraints.push(StrategyConstraint::OffsetUnderSpInc(2));
	let off_param = g.node(load).params[2].clone();
	g.node_mut(load).special_paddings.push((off_param, cst_param));

	g.redirect_node(n, load);
	g.disable_node(n);
	true
}

/// Placeholder stack-pointer register id substituted by the selection
/// search with `Arch::sp()` before querying the database — the graph
/// itself has no `Arch` handle, only the compiler task does (spec 4.5:
/// params are arch-agnostic until resolution).
pub const SP_PLACEHOLDER: RegId = 0xfffe;

/// Rule 3: for a RET-typed node, retarget its branch to JMP via an
/// indirect adjust gadget `LOAD(pc, SP + sp_delta)`, planted as a padding
/// of a preceding `MOV_CST(jmp_reg, @adjust)` and linked as the mandatory
/// follower.
pub fn adjust_jmp(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled || g.node(n).branch_type != BranchType::Ret {
		return false;
	}
	let adjust = g.new_node(TypeId::Load, BranchType::Ret);
	let addr_name = g.new_name("adjust_sp");
	g.node_mut(adjust).params[0] = crate::strategy::graph::Parameter::fixed(ParamRole::Dst, ParamValue::Reg(SP_PLACEHOLDER), g.new_name("pc_dst"));
	g.node_mut(adjust).params[1] = crate::strategy::graph::Parameter::fixed(ParamRole::AddrReg, ParamValue::Reg(SP_PLACEHOLDER), addr_name);
	g.node_mut(adjust).params[2] = crate::strategy::graph::Parameter::free(ParamRole::Offset, g.new_name("sp_delta"));
	g.node_mut(adjust).is_indirect = true;

	let jmp_reg_name = g.new_name("jmp_reg");
	let pre_jmp = g.new_node(TypeId::MovCst, BranchType::Ret);
	g.node_mut(pre_jmp).params[0] = crate::strategy::graph::Parameter::free(ParamRole::Dst, jmp_reg_name);
	let jmp_cst_name = g.new_name("adjust_addr");
	g.node_mut(pre_jmp).params[1] = crate::strategy::graph::Parameter::dependent_address(ParamRole::Cst, adjust, jmp_cst_name);
	g.update_param_edges();

	g.node_mut(n).branch_type = BranchType::Jmp;
	g.node_mut(n)
		.strategy_constraints
		.push(StrategyConstraint::ParamRegsDiffer(0, 0)); // jmp reg must not be read/written by n (index refined by selection)
	g.node_mut(n).mandatory_following_node = Some(adjust);

	g.add_strategy_edge(pre_jmp, n);
	true
}

/// Rule 4: replace `LOAD/STORE(base + K, reg)` with a preceding
/// `AMOV_CST(base', base + K)` and `LOAD/STORE(base', reg)` (`K' = 0`): the
/// whole displacement is folded into `base2`, so selection matches gadgets
/// whose addressing mode carries no displacement of its own. `GadgetDb`
/// only wildcard-searches registers, not constants (see `PartialKey`), so a
/// genuinely free `K'` searched across candidate displacements isn't
/// resolvable by the existing query path; `K' = 0` is the one instantiation
/// selection can actually reach.
pub fn adjust_load_store(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled || !matches!(g.node(n).type_id, TypeId::Load | TypeId::ALoad | TypeId::Store | TypeId::AStore) {
		return false;
	}
	let Some(addr_idx) = g.node(n).param_index(ParamRole::AddrReg) else { return false };
	let Some(off_idx) = g.node(n).param_index(ParamRole::Offset) else { return false };
	let ParamSlot::Fixed(ParamValue::Cst(k)) = g.node(n).params[off_idx].slot else { return false };

	let base_param = g.node(n).params[addr_idx].clone();
	let amov = g.new_node(TypeId::AMovCst, BranchType::Ret);
	g.node_mut(amov).params[0] = crate::strategy::graph::Parameter::free(ParamRole::Dst, g.new_name("base2"));
	g.node_mut(amov).params[1] = base_param;
	g.node_mut(amov).params[2] = crate::strategy::graph::Parameter::fixed(ParamRole::Op, ParamValue::Op(crate::expr::BinOp::Add), g.new_name("op"));
	g.node_mut(amov).params[3] = crate::strategy::graph::Parameter::fixed(ParamRole::Cst, ParamValue::Cst(k), g.new_name("k"));

	let amov_dst_idx = 0;
	g.node_mut(n).params[addr_idx] = crate::strategy::graph::Parameter::dependent(ParamRole::AddrReg, amov, amov_dst_idx, g.new_name("base2_use"));
	g.node_mut(n).params[off_idx] = crate::strategy::graph::Parameter::fixed(ParamRole::Offset, ParamValue::Cst(0), g.new_name("kprime_zero"));
	g.node_mut(n)
		.strategy_constraints
		.push(StrategyConstraint::ParamRegsDiffer(addr_idx, addr_idx));

	g.add_strategy_edge(amov, n);
	g.update_param_edges();
	true
}

/// Rule 5: dual of (1) on the source operand — clone `n` reading a fresh
/// scratch register `R` instead of its declared source, then add
/// `n1: MOV_REG(R, src)` feeding it.
pub fn generic_src_transitivity(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled {
		return false;
	}
	let Some(src_idx) = g.node(n).param_index(ParamRole::Src) else { return false };
	let scratch: RegId = 0xfffd;
	let src_param = g.node(n).params[src_idx].clone();

	let mover = g.new_node(TypeId::MovReg, BranchType::Ret);
	g.node_mut(mover).params[0] = crate::strategy::graph::Parameter::fixed(ParamRole::Dst, ParamValue::Reg(scratch), g.new_name("src_scratch"));
	g.node_mut(mover).params[1] = src_param;
	g.node_mut(mover).params[1].is_data_link = true;

	g.node_mut(n).params[src_idx] = crate::strategy::graph::Parameter::dependent(ParamRole::Src, mover, 0, g.new_name("src_scratch_use"));
	g.node_mut(n).params[src_idx].is_data_link = true;
	g.add_strategy_edge(mover, n);
	g.update_param_edges();
	true
}

/// Rule 6 (opportunistic/optional): replace a constant load by a
/// mixed-boolean-arithmetic sequence yielding the same value — here, `K`
/// rewritten as `(K ^ M) ^ M` for a fresh mask `M`, giving selection a
/// second shape to search when a direct `MOV_CST`/`pop` candidate is
/// scarce.
pub fn mba_set_cst(g: &mut StrategyGraph, n: NodeId) -> bool {
	if g.node(n).is_disabled || g.node(n).type_id != TypeId::MovCst {
		return false;
	}
	let cst_idx = g.node(n).param_index(ParamRole::Cst).unwrap();
	let ParamSlot::Fixed(ParamValue::Cst(k)) = g.node(n).params[cst_idx].slot else {
		return false;
	};
	let dst_param = g.node(n).params[g.node(n).param_index(ParamRole::Dst).unwrap()].clone();

	// Deterministic per-node mask, not a random one: same graph always
	// rewrites the same way, which keeps `CompilerTask`'s search reproducible.
	let mask: i64 = 0x5a5a5a5a ^ (n as i64);
	let step1 = g.new_node(TypeId::MovCst, BranchType::Ret);
	g.node_mut(step1).params[0] = crate::strategy::graph::Parameter::fixed(ParamRole::Dst, ParamValue::Reg(0xfffc), g.new_name("mba_tmp"));
	g.node_mut(step1).params[1] = crate::strategy::graph::Parameter::fixed(ParamRole::Cst, ParamValue::Cst(k ^ mask), g.new_name("mba_k"));

	let step2 = g.new_node(TypeId::AMovCst, BranchType::Ret);
	g.node_mut(step2).params[0] = dst_param;
	g.node_mut(step2).params[1] = crate::strategy::graph::Parameter::dependent(ParamRole::Src, step1, 0, g.new_name("mba_tmp_use"));
	g.node_mut(step2).params[1].is_data_link = true;
	g.node_mut(step2).params[2] = crate::strategy::graph::Parameter::fixed(ParamRole::Op, ParamValue::Op(crate::expr::BinOp::Xor), g.new_name("mba_op"));
	g.node_mut(step2).params[3] = crate::strategy::graph::Parameter::fixed(ParamRole::Cst, ParamValue::Cst(mask), g.new_name("mba_mask"));

	g.add_strategy_edge(step1, step2);
	g.redirect_node(n, step2);
	g.disable_node(n);
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gadget::ParamRole;

	#[test]
	fn generic_transitivity_disables_original_and_wires_two_nodes() {
		let mut g = StrategyGraph::new();
		let n = g.new_node(TypeId::MovReg, BranchType::Ret);
		g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(1));
		g.node_mut(n).set_fixed(ParamRole::Src, ParamValue::Reg(2));
		assert!(generic_transitivity(&mut g, n));
		assert!(g.node(n).is_disabled);
		assert_eq!(g.nodes.len(), 3);
	}

	#[test]
	fn mov_cst_via_pop_produces_load_with_special_padding() {
		let mut g = StrategyGraph::new();
		let n = g.new_node(TypeId::MovCst, BranchType::Ret);
		g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(1));
		g.node_mut(n).set_fixed(ParamRole::Cst, ParamValue::Cst(0xdeadbeef));
		assert!(mov_cst_via_pop(&mut g, n));
		assert!(g.node(n).is_disabled);
		let load = g.nodes.last().unwrap();
		assert_eq!(load.type_id, TypeId::Load);
		assert_eq!(load.special_paddings.len(), 1);
	}
}
