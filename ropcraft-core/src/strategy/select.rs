//! C7: selection search. DFS over the parameter-dependency order,
//! backtracking over database candidates, honouring the global
//! `Constraint` and each node's own strategy/gadget predicates (spec 4.7).

use crate::arch::Arch;
use crate::constraint::Constraint;
use crate::db::{GadgetDb, PartialKey};
use crate::error::{Error, Result};
use crate::expr::VarContext;
use crate::gadget::{Gadget, GadgetType, ParamRole, TypeId};
use crate::strategy::graph::{NodeId, ParamSlot, ParamValue, StrategyConstraint, StrategyGraph};
use std::sync::Arc;

/// Resolve a standalone `ParamSlot`, binding `name` into `ctx` once a
/// concrete constant appears (spec 4.5 `_resolve_param`). `Dependent`
/// parameters copy their target's already-resolved value; `DependentAddress`
/// copies the target node's selected gadget address. Fixed and dependent
/// values resolve uniformly rather than special-casing fixed away (spec 9,
/// open question 2).
fn resolve_slot(graph: &StrategyGraph, ctx: &mut VarContext, slot: &ParamSlot, name: &str) -> Option<ParamValue> {
	let value = match *slot {
		ParamSlot::Fixed(v) => Some(v),
		ParamSlot::Dependent { node: src_node, param: src_idx } => graph.node(src_node).params[src_idx].resolved,
		ParamSlot::DependentAddress(src_node) => {
			let gadget = graph.node(src_node).affected_gadget.as_ref()?;
			gadget.addresses.first().map(|&a| ParamValue::Cst(a as i64))
		}
		ParamSlot::Free => None,
	};
	if let Some(ParamValue::Cst(c)) = value {
		ctx.bind(name.to_string(), c as u64);
	}
	value
}

/// Resolve `node`'s parameter at `idx`.
fn resolve_param(graph: &mut StrategyGraph, ctx: &mut VarContext, node: NodeId, idx: usize) -> Option<ParamValue> {
	let (slot, name) = {
		let p = &graph.node(node).params[idx];
		(p.slot.clone(), p.name.clone())
	};
	let value = resolve_slot(graph, ctx, &slot, &name);
	graph.node_mut(node).params[idx].resolved = value;
	value
}

/// Resolve every parameter of `node`, then its special paddings (their
/// value parameters may depend on parameters just resolved above them).
fn resolve_all_params(graph: &mut StrategyGraph, ctx: &mut VarContext, node: NodeId) {
	for idx in 0..graph.node(node).params.len() {
		resolve_param(graph, ctx, node, idx);
	}
	for i in 0..graph.node(node).special_paddings.len() {
		let (off_slot, off_name, val_slot, val_name) = {
			let (off, val) = &graph.node(node).special_paddings[i];
			(off.slot.clone(), off.name.clone(), val.slot.clone(), val.name.clone())
		};
		let off_resolved = resolve_slot(graph, ctx, &off_slot, &off_name);
		let val_resolved = resolve_slot(graph, ctx, &val_slot, &val_name);
		let pad = &mut graph.node_mut(node).special_paddings[i];
		pad.0.resolved = off_resolved;
		pad.1.resolved = val_resolved;
	}
}

fn reg_val(v: Option<ParamValue>) -> Option<crate::arch::RegId> {
	match v {
		Some(ParamValue::Reg(r)) => Some(r),
		_ => None,
	}
}
fn cst_val(v: Option<ParamValue>) -> Option<i64> {
	match v {
		Some(ParamValue::Cst(c)) => Some(c),
		_ => None,
	}
}
fn op_val(v: Option<ParamValue>) -> Option<crate::expr::BinOp> {
	match v {
		Some(ParamValue::Op(o)) => Some(o),
		_ => None,
	}
}

/// Build the wildcard query for `node`'s current (possibly partial)
/// resolved parameters.
fn build_partial_key(graph: &StrategyGraph, node: NodeId, sp: crate::arch::RegId) -> Option<PartialKey> {
	let n = graph.node(node);
	let r = |role: ParamRole| n.param_index(role).map(|i| n.params[i].resolved).unwrap_or(None);
	let _ = sp; // SP_PLACEHOLDER substitution happens in bind_resolved once a concrete key is chosen
	Some(match n.type_id {
		TypeId::MovCst => PartialKey::MovCst { dst: reg_val(r(ParamRole::Dst)), cst: cst_val(r(ParamRole::Cst))? },
		TypeId::MovReg => PartialKey::MovReg { dst: reg_val(r(ParamRole::Dst)), src: reg_val(r(ParamRole::Src)) },
		TypeId::AMovCst => PartialKey::AMovCst {
			dst: reg_val(r(ParamRole::Dst)),
			src: reg_val(r(ParamRole::Src)),
			op: op_val(r(ParamRole::Op)),
			cst: cst_val(r(ParamRole::Cst))?,
		},
		TypeId::AMovReg => PartialKey::AMovReg {
			dst: reg_val(r(ParamRole::Dst)),
			src1: reg_val(r(ParamRole::Src1)),
			op: op_val(r(ParamRole::Op)),
			src2: reg_val(r(ParamRole::Src2)),
		},
		TypeId::Load => PartialKey::Load {
			dst: reg_val(r(ParamRole::Dst)),
			addr_reg: reg_val(r(ParamRole::AddrReg)),
			offset: cst_val(r(ParamRole::Offset))?,
		},
		TypeId::ALoad => PartialKey::ALoad {
			dst: reg_val(r(ParamRole::Dst)),
			op: op_val(r(ParamRole::Op)),
			addr_reg: reg_val(r(ParamRole::AddrReg)),
			offset: cst_val(r(ParamRole::Offset))?,
		},
		TypeId::Store => PartialKey::Store {
			addr_reg: reg_val(r(ParamRole::AddrReg)),
			offset: cst_val(r(ParamRole::Offset))?,
			src: reg_val(r(ParamRole::Src)),
		},
		TypeId::AStore => PartialKey::AStore {
			addr_reg: reg_val(r(ParamRole::AddrReg)),
			offset: cst_val(r(ParamRole::Offset))?,
			op: op_val(r(ParamRole::Op)),
			src: reg_val(r(ParamRole::Src)),
		},
		TypeId::Jmp => PartialKey::Jmp { reg: reg_val(r(ParamRole::JmpReg)) },
		TypeId::Syscall => PartialKey::Syscall,
		TypeId::Int80 => PartialKey::Int80,
	})
}

fn key_to_gadget_type(key: &PartialKey) -> Option<GadgetType> {
	Some(match *key {
		PartialKey::MovCst { dst: Some(dst), cst } => GadgetType::MovCst { dst, cst },
		PartialKey::MovReg { dst: Some(dst), src: Some(src) } => GadgetType::MovReg { dst, src },
		PartialKey::AMovCst { dst: Some(dst), src: Some(src), op: Some(op), cst } => GadgetType::AMovCst { dst, src, op, cst },
		PartialKey::AMovReg { dst: Some(dst), src1: Some(src1), op: Some(op), src2: Some(src2) } => {
			GadgetType::AMovReg { dst, src1, op, src2 }
		}
		PartialKey::Load { dst: Some(dst), addr_reg: Some(addr_reg), offset } => GadgetType::Load { dst, addr_reg, offset },
		PartialKey::ALoad { dst: Some(dst), op: Some(op), addr_reg: Some(addr_reg), offset } => {
			GadgetType::ALoad { dst, op, addr_reg, offset }
		}
		PartialKey::Store { addr_reg: Some(addr_reg), offset, src: Some(src) } => GadgetType::Store { addr_reg, offset, src },
		PartialKey::AStore { addr_reg: Some(addr_reg), offset, op: Some(op), src: Some(src) } => {
			GadgetType::AStore { addr_reg, offset, op, src }
		}
		PartialKey::Jmp { reg: Some(reg) } => GadgetType::Jmp { reg },
		PartialKey::Syscall => GadgetType::Syscall,
		PartialKey::Int80 => GadgetType::Int80,
		_ => return None,
	})
}

/// Whether every parameter of `key` is concrete (no free coordinate left).
fn key_is_exact(key: &PartialKey) -> bool {
	key_to_gadget_type(key).is_some()
}

fn bind_resolved(graph: &mut StrategyGraph, node: NodeId, ty: &GadgetType) {
	let roles = graph.node(node).type_id.param_roles().to_vec();
	for (i, role) in roles.iter().enumerate() {
		let v = match (*role, *ty) {
			(ParamRole::Dst, GadgetType::MovCst { dst, .. } | GadgetType::MovReg { dst, .. })
			| (ParamRole::Dst, GadgetType::AMovCst { dst, .. } | GadgetType::AMovReg { dst, .. })
			| (ParamRole::Dst, GadgetType::Load { dst, .. } | GadgetType::ALoad { dst, .. }) => Some(ParamValue::Reg(dst)),
			(ParamRole::Src, GadgetType::MovReg { src, .. } | GadgetType::AMovCst { src, .. }) => Some(ParamValue::Reg(src)),
			(ParamRole::Src, GadgetType::Store { src, .. } | GadgetType::AStore { src, .. }) => Some(ParamValue::Reg(src)),
			(ParamRole::Src1, GadgetType::AMovReg { src1, .. }) => Some(ParamValue::Reg(src1)),
			(ParamRole::Src2, GadgetType::AMovReg { src2, .. }) => Some(ParamValue::Reg(src2)),
			(ParamRole::AddrReg, GadgetType::Load { addr_reg, .. } | GadgetType::ALoad { addr_reg, .. }) => Some(ParamValue::Reg(addr_reg)),
			(ParamRole::AddrReg, GadgetType::Store { addr_reg, .. } | GadgetType::AStore { addr_reg, .. }) => {
				Some(ParamValue::Reg(addr_reg))
			}
			(ParamRole::Offset, GadgetType::Load { offset, .. } | GadgetType::ALoad { offset, .. }) => Some(ParamValue::Cst(offset)),
			(ParamRole::Offset, GadgetType::Store { offset, .. } | GadgetType::AStore { offset, .. }) => Some(ParamValue::Cst(offset)),
			(ParamRole::Op, GadgetType::AMovCst { op, .. } | GadgetType::AMovReg { op, .. }) => Some(ParamValue::Op(op)),
			(ParamRole::Op, GadgetType::AStore { op, .. }) => Some(ParamValue::Op(op)),
			(ParamRole::Cst, GadgetType::MovCst { cst, .. } | GadgetType::AMovCst { cst, .. }) => Some(ParamValue::Cst(cst)),
			(ParamRole::JmpReg, GadgetType::Jmp { reg }) => Some(ParamValue::Reg(reg)),
			_ => graph.node(node).params[i].resolved,
		};
		graph.node_mut(node).params[i].resolved = v;
	}
}

fn check_strategy_constraints(graph: &StrategyGraph, node: NodeId) -> bool {
	let n = graph.node(node);
	for c in &n.strategy_constraints {
		match *c {
			StrategyConstraint::ParamRegsDiffer(a, b) => {
				if a == b {
					continue;
				}
				if let (Some(ParamValue::Reg(ra)), Some(ParamValue::Reg(rb))) = (n.params[a].resolved, n.params[b].resolved) {
					if ra == rb {
						return false;
					}
				}
			}
			StrategyConstraint::OffsetUnderSpInc(idx) => {
				if let Some(ParamValue::Cst(off)) = n.params[idx].resolved {
					if !(0..160).contains(&off) {
						return false;
					}
				}
			}
		}
	}
	true
}

fn check_gadget(graph: &StrategyGraph, node: NodeId, gadget: &Gadget, constraint: &Constraint, arch: &dyn Arch) -> bool {
	if !constraint.accepts_gadget_address(gadget, arch.word_size()) {
		return false;
	}
	if !constraint.accepts_gadget(gadget) {
		return false;
	}
	graph.node(node).assigned_gadget_constraints.iter().all(|f| {
		let mut tmp = constraint.clone();
		tmp.filters = vec![*f];
		tmp.accepts_gadget(gadget)
	})
}

/// Entry point: attempt to assign a gadget to every non-disabled,
/// non-indirect node of `graph`. On success, every such node's
/// `affected_gadget` is populated and `graph.has_gadget_selection = true`.
pub fn select(graph: &mut StrategyGraph, db: &GadgetDb, arch: &dyn Arch, constraint: &Constraint) -> Result<bool> {
	let order = graph.dfs_params().ok_or(Error::IlSemantic("parameter edges contain a cycle".into()))?;
	let mut ctx = VarContext::new();
	let ok = select_at(graph, &order, 0, db, arch, constraint, &mut ctx);
	graph.has_gadget_selection = ok;
	Ok(ok)
}

fn select_at(
	graph: &mut StrategyGraph,
	order: &[NodeId],
	i: usize,
	db: &GadgetDb,
	arch: &dyn Arch,
	constraint: &Constraint,
	ctx: &mut VarContext,
) -> bool {
	if i == order.len() {
		return true;
	}
	let node = order[i];
	if graph.node(node).is_disabled {
		resolve_all_params(graph, ctx, node);
		return select_at(graph, order, i + 1, db, arch, constraint, ctx);
	}

	resolve_all_params(graph, ctx, node);
	let Some(partial) = build_partial_key(graph, node, arch.sp()) else {
		return false;
	};

	if key_is_exact(&partial) {
		let ty = key_to_gadget_type(&partial).unwrap();
		if !check_strategy_constraints(graph, node) {
			return false;
		}
		for gadget in db.get_exact(&ty) {
			if !check_gadget(graph, node, gadget, constraint, arch) {
				continue;
			}
			graph.node_mut(node).affected_gadget = Some(Arc::clone(gadget));
			if select_at(graph, order, i + 1, db, arch, constraint, ctx) {
				return true;
			}
		}
		graph.node_mut(node).affected_gadget = None;
		return false;
	}

	for (ty, gadgets) in db.get_possible(&partial, arch) {
		bind_resolved(graph, node, &ty);
		resolve_all_params(graph, ctx, node); // re-resolve special paddings against newly bound params
		if !check_strategy_constraints(graph, node) {
			continue;
		}
		for gadget in &gadgets {
			if !check_gadget(graph, node, gadget, constraint, arch) {
				continue;
			}
			graph.node_mut(node).affected_gadget = Some(Arc::clone(gadget));
			if select_at(graph, order, i + 1, db, arch, constraint, ctx) {
				return true;
			}
		}
	}
	graph.node_mut(node).affected_gadget = None;
	false
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::{ToyArch, REG_A, REG_B};
	use crate::gadget::{BranchType, ParamRole};
	use crate::strategy::graph::ParamValue;

	#[test]
	fn select_fills_exact_match_node() {
		let arch = ToyArch;
		let mut db = GadgetDb::new();
		let mut arena = crate::expr::ExprArena::new();
		let mut regs = rustc_hash::FxHashMap::default();
		let src = arena.var(32, "r1", Some(REG_B));
		regs.insert(REG_A, src);
		let sp0 = arena.var(32, "r3", Some(arch.sp()));
		let sem = crate::ir::Semantics {
			regs,
			mem: vec![],
			terminal: Some(crate::ir::Terminal::Pc(arena.mem(32, sp0))),
			sp_inc: Some(4),
			max_sp_inc: Some(4),
		};
		let (entries, branch_type, jmp_reg, sp_inc, modified) = crate::gadget::classify(&mut arena, &arch, &sem).unwrap();
		let gadget = Arc::new(Gadget {
			id: 0,
			addresses: vec![2],
			asm_str: "mov eax, ecx; ret".into(),
			semantics: sem,
			sp_inc,
			max_sp_inc: sp_inc,
			branch_type,
			jmp_reg,
			modified_regs: modified,
			dereferenced_regs: 0,
			nb_instr: 1,
		});
		for e in entries {
			db.insert(e, gadget.clone());
		}

		let mut graph = StrategyGraph::new();
		let n = graph.new_node(TypeId::MovReg, BranchType::Ret);
		graph.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(REG_A));
		graph.node_mut(n).set_fixed(ParamRole::Src, ParamValue::Reg(REG_B));

		let constraint = Constraint::new();
		let ok = select(&mut graph, &db, &arch, &constraint).unwrap();
		assert!(ok);
		assert!(graph.node(n).affected_gadget.is_some());
	}
}
