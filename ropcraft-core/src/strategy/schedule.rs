//! C8: interference analysis, DFS scheduling, and chain emission. Runs
//! after selection has populated every node's `affected_gadget` (spec 4.8).

use crate::arch::Arch;
use crate::chain::{RopChain, RopItem};
use crate::constraint::Constraint;
use crate::strategy::graph::{InterferencePoint, NodeId, ParamSlot, ParamValue, StrategyGraph};

fn reg_bit(reg: crate::arch::RegId) -> u64 {
	if reg < 64 {
		1u64 << reg
	} else {
		0
	}
}

/// Find every data-linked register and every other selected node that
/// clobbers it between producer and consumer; each becomes one
/// `InterferencePoint` the scheduler must place before or after.
pub fn collect_interference_points(graph: &StrategyGraph) -> Vec<InterferencePoint> {
	let mut points = Vec::new();
	for consumer in &graph.nodes {
		if consumer.is_disabled {
			continue;
		}
		for (idx, p) in consumer.params.iter().enumerate() {
			if !p.is_data_link {
				continue;
			}
			let ParamSlot::Dependent { node: producer, .. } = p.slot else { continue };
			let Some(ParamValue::Reg(r)) = consumer.params[idx].resolved else { continue };
			let bit = reg_bit(r);
			for interferer in &graph.nodes {
				if interferer.is_disabled || interferer.id == producer || interferer.id == consumer.id {
					continue;
				}
				let clobbers = interferer.affected_gadget.as_ref().map(|g| g.modified_regs & bit != 0).unwrap_or(false);
				if clobbers {
					points.push(InterferencePoint { interferer: interferer.id, start: producer, end: consumer.id });
				}
			}
		}
	}
	points
}

/// Try both placements (`interferer` before `start`, or after `end`) for
/// every collected interference point, backtracking whenever a placement
/// would introduce a strategy-edge cycle. On success the chosen ordering
/// is recorded as additional strategy edges so scheduling's single DFS
/// sees both "strategy ∪ interference" as one edge set (spec 4.8).
pub fn resolve_interference(graph: &mut StrategyGraph) -> bool {
	let points = collect_interference_points(graph);
	resolve_at(graph, &points, 0)
}

fn resolve_at(graph: &mut StrategyGraph, points: &[InterferencePoint], i: usize) -> bool {
	if i == points.len() {
		return true;
	}
	let p = points[i];
	let start_is_initial = graph.node(p.start).strategy_in.is_empty();
	let end_is_final = graph.node(p.end).strategy_out.is_empty();

	// Special-case placements (spec 4.8): an initial data-link endpoint
	// forces the interferer after; a final endpoint forces it before.
	let mut candidates = Vec::new();
	if end_is_final {
		candidates.push((p.interferer, p.start)); // before start
	} else if start_is_initial {
		candidates.push((p.end, p.interferer)); // after end
	} else {
		candidates.push((p.interferer, p.start));
		candidates.push((p.end, p.interferer));
	}

	for (from, to) in candidates {
		let saved = graph.clone();
		graph.add_strategy_edge(from, to);
		if graph.dfs_strategy().is_some() && resolve_at(graph, points, i + 1) {
			return true;
		}
		*graph = saved;
	}
	false
}

/// Produce the final node order: `dfs_strategy` over the combined edge
/// set, with indirect nodes dropped (they're emitted as a padding of
/// their owner, not a stand-alone item) and every `mandatory_following_node`
/// forced to sit immediately after its owner.
pub fn schedule(graph: &StrategyGraph) -> Option<Vec<NodeId>> {
	let mut order = graph.dfs_strategy()?;
	order.retain(|&n| !graph.node(n).is_indirect);

	let mandatory: Vec<(NodeId, NodeId)> =
		graph.nodes.iter().filter(|n| !n.is_disabled && !n.is_indirect).filter_map(|n| n.mandatory_following_node.map(|m| (n.id, m))).collect();
	for (owner, follower) in mandatory {
		if graph.node(follower).is_indirect {
			continue; // planted as a padding, not scheduled as its own item
		}
		if let Some(fpos) = order.iter().position(|&n| n == follower) {
			order.remove(fpos);
		}
		let opos = order.iter().position(|&n| n == owner)?;
		order.insert(opos + 1, follower);
	}
	Some(order)
}

/// Emit the scheduled nodes into a `RopChain`: gadget address, then one
/// word per stack slot the gadget consumes up to `sp_inc`, using the
/// node's special paddings where declared and the constraint's default
/// padding elsewhere.
pub fn emit(graph: &StrategyGraph, order: &[NodeId], constraint: &Constraint, arch: &dyn Arch) -> crate::error::Result<RopChain> {
	let mut items = Vec::new();
	let word = arch.word_size();
	for &id in order {
		let node = graph.node(id);
		let gadget = node.affected_gadget.as_ref().ok_or(crate::error::Error::NoChain)?;
		let addr = *gadget.addresses.iter().find(|&&a| constraint.accepts_address(a, word)).ok_or(crate::error::Error::NoChain)?;
		items.push(RopItem::Gadget { addr, gadget: gadget.clone() });

		let nb_words = (gadget.sp_inc as usize) / word;
		for slot in 0..nb_words {
			if let Some((off_param, val_param)) = node.special_paddings.iter().find(|(off, _)| matches!(off.resolved, Some(ParamValue::Cst(o)) if o as usize == slot * word)) {
				let _ = off_param;
				// selection has already resolved every special padding by the
				// time scheduling runs; an unresolved value means a rule left a
				// dangling reference rather than a real gadget/constant.
				let Some(ParamValue::Cst(v)) = val_param.resolved else {
					return Err(crate::error::Error::NoChain);
				};
				if !constraint.accepts_address(v as u64, word) {
					return Err(crate::error::Error::NoChain);
				}
				items.push(RopItem::Padding { value: v as u64, message: Some(val_param.name.clone()) });
			} else {
				let pad = default_padding(constraint, word)?;
				items.push(RopItem::Padding { value: pad, message: None });
			}
		}
	}
	Ok(RopChain::new(items))
}

/// A word built entirely from bytes outside `constraint.bad_bytes`
/// (`get_valid_padding`, spec 6). Returns `BAD-BYTE` when no such byte
/// exists.
fn default_padding(constraint: &Constraint, word: usize) -> crate::error::Result<u64> {
	for candidate in 0u8..=255 {
		if !constraint.bad_bytes.contains(&candidate) {
			let mut v = 0u64;
			for i in 0..word {
				v |= (candidate as u64) << (i * 8);
			}
			return Ok(v);
		}
	}
	Err(crate::error::Error::NoChain)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gadget::{BranchType, TypeId};

	#[test]
	fn schedule_places_mandatory_follower_right_after_owner() {
		let mut g = StrategyGraph::new();
		let a = g.new_node(TypeId::MovReg, BranchType::Ret);
		let b = g.new_node(TypeId::MovReg, BranchType::Ret);
		let c = g.new_node(TypeId::MovReg, BranchType::Ret);
		g.add_strategy_edge(a, b);
		g.add_strategy_edge(b, c);
		g.node_mut(a).mandatory_following_node = Some(c);
		let order = schedule(&g).unwrap();
		let pos_a = order.iter().position(|&n| n == a).unwrap();
		let pos_c = order.iter().position(|&n| n == c).unwrap();
		assert_eq!(pos_c, pos_a + 1);
	}

	#[test]
	fn default_padding_avoids_bad_bytes() {
		let mut bad = Vec::new();
		for b in 0u16..256 {
			if b != 0x41 {
				bad.push(b as u8);
			}
		}
		let c = Constraint::new().with_bad_bytes(bad);
		let pad = default_padding(&c, 4).unwrap();
		assert_eq!(pad, 0x41414141);
	}
}
