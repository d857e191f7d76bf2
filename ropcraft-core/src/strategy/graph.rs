//! C5: the strategy graph. Nodes are abstract gadget slots with typed
//! parameters; two edge kinds (strategy, parameter) plus a derived
//! interference set drive selection (§4.7) and scheduling (§4.8).

use crate::arch::RegId;
use crate::constraint::GadgetFilter;
use crate::expr::BinOp;
use crate::gadget::{BranchType, Gadget, ParamRole, TypeId};
use std::sync::Arc;

pub type NodeId = usize;

/// A resolved parameter value — the concrete coordinate fed to `GadgetDb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
	Reg(RegId),
	Cst(i64),
	Op(BinOp),
}

/// How a `Parameter`'s value is determined (spec 4.5: fixed / dependent /
/// free).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSlot {
	/// Concrete value known up front (from the intent instruction or a
	/// previous rewrite).
	Fixed(ParamValue),
	/// Value equals another node's parameter, copied verbatim.
	Dependent { node: NodeId, param: usize },
	/// Value is the address of the gadget eventually selected for another
	/// node (spec 4.6 rule 3: the pre-jmp constant is the adjust gadget's
	/// own address, not one of its register parameters).
	DependentAddress(NodeId),
	/// Resolved by database search during selection.
	Free,
}

/// One coordinate of a node's gadget-type tuple.
#[derive(Debug, Clone)]
pub struct Parameter {
	pub role: ParamRole,
	pub slot: ParamSlot,
	/// True once `_resolve_param` has produced a concrete `ParamValue` for
	/// this slot in the current selection attempt.
	pub resolved: Option<ParamValue>,
	/// Marks this parameter as a data-link: its resolved value must reach
	/// every dependent consumer unclobbered (drives interference analysis).
	pub is_data_link: bool,
	/// Unique symbolic name, used as the `VarContext` binding key when this
	/// parameter is a constant (`new_name` in spec 4.5).
	pub name: String,
}

impl Parameter {
	pub fn fixed(role: ParamRole, value: ParamValue, name: impl Into<String>) -> Self {
		Parameter { role, slot: ParamSlot::Fixed(value), resolved: None, is_data_link: false, name: name.into() }
	}
	pub fn free(role: ParamRole, name: impl Into<String>) -> Self {
		Parameter { role, slot: ParamSlot::Free, resolved: None, is_data_link: false, name: name.into() }
	}
	pub fn dependent(role: ParamRole, node: NodeId, param: usize, name: impl Into<String>) -> Self {
		Parameter { role, slot: ParamSlot::Dependent { node, param }, resolved: None, is_data_link: false, name: name.into() }
	}
	pub fn dependent_address(role: ParamRole, node: NodeId, name: impl Into<String>) -> Self {
		Parameter { role, slot: ParamSlot::DependentAddress(node), resolved: None, is_data_link: false, name: name.into() }
	}
	pub fn is_free(&self) -> bool {
		matches!(self.slot, ParamSlot::Free)
	}
}

/// A predicate over a node's resolved parameters, checked before the DB is
/// queried (spec 4.6/9: "Callbacks as predicates" re-modelled as a closed
/// enum instead of function pointers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyConstraint {
	/// Two register-typed parameter indices on this node must differ
	/// (e.g. `AddrRegNeqSrcReg` for adjust-load/store).
	ParamRegsDiffer(usize, usize),
	/// `LoadOffsetUnderSpInc`: the resolved constant parameter at this
	/// index must be strictly less than the *other* parameter's resolved
	/// `sp_inc`-derived bound; used by `rule_mov_cst_via_pop`.
	OffsetUnderSpInc(usize),
}

/// A node-level assertion carried for `mem_safety` bookkeeping (spec 6):
/// "the register at this parameter index is a valid pointer".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAssertion {
	pub param: usize,
}

/// One abstract gadget slot.
#[derive(Clone)]
pub struct Node {
	pub id: NodeId,
	pub type_id: TypeId,
	pub branch_type: BranchType,
	pub params: Vec<Parameter>,
	/// `(offset_param, value_param)`: extra stack words this node's gadget
	/// consumes beyond its natural operands (spec 4.6 rule 2: the constant
	/// planted by a `pop reg; ret`).
	pub special_paddings: Vec<(Parameter, Parameter)>,
	pub strategy_constraints: Vec<StrategyConstraint>,
	pub assigned_gadget_constraints: Vec<GadgetFilter>,
	pub node_assertion: Option<NodeAssertion>,
	pub affected_gadget: Option<Arc<Gadget>>,
	pub mandatory_following_node: Option<NodeId>,
	pub is_indirect: bool,
	pub is_disabled: bool,
	pub strategy_in: Vec<NodeId>,
	pub strategy_out: Vec<NodeId>,
	pub param_in: Vec<NodeId>,
	pub param_out: Vec<NodeId>,
	pub interference_out: Vec<(NodeId, NodeId)>,
}

impl Node {
	fn new(id: NodeId, type_id: TypeId, branch_type: BranchType, name_base: &str) -> Self {
		let params = type_id
			.param_roles()
			.iter()
			.enumerate()
			.map(|(i, role)| Parameter::free(*role, format!("{name_base}_{i}")))
			.collect();
		Node {
			id,
			type_id,
			branch_type,
			params,
			special_paddings: Vec::new(),
			strategy_constraints: Vec::new(),
			assigned_gadget_constraints: Vec::new(),
			node_assertion: None,
			affected_gadget: None,
			mandatory_following_node: None,
			is_indirect: false,
			is_disabled: false,
			strategy_in: Vec::new(),
			strategy_out: Vec::new(),
			param_in: Vec::new(),
			param_out: Vec::new(),
			interference_out: Vec::new(),
		}
	}

	pub fn param_index(&self, role: ParamRole) -> Option<usize> {
		self.params.iter().position(|p| p.role == role)
	}

	pub fn set_fixed(&mut self, role: ParamRole, value: ParamValue) {
		if let Some(i) = self.param_index(role) {
			self.params[i].slot = ParamSlot::Fixed(value);
		}
	}
}

/// An interference point (spec glossary): `interferer` clobbers a
/// data-linked register live between `start` and `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterferencePoint {
	pub interferer: NodeId,
	pub start: NodeId,
	pub end: NodeId,
}

/// One candidate chaining plan. Owns its nodes; destroyed by the compiler
/// task if selection ultimately fails (spec 3: "Lifetimes").
#[derive(Clone, Default)]
pub struct StrategyGraph {
	pub nodes: Vec<Node>,
	name_counter: u64,
	pub has_gadget_selection: bool,
	pub interference_points: Vec<InterferencePoint>,
}

impl StrategyGraph {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of non-disabled, non-indirect nodes — the priority-queue size
	/// metric the compiler task orders candidate graphs by (spec 2).
	pub fn size(&self) -> usize {
		self.nodes.iter().filter(|n| !n.is_disabled && !n.is_indirect).count()
	}

	pub fn new_name(&mut self, base: &str) -> String {
		self.name_counter += 1;
		format!("{base}_{}", self.name_counter)
	}

	pub fn new_node(&mut self, type_id: TypeId, branch_type: BranchType) -> NodeId {
		let id = self.nodes.len();
		let name = format!("n{id}");
		self.nodes.push(Node::new(id, type_id, branch_type, &name));
		id
	}

	pub fn node(&self, id: NodeId) -> &Node {
		&self.nodes[id]
	}
	pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
		&mut self.nodes[id]
	}

	pub fn add_strategy_edge(&mut self, from: NodeId, to: NodeId) {
		if from == to {
			return;
		}
		if !self.nodes[from].strategy_out.contains(&to) {
			self.nodes[from].strategy_out.push(to);
		}
		if !self.nodes[to].strategy_in.contains(&from) {
			self.nodes[to].strategy_in.push(from);
		}
	}

	pub fn add_param_edge(&mut self, from: NodeId, to: NodeId) {
		if from == to {
			return;
		}
		if !self.nodes[from].param_out.contains(&to) {
			self.nodes[from].param_out.push(to);
		}
		if !self.nodes[to].param_in.contains(&from) {
			self.nodes[to].param_in.push(from);
		}
	}

	pub fn add_interference_edge(&mut self, point: InterferencePoint) {
		self.interference_points.push(point);
	}

	pub fn disable_node(&mut self, n: NodeId) {
		self.nodes[n].is_disabled = true;
	}

	/// Recompute every `param_in`/`param_out` edge from each node's current
	/// `deps` (its parameters' `ParamSlot::Dependent` targets). Called
	/// after every rewrite rule application since rules freely add/remove
	/// nodes and retarget dependencies (spec 4.5).
	pub fn update_param_edges(&mut self) {
		for n in &mut self.nodes {
			n.param_in.clear();
			n.param_out.clear();
		}
		let deps: Vec<(NodeId, NodeId)> = self
			.nodes
			.iter()
			.flat_map(|n| {
				n.params.iter().chain(n.special_paddings.iter().flat_map(|(off, val)| [off, val])).filter_map(move |p| match p.slot {
					ParamSlot::Dependent { node, .. } => Some((n.id, node)),
					ParamSlot::DependentAddress(node) => Some((n.id, node)),
					_ => None,
				})
			})
			.collect();
		for (from, to) in deps {
			self.add_param_edge(from, to);
		}
	}

	/// Replace every edge endpoint `old` with `new` across both strategy
	/// and parameter edge sets, and retarget every `Dependent` parameter
	/// pointing at `old`. Self-edges created by the substitution are
	/// dropped (spec 4.5: "self-references during redirection are
	/// suppressed"). This single routine covers the five named redirection
	/// primitives: incoming/outgoing strategy edges, incoming/outgoing
	/// parameter edges, and generic parameter-edge retargeting all reduce
	/// to "rename `old` to `new` wherever it appears".
	pub fn redirect_node(&mut self, old: NodeId, new: NodeId) {
		if old == new {
			return;
		}
		for n in &mut self.nodes {
			for p in n.params.iter_mut().chain(n.special_paddings.iter_mut().flat_map(|(off, val)| [off, val])) {
				match &mut p.slot {
					ParamSlot::Dependent { node, .. } if *node == old => *node = new,
					ParamSlot::DependentAddress(node) if *node == old => *node = new,
					_ => {}
				}
			}
			if n.mandatory_following_node == Some(old) {
				n.mandatory_following_node = Some(new);
			}
		}
		let old_out = std::mem::take(&mut self.nodes[old].strategy_out);
		for to in old_out {
			if to != new {
				self.add_strategy_edge(new, to);
			}
		}
		let old_in = std::mem::take(&mut self.nodes[old].strategy_in);
		for from in old_in {
			if from != new {
				self.add_strategy_edge(from, new);
			}
		}
		self.nodes[old].strategy_in.clear();
		self.nodes[old].strategy_out.clear();
		self.update_param_edges();
	}

	/// `compute_dfs_strategy`: a topological DFS ordering over strategy
	/// edges, visiting every non-disabled node exactly once. Returns
	/// `None` on a cycle (spec 8: DFS-CYCLE is a fatal internal bug).
	pub fn dfs_strategy(&self) -> Option<Vec<NodeId>> {
		dfs_order(&self.nodes, |n| &n.strategy_out)
	}

	/// `compute_dfs_params`: same shape, over parameter edges. Selection
	/// recursion indexes into this ordering (spec 4.7).
	pub fn dfs_params(&self) -> Option<Vec<NodeId>> {
		dfs_order(&self.nodes, |n| &n.param_out)
	}
}

/// Shared DFS-postorder-reversed topological sort used by both orderings;
/// `WHITE/GRAY/BLACK` colouring detects back edges (a cycle).
fn dfs_order(nodes: &[Node], edges: impl Fn(&Node) -> &Vec<NodeId>) -> Option<Vec<NodeId>> {
	#[derive(Clone, Copy, PartialEq, Eq)]
	enum Color {
		White,
		Gray,
		Black,
	}
	let mut color = vec![Color::White; nodes.len()];
	let mut order = Vec::with_capacity(nodes.len());

	fn visit(
		n: NodeId,
		nodes: &[Node],
		edges: &impl Fn(&Node) -> &Vec<NodeId>,
		color: &mut [Color],
		order: &mut Vec<NodeId>,
	) -> bool {
		color[n] = Color::Gray;
		for &m in edges(&nodes[n]) {
			match color[m] {
				Color::White => {
					if !visit(m, nodes, edges, color, order) {
						return false;
					}
				}
				Color::Gray => return false,
				Color::Black => {}
			}
		}
		color[n] = Color::Black;
		order.push(n);
		true
	}

	for n in nodes.iter().filter(|n| !n.is_disabled).map(|n| n.id) {
		if color[n] == Color::White && !visit(n, nodes, &edges, &mut color, &mut order) {
			return None;
		}
	}
	order.reverse();
	Some(order.into_iter().filter(|&n| !nodes[n].is_disabled).collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dfs_strategy_orders_producer_before_consumer() {
		let mut g = StrategyGraph::new();
		let a = g.new_node(TypeId::MovReg, BranchType::Ret);
		let b = g.new_node(TypeId::MovReg, BranchType::Ret);
		g.add_strategy_edge(a, b);
		let order = g.dfs_strategy().unwrap();
		assert_eq!(order, vec![a, b]);
	}

	#[test]
	fn dfs_strategy_detects_cycle() {
		let mut g = StrategyGraph::new();
		let a = g.new_node(TypeId::MovReg, BranchType::Ret);
		let b = g.new_node(TypeId::MovReg, BranchType::Ret);
		g.add_strategy_edge(a, b);
		g.add_strategy_edge(b, a);
		assert!(g.dfs_strategy().is_none());
	}

	#[test]
	fn redirect_node_retargets_dependents_and_drops_self_edge() {
		let mut g = StrategyGraph::new();
		let a = g.new_node(TypeId::MovReg, BranchType::Ret);
		let b = g.new_node(TypeId::MovReg, BranchType::Ret);
		let c = g.new_node(TypeId::MovReg, BranchType::Ret);
		g.node_mut(b).params[1].slot = ParamSlot::Dependent { node: a, param: 0 };
		g.update_param_edges();
		g.redirect_node(a, c);
		assert!(matches!(g.node(b).params[1].slot, ParamSlot::Dependent { node, .. } if node == c));
		assert!(g.node(c).strategy_in.is_empty() || !g.node(c).strategy_in.contains(&c));
	}
}
