//! Top-level `CompilerTask`: lowers an `IntentProgram` to a seed strategy
//! graph per statement, then iterates a priority queue of candidate graphs
//! — smallest first — trying selection, else enqueuing rewritten children,
//! until a chain is found, the queue empties, the try budget is exhausted,
//! or cancellation is observed (spec 2/5).

use crate::arch::{Abi, Arch, RegId, System};
use crate::chain::RopChain;
use crate::constraint::Constraint;
use crate::db::GadgetDb;
use crate::error::{Error, Result};
use crate::gadget::{BranchType, ParamRole, TypeId};
use crate::intent::{IntentExpr, IntentProgram, Stmt};
use crate::strategy::graph::{NodeId, ParamValue, StrategyGraph};
use crate::strategy::{rules, schedule, select};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The cooperative cancellation flag (spec 5): "install on enter compile,
/// remove on leave" re-expressed as an injected token instead of a
/// process-wide SIGINT handler, so the engine is reentrant and testable.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn new() -> Self {
		Self::default()
	}
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
	fn clear(&self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

const DEFAULT_TRY_BUDGET: u32 = 3000;

struct QueueEntry {
	graph: StrategyGraph,
}

impl PartialEq for QueueEntry {
	fn eq(&self, other: &Self) -> bool {
		self.graph.size() == other.graph.size()
	}
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for QueueEntry {
	// `BinaryHeap` is a max-heap; reverse so the smallest graph pops first.
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		other.graph.size().cmp(&self.graph.size())
	}
}

pub struct CompilerTask<'a> {
	pub db: &'a GadgetDb,
	pub arch: &'a dyn Arch,
	pub constraint: Constraint,
	/// Open question 2 (spec 9): the external try-budget parameter wins
	/// over any hard-coded default, unlike the source it's modelled on.
	pub try_budget: u32,
	pub cancel: CancelToken,
}

impl<'a> CompilerTask<'a> {
	pub fn new(db: &'a GadgetDb, arch: &'a dyn Arch, constraint: Constraint) -> Self {
		CompilerTask { db, arch, constraint, try_budget: DEFAULT_TRY_BUDGET, cancel: CancelToken::new() }
	}

	pub fn with_try_budget(mut self, budget: u32) -> Self {
		self.try_budget = budget;
		self
	}

	/// Compile a full intent program to one spliced chain: every
	/// statement lowers to its own seed graph and compiles independently;
	/// successful chains are concatenated in program order.
	pub fn compile_program(&mut self, program: &IntentProgram) -> Result<RopChain> {
		let mut items = Vec::new();
		for stmt in &program.stmts {
			let chain = self.compile_stmt(stmt)?;
			items.extend(chain.items);
		}
		Ok(RopChain::new(items))
	}

	fn compile_stmt(&mut self, stmt: &Stmt) -> Result<RopChain> {
		match stmt {
			Stmt::JmpReg { reg } => self.compile_seed(seed_jmp_reg(*reg)),
			Stmt::SetReg { dst, value } => self.compile_seed(seed_set_reg(*dst, value)?),
			Stmt::StoreMem { addr, value } => self.compile_seed(seed_store_mem(addr, value)?),
			Stmt::Syscall { number, args, system } => self.compile_seed(seed_syscall(self.arch, number, args, *system)?),
			Stmt::Call { target, args, abi } => self.compile_call(target, args, *abi),
		}
	}

	/// `N(args...)`: set up argument registers via ordinary chain
	/// compilation, then splice the literal target address as the next
	/// chain word — the preceding `ret` pops it and transfers control, the
	/// same mechanism `adjust_jmp`'s indirect node uses (spec 6). Only a
	/// constant target is supported; a register target would require
	/// call-through-register lowering the distilled grammar does not name.
	fn compile_call(&mut self, target: &IntentExpr, args: &[IntentExpr], abi: Abi) -> Result<RopChain> {
		let IntentExpr::Cst(addr) = target else {
			return Err(Error::IlSemantic("call target must be a constant address".into()));
		};
		let arg_regs = self.arch.abi_arg_regs(abi)?;
		if args.len() > arg_regs.len() {
			return Err(Error::IlSemantic(format!("call has {} args, ABI provides {} registers", args.len(), arg_regs.len())));
		}
		let mut chain_items = Vec::new();
		for (reg, arg) in arg_regs.iter().zip(args.iter()) {
			let sub = self.compile_seed(seed_set_reg(*reg, arg)?)?;
			chain_items.extend(sub.items);
		}
		chain_items.push(crate::chain::RopItem::GadgetAddress { value: *addr as u64, message: Some("call target".into()) });
		if self.arch.callee_cleans_args(abi) {
			// cdecl: the callee's own `ret N` pops its arguments, so the
			// caller must still reserve the words here for chain-offset
			// bookkeeping even though their content is never read.
			for _ in 0..args.len() {
				chain_items.push(crate::chain::RopItem::Padding { value: 0, message: Some("cdecl arg cleanup".into()) });
			}
		}
		Ok(RopChain::new(chain_items))
	}

	fn compile_seed(&mut self, seed: StrategyGraph) -> Result<RopChain> {
		let mut heap = BinaryHeap::new();
		heap.push(QueueEntry { graph: seed });
		let mut tries = 0u32;

		while let Some(QueueEntry { mut graph }) = heap.pop() {
			if self.cancel.is_cancelled() {
				self.cancel.clear();
				return Err(Error::Cancelled);
			}
			if tries >= self.try_budget {
				return Err(Error::NoChain);
			}
			tries += 1;

			if select::select(&mut graph, self.db, self.arch, &self.constraint)? {
				if schedule::resolve_interference(&mut graph) {
					if let Some(order) = schedule::schedule(&graph) {
						if let Ok(chain) = schedule::emit(&graph, &order, &self.constraint, self.arch) {
							return Ok(chain);
						}
					}
				}
			}

			for &rule in rules::CATALOGUE {
				for node in 0..graph.nodes.len() {
					let mut candidate = graph.clone();
					if rule(&mut candidate, node) {
						candidate.update_param_edges();
						heap.push(QueueEntry { graph: candidate });
					}
				}
			}
		}
		Err(Error::NoChain)
	}
}

fn seed_jmp_reg(reg: RegId) -> StrategyGraph {
	let mut g = StrategyGraph::new();
	let n = g.new_node(TypeId::Jmp, BranchType::Jmp);
	g.node_mut(n).set_fixed(ParamRole::JmpReg, ParamValue::Reg(reg));
	g
}

/// Decompose a memory-address intent expression into `(base register,
/// constant offset)`, the only addressing shape the taxonomy supports
/// (spec 4.3's Load/Store patterns).
fn split_addr(expr: &IntentExpr) -> Result<(RegId, i64)> {
	match expr {
		IntentExpr::Reg(r) => Ok((*r, 0)),
		IntentExpr::Bin(crate::expr::BinOp::Add, a, b) => match (a.as_ref(), b.as_ref()) {
			(IntentExpr::Reg(r), IntentExpr::Cst(k)) | (IntentExpr::Cst(k), IntentExpr::Reg(r)) => Ok((*r, *k)),
			_ => Err(Error::IlSemantic("unsupported memory address shape".into())),
		},
		IntentExpr::Cst(_) => Err(Error::IlSemantic("absolute memory addressing requires a base-register gadget and is not supported".into())),
		_ => Err(Error::IlSemantic("unsupported memory address shape".into())),
	}
}

fn seed_set_reg(dst: RegId, value: &IntentExpr) -> Result<StrategyGraph> {
	let mut g = StrategyGraph::new();
	match value {
		IntentExpr::Cst(v) => {
			let n = g.new_node(TypeId::MovCst, BranchType::Ret);
			g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(dst));
			g.node_mut(n).set_fixed(ParamRole::Cst, ParamValue::Cst(*v));
		}
		IntentExpr::Reg(src) => {
			let n = g.new_node(TypeId::MovReg, BranchType::Ret);
			g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(dst));
			g.node_mut(n).set_fixed(ParamRole::Src, ParamValue::Reg(*src));
		}
		IntentExpr::Bin(op, a, b) => match (a.as_ref(), b.as_ref()) {
			(IntentExpr::Reg(r), IntentExpr::Cst(k)) => {
				let n = g.new_node(TypeId::AMovCst, BranchType::Ret);
				g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(dst));
				g.node_mut(n).set_fixed(ParamRole::Src, ParamValue::Reg(*r));
				g.node_mut(n).set_fixed(ParamRole::Op, ParamValue::Op(*op));
				g.node_mut(n).set_fixed(ParamRole::Cst, ParamValue::Cst(*k));
			}
			(IntentExpr::Reg(r1), IntentExpr::Reg(r2)) => {
				let n = g.new_node(TypeId::AMovReg, BranchType::Ret);
				g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(dst));
				g.node_mut(n).set_fixed(ParamRole::Src1, ParamValue::Reg(*r1));
				g.node_mut(n).set_fixed(ParamRole::Op, ParamValue::Op(*op));
				g.node_mut(n).set_fixed(ParamRole::Src2, ParamValue::Reg(*r2));
			}
			_ => return Err(Error::IlSemantic("unsupported register-arithmetic shape".into())),
		},
		IntentExpr::Mem(addr) => {
			let (addr_reg, offset) = split_addr(addr)?;
			let n = g.new_node(TypeId::Load, BranchType::Ret);
			g.node_mut(n).set_fixed(ParamRole::Dst, ParamValue::Reg(dst));
			g.node_mut(n).set_fixed(ParamRole::AddrReg, ParamValue::Reg(addr_reg));
			g.node_mut(n).set_fixed(ParamRole::Offset, ParamValue::Cst(offset));
		}
	}
	Ok(g)
}

fn seed_store_mem(addr: &IntentExpr, value: &IntentExpr) -> Result<StrategyGraph> {
	let (addr_reg, offset) = split_addr(addr)?;
	let mut g = StrategyGraph::new();
	match value {
		IntentExpr::Reg(src) => {
			let n = g.new_node(TypeId::Store, BranchType::Ret);
			g.node_mut(n).set_fixed(ParamRole::AddrReg, ParamValue::Reg(addr_reg));
			g.node_mut(n).set_fixed(ParamRole::Offset, ParamValue::Cst(offset));
			g.node_mut(n).set_fixed(ParamRole::Src, ParamValue::Reg(*src));
		}
		_ => return Err(Error::IlSemantic("store value must be a register (expand constants via a scratch mov first)".into())),
	}
	Ok(g)
}

fn seed_syscall(arch: &dyn Arch, number: &Option<IntentExpr>, args: &[IntentExpr], system: System) -> Result<StrategyGraph> {
	let (num_reg, arg_regs) = arch.syscall_regs(system)?;
	if args.len() > arg_regs.len() {
		return Err(Error::IlSemantic(format!("syscall has {} args, {} arg registers available", args.len(), arg_regs.len())));
	}
	let mut g = StrategyGraph::new();

	// Bare `syscall`: number/args assumed already in place by preceding
	// statements, so the seed is just the lone Syscall node.
	let Some(number) = number else {
		if !args.is_empty() {
			return Err(Error::IlSemantic("bare syscall takes no arguments".into()));
		}
		g.new_node(TypeId::Syscall, BranchType::Syscall);
		return Ok(g);
	};

	let num_node = g.new_node(TypeId::MovCst, BranchType::Ret);
	g.node_mut(num_node).set_fixed(ParamRole::Dst, ParamValue::Reg(num_reg));
	match number {
		IntentExpr::Cst(v) => g.node_mut(num_node).set_fixed(ParamRole::Cst, ParamValue::Cst(*v)),
		_ => return Err(Error::IlSemantic("syscall number must be a constant".into())),
	}
	let mut prev: NodeId = num_node;
	for (reg, arg) in arg_regs.iter().zip(args.iter()) {
		let sub = seed_set_reg(*reg, arg)?;
		let offset = g.nodes.len();
		for node in &sub.nodes {
			let mut n = node.clone();
			n.id += offset;
			g.nodes.push(n);
		}
		let new_id = offset; // seed_set_reg always produces exactly one node
		g.add_strategy_edge(prev, new_id);
		prev = new_id;
	}
	let sys_node = g.new_node(TypeId::Syscall, BranchType::Syscall);
	g.add_strategy_edge(prev, sys_node);
	Ok(g)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::{ToyArch, REG_A, REG_B, REG_C, REG_D};
	use crate::chain::RopItem;
	use crate::expr::{BinOp, ExprArena};
	use crate::gadget::{classify, Gadget};
	use crate::ir::{reg_var_name, Semantics, Terminal};

	/// Build one literal gadget from a hand-written `Semantics` and insert
	/// it into `db` under every key the classifier emits — the "small
	/// literal `GadgetDb`" construction the ambient test-tooling notes call
	/// for, standing in for a real disassembler in these end-to-end tests.
	fn add_gadget(db: &mut GadgetDb, arena: &mut ExprArena, arch: &dyn Arch, id: u32, addr: u64, asm: &str, sem: Semantics) {
		let (entries, branch_type, jmp_reg, sp_inc, modified) = classify(arena, arch, &sem).expect("gadget must classify");
		let gadget = Arc::new(Gadget {
			id,
			addresses: vec![addr],
			asm_str: asm.to_string(),
			semantics: sem,
			sp_inc,
			max_sp_inc: sp_inc,
			branch_type,
			jmp_reg,
			modified_regs: modified,
			dereferenced_regs: 0,
			nb_instr: 1,
		});
		for entry in entries {
			db.insert(entry, gadget.clone());
		}
		db.all.push(gadget);
	}

	/// `reg <- var(reg)`, i.e. this register's final value equals another
	/// register's starting value (a plain `mov dst, src`).
	fn reg_of(arena: &mut ExprArena, arch: &dyn Arch, reg: RegId) -> crate::expr::ExprId {
		arena.var(arch.bits(), reg_var_name(reg), Some(reg))
	}

	/// A bare `ret`: fetches its target from `[sp]`. The implicit advance
	/// past that fetched word is accounted for by the chain builder moving
	/// on to the next item, not by `sp_inc` — a lone `ret` with no other
	/// stack effects has `sp_inc = 0`.
	fn ret_terminal(arena: &mut ExprArena, arch: &dyn Arch) -> (Terminal, u64) {
		let sp = reg_of(arena, arch, arch.sp());
		let addr = arena.mem(arch.bits(), sp);
		(Terminal::Pc(addr), 0)
	}

	fn chain_words(chain: &RopChain) -> Vec<u64> {
		chain
			.items
			.iter()
			.map(|item| match item {
				RopItem::Gadget { addr, .. } => *addr,
				RopItem::Padding { value, .. } => *value,
				RopItem::GadgetAddress { value, .. } => *value,
			})
			.collect()
	}

	#[test]
	fn direct_mov_reg() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		let (terminal, sp_inc) = ret_terminal(&mut arena, &arch);
		let src = reg_of(&mut arena, &arch, REG_B);
		let mut sem = Semantics { terminal: Some(terminal), sp_inc: Some(sp_inc), ..Default::default() };
		sem.regs.insert(REG_A, src);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x2, "mov a, b; ret", sem);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_A, value: IntentExpr::Reg(REG_B) });

		let mut task = CompilerTask::new(&db, &arch, Constraint::new());
		let chain = task.compile_program(&program).expect("direct mov should chain");
		assert_eq!(chain_words(&chain), vec![0x2]);
	}

	#[test]
	fn mov_cst_via_pop() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		// pop b; ret: b <- [sp], sp advances one word from the explicit
		// pop (the ret's own implicit advance isn't folded into sp_inc,
		// see `ret_terminal`).
		let word = arch.word_size() as u64;
		let sp0 = reg_of(&mut arena, &arch, arch.sp());
		let popped_addr = arena.mem(arch.bits(), sp0);
		let word_cst = arena.cst(arch.bits(), word);
		let ret_addr = arena.binop(BinOp::Add, sp0, word_cst);
		let ret_slot = arena.mem(arch.bits(), ret_addr);
		let mut sem = Semantics { terminal: Some(Terminal::Pc(ret_slot)), sp_inc: Some(word), ..Default::default() };
		sem.regs.insert(REG_B, popped_addr);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x10, "pop b; ret", sem);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_B, value: IntentExpr::Cst(0xdeadbeefu32 as i64) });

		let mut task = CompilerTask::new(&db, &arch, Constraint::new());
		let chain = task.compile_program(&program).expect("mov-cst-via-pop should chain");
		assert_eq!(chain_words(&chain), vec![0x10, 0xdeadbeef]);
	}

	#[test]
	fn transitivity() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		// mov c, d; ret: c <- d (d stands in for spec's "edi").
		let (t1, sp1) = ret_terminal(&mut arena, &arch);
		let mut sem1 = Semantics { terminal: Some(t1), sp_inc: Some(sp1), ..Default::default() };
		let d_val = reg_of(&mut arena, &arch, REG_D);
		sem1.regs.insert(REG_C, d_val);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x1, "mov c, d; ret", sem1);

		// mov a, c; ret: a <- c.
		let (t2, sp2) = ret_terminal(&mut arena, &arch);
		let mut sem2 = Semantics { terminal: Some(t2), sp_inc: Some(sp2), ..Default::default() };
		let c_val = reg_of(&mut arena, &arch, REG_C);
		sem2.regs.insert(REG_A, c_val);
		add_gadget(&mut db, &mut arena, &arch, 1, 0x2, "mov a, c; ret", sem2);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_A, value: IntentExpr::Reg(REG_D) });

		let mut task = CompilerTask::new(&db, &arch, Constraint::new());
		let chain = task.compile_program(&program).expect("transitive mov should chain");
		assert_eq!(chain_words(&chain), vec![0x1, 0x2]);
	}

	#[test]
	fn bad_byte_avoidance_yields_no_chain() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		let word = arch.word_size() as u64;
		let sp0 = reg_of(&mut arena, &arch, arch.sp());
		let popped_addr = arena.mem(arch.bits(), sp0);
		let word_cst = arena.cst(arch.bits(), word);
		let ret_addr = arena.binop(BinOp::Add, sp0, word_cst);
		let ret_slot = arena.mem(arch.bits(), ret_addr);
		let mut sem = Semantics { terminal: Some(Terminal::Pc(ret_slot)), sp_inc: Some(word), ..Default::default() };
		sem.regs.insert(REG_B, popped_addr);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x10, "pop b; ret", sem);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_B, value: IntentExpr::Cst(0xdeadbeefu32 as i64) });

		// 0xdeadbeef's second byte is 0xbe: the only candidate padding, so
		// no chain can avoid it.
		let constraint = Constraint::new().with_bad_bytes([0xbe]);
		let mut task = CompilerTask::new(&db, &arch, constraint);
		let result = task.compile_program(&program);
		assert!(matches!(result, Err(Error::NoChain)));
	}

	#[test]
	fn cancellation_mid_compile_returns_no_hang() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		let (terminal, sp_inc) = ret_terminal(&mut arena, &arch);
		let src = reg_of(&mut arena, &arch, REG_B);
		let mut sem = Semantics { terminal: Some(terminal), sp_inc: Some(sp_inc), ..Default::default() };
		sem.regs.insert(REG_A, src);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x2, "mov a, b; ret", sem);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_A, value: IntentExpr::Reg(REG_B) });

		let mut task = CompilerTask::new(&db, &arch, Constraint::new());
		task.cancel.cancel();
		let result = task.compile_program(&program);
		assert!(matches!(result, Err(Error::Cancelled)));
	}

	#[test]
	fn exhausted_try_budget_yields_no_chain_without_hanging() {
		let arch = ToyArch;
		let mut arena = ExprArena::new();
		let mut db = GadgetDb::new();

		let (terminal, sp_inc) = ret_terminal(&mut arena, &arch);
		let src = reg_of(&mut arena, &arch, REG_B);
		let mut sem = Semantics { terminal: Some(terminal), sp_inc: Some(sp_inc), ..Default::default() };
		sem.regs.insert(REG_A, src);
		add_gadget(&mut db, &mut arena, &arch, 0, 0x2, "mov a, b; ret", sem);

		let mut program = IntentProgram::new();
		program.push(Stmt::SetReg { dst: REG_A, value: IntentExpr::Reg(REG_B) });

		let mut task = CompilerTask::new(&db, &arch, Constraint::new()).with_try_budget(0);
		let result = task.compile_program(&program);
		assert!(matches!(result, Err(Error::NoChain)));
	}
}
