//! Rewrite-to-fixpoint simplifier (spec 4.1). A two-tier driver: tier 1
//! tries local rewrites at the root; tier 2 recurses into children when the
//! root didn't change, then re-canonicalises and retries from tier 1. Each
//! subterm is capped at 64 iterations (design notes: an unbounded fixpoint
//! is the only part of the source that can loop forever on pathological
//! input) and nodes are tagged `simplified` so repeat visits are O(1).

use super::{BinOp, ExprArena, ExprId, ExprKind, UnOp, Width};

const ITERATION_CAP: usize = 64;

/// Simplify `id` to a semantically equivalent, smaller-or-equal normal form.
/// `simplify(simplify(e)) == simplify(e)` for every `e` (spec 8, idempotence).
pub fn simplify(arena: &mut ExprArena, id: ExprId) -> ExprId {
	if let Some(&cached) = arena.simplify_cache.get(&id) {
		return cached;
	}
	if arena.is_marked_simplified(id) {
		arena.simplify_cache.insert(id, id);
		return id;
	}

	let mut cur = id;
	for iteration in 0..ITERATION_CAP {
		if let Some(next) = root_rewrite(arena, cur) {
			if next != cur {
				cur = next;
				continue;
			}
		}
		let rebuilt = rebuild_children(arena, cur);
		if rebuilt == cur {
			break;
		}
		cur = rebuilt;
		if iteration == ITERATION_CAP - 1 {
			tracing::debug!(expr = cur, "simplifier iteration cap reached");
		}
	}
	arena.mark_simplified(cur);
	arena.simplify_cache.insert(id, cur);
	arena.simplify_cache.insert(cur, cur);
	cur
}

/// Tier 2: rebuild `id` with every child simplified, then re-canonicalise
/// through the normal constructors (which re-sort symmetric operands etc).
fn rebuild_children(arena: &mut ExprArena, id: ExprId) -> ExprId {
	match arena.kind(id).clone() {
		ExprKind::Cst(_) | ExprKind::Var(..) | ExprKind::Unknown => id,
		ExprKind::Mem(a) => {
			let sa = simplify(arena, a);
			arena.mem(arena.width(id), sa)
		}
		ExprKind::Unop(op, a) => {
			let sa = simplify(arena, a);
			arena.unop(op, sa)
		}
		ExprKind::Binop(op, a, b) => {
			let sa = simplify(arena, a);
			let sb = simplify(arena, b);
			arena.binop(op, sa, sb)
		}
		ExprKind::Extract(a, hi, lo) => {
			let sa = simplify(arena, a);
			arena.extract(sa, hi, lo)
		}
		ExprKind::Concat(a, b) => {
			let sa = simplify(arena, a);
			let sb = simplify(arena, b);
			arena.concat(sa, sb)
		}
		ExprKind::Bisz(a, m) => {
			let sa = simplify(arena, a);
			arena.bisz(sa, m)
		}
	}
}

fn all_ones(width: Width) -> u64 {
	if width >= 64 {
		u64::MAX
	} else {
		(1u64 << width) - 1
	}
}

/// Tier 1: a single local rewrite attempt at the root of `id`. Returns
/// `None` when no rule applies (distinguished from `Some(id)`, a no-op
/// rewrite, so the driver knows whether to fall through to tier 2).
fn root_rewrite(arena: &mut ExprArena, id: ExprId) -> Option<ExprId> {
	let width = arena.width(id);
	match arena.kind(id).clone() {
		ExprKind::Unop(op, a) => rewrite_unop(arena, op, a, width),
		ExprKind::Binop(op, a, b) => rewrite_binop(arena, op, a, b, width),
		ExprKind::Extract(a, hi, lo) => rewrite_extract(arena, a, hi, lo, width),
		ExprKind::Concat(a, b) => rewrite_concat(arena, a, b),
		ExprKind::Bisz(a, mode) => rewrite_bisz(arena, a, mode, width),
		_ => None,
	}
}

fn rewrite_unop(arena: &mut ExprArena, op: UnOp, a: ExprId, width: Width) -> Option<ExprId> {
	// Constant folding.
	if let Some(va) = arena.as_cst(a) {
		let r = match op {
			UnOp::Neg => va.wrapping_neg(),
			UnOp::Not => !va,
		};
		return Some(arena.cst(width, r));
	}
	// Involution: --x -> x, ~~x -> x.
	if let ExprKind::Unop(inner_op, inner) = arena.kind(a).clone() {
		if inner_op == op {
			return Some(inner);
		}
	}
	None
}

fn rewrite_binop(
	arena: &mut ExprArena,
	op: BinOp,
	a: ExprId,
	b: ExprId,
	width: Width,
) -> Option<ExprId> {
	// Constant folding (both sides concrete).
	if let (Some(va), Some(vb)) = (arena.as_cst(a), arena.as_cst(b)) {
		return Some(arena.cst(width, super::eval_binop(op, va, vb, width)));
	}

	let cst_a = arena.as_cst(a);
	let cst_b = arena.as_cst(b);

	match op {
		BinOp::Add => {
			if cst_a == Some(0) {
				return Some(b);
			}
			if cst_b == Some(0) {
				return Some(a);
			}
			// x + (-x) -> 0 ; x + (-1 * x) -> 0
			if is_negation_of(arena, b, a) || is_negation_of(arena, a, b) {
				return Some(arena.cst(width, 0));
			}
		}
		BinOp::Mul => {
			if cst_a == Some(0) || cst_b == Some(0) {
				return Some(arena.cst(width, 0));
			}
			if cst_a == Some(1) {
				return Some(b);
			}
			if cst_b == Some(1) {
				return Some(a);
			}
		}
		BinOp::And => {
			if cst_a == Some(0) || cst_b == Some(0) {
				return Some(arena.cst(width, 0));
			}
			let ones = all_ones(width);
			if cst_a == Some(ones) {
				return Some(b);
			}
			if cst_b == Some(ones) {
				return Some(a);
			}
			if a == b {
				return Some(a);
			}
			if is_bitwise_not_of(arena, a, b) || is_bitwise_not_of(arena, b, a) {
				return Some(arena.cst(width, 0));
			}
		}
		BinOp::Or => {
			if cst_a == Some(0) {
				return Some(b);
			}
			if cst_b == Some(0) {
				return Some(a);
			}
			let ones = all_ones(width);
			if cst_a == Some(ones) || cst_b == Some(ones) {
				return Some(arena.cst(width, ones));
			}
			if a == b {
				return Some(a);
			}
			if is_bitwise_not_of(arena, a, b) || is_bitwise_not_of(arena, b, a) {
				return Some(arena.cst(width, ones));
			}
		}
		BinOp::Xor => {
			if cst_a == Some(0) {
				return Some(b);
			}
			if cst_b == Some(0) {
				return Some(a);
			}
			if a == b {
				return Some(arena.cst(width, 0));
			}
			// -1 ^ x -> ~x
			let ones = all_ones(width);
			if cst_a == Some(ones) {
				return Some(arena.unop(UnOp::Not, b));
			}
			if cst_b == Some(ones) {
				return Some(arena.unop(UnOp::Not, a));
			}
		}
		BinOp::Div | BinOp::Sdiv => {
			if cst_b == Some(1) {
				return Some(a);
			}
		}
		BinOp::Shl => {
			if cst_b == Some(0) {
				return Some(a);
			}
			if let Some(k) = cst_b {
				if k >= width as u64 {
					return Some(arena.cst(width, 0));
				}
				// Canonical rewrite x << k -> x * 2^k.
				let pow = arena.cst(width, 1u64.checked_shl(k as u32).unwrap_or(0));
				return Some(arena.binop(BinOp::Mul, a, pow));
			}
		}
		BinOp::Shr => {
			if cst_b == Some(0) {
				return Some(a);
			}
			if let Some(k) = cst_b {
				if k >= width as u64 {
					return Some(arena.cst(width, 0));
				}
			}
		}
		BinOp::Mod | BinOp::Smod => {
			if cst_b == Some(1) {
				return Some(arena.cst(width, 0));
			}
		}
		_ => {}
	}

	try_factor(arena, op, a, b, width)
}

/// `x*a + x*b -> x*(a+b)` and the dual `x&a | x&b -> x&(a|b)`-style
/// factoring over a distributive operator pair.
fn try_factor(arena: &mut ExprArena, op: BinOp, a: ExprId, b: ExprId, width: Width) -> Option<ExprId> {
	let (outer, inner) = match op {
		BinOp::Add => (BinOp::Add, BinOp::Mul),
		BinOp::Or => (BinOp::Or, BinOp::And),
		_ => return None,
	};
	let factor_of = |arena: &ExprArena, id: ExprId| -> Option<(ExprId, ExprId)> {
		if let ExprKind::Binop(o, x, y) = arena.kind(id) {
			if *o == inner {
				return Some((*x, *y));
			}
		}
		None
	};
	let (fa_l, fa_r) = factor_of(arena, a)?;
	let (fb_l, fb_r) = factor_of(arena, b)?;
	let common = if fa_l == fb_l {
		Some((fa_l, fa_r, fb_r))
	} else if fa_l == fb_r {
		Some((fa_l, fa_r, fb_l))
	} else if fa_r == fb_l {
		Some((fa_r, fa_l, fb_r))
	} else if fa_r == fb_r {
		Some((fa_r, fa_l, fb_l))
	} else {
		None
	};
	let (common, rest_a, rest_b) = common?;
	let summed = arena.binop(outer, rest_a, rest_b);
	let _ = width;
	Some(arena.binop(inner, common, summed))
}

fn is_negation_of(arena: &mut ExprArena, candidate_negation: ExprId, of: ExprId) -> bool {
	match arena.kind(candidate_negation).clone() {
		ExprKind::Unop(UnOp::Neg, inner) => inner == of,
		ExprKind::Binop(BinOp::Mul, x, y) => {
			let width = arena.width(candidate_negation);
			let neg_one = all_ones(width);
			(arena.as_cst(x) == Some(neg_one) && y == of) || (arena.as_cst(y) == Some(neg_one) && x == of)
		}
		_ => false,
	}
}

fn is_bitwise_not_of(arena: &ExprArena, candidate_not: ExprId, of: ExprId) -> bool {
	matches!(arena.kind(candidate_not), ExprKind::Unop(UnOp::Not, inner) if *inner == of)
}

fn rewrite_extract(
	arena: &mut ExprArena,
	a: ExprId,
	hi: u32,
	lo: u32,
	width: Width,
) -> Option<ExprId> {
	if let Some(va) = arena.as_cst(a) {
		let m = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
		return Some(arena.cst(width, (va >> lo) & m));
	}
	// extract(x, w-1, 0) -> x
	if lo == 0 && hi + 1 == arena.width(a) {
		return Some(a);
	}
	// extract-of-extract flattening
	if let ExprKind::Extract(inner, inner_hi, inner_lo) = arena.kind(a).clone() {
		return Some(arena.extract(inner, inner_lo + hi, inner_lo + lo));
	}
	// extract-of-concat flattening
	if let ExprKind::Concat(hi_part, lo_part) = arena.kind(a).clone() {
		let lo_width = arena.width(lo_part);
		if hi < lo_width {
			return Some(arena.extract(lo_part, hi, lo));
		}
		if lo >= lo_width {
			return Some(arena.extract(hi_part, hi - lo_width, lo - lo_width));
		}
	}
	None
}

fn rewrite_concat(arena: &mut ExprArena, a: ExprId, b: ExprId) -> Option<ExprId> {
	// concat(extract(x,w-1,k), extract(x,k-1,0)) -> x
	if let (ExprKind::Extract(xa, hia, loa), ExprKind::Extract(xb, hib, lob)) =
		(arena.kind(a).clone(), arena.kind(b).clone())
	{
		if xa == xb && lob == 0 && loa == hib + 1 && hia + 1 == arena.width(xa) {
			return Some(xa);
		}
	}
	if let (Some(va), Some(vb)) = (arena.as_cst(a), arena.as_cst(b)) {
		let width = arena.width(a) + arena.width(b);
		let m = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
		return Some(arena.cst(width, ((va << arena.width(b)) | vb) & m));
	}
	None
}

fn rewrite_bisz(arena: &mut ExprArena, a: ExprId, mode_one_if_zero: bool, width: Width) -> Option<ExprId> {
	if let Some(va) = arena.as_cst(a) {
		let is_zero = va == 0;
		let r = if is_zero == mode_one_if_zero { 1 } else { 0 };
		return Some(arena.cst(width, r));
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::expr::VarContext;

	#[test]
	fn neutral_add_zero() {
		let mut a = ExprArena::new();
		let x = a.var(32, "x", None);
		let zero = a.cst(32, 0);
		let e = a.binop(BinOp::Add, x, zero);
		assert_eq!(simplify(&mut a, e), x);
	}

	#[test]
	fn self_xor_is_zero() {
		let mut a = ExprArena::new();
		let x = a.var(32, "x", None);
		let e = a.binop(BinOp::Xor, x, x);
		let s = simplify(&mut a, e);
		assert_eq!(a.as_cst(s), Some(0));
	}

	#[test]
	fn idempotent() {
		let mut a = ExprArena::new();
		let x = a.var(32, "x", None);
		let y = a.var(32, "y", None);
		let one = a.cst(32, 1);
		let zero = a.cst(32, 0);
		let lhs = a.binop(BinOp::Mul, x, one);
		let rhs = a.binop(BinOp::Add, y, zero);
		let e = a.binop(BinOp::Add, lhs, rhs);
		let s1 = simplify(&mut a, e);
		let s2 = simplify(&mut a, s1);
		assert_eq!(s1, s2);
	}

	#[test]
	fn semantic_preservation() {
		let mut a = ExprArena::new();
		let x = a.var(32, "x", None);
		let two = a.cst(32, 2);
		let e = a.binop(BinOp::Shl, x, two);
		let mut ctx = VarContext::new();
		ctx.bind("x", 5);
		let before = a.concretize(e, &ctx).unwrap();
		let s = simplify(&mut a, e);
		let after = a.concretize(s, &ctx).unwrap();
		assert_eq!(before, after);
	}

	#[test]
	fn involution_double_negate() {
		let mut a = ExprArena::new();
		let x = a.var(32, "x", None);
		let inner = a.unop(UnOp::Not, x);
		let e = a.unop(UnOp::Not, inner);
		assert_eq!(simplify(&mut a, e), x);
	}

	#[test]
	fn extract_of_concat_flattens() {
		let mut a = ExprArena::new();
		let x = a.var(16, "x", None);
		let y = a.var(16, "y", None);
		let c = a.concat(x, y); // width 32, x is high half, y is low half
		let low = a.extract(c, 15, 0);
		assert_eq!(simplify(&mut a, low), y);
	}

	/// Generates small ground (no free variables) arithmetic expression
	/// trees over `Cst`/`Binop`/`Unop` so quickcheck can throw random shapes
	/// at `simplify` without needing a `VarContext`.
	#[derive(Clone, Debug)]
	struct GroundExpr(Vec<Op>);

	#[derive(Clone, Copy, Debug)]
	enum Op {
		Leaf(u32),
		Bin(BinOp, u8, u8),
		Un(UnOp, u8),
	}

	impl quickcheck::Arbitrary for GroundExpr {
		fn arbitrary(g: &mut quickcheck::Gen) -> Self {
			let depth = *g.choose(&[1u8, 2, 3, 4]).unwrap();
			let mut ops = vec![Op::Leaf(u32::arbitrary(g) % 1000)];
			for _ in 0..depth {
				if bool::arbitrary(g) {
					let op = *g
						.choose(&[BinOp::Add, BinOp::Mul, BinOp::And, BinOp::Or, BinOp::Xor, BinOp::Shl, BinOp::Shr])
						.unwrap();
					let a = ops.len().saturating_sub(1) as u8;
					ops.push(Op::Bin(op, a, a));
				} else {
					let a = ops.len().saturating_sub(1) as u8;
					ops.push(Op::Un(UnOp::Not, a));
				}
			}
			GroundExpr(ops)
		}
	}

	impl GroundExpr {
		fn build(&self, arena: &mut ExprArena) -> ExprId {
			let mut built: Vec<ExprId> = Vec::with_capacity(self.0.len());
			for op in &self.0 {
				let id = match *op {
					Op::Leaf(v) => arena.cst(32, v as u64),
					Op::Bin(bop, a, b) => arena.binop(bop, built[a as usize], built[b as usize]),
					Op::Un(uop, a) => arena.unop(uop, built[a as usize]),
				};
				built.push(id);
			}
			*built.last().unwrap()
		}
	}

	#[quickcheck_macros::quickcheck]
	fn qc_simplify_is_idempotent(e: GroundExpr) -> bool {
		let mut a = ExprArena::new();
		let id = e.build(&mut a);
		let s1 = simplify(&mut a, id);
		let s2 = simplify(&mut a, s1);
		s1 == s2
	}

	#[quickcheck_macros::quickcheck]
	fn qc_simplify_preserves_value(e: GroundExpr) -> bool {
		let mut a = ExprArena::new();
		let id = e.build(&mut a);
		let ctx = VarContext::new();
		let before = a.concretize(id, &ctx).expect("ground expr has no free vars");
		let s = simplify(&mut a, id);
		let after = a.concretize(s, &ctx).expect("simplified ground expr stays ground");
		before == after
	}
}
