//! Textual intent-language parser (the grammar table of the external
//! interfaces section): one instruction per non-blank line, whitespace
//! insignificant inside a line, `#` has no special meaning. Turns source
//! text into the typed `IntentProgram` the compiler consumes.

use crate::error::{CliError, Result};
use ropcraft_core::arch::{Abi, RegId, System};
use ropcraft_core::expr::BinOp;
use ropcraft_core::intent::{IntentExpr, IntentProgram, Stmt};
use ropcraft_x86::reg_by_name;

const OPS: &[(&str, BinOp)] =
	&[("<<", BinOp::Shl), (">>", BinOp::Shr), ("+", BinOp::Add), ("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod), ("&", BinOp::And), ("|", BinOp::Or), ("^", BinOp::Xor)];

pub struct Parser {
	pub bits: u32,
	pub default_abi: Abi,
	pub default_system: System,
}

impl Parser {
	pub fn new(bits: u32, default_abi: Abi, default_system: System) -> Self {
		Parser { bits, default_abi, default_system }
	}

	pub fn parse(&self, path: &str, src: &str) -> Result<IntentProgram> {
		let mut program = IntentProgram::new();
		for (i, raw_line) in src.lines().enumerate() {
			let line = raw_line.trim();
			if line.is_empty() {
				continue;
			}
			let stmts = self.parse_line(line).map_err(|message| CliError::Parse { path: path.to_string(), line: i + 1, message })?;
			for stmt in stmts {
				program.push(stmt);
			}
		}
		Ok(program)
	}

	fn parse_line(&self, line: &str) -> std::result::Result<Vec<Stmt>, String> {
		if line == "syscall" {
			return Ok(vec![Stmt::Syscall { number: None, args: Vec::new(), system: self.default_system }]);
		}
		if let Some(rest) = line.strip_prefix("sys_") {
			return self.parse_syscall_call(rest);
		}
		if let Some(eq) = find_top_level_eq(line) {
			return self.parse_assignment(line, eq);
		}
		if let Some(open) = line.find('(') {
			if is_numeric_literal(line[..open].trim()) {
				return self.parse_call(line);
			}
		}
		Err(format!("unrecognised intent instruction: {line}"))
	}

	fn parse_call(&self, line: &str) -> std::result::Result<Vec<Stmt>, String> {
		let open = line.find('(').ok_or("call missing '('")?;
		let close = line.rfind(')').ok_or("call missing ')'")?;
		let target = self.parse_int(line[..open].trim())?;
		let args = self.parse_args(&line[open + 1..close])?;
		Ok(vec![Stmt::Call { target: IntentExpr::Cst(target), args, abi: self.default_abi }])
	}

	fn parse_syscall_call(&self, rest: &str) -> std::result::Result<Vec<Stmt>, String> {
		let open = rest.find('(').ok_or("syscall call missing '('")?;
		let close = rest.rfind(')').ok_or("syscall call missing ')'")?;
		let name_or_num = &rest[..open];
		let number = match self.parse_int(name_or_num) {
			Ok(n) => n,
			Err(_) => syscall_number(self.bits, name_or_num).ok_or_else(|| format!("unknown syscall name 'sys_{name_or_num}'"))?,
		};
		let args = self.parse_args(&rest[open + 1..close])?;
		Ok(vec![Stmt::Syscall { number: Some(IntentExpr::Cst(number)), args, system: self.default_system }])
	}

	fn parse_args(&self, inner: &str) -> std::result::Result<Vec<IntentExpr>, String> {
		let inner = inner.trim();
		if inner.is_empty() {
			return Ok(Vec::new());
		}
		inner.split(',').map(|tok| self.parse_operand(tok.trim())).collect()
	}

	/// `lhs = rhs` / `lhs op= rhs`, dispatched by whether `lhs`/`rhs` name a
	/// `mem(...)` address (store/load) or a bare register (set-reg).
	fn parse_assignment(&self, line: &str, eq: usize) -> std::result::Result<Vec<Stmt>, String> {
		let lhs_raw = line[..eq].trim_end();
		let rhs = line[eq + 1..].trim();

		let (lhs, accum_op) = match strip_accum_op(lhs_raw) {
			Some((stripped, op)) => (stripped.trim_end(), Some(op)),
			None => (lhs_raw.trim_end(), None),
		};

		if let Some(addr_src) = mem_inner(lhs) {
			let addr = self.parse_mem_addr(addr_src)?;
			return self.parse_store(addr, rhs, accum_op);
		}

		if accum_op.is_some() && mem_inner(rhs).is_none() {
			return Err("op= is only valid when the right-hand side is mem(...)".into());
		}

		let dst = self.parse_reg(lhs)?;
		let value = if let Some(addr_src) = mem_inner(rhs) {
			let addr = self.parse_mem_addr(addr_src)?;
			IntentExpr::mem(addr)
		} else {
			self.parse_rhs_expr(rhs)?
		};
		let value = match accum_op {
			Some(op) => IntentExpr::bin(op, IntentExpr::reg(dst), value),
			None => value,
		};
		Ok(vec![Stmt::SetReg { dst, value }])
	}

	fn parse_store(&self, addr: IntentExpr, rhs: &str, accum_op: Option<BinOp>) -> std::result::Result<Vec<Stmt>, String> {
		if rhs.starts_with('"') {
			if accum_op.is_some() {
				return Err("op= is not valid with a string store".into());
			}
			return self.expand_string_store(addr, rhs);
		}
		if is_numeric_literal(rhs) {
			if accum_op.is_some() {
				return Err("op= is not valid with a constant store".into());
			}
			let cst = self.parse_int(rhs)?;
			return Ok(self.expand_const_store(addr, cst));
		}
		let src = self.parse_reg(rhs)?;
		let value = match accum_op {
			Some(op) => IntentExpr::bin(op, IntentExpr::mem(addr.clone()), IntentExpr::reg(src)),
			None => IntentExpr::reg(src),
		};
		Ok(vec![Stmt::StoreMem { addr, value }])
	}

	/// "store constant (expanded to fetch-then-store)": a scratch register
	/// carries the literal value since `mem(...) = N` has no gadget of its
	/// own — the constant must land in a register before it can be stored.
	fn expand_const_store(&self, addr: IntentExpr, cst: i64) -> Vec<Stmt> {
		let scratch = self.scratch_reg(addr_base_reg(&addr));
		vec![Stmt::SetReg { dst: scratch, value: IntentExpr::cst(cst) }, Stmt::StoreMem { addr, value: IntentExpr::reg(scratch) }]
	}

	fn expand_string_store(&self, addr: IntentExpr, rhs: &str) -> std::result::Result<Vec<Stmt>, String> {
		let IntentExpr::Cst(base) = addr else {
			return Err("string store requires an absolute mem(N) address".into());
		};
		let bytes = decode_string_literal(rhs)?;
		let word = (self.bits / 8) as usize;
		let mut padded = bytes;
		while padded.len() % word != 0 {
			padded.push(0x00); // trailing-gap pad byte; bad-byte-aware choice belongs to the compiler
		}
		let scratch = self.scratch_reg(None);
		let mut stmts = Vec::new();
		for (i, chunk) in padded.chunks(word).enumerate() {
			let mut buf = [0u8; 8];
			buf[..chunk.len()].copy_from_slice(chunk);
			let value = i64::from_le_bytes(buf);
			let chunk_addr = IntentExpr::cst(base + (i * word) as i64);
			stmts.push(Stmt::SetReg { dst: scratch, value: IntentExpr::cst(value) });
			stmts.push(Stmt::StoreMem { addr: chunk_addr, value: IntentExpr::reg(scratch) });
		}
		Ok(stmts)
	}

	fn scratch_reg(&self, avoid: Option<RegId>) -> RegId {
		let nb_regs: RegId = if self.bits == 64 { 16 } else { 8 };
		let mut candidate = nb_regs - 1;
		if Some(candidate) == avoid {
			candidate -= 1;
		}
		candidate
	}

	fn parse_mem_addr(&self, inner: &str) -> std::result::Result<IntentExpr, String> {
		let inner = inner.trim();
		if is_numeric_literal(inner) {
			return Ok(IntentExpr::cst(self.parse_int(inner)?));
		}
		if let Some((reg_tok, sign, num_tok)) = split_signed(inner) {
			let reg = self.parse_reg(reg_tok.trim())?;
			let mut offset = self.parse_int(num_tok.trim())?;
			if sign == '-' {
				offset = -offset;
			}
			if offset == 0 {
				return Ok(IntentExpr::reg(reg));
			}
			return Ok(IntentExpr::bin(BinOp::Add, IntentExpr::reg(reg), IntentExpr::cst(offset)));
		}
		Ok(IntentExpr::reg(self.parse_reg(inner)?))
	}

	/// `R' op N` / `R1 op R2` / bare `R'` / bare `N` on a plain (non-`mem`)
	/// right-hand side.
	fn parse_rhs_expr(&self, rhs: &str) -> std::result::Result<IntentExpr, String> {
		if let Some((lhs_tok, op, rhs_tok)) = split_top_level_op(rhs) {
			let a = self.parse_operand(lhs_tok.trim())?;
			let b_tok = rhs_tok.trim();
			if op == "-" {
				// `-` has no direct IR opcode; fold a constant subtrahend
				// into a negated addition, the only shape the core models.
				let k = self.parse_int(b_tok).map_err(|_| "register-register subtraction is not supported".to_string())?;
				return Ok(IntentExpr::bin(BinOp::Add, a, IntentExpr::cst(-k)));
			}
			let bin_op = OPS.iter().find(|(s, _)| *s == op).map(|(_, o)| *o).ok_or_else(|| format!("unknown operator '{op}'"))?;
			let b = self.parse_operand(b_tok)?;
			return Ok(IntentExpr::bin(bin_op, a, b));
		}
		self.parse_operand(rhs)
	}

	fn parse_operand(&self, tok: &str) -> std::result::Result<IntentExpr, String> {
		if is_numeric_literal(tok) {
			return Ok(IntentExpr::cst(self.parse_int(tok)?));
		}
		Ok(IntentExpr::reg(self.parse_reg(tok)?))
	}

	fn parse_reg(&self, tok: &str) -> std::result::Result<RegId, String> {
		reg_by_name(self.bits, tok).ok_or_else(|| format!("unknown register '{tok}'"))
	}

	fn parse_int(&self, tok: &str) -> std::result::Result<i64, String> {
		parse_int_literal(tok)
	}
}

fn addr_base_reg(addr: &IntentExpr) -> Option<RegId> {
	match addr {
		IntentExpr::Reg(r) => Some(*r),
		IntentExpr::Bin(_, a, _) => addr_base_reg(a),
		_ => None,
	}
}

fn is_numeric_literal(tok: &str) -> bool {
	let tok = tok.strip_prefix('-').unwrap_or(tok);
	!tok.is_empty() && (tok.starts_with("0x") || tok.starts_with("0X") || tok.chars().all(|c| c.is_ascii_digit()))
}

fn parse_int_literal(tok: &str) -> std::result::Result<i64, String> {
	let (neg, tok) = match tok.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, tok),
	};
	let v = if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
		i64::from_str_radix(hex, 16).map_err(|e| format!("bad hex literal '{tok}': {e}"))?
	} else {
		tok.parse::<i64>().map_err(|e| format!("bad integer literal '{tok}': {e}"))?
	};
	Ok(if neg { -v } else { v })
}

/// First `=` outside a double-quoted string literal (so a string store's
/// payload can never be mistaken for another assignment).
fn find_top_level_eq(line: &str) -> Option<usize> {
	let mut in_quote = false;
	let mut chars = line.char_indices().peekable();
	while let Some((i, c)) = chars.next() {
		match c {
			'"' => in_quote = !in_quote,
			'\\' if in_quote => {
				chars.next();
			}
			'=' if !in_quote => return Some(i),
			_ => {}
		}
	}
	None
}

/// If `lhs` ends in one of the accumulating-assignment operator tokens
/// (`+=`, `<<=`, ...), returns `(lhs without the token, BinOp)`.
fn strip_accum_op(lhs: &str) -> Option<(&str, BinOp)> {
	let trimmed = lhs.trim_end();
	for (tok, op) in OPS {
		if let Some(stripped) = trimmed.strip_suffix(*tok) {
			return Some((stripped, *op));
		}
	}
	None
}

/// `mem(...)`, innards only — `None` if `s` isn't exactly that shape.
fn mem_inner(s: &str) -> Option<&str> {
	let s = s.trim();
	let inner = s.strip_prefix("mem(")?;
	inner.strip_suffix(')')
}

/// Splits `"reg + N"` / `"reg - N"` into `(reg, sign, N)`; `None` if `s`
/// isn't a single register followed by a signed offset.
fn split_signed(s: &str) -> Option<(&str, char, &str)> {
	for (i, c) in s.char_indices().skip(1) {
		if c == '+' || c == '-' {
			return Some((&s[..i], c, &s[i + 1..]));
		}
	}
	None
}

/// Splits `"a OP b"` on the first top-level binary operator, skipping index
/// 0 so a leading sign on `a` (`-5 + ecx`, uncommon but legal) isn't
/// mistaken for the operator. The operator token is returned whole (`"<<"`,
/// `"-"`, ...) so callers can match it straight against `OPS`.
fn split_top_level_op(s: &str) -> Option<(&str, &str, &str)> {
	let bytes = s.as_bytes();
	let mut i = 1;
	while i < bytes.len() {
		let c = bytes[i] as char;
		if c == '<' && bytes.get(i + 1) == Some(&b'<') {
			return Some((&s[..i], "<<", &s[i + 2..]));
		}
		if c == '>' && bytes.get(i + 1) == Some(&b'>') {
			return Some((&s[..i], ">>", &s[i + 2..]));
		}
		if matches!(c, '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^') {
			return Some((&s[..i], &s[i..i + 1], &s[i + 1..]));
		}
		i += 1;
	}
	None
}

/// Decodes `\\`, `\'`, `\"`, `\xHH` escapes inside a double-quoted literal.
fn decode_string_literal(tok: &str) -> std::result::Result<Vec<u8>, String> {
	let inner = tok.strip_prefix('"').and_then(|s| s.strip_suffix('"')).ok_or("malformed string literal")?;
	let mut out = Vec::new();
	let mut chars = inner.chars().peekable();
	while let Some(c) = chars.next() {
		if c != '\\' {
			let mut buf = [0u8; 4];
			out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
			continue;
		}
		match chars.next() {
			Some('\\') => out.push(b'\\'),
			Some('\'') => out.push(b'\''),
			Some('"') => out.push(b'"'),
			Some('x') => {
				let hi = chars.next().ok_or("truncated \\x escape")?;
				let lo = chars.next().ok_or("truncated \\x escape")?;
				let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|e| format!("bad \\x escape: {e}"))?;
				out.push(byte);
			}
			Some(other) => return Err(format!("unknown escape '\\{other}'")),
			None => return Err("trailing backslash in string literal".into()),
		}
	}
	Ok(out)
}

/// Linux syscall numbers for the handful of names worth resolving by name;
/// anything else must be written as `sys_N(...)`.
fn syscall_number(bits: u32, name: &str) -> Option<i64> {
	let table: &[(&str, i64)] = if bits == 64 {
		&[
			("read", 0),
			("write", 1),
			("open", 2),
			("close", 3),
			("mmap", 9),
			("munmap", 11),
			("brk", 12),
			("rt_sigaction", 13),
			("socket", 41),
			("connect", 42),
			("dup2", 33),
			("execve", 59),
			("exit", 60),
			("fork", 57),
			("exit_group", 231),
		]
	} else {
		&[
			("exit", 1),
			("fork", 2),
			("read", 3),
			("write", 4),
			("open", 5),
			("close", 6),
			("execve", 11),
			("brk", 45),
			("socket", 359),
			("connect", 362),
			("mmap", 90),
			("munmap", 91),
		]
	};
	table.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parser() -> Parser {
		Parser::new(32, Abi::X86Cdecl, System::Linux)
	}

	#[test]
	fn direct_mov_reg() {
		let p = parser();
		let prog = p.parse("t", "eax = ecx").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::SetReg { dst: 0, value: IntentExpr::reg(1) }]);
	}

	#[test]
	fn mov_cst_hex() {
		let p = parser();
		let prog = p.parse("t", "ebx = 0xdeadbeef").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::SetReg { dst: 3, value: IntentExpr::cst(0xdeadbeefu32 as i64) }]);
	}

	#[test]
	fn reg_arith_with_constant() {
		let p = parser();
		let prog = p.parse("t", "eax = ebx + 16").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::SetReg { dst: 0, value: IntentExpr::bin(BinOp::Add, IntentExpr::reg(3), IntentExpr::cst(16)) }]);
	}

	#[test]
	fn load_with_offset() {
		let p = parser();
		let prog = p.parse("t", "eax = mem(ebx+16)").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::SetReg { dst: 0, value: IntentExpr::mem(IntentExpr::bin(BinOp::Add, IntentExpr::reg(3), IntentExpr::cst(16))) }]);
	}

	#[test]
	fn store_register() {
		let p = parser();
		let prog = p.parse("t", "mem(ebx+4) = eax").unwrap();
		assert_eq!(
			prog.stmts,
			vec![Stmt::StoreMem { addr: IntentExpr::bin(BinOp::Add, IntentExpr::reg(3), IntentExpr::cst(4)), value: IntentExpr::reg(0) }]
		);
	}

	#[test]
	fn constant_store_expands_to_scratch_then_store() {
		let p = parser();
		let prog = p.parse("t", "mem(ebx) = 5").unwrap();
		assert_eq!(prog.stmts.len(), 2);
		assert!(matches!(prog.stmts[0], Stmt::SetReg { dst: 7, .. }));
		assert!(matches!(prog.stmts[1], Stmt::StoreMem { .. }));
	}

	#[test]
	fn bare_syscall() {
		let p = parser();
		let prog = p.parse("t", "syscall").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::Syscall { number: None, args: Vec::new(), system: System::Linux }]);
	}

	#[test]
	fn syscall_by_name() {
		let p = parser();
		let prog = p.parse("t", "sys_exit(0)").unwrap();
		assert_eq!(prog.stmts, vec![Stmt::Syscall { number: Some(IntentExpr::cst(1)), args: vec![IntentExpr::cst(0)], system: System::Linux }]);
	}

	#[test]
	fn call_with_args() {
		let p = parser();
		let prog = p.parse("t", "0x1000(eax, 4)").unwrap();
		assert_eq!(
			prog.stmts,
			vec![Stmt::Call { target: IntentExpr::cst(0x1000), args: vec![IntentExpr::reg(0), IntentExpr::cst(4)], abi: Abi::X86Cdecl }]
		);
	}

	#[test]
	fn string_store_expands_per_word() {
		let p = Parser::new(32, Abi::X86Cdecl, System::Linux);
		let prog = p.parse("t", "mem(0x1000) = \"AB\"").unwrap();
		// "AB" -> 2 bytes padded to one 4-byte word -> one scratch-set + one store.
		assert_eq!(prog.stmts.len(), 2);
	}

	#[test]
	fn malformed_line_reports_line_number() {
		let p = parser();
		let err = p.parse("t", "eax = ecx\n???").unwrap_err();
		match err {
			CliError::Parse { line, .. } => assert_eq!(line, 2),
			_ => panic!("expected Parse error"),
		}
	}
}
