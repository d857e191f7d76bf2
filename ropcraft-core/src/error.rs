use thiserror::Error;

/// The error taxonomy from the error-handling design: everything a caller
/// can recover from is a `Result` variant, everything else is a bug and
/// panics at the call site instead of being constructed here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("parse error on line {line}: {message}")]
	Parse { line: usize, message: String },

	#[error("unsupported intent semantics: {0}")]
	IlSemantic(String),

	#[error("unsupported ABI for this architecture: {0:?}")]
	UnsupportedAbi(crate::arch::Abi),

	#[error("no chain: bad byte prevents a valid address or padding")]
	BadByte,

	#[error("no chain found (try budget exhausted or search space empty)")]
	NoChain,

	#[error("compilation cancelled")]
	Cancelled,

	#[error("unbound variable `{0}` during concretization")]
	Unbound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
