use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("{path}:{line}: {message}")]
	Parse { path: String, line: usize, message: String },

	#[error(transparent)]
	Core(#[from] ropcraft_core::Error),

	#[error(transparent)]
	X86(#[from] ropcraft_x86::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("malformed raw gadget line {0}: {1}")]
	BadGadgetLine(usize, String),

	#[error(transparent)]
	Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
