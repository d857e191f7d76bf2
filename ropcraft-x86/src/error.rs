use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Core(#[from] ropcraft_core::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse binary: {0}")]
	Goblin(#[from] goblin::error::Error),

	#[error("unsupported object format (expected ELF or PE)")]
	UnsupportedFormat,
}

pub type Result<T> = std::result::Result<T, Error>;
