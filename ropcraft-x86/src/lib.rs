//! x86/x86-64 external collaborator for `ropcraft-core`: concrete `Arch`
//! impls, an iced-x86-backed `disasm`, and goblin-based raw gadget
//! extraction from on-disk ELF/PE binaries.

pub mod arch;
pub mod binary;
pub mod disasm;
pub mod error;

pub use arch::{reg_by_name, X64, X86};
pub use error::{Error, Result};
