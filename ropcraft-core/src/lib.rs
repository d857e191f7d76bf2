//! ropcraft-core: symbolic gadget analysis, a multi-indexed gadget
//! database, and a strategy-graph search engine that compiles a small
//! imperative intent language into a ROP chain.
//!
//! Out of scope (external collaborators, see `ropcraft-x86`/`ropcraft-cli`):
//! disassembly of raw bytes into the IR, concrete architecture tables, the
//! intent-language textual parser, the CLI, and candidate-gadget file I/O.

pub mod arch;
pub mod chain;
pub mod compiler;
pub mod constraint;
pub mod db;
pub mod error;
pub mod expr;
pub mod gadget;
pub mod intent;
pub mod ir;
pub mod strategy;

pub use arch::{Abi, Arch, RegId, System};
pub use chain::{RopChain, RopItem};
pub use compiler::{CancelToken, CompilerTask};
pub use constraint::{Constraint, GadgetFilter, MemSafety};
pub use db::GadgetDb;
pub use error::{Error, Result};
pub use gadget::{BranchType, Gadget, GadgetType};
pub use intent::{IntentExpr, IntentProgram, Stmt};
pub use ir::IRBlock;
