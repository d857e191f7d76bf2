//! C5–C8: the strategy graph, its rewrite catalogue, selection search and
//! scheduler/emitter.

pub mod graph;
pub mod rules;
pub mod schedule;
pub mod select;
