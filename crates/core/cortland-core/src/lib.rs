//! Shared leaf crate for the Cortland emulation core.
//!
//! Holds the pieces every other crate needs without pulling in machine
//! semantics: the category/level logging facility and the checkpoint
//! stream primitives.

pub mod chkpt;
pub mod log;
