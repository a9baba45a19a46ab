//! Coordination of transaction submission
//!
//! The coordination layer:
//! 1. Resolves which transaction of a dependency graph may go next
//! 2. Picks and submits ready transactions every spool cycle
//! 3. Drives spool, confirmation wait and index passes per chain

pub mod dependency;
pub mod engine;
pub mod spooler;

pub use dependency::DependencyGraph;
pub use engine::CoordinationEngine;
pub use spooler::{SpoolOutcome, Spooler};
