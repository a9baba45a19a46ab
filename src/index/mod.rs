//! Index module - reconciles stored transactions with chain state
//!
//! This module provides:
//! - Level by level indexing with reorg rollback
//! - Normalizer registration and the normalization pass

mod indexer;
pub mod normalize;

pub use indexer::{IndexOutcome, Indexer};
pub use normalize::{Normalizer, NormalizerRegistry};
