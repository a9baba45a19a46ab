//! Dapp relayer - transaction spooler and chain indexer
//!
//! Submits contract originations, function calls and transfers to
//! blockchains in dependency order, waits for confirmation depth, and
//! reconciles the stored record with what actually landed on chain.

pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod state;
pub mod tx;

pub use error::{RelayerError, RelayerResult};
