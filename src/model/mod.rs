//! Records shared by the spooler, the indexer and the stores
//!
//! A transaction is one record shape for every kind of operation; chain
//! specific fields live in its opaque `payload`.

mod account;
mod chain;
mod event;
mod transaction;

pub use account::{Account, Secret};
pub use chain::{Chain, ChainFamily};
pub use event::Event;
pub use transaction::{Dependency, HistoryEntry, Transaction, TxKind, TxState};
