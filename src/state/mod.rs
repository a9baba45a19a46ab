//! Durable record of chains, accounts, transactions and dependency edges
//!
//! Handles:
//! - Filtered transaction queries for the spooler and the indexer
//! - Single record updates (read-modify-write by callers)
//! - Transactional reorg rollback
//!
//! Two backends: [`MemoryStore`] and the PostgreSQL [`PgStore`].

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::RelayerResult;
use crate::model::{Account, Chain, Dependency, Event, Transaction, TxKind, TxState};

use async_trait::async_trait;
use std::cmp::Ordering;
use uuid::Uuid;

/// Result ordering of [`TxFilter`] queries, always ascending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxOrder {
    #[default]
    CreatedAt,
    LastFail,
    Nonce,
    Level,
}

impl TxOrder {
    /// Compare two records, `None` values sort last
    pub fn compare(&self, a: &Transaction, b: &Transaction) -> Ordering {
        fn nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
            match (a, b) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }

        let primary = match self {
            TxOrder::CreatedAt => Ordering::Equal,
            TxOrder::LastFail => nulls_last(&a.last_fail, &b.last_fail),
            TxOrder::Nonce => a.nonce.cmp(&b.nonce),
            TxOrder::Level => nulls_last(&a.level, &b.level),
        };
        primary.then(a.created_at.cmp(&b.created_at))
    }
}

/// Predicates over transactions, all optional and combined with AND
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub chain_id: Option<u64>,
    pub kind: Option<TxKind>,
    /// State must be one of these when not empty
    pub states: Vec<TxState>,
    pub exclude_states: Vec<TxState>,
    pub hash: Option<String>,
    pub has_hash: Option<bool>,
    pub address: Option<String>,
    pub has_address: Option<bool>,
    /// `Some(None)` matches records without a counter
    pub counter: Option<Option<u64>>,
    pub nonce: Option<i64>,
    /// `Some(None)` matches top-level operations only
    pub caller: Option<Option<Uuid>>,
    pub contract: Option<Uuid>,
    pub index: Option<bool>,
    pub normalized: Option<bool>,
    pub order: TxOrder,
    pub limit: Option<usize>,
}

impl TxFilter {
    pub fn chain(chain_id: u64) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: TxKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn states(mut self, states: &[TxState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn exclude(mut self, states: &[TxState]) -> Self {
        self.exclude_states = states.to_vec();
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn order(mut self, order: TxOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the filter against one record
    pub fn matches(&self, tx: &Transaction) -> bool {
        fn has(value: &Option<String>) -> bool {
            value.as_deref().map_or(false, |v| !v.is_empty())
        }

        self.chain_id.map_or(true, |c| tx.chain_id == c)
            && self.kind.map_or(true, |k| tx.kind == k)
            && (self.states.is_empty() || self.states.contains(&tx.state))
            && !self.exclude_states.contains(&tx.state)
            && self.hash.as_ref().map_or(true, |h| tx.hash.as_ref() == Some(h))
            && self.has_hash.map_or(true, |b| has(&tx.hash) == b)
            && self
                .address
                .as_ref()
                .map_or(true, |a| tx.address.as_ref() == Some(a))
            && self.has_address.map_or(true, |b| has(&tx.address) == b)
            && self.counter.map_or(true, |c| tx.counter == c)
            && self.nonce.map_or(true, |n| tx.nonce == n)
            && self.caller.map_or(true, |c| tx.caller == c)
            && self.contract.map_or(true, |c| tx.contract == Some(c))
            && self.index.map_or(true, |i| tx.index == i)
            && self.normalized.map_or(true, |n| tx.normalized == n)
    }
}

/// Spool candidate selection for one kind on one chain.
///
/// Candidates have no hash yet, a state outside [`TxState::EXCLUDED`], and a
/// sender on an active chain with a positive balance whose last submission
/// level is below `head`. Contracts additionally need code and no address;
/// calls need a target contract that has an address.
///
/// With `failed == false` only never-failed records are returned, oldest
/// created first; otherwise only failed records, oldest failure first.
#[derive(Debug, Clone)]
pub struct SpoolQuery {
    pub chain_id: u64,
    pub kind: TxKind,
    pub head: u64,
    pub failed: bool,
    pub limit: Option<usize>,
}

/// Storage backend
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> RelayerResult<()>;

    /// Insert or replace a chain record
    async fn save_chain(&self, chain: &Chain) -> RelayerResult<()>;

    async fn get_chain(&self, chain_id: u64) -> RelayerResult<Chain>;

    async fn chains(&self, active_only: bool) -> RelayerResult<Vec<Chain>>;

    async fn set_index_level(&self, chain_id: u64, level: u64) -> RelayerResult<()>;

    /// Insert or replace an account record
    async fn save_account(&self, account: &Account) -> RelayerResult<()>;

    async fn get_account(&self, id: Uuid) -> RelayerResult<Account>;

    async fn find_account(&self, chain_id: u64, address: &str) -> RelayerResult<Option<Account>>;

    async fn accounts(&self, chain_id: u64) -> RelayerResult<Vec<Account>>;

    /// Insert a new transaction, rejecting duplicates of `(chain, hash, counter, nonce)`
    async fn insert_transaction(&self, tx: &Transaction) -> RelayerResult<()>;

    /// Atomically replace an existing transaction row, history included
    async fn save_transaction(&self, tx: &Transaction) -> RelayerResult<()>;

    async fn get_transaction(&self, id: Uuid) -> RelayerResult<Transaction>;

    /// Fetch several transactions, missing ids are skipped
    async fn get_transactions(&self, ids: &[Uuid]) -> RelayerResult<Vec<Transaction>>;

    async fn find_transactions(&self, filter: &TxFilter) -> RelayerResult<Vec<Transaction>>;

    async fn spool_candidates(&self, query: &SpoolQuery) -> RelayerResult<Vec<Transaction>>;

    /// Reorg rollback in one transaction: every transaction of the chain at or
    /// above `level` becomes `deleted` with level, hash and address cleared
    /// and a history entry stamped `at`; the chain index level becomes
    /// `level`. Returns the number of rolled back transactions.
    async fn rollback_from(&self, chain_id: u64, level: u64, at: i64) -> RelayerResult<u64>;

    /// Insert or replace the event at `(event.transaction, event.index)`
    async fn save_event(&self, event: &Event) -> RelayerResult<()>;

    /// Events of a transaction, by index
    async fn events_of(&self, tx_id: Uuid) -> RelayerResult<Vec<Event>>;

    async fn insert_dependency(&self, dependency: &Dependency) -> RelayerResult<()>;

    /// Graph id of any edge touching `tx_id`
    async fn graph_of(&self, tx_id: Uuid) -> RelayerResult<Option<Uuid>>;

    async fn graph_edges(&self, graph: Uuid) -> RelayerResult<Vec<Dependency>>;

    /// Relabel every edge of graph `from` into graph `into`
    async fn merge_graphs(&self, from: Uuid, into: Uuid) -> RelayerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_filter_matches_top_level_only() {
        let mut tx = Transaction::new(1, TxKind::Function);
        let filter = TxFilter {
            caller: Some(None),
            ..TxFilter::chain(1)
        };
        assert!(filter.matches(&tx));

        tx.caller = Some(Uuid::new_v4());
        assert!(!filter.matches(&tx));
    }

    #[test]
    fn test_filter_empty_hash_counts_as_missing() {
        let mut tx = Transaction::new(1, TxKind::Contract);
        tx.address = Some(String::new());
        let filter = TxFilter {
            has_address: Some(false),
            ..TxFilter::chain(1)
        };
        assert!(filter.matches(&tx));
    }

    #[test]
    fn test_last_fail_order_puts_unfailed_last() {
        let mut failed = Transaction::new(1, TxKind::Transfer);
        failed.last_fail = Some(Utc::now() - Duration::seconds(5));
        let fresh = Transaction::new(1, TxKind::Transfer);

        assert_eq!(TxOrder::LastFail.compare(&failed, &fresh), Ordering::Less);
    }
}
