//! In-memory store, used by the sandbox backend and the test-suite

use super::{SpoolQuery, Store, TxFilter, TxOrder};
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Account, Chain, Dependency, Event, HistoryEntry, Transaction, TxKind, TxState};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    chains: BTreeMap<u64, Chain>,
    accounts: HashMap<Uuid, Account>,
    /// Transactions with their insertion sequence, tie-breaker for ordering
    transactions: HashMap<Uuid, (u64, Transaction)>,
    dependencies: Vec<Dependency>,
    events: Vec<Event>,
    sequence: u64,
}

impl MemoryState {
    fn sorted(&self, mut found: Vec<&(u64, Transaction)>, order: TxOrder) -> Vec<Transaction> {
        found.sort_by(|(sa, a), (sb, b)| order.compare(a, b).then(sa.cmp(sb)));
        found.into_iter().map(|(_, tx)| tx.clone()).collect()
    }

    fn is_spoolable(&self, tx: &Transaction, query: &SpoolQuery) -> bool {
        if tx.chain_id != query.chain_id
            || tx.kind != query.kind
            || tx.hash.is_some()
            || tx.state.is_excluded()
            || tx.last_fail.is_some() != query.failed
        {
            return false;
        }

        let chain_active = self
            .chains
            .get(&tx.chain_id)
            .map_or(false, |c| c.is_active);
        let sender_ready = tx
            .sender
            .and_then(|id| self.accounts.get(&id))
            .map_or(false, |a| {
                a.balance > Decimal::ZERO && a.last_level.map_or(true, |l| l < query.head)
            });
        if !chain_active || !sender_ready {
            return false;
        }

        match tx.kind {
            TxKind::Contract => tx.has_code && !tx.is_deployed(),
            TxKind::Function => tx
                .contract
                .and_then(|id| self.transactions.get(&id))
                .map_or(false, |(_, contract)| contract.is_deployed()),
            TxKind::Transfer => true,
        }
    }
}

/// Store keeping every record behind one async lock
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }

    async fn save_chain(&self, chain: &Chain) -> RelayerResult<()> {
        self.state.write().await.chains.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn get_chain(&self, chain_id: u64) -> RelayerResult<Chain> {
        self.state
            .read()
            .await
            .chains
            .get(&chain_id)
            .cloned()
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    async fn chains(&self, active_only: bool) -> RelayerResult<Vec<Chain>> {
        Ok(self
            .state
            .read()
            .await
            .chains
            .values()
            .filter(|c| c.is_active || !active_only)
            .cloned()
            .collect())
    }

    async fn set_index_level(&self, chain_id: u64, level: u64) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        let chain = state
            .chains
            .get_mut(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })?;
        chain.index_level = Some(level);
        Ok(())
    }

    async fn save_account(&self, account: &Account) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        if let Some(address) = &account.address {
            let taken = state.accounts.values().any(|a| {
                a.id != account.id
                    && a.chain_id == account.chain_id
                    && a.address.as_ref() == Some(address)
            });
            if taken {
                return Err(RelayerError::Internal(format!(
                    "account {} already exists on chain {}",
                    address, account.chain_id
                )));
            }
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> RelayerResult<Account> {
        self.state
            .read()
            .await
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| RelayerError::AccountNotFound {
                account: id.to_string(),
            })
    }

    async fn find_account(&self, chain_id: u64, address: &str) -> RelayerResult<Option<Account>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.chain_id == chain_id && a.address.as_deref() == Some(address))
            .cloned())
    }

    async fn accounts(&self, chain_id: u64) -> RelayerResult<Vec<Account>> {
        let state = self.state.read().await;
        let mut accounts: Vec<_> = state
            .accounts
            .values()
            .filter(|a| a.chain_id == chain_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&tx.id) {
            return Err(RelayerError::Internal(format!("transaction {} exists", tx.id)));
        }
        if tx.hash.is_some() {
            let duplicate = state.transactions.values().any(|(_, other)| {
                other.chain_id == tx.chain_id
                    && other.hash == tx.hash
                    && other.counter == tx.counter
                    && other.nonce == tx.nonce
            });
            if duplicate {
                return Err(RelayerError::Internal(format!(
                    "duplicate operation {:?} counter {:?} nonce {}",
                    tx.hash, tx.counter, tx.nonce
                )));
            }
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state.transactions.insert(tx.id, (sequence, tx.clone()));
        Ok(())
    }

    async fn save_transaction(&self, tx: &Transaction) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        match state.transactions.get_mut(&tx.id) {
            Some((_, stored)) => {
                *stored = tx.clone();
                Ok(())
            }
            None => Err(RelayerError::TransactionNotFound {
                tx_id: tx.id.to_string(),
            }),
        }
    }

    async fn get_transaction(&self, id: Uuid) -> RelayerResult<Transaction> {
        self.state
            .read()
            .await
            .transactions
            .get(&id)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| RelayerError::TransactionNotFound {
                tx_id: id.to_string(),
            })
    }

    async fn get_transactions(&self, ids: &[Uuid]) -> RelayerResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.transactions.get(id).map(|(_, tx)| tx.clone()))
            .collect())
    }

    async fn find_transactions(&self, filter: &TxFilter) -> RelayerResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let found: Vec<_> = state
            .transactions
            .values()
            .filter(|(_, tx)| filter.matches(tx))
            .collect();
        let mut sorted = state.sorted(found, filter.order);
        if let Some(limit) = filter.limit {
            sorted.truncate(limit);
        }
        Ok(sorted)
    }

    async fn spool_candidates(&self, query: &SpoolQuery) -> RelayerResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let found: Vec<_> = state
            .transactions
            .values()
            .filter(|(_, tx)| state.is_spoolable(tx, query))
            .collect();
        let order = if query.failed {
            TxOrder::LastFail
        } else {
            TxOrder::CreatedAt
        };
        let mut sorted = state.sorted(found, order);
        if let Some(limit) = query.limit {
            sorted.truncate(limit);
        }
        Ok(sorted)
    }

    async fn rollback_from(&self, chain_id: u64, level: u64, at: i64) -> RelayerResult<u64> {
        let mut state = self.state.write().await;
        if !state.chains.contains_key(&chain_id) {
            return Err(RelayerError::ChainNotFound { chain_id });
        }

        let mut rolled_back = 0;
        for (_, tx) in state.transactions.values_mut() {
            if tx.chain_id != chain_id || tx.level.map_or(true, |l| l < level) {
                continue;
            }
            tx.level = None;
            tx.hash = None;
            tx.address = None;
            tx.state = TxState::Deleted;
            tx.history.push(HistoryEntry(TxState::Deleted, at));
            rolled_back += 1;
        }

        if let Some(chain) = state.chains.get_mut(&chain_id) {
            chain.index_level = Some(level);
        }
        debug!("Rolled back {} transactions on chain {}", rolled_back, chain_id);
        Ok(rolled_back)
    }

    async fn save_event(&self, event: &Event) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        if !state.transactions.contains_key(&event.transaction) {
            return Err(RelayerError::TransactionNotFound {
                tx_id: event.transaction.to_string(),
            });
        }
        state
            .events
            .retain(|e| !(e.transaction == event.transaction && e.index == event.index));
        state.events.push(event.clone());
        Ok(())
    }

    async fn events_of(&self, tx_id: Uuid) -> RelayerResult<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.transaction == tx_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.index);
        Ok(events)
    }

    async fn insert_dependency(&self, dependency: &Dependency) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        let exists = state.dependencies.iter().any(|d| {
            d.dependency == dependency.dependency && d.dependent == dependency.dependent
        });
        if !exists {
            state.dependencies.push(dependency.clone());
        }
        Ok(())
    }

    async fn graph_of(&self, tx_id: Uuid) -> RelayerResult<Option<Uuid>> {
        Ok(self
            .state
            .read()
            .await
            .dependencies
            .iter()
            .find(|d| d.dependent == tx_id || d.dependency == tx_id)
            .map(|d| d.graph))
    }

    async fn graph_edges(&self, graph: Uuid) -> RelayerResult<Vec<Dependency>> {
        Ok(self
            .state
            .read()
            .await
            .dependencies
            .iter()
            .filter(|d| d.graph == graph)
            .cloned()
            .collect())
    }

    async fn merge_graphs(&self, from: Uuid, into: Uuid) -> RelayerResult<()> {
        let mut state = self.state.write().await;
        for dependency in state.dependencies.iter_mut().filter(|d| d.graph == from) {
            dependency.graph = into;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChainFamily;

    async fn seeded() -> (MemoryStore, Account) {
        let store = MemoryStore::new();
        store
            .save_chain(&Chain::new(1, "sandbox", ChainFamily::Sandbox))
            .await
            .unwrap();
        let mut sender = Account::new(1, Some("tz1sender".into()));
        sender.balance = Decimal::new(100, 0);
        store.save_account(&sender).await.unwrap();
        (store, sender)
    }

    #[tokio::test]
    async fn test_rejects_duplicate_operation() {
        let (store, _) = seeded().await;
        let mut first = Transaction::new(1, TxKind::Function);
        first.hash = Some("oo1".into());
        first.nonce = 3;
        store.insert_transaction(&first).await.unwrap();

        let mut second = Transaction::new(1, TxKind::Function);
        second.hash = Some("oo1".into());
        second.nonce = 3;
        assert!(store.insert_transaction(&second).await.is_err());

        second.nonce = 4;
        assert!(store.insert_transaction(&second).await.is_ok());
    }

    #[tokio::test]
    async fn test_spool_candidates_skip_busy_sender() {
        let (store, mut sender) = seeded().await;
        let mut transfer = Transaction::new(1, TxKind::Transfer);
        transfer.sender = Some(sender.id);
        store.insert_transaction(&transfer).await.unwrap();

        let query = SpoolQuery {
            chain_id: 1,
            kind: TxKind::Transfer,
            head: 10,
            failed: false,
            limit: None,
        };
        assert_eq!(store.spool_candidates(&query).await.unwrap().len(), 1);

        sender.last_level = Some(10);
        store.save_account(&sender).await.unwrap();
        assert!(store.spool_candidates(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spool_candidates_need_deployed_contract_for_calls() {
        let (store, sender) = seeded().await;
        let mut contract = Transaction::new(1, TxKind::Contract);
        contract.sender = Some(sender.id);
        contract.has_code = true;
        store.insert_transaction(&contract).await.unwrap();

        let mut call = Transaction::new(1, TxKind::Function);
        call.sender = Some(sender.id);
        call.contract = Some(contract.id);
        call.function = Some("mint".into());
        store.insert_transaction(&call).await.unwrap();

        let query = SpoolQuery {
            chain_id: 1,
            kind: TxKind::Function,
            head: 10,
            failed: false,
            limit: None,
        };
        assert!(store.spool_candidates(&query).await.unwrap().is_empty());

        contract.address = Some("KT1".into());
        store.save_transaction(&contract).await.unwrap();
        assert_eq!(store.spool_candidates(&query).await.unwrap()[0].id, call.id);
    }

    #[tokio::test]
    async fn test_rollback_clears_levels_at_or_above() {
        let (store, _) = seeded().await;
        let mut below = Transaction::new(1, TxKind::Contract);
        below.level = Some(4);
        below.hash = Some("oo4".into());
        below.state = TxState::Done;
        let mut above = Transaction::new(1, TxKind::Contract);
        above.level = Some(5);
        above.hash = Some("oo5".into());
        above.address = Some("KT5".into());
        above.state = TxState::Done;
        store.insert_transaction(&below).await.unwrap();
        store.insert_transaction(&above).await.unwrap();

        assert_eq!(store.rollback_from(1, 5, 42).await.unwrap(), 1);

        let above = store.get_transaction(above.id).await.unwrap();
        assert_eq!(above.state, TxState::Deleted);
        assert_eq!((above.level, above.hash, above.address), (None, None, None));
        assert_eq!(above.history.last(), Some(&HistoryEntry(TxState::Deleted, 42)));
        assert_eq!(store.get_transaction(below.id).await.unwrap().state, TxState::Done);
        assert_eq!(store.get_chain(1).await.unwrap().index_level, Some(5));
    }
}
