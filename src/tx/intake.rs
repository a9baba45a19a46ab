//! Transaction intake
//!
//! New transactions get their kind and chain derived once here, and calls
//! get the edge to their target contract added explicitly.

use crate::coordination::DependencyGraph;
use crate::error::{RelayerError, RelayerResult};
use crate::model::{HistoryEntry, Transaction, TxKind, TxState};
use crate::state::Store;

use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

/// Request to create a transaction
#[derive(Debug, Clone, Default)]
pub struct NewTransaction {
    /// Required when neither sender nor contract gives the chain
    pub chain_id: Option<u64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub sender: Option<Uuid>,
    pub receiver: Option<Uuid>,
    /// Target contract transaction, for calls
    pub contract: Option<Uuid>,
    pub function: Option<String>,
    pub args: serde_json::Value,
    pub amount: Decimal,
    /// Defaults to true for contracts
    pub has_code: Option<bool>,
    pub payload: serde_json::Value,
    pub max_fails: Option<u32>,
    pub normalizer: Option<String>,
    /// Create in `held` instead of `deploy`
    pub held: bool,
    /// Transactions that must be deployed first
    pub depends_on: Vec<Uuid>,
}

/// Persist a new transaction and its dependency edges
pub async fn create_transaction(
    store: &dyn Store,
    graph: &DependencyGraph,
    new: NewTransaction,
) -> RelayerResult<Transaction> {
    let kind = TxKind::derive(new.function.as_deref(), new.receiver.is_some());

    let sender = match new.sender {
        Some(id) => Some(store.get_account(id).await?),
        None => None,
    };
    let contract = match new.contract {
        Some(id) => Some(store.get_transaction(id).await?),
        None => None,
    };

    let chain_id = new
        .chain_id
        .or(sender.as_ref().map(|s| s.chain_id))
        .or(contract.as_ref().map(|c| c.chain_id))
        .ok_or_else(|| RelayerError::Config("transaction needs a chain, a sender or a contract".into()))?;

    for other in [sender.as_ref().map(|s| s.chain_id), contract.as_ref().map(|c| c.chain_id)]
        .into_iter()
        .flatten()
    {
        if other != chain_id {
            return Err(RelayerError::Config(format!(
                "transaction on chain {} references chain {}",
                chain_id, other
            )));
        }
    }
    store.get_chain(chain_id).await?;

    let mut tx = Transaction::new(chain_id, kind);
    tx.name = new.name;
    tx.description = new.description;
    tx.sender = new.sender;
    tx.receiver = new.receiver;
    tx.contract = new.contract;
    tx.function = new.function;
    tx.args = new.args;
    tx.amount = new.amount;
    tx.has_code = new.has_code.unwrap_or(kind == TxKind::Contract);
    tx.payload = new.payload;
    tx.normalizer = new.normalizer;
    if let Some(max_fails) = new.max_fails {
        tx.max_fails = max_fails;
    }
    tx.state = if new.held { TxState::Held } else { TxState::Deploy };
    tx.history.push(HistoryEntry(tx.state, tx.created_at.timestamp()));

    store.insert_transaction(&tx).await?;
    info!("Created {} transaction {} on chain {} state={}", kind, tx.id, chain_id, tx.state);

    if let Some(contract) = &contract {
        graph.add(&tx, contract).await?;
    }
    for dependency_id in new.depends_on {
        let dependency = store.get_transaction(dependency_id).await?;
        graph.add(&tx, &dependency).await?;
    }

    Ok(tx)
}

/// Move a held transaction into the spool
pub async fn release(store: &dyn Store, tx_id: Uuid) -> RelayerResult<Transaction> {
    crate::tx::machine::transition(store, tx_id, TxState::Deploy, 0, 0).await
}
