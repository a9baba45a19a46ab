//! Chain indexer
//!
//! Walks blocks from the last indexed level up to head and reconciles the
//! operations it finds with stored transactions. A head below the indexed
//! level is a reorganization: everything at or above the new head is rolled
//! back and the pass stops there.

use super::normalize::{self, NormalizerRegistry};
use crate::chain::{ChainClient, Operation, OperationKind};
use crate::error::RelayerResult;
use crate::model::{Account, Chain, Event, Transaction, TxKind, TxState};
use crate::state::{Store, TxFilter, TxOrder};
use crate::tx::machine;

use chrono::Utc;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one indexing pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Chain is not active
    Inactive,
    /// Levels `from..=to` were indexed
    Indexed { from: u64, to: u64, operations: usize },
    /// Head went back from `from` to `to`, nothing was indexed
    Reorg { from: u64, to: u64, rolled_back: u64 },
}

/// Block being indexed
struct BlockContext<'a> {
    chain: &'a Chain,
    client: &'a dyn ChainClient,
    level: u64,
    head: u64,
}

/// Indexer for every chain of a store
pub struct Indexer {
    store: Arc<dyn Store>,
    normalizers: Arc<NormalizerRegistry>,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>, normalizers: Arc<NormalizerRegistry>) -> Self {
        Self { store, normalizers }
    }

    /// Run one indexing pass on a chain
    pub async fn index(&self, chain_id: u64, client: &dyn ChainClient) -> RelayerResult<IndexOutcome> {
        let chain = self.store.get_chain(chain_id).await?;
        if !chain.is_active {
            return Ok(IndexOutcome::Inactive);
        }

        let head = client.head().await?;
        crate::metrics::record_head(chain.id, head);

        if let Some(indexed) = chain.index_level {
            if head < indexed {
                let rolled_back = self
                    .store
                    .rollback_from(chain.id, head, Utc::now().timestamp())
                    .await?;
                warn!(
                    "Reorg on chain {}: head {} below indexed level {}, rolled back {} transactions",
                    chain, head, indexed, rolled_back
                );
                crate::metrics::record_reorg(chain.id);
                crate::metrics::record_index_level(chain.id, head);
                return Ok(IndexOutcome::Reorg {
                    from: indexed,
                    to: head,
                    rolled_back,
                });
            }
        }

        let start = self.start_level(&chain).await?;
        let mut operations = 0;
        for level in start..=head {
            let context = BlockContext {
                chain: &chain,
                client,
                level,
                head,
            };
            operations += self.index_block(&context).await?;
        }

        self.store.set_index_level(chain.id, head).await?;
        crate::metrics::record_index_level(chain.id, head);
        debug!(
            "Indexed chain {} levels {}..={} ({} operations)",
            chain, start, head, operations
        );

        Ok(IndexOutcome::Indexed {
            from: start,
            to: head,
            operations,
        })
    }

    /// Run the normalizers over confirmed transactions of a chain
    pub async fn normalize(&self, chain_id: u64) -> RelayerResult<usize> {
        normalize::normalize_chain(self.store.as_ref(), &self.normalizers, chain_id).await
    }

    /// Lowest level of the next sweep: the indexed level, pulled down to
    /// the lowest transaction still waiting for confirmations
    async fn start_level(&self, chain: &Chain) -> RelayerResult<u64> {
        let indexed = chain.index_level.or(chain.min_level).unwrap_or(0);

        let waiting = self
            .store
            .find_transactions(
                &TxFilter::chain(chain.id)
                    .states(&[TxState::Confirm])
                    .order(TxOrder::Level)
                    .limit(1),
            )
            .await?;

        Ok(waiting
            .first()
            .and_then(|tx| tx.level)
            .map_or(indexed, |level| level.min(indexed)))
    }

    async fn index_block(&self, ctx: &BlockContext<'_>) -> RelayerResult<usize> {
        let operations = ctx.client.block_at(ctx.level).await?;
        let mut indexed = 0;

        for operation in &operations {
            let Some(record) = self.index_operation(ctx, operation, None).await? else {
                continue;
            };
            indexed += 1;

            // Depth first, lowest nonce first
            let mut pending = internal_of(operation, record.id);
            while let Some((internal, caller)) = pending.pop() {
                if let Some(record) = self.index_operation(ctx, internal, Some(caller)).await? {
                    indexed += 1;
                    pending.extend(internal_of(internal, record.id));
                }
            }
        }

        Ok(indexed)
    }

    /// Index one operation if it concerns us. Internal operations, those
    /// with a `caller`, are always indexed.
    async fn index_operation(
        &self,
        ctx: &BlockContext<'_>,
        operation: &Operation,
        caller: Option<Uuid>,
    ) -> RelayerResult<Option<Transaction>> {
        let chain_id = ctx.chain.id;
        let known = self.find_known(chain_id, operation, caller.is_none()).await?;

        match operation.kind {
            OperationKind::Origination => {
                let known = match (known, &operation.address) {
                    (Some(tx), _) => Some(tx),
                    (None, Some(address)) => self.find_contract(chain_id, address).await?,
                    (None, None) => None,
                };
                if known.is_none()
                    && caller.is_none()
                    && !self.is_indexed_account(chain_id, &operation.source).await?
                {
                    return Ok(None);
                }
                self.record(ctx, operation, TxKind::Contract, known, caller, None)
                    .await
                    .map(Some)
            }
            OperationKind::Call => {
                let Some(destination) = operation.destination.as_deref() else {
                    warn!("Call {} on chain {} has no destination", operation.hash, chain_id);
                    return Ok(None);
                };
                let contract = self.find_contract(chain_id, destination).await?;
                let wanted = known.is_some()
                    || caller.is_some()
                    || contract.as_ref().map_or(false, |c| c.index);
                if !wanted {
                    return Ok(None);
                }

                let contract = match contract {
                    Some(contract) => contract,
                    None => self.contract_stub(ctx, destination).await?,
                };
                self.record(ctx, operation, TxKind::Function, known, caller, Some(&contract))
                    .await
                    .map(Some)
            }
            OperationKind::Transfer => {
                if known.is_none() && caller.is_none() {
                    return Ok(None);
                }
                self.record(ctx, operation, TxKind::Transfer, known, caller, None)
                    .await
                    .map(Some)
            }
        }
    }

    /// Create or update the record of an operation and confirm it
    async fn record(
        &self,
        ctx: &BlockContext<'_>,
        operation: &Operation,
        kind: TxKind,
        known: Option<Transaction>,
        caller: Option<Uuid>,
        contract: Option<&Transaction>,
    ) -> RelayerResult<Transaction> {
        let min_confirmations = ctx.chain.min_confirmations;
        let target = if ctx.chain.confirmed_level(ctx.level) > ctx.head {
            TxState::Confirm
        } else {
            TxState::Done
        };

        if let Some(tx) = &known {
            if tx.level == Some(ctx.level) && (tx.state == TxState::Done || tx.state == target) {
                return Ok(tx.clone());
            }
        }

        let is_new = known.is_none();
        let mut tx = known.unwrap_or_else(|| Transaction::new(ctx.chain.id, kind));
        let previous = tx.state;

        tx.hash = Some(operation.hash.clone());
        tx.counter = operation.counter;
        tx.nonce = operation.nonce;
        tx.level = Some(ctx.level);
        tx.gas = operation.fee;
        tx.metadata = metadata_of(operation)?;
        tx.updated_at = Utc::now();
        if caller.is_some() {
            tx.caller = caller;
        }
        if tx.sender.is_none() {
            tx.sender = Some(self.account_for(ctx.chain.id, &operation.source).await?.id);
        }
        if is_new {
            tx.amount = operation.amount;
        }

        match kind {
            TxKind::Contract => {
                tx.address = operation.address.clone();
                if is_new {
                    tx.has_code = true;
                    tx.args = operation.parameters.clone();
                }
            }
            TxKind::Function => {
                if let Some(contract) = contract {
                    let decoded = ctx.client.decode_call(contract, operation).await?;
                    tx.contract = Some(contract.id);
                    tx.function = Some(decoded.function);
                    tx.args = decoded.args;
                }
            }
            TxKind::Transfer => {
                if let Some(destination) = &operation.destination {
                    tx.receiver = Some(self.account_for(ctx.chain.id, destination).await?.id);
                }
            }
        }

        if previous != TxState::Done {
            machine::state_set(&mut tx, TxState::Done, ctx.head, min_confirmations)?;
        }

        if is_new {
            self.store.insert_transaction(&tx).await?;
            info!(
                "Indexed new {} {} at level {} on chain {}",
                kind, tx, ctx.level, ctx.chain
            );
        } else {
            self.store.save_transaction(&tx).await?;
            debug!("Indexed {} at level {} state={}", tx.id, ctx.level, tx.state);
        }

        self.record_events(&tx, operation).await?;

        if tx.state == TxState::Done && previous != TxState::Done {
            crate::metrics::record_tx_confirmed(ctx.chain.id);
        }
        Ok(tx)
    }

    /// Store the events of `operation` on `tx`. Unchanged events keep their
    /// normalization status.
    async fn record_events(&self, tx: &Transaction, operation: &Operation) -> RelayerResult<usize> {
        if operation.events.is_empty() {
            return Ok(0);
        }

        let existing = self.store.events_of(tx.id).await?;
        let mut saved = 0;
        for (index, log) in operation.events.iter().enumerate() {
            let index = index as u32;
            let previous = existing.iter().find(|e| e.index == index);
            if previous.map_or(false, |e| e.name == log.name && e.args == log.args) {
                continue;
            }

            let mut event = Event::new(tx.chain_id, tx.id, index, log.name.clone(), log.args.clone());
            if let Some(previous) = previous {
                event.id = previous.id;
                event.created_at = previous.created_at;
            }
            self.store.save_event(&event).await?;
            saved += 1;
        }

        debug!("Stored {} events of {}", saved, tx.id);
        Ok(saved)
    }

    /// Record of a contract first seen as the destination of a call
    async fn contract_stub(&self, ctx: &BlockContext<'_>, address: &str) -> RelayerResult<Transaction> {
        let mut stub = Transaction::new(ctx.chain.id, TxKind::Contract);
        stub.address = Some(address.to_string());
        stub.index = false;
        machine::state_set(&mut stub, TxState::Done, ctx.head, ctx.chain.min_confirmations)?;
        self.store.insert_transaction(&stub).await?;

        info!("Discovered contract {} on chain {}", address, ctx.chain);
        Ok(stub)
    }

    /// Transaction already recorded for this operation.
    ///
    /// Records are keyed by `(hash, counter, nonce)`. A top-level operation
    /// also matches one of our submissions by hash alone as long as the
    /// indexer never saw it, since clients may report no counter or another
    /// one than the block carries.
    async fn find_known(
        &self,
        chain_id: u64,
        operation: &Operation,
        top_level: bool,
    ) -> RelayerResult<Option<Transaction>> {
        let filter = TxFilter {
            counter: Some(operation.counter),
            nonce: Some(operation.nonce),
            ..TxFilter::chain(chain_id).hash(&operation.hash).limit(1)
        };
        if let Some(tx) = self.store.find_transactions(&filter).await?.into_iter().next() {
            return Ok(Some(tx));
        }
        if !top_level {
            return Ok(None);
        }

        let filter = TxFilter {
            caller: Some(None),
            ..TxFilter::chain(chain_id)
                .kind(kind_of(operation.kind))
                .hash(&operation.hash)
        };
        let submitted = self
            .store
            .find_transactions(&filter)
            .await?
            .into_iter()
            .find(|tx| tx.metadata.is_null());
        if let Some(tx) = &submitted {
            debug!(
                "Matched {} to submission {} by hash, block counter {:?}",
                operation.hash, tx.id, operation.counter
            );
        }
        Ok(submitted)
    }

    async fn find_contract(&self, chain_id: u64, address: &str) -> RelayerResult<Option<Transaction>> {
        let filter = TxFilter::chain(chain_id)
            .kind(TxKind::Contract)
            .address(address)
            .limit(1);
        Ok(self.store.find_transactions(&filter).await?.into_iter().next())
    }

    async fn is_indexed_account(&self, chain_id: u64, address: &str) -> RelayerResult<bool> {
        Ok(self
            .store
            .find_account(chain_id, address)
            .await?
            .map_or(false, |account| account.index))
    }

    /// Account of an address, created without secret when unseen
    async fn account_for(&self, chain_id: u64, address: &str) -> RelayerResult<Account> {
        if let Some(account) = self.store.find_account(chain_id, address).await? {
            return Ok(account);
        }

        let mut account = Account::new(chain_id, Some(address.to_string()));
        account.index = false;
        self.store.save_account(&account).await?;
        debug!("Created account {} on chain {}", address, chain_id);
        Ok(account)
    }
}

fn kind_of(kind: OperationKind) -> TxKind {
    match kind {
        OperationKind::Origination => TxKind::Contract,
        OperationKind::Call => TxKind::Function,
        OperationKind::Transfer => TxKind::Transfer,
    }
}

/// Internal operations of `operation`, highest nonce first so that popping
/// yields them in execution order
fn internal_of(operation: &Operation, caller: Uuid) -> Vec<(&Operation, Uuid)> {
    let mut internal: Vec<_> = operation.internal.iter().map(|op| (op, caller)).collect();
    internal.sort_by_key(|(op, _)| Reverse(op.nonce));
    internal
}

/// Operation as stored in the metadata column, nested operations and
/// events excluded
fn metadata_of(operation: &Operation) -> RelayerResult<serde_json::Value> {
    let mut metadata = serde_json::to_value(operation)?;
    if let Some(object) = metadata.as_object_mut() {
        object.remove("internal");
        object.remove("events");
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{OperationEvent, SandboxChain};
    use crate::model::ChainFamily;
    use crate::state::MemoryStore;
    use rust_decimal::Decimal;

    fn operation(kind: OperationKind, hash: &str, source: &str) -> Operation {
        Operation {
            kind,
            hash: hash.to_string(),
            counter: Some(1),
            nonce: -1,
            source: source.to_string(),
            destination: None,
            address: None,
            entrypoint: None,
            parameters: serde_json::Value::Null,
            amount: Decimal::ZERO,
            fee: Some(1_000),
            internal: Vec::new(),
            events: Vec::new(),
        }
    }

    fn origination(hash: &str, source: &str, address: &str) -> Operation {
        Operation {
            address: Some(address.to_string()),
            ..operation(OperationKind::Origination, hash, source)
        }
    }

    fn call(hash: &str, source: &str, destination: &str, entrypoint: &str) -> Operation {
        Operation {
            destination: Some(destination.to_string()),
            entrypoint: Some(entrypoint.to_string()),
            parameters: serde_json::json!({"value": 1}),
            ..operation(OperationKind::Call, hash, source)
        }
    }

    async fn setup() -> (Arc<MemoryStore>, SandboxChain, Indexer) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_chain(&Chain::new(1, "sandbox", ChainFamily::Sandbox))
            .await
            .unwrap();
        store
            .save_account(&Account::new(1, Some("tz1alice".into())))
            .await
            .unwrap();
        let indexer = Indexer::new(store.clone(), Arc::new(NormalizerRegistry::new()));
        (store, SandboxChain::new(1), indexer)
    }

    async fn all(store: &MemoryStore) -> Vec<Transaction> {
        store.find_transactions(&TxFilter::chain(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_internal_origination_references_its_caller() {
        let (store, chain, indexer) = setup().await;
        let mut outer = origination("oo1", "tz1alice", "KT1factory");
        outer.internal.push(Operation {
            nonce: 0,
            ..origination("oo1", "KT1factory", "KT1child")
        });
        chain.push_block(vec![outer]).await;
        chain.bake().await;
        chain.bake().await;

        let outcome = indexer.index(1, &chain).await.unwrap();
        assert_eq!(
            outcome,
            IndexOutcome::Indexed {
                from: 0,
                to: 3,
                operations: 2
            }
        );

        let factory = store
            .find_transactions(&TxFilter::chain(1).address("KT1factory"))
            .await
            .unwrap()
            .remove(0);
        let child = store
            .find_transactions(&TxFilter::chain(1).address("KT1child"))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(factory.state, TxState::Done);
        assert_eq!(child.state, TxState::Done);
        assert_eq!(child.caller, Some(factory.id));
        assert_eq!(factory.caller, None);
        assert_eq!(child.level, Some(1));
        assert!(factory.metadata.get("internal").is_none());

        let deployer = store.find_account(1, "KT1factory").await.unwrap().unwrap();
        assert!(!deployer.index);
        assert_eq!(child.sender, Some(deployer.id));
    }

    #[tokio::test]
    async fn test_reindexing_changes_nothing() {
        let (store, chain, indexer) = setup().await;
        chain
            .push_block(vec![
                origination("oo1", "tz1alice", "KT1a"),
                origination("oo2", "tz1stranger", "KT1b"),
                call("oo3", "tz1stranger", "KT1a", "mint"),
            ])
            .await;
        chain.bake().await;
        chain.bake().await;

        indexer.index(1, &chain).await.unwrap();
        let first: Vec<_> = all(&store).await;
        assert_eq!(first.len(), 2);

        indexer.index(1, &chain).await.unwrap();
        let second: Vec<_> = all(&store).await;
        assert_eq!(first, second);

        let minted = second
            .iter()
            .find(|tx| tx.kind == TxKind::Function)
            .unwrap();
        assert_eq!(minted.function.as_deref(), Some("mint"));
        assert_eq!(minted.args, serde_json::json!({"value": 1}));
    }

    #[tokio::test]
    async fn test_submission_matched_by_hash_when_counter_differs() {
        let (store, chain, indexer) = setup().await;
        let alice = store.find_account(1, "tz1alice").await.unwrap().unwrap();
        let mut submitted = Transaction::new(1, TxKind::Transfer);
        submitted.sender = Some(alice.id);
        submitted.hash = Some("oo5".into());
        submitted.counter = None;
        submitted.level = Some(0);
        submitted.state = TxState::Confirm;
        store.insert_transaction(&submitted).await.unwrap();

        chain
            .push_block(vec![Operation {
                destination: Some("tz1bob".into()),
                amount: Decimal::new(2, 0),
                ..operation(OperationKind::Transfer, "oo5", "tz1alice")
            }])
            .await;
        chain.bake().await;
        chain.bake().await;
        indexer.index(1, &chain).await.unwrap();

        let transfers = store
            .find_transactions(&TxFilter::chain(1).kind(TxKind::Transfer))
            .await
            .unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].id, submitted.id);
        assert_eq!(transfers[0].state, TxState::Done);
        assert_eq!(transfers[0].level, Some(1));
        assert_eq!(transfers[0].counter, Some(1));

        // Matched records are keyed by the block counter from now on
        indexer.index(1, &chain).await.unwrap();
        assert_eq!(all(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_stored_once() {
        let (store, chain, indexer) = setup().await;
        let mut minted = origination("oo1", "tz1alice", "KT1a");
        minted.events = vec![
            OperationEvent {
                name: "Transfer".into(),
                args: serde_json::json!({"to": "tz1bob", "value": 3}),
            },
            OperationEvent {
                name: "Approval".into(),
                args: serde_json::Value::Null,
            },
        ];
        chain.push_block(vec![minted]).await;
        indexer.index(1, &chain).await.unwrap();

        let contract = all(&store).await.remove(0);
        assert!(contract.metadata.get("events").is_none());
        let mut events = store.events_of(contract.id).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["Transfer", "Approval"]
        );
        assert_eq!(events[0].args["value"], 3);

        events[0].normalized = true;
        store.save_event(&events[0]).await.unwrap();
        chain.bake().await;
        chain.bake().await;
        indexer.index(1, &chain).await.unwrap();

        let again = store.events_of(contract.id).await.unwrap();
        assert_eq!(again.len(), 2);
        assert!(again[0].normalized);
        assert_eq!(again[0].id, events[0].id);
    }

    #[tokio::test]
    async fn test_reorg_rolls_back_and_stops() {
        let (store, chain, indexer) = setup().await;
        chain.bake().await;
        chain
            .push_block(vec![origination("oo1", "tz1alice", "KT1a")])
            .await;
        indexer.index(1, &chain).await.unwrap();
        let contract = all(&store).await.remove(0);
        assert_eq!(contract.state, TxState::Confirm);
        assert_eq!(contract.level, Some(2));

        chain.rewind(1).await;
        let outcome = indexer.index(1, &chain).await.unwrap();
        assert_eq!(
            outcome,
            IndexOutcome::Reorg {
                from: 2,
                to: 1,
                rolled_back: 1
            }
        );

        let contract = store.get_transaction(contract.id).await.unwrap();
        assert_eq!(contract.state, TxState::Deleted);
        assert_eq!((contract.level, contract.hash, contract.address), (None, None, None));
        assert_eq!(store.get_chain(1).await.unwrap().index_level, Some(1));
    }

    #[tokio::test]
    async fn test_confirm_is_rechecked_on_later_passes() {
        let (store, chain, indexer) = setup().await;
        chain
            .push_block(vec![origination("oo1", "tz1alice", "KT1a")])
            .await;
        indexer.index(1, &chain).await.unwrap();
        assert_eq!(all(&store).await[0].state, TxState::Confirm);

        chain.bake().await;
        indexer.index(1, &chain).await.unwrap();
        assert_eq!(all(&store).await[0].state, TxState::Confirm);
        assert_eq!(store.get_chain(1).await.unwrap().index_level, Some(2));

        // Index level is past the record, the sweep still starts at level 1
        chain.bake().await;
        chain.bake().await;
        let outcome = indexer.index(1, &chain).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Indexed { from: 1, to: 4, .. }));
        assert_eq!(all(&store).await[0].state, TxState::Done);
    }

    #[tokio::test]
    async fn test_internal_call_to_unknown_contract_creates_stub() {
        let (store, chain, indexer) = setup().await;
        let mut outer = call("oo2", "tz1alice", "KT1a", "swap");
        outer.internal.push(Operation {
            nonce: 1,
            ..call("oo2", "KT1a", "KT1elsewhere", "transfer")
        });

        let mut contract = Transaction::new(1, TxKind::Contract);
        contract.address = Some("KT1a".into());
        contract.state = TxState::Done;
        store.insert_transaction(&contract).await.unwrap();

        chain.push_block(vec![outer]).await;
        chain.bake().await;
        chain.bake().await;
        indexer.index(1, &chain).await.unwrap();

        let stub = store
            .find_transactions(&TxFilter::chain(1).address("KT1elsewhere"))
            .await
            .unwrap()
            .remove(0);
        assert!(!stub.index);
        assert_eq!(stub.state, TxState::Done);

        let internal = store
            .find_transactions(&TxFilter {
                contract: Some(stub.id),
                ..TxFilter::chain(1)
            })
            .await
            .unwrap()
            .remove(0);
        assert_eq!(internal.function.as_deref(), Some("transfer"));
        assert_eq!(internal.nonce, 1);
        assert!(internal.caller.is_some());
    }

    #[tokio::test]
    async fn test_top_level_calls_to_stub_contracts_are_ignored() {
        let (store, chain, indexer) = setup().await;
        let mut stub = Transaction::new(1, TxKind::Contract);
        stub.address = Some("KT1elsewhere".into());
        stub.index = false;
        stub.state = TxState::Done;
        store.insert_transaction(&stub).await.unwrap();

        chain
            .push_block(vec![call("oo9", "tz1stranger", "KT1elsewhere", "transfer")])
            .await;
        indexer.index(1, &chain).await.unwrap();
        assert_eq!(all(&store).await.len(), 1);
    }
}
