//! Normalization of indexed transactions into application records
//!
//! Normalizers are registered by name at start-up. A contract names its
//! normalizer; every confirmed operation on that contract goes through it
//! once, internal operations after the operation that produced them. The
//! events of an operation are normalized right after the operation itself.

use crate::error::RelayerResult;
use crate::model::{Event, Transaction, TxKind, TxState};
use crate::state::{Store, TxFilter, TxOrder};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns a confirmed transaction into application data
#[async_trait]
pub trait Normalizer: Send + Sync {
    /// `contract` is `tx` itself for originations
    async fn normalize(
        &self,
        tx: &Transaction,
        contract: &Transaction,
        store: &dyn Store,
    ) -> anyhow::Result<()>;

    /// Called for every event of `tx` once `tx` is normalized
    async fn normalize_event(
        &self,
        _event: &Event,
        _tx: &Transaction,
        _contract: &Transaction,
        _store: &dyn Store,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Normalizers by name, built once and shared read-only
#[derive(Default, Clone)]
pub struct NormalizerRegistry {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, normalizer: Arc<dyn Normalizer>) {
        let name = name.into();
        debug!("Registered normalizer {}", name);
        self.normalizers.insert(name, normalizer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Normalizer>> {
        self.normalizers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.normalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normalizers.is_empty()
    }
}

/// Normalize every confirmed top-level transaction of a chain, oldest
/// first, then the internal operations of each one that succeeded, depth
/// first. Returns how many transactions got normalized.
pub async fn normalize_chain(
    store: &dyn Store,
    registry: &NormalizerRegistry,
    chain_id: u64,
) -> RelayerResult<usize> {
    if registry.is_empty() {
        return Ok(0);
    }

    let pending = store
        .find_transactions(&TxFilter {
            states: vec![TxState::Done],
            normalized: Some(false),
            caller: Some(None),
            order: TxOrder::CreatedAt,
            ..TxFilter::chain(chain_id)
        })
        .await?;

    let mut normalized = 0;
    for mut tx in pending {
        if !normalize_one(store, registry, &mut tx).await? {
            continue;
        }
        normalized += 1;

        // Lowest nonce first, children right after their caller
        let mut pending = internals_of(store, chain_id, &tx).await?;
        while let Some(mut internal) = pending.pop() {
            if normalize_one(store, registry, &mut internal).await? {
                normalized += 1;
                pending.extend(internals_of(store, chain_id, &internal).await?);
            }
        }
    }

    if normalized > 0 {
        info!("Normalized {} transactions on chain {}", normalized, chain_id);
    }
    Ok(normalized)
}

/// Unnormalized internal operations of `caller`, highest nonce first
async fn internals_of(
    store: &dyn Store,
    chain_id: u64,
    caller: &Transaction,
) -> RelayerResult<Vec<Transaction>> {
    let mut internals = store
        .find_transactions(&TxFilter {
            caller: Some(Some(caller.id)),
            normalized: Some(false),
            order: TxOrder::Nonce,
            ..TxFilter::chain(chain_id)
        })
        .await?;
    internals.reverse();
    Ok(internals)
}

/// Run the normalizer of the contract of `tx`, recording the outcome.
/// Returns whether `tx` is normalized afterwards.
async fn normalize_one(
    store: &dyn Store,
    registry: &NormalizerRegistry,
    tx: &mut Transaction,
) -> RelayerResult<bool> {
    let contract = match (tx.kind, tx.contract) {
        (TxKind::Contract, _) => tx.clone(),
        (_, Some(contract_id)) => store.get_transaction(contract_id).await?,
        _ => return Ok(false),
    };
    let Some(normalizer) = contract.normalizer.as_deref().and_then(|n| registry.get(n)) else {
        return Ok(false);
    };

    match normalizer.normalize(tx, &contract, store).await {
        Ok(()) => {
            tx.normalized = true;
            tx.error = None;
            tx.last_fail = None;
            tx.updated_at = Utc::now();
            store.save_transaction(tx).await?;
            normalize_events(store, normalizer.as_ref(), tx, &contract).await?;
            Ok(true)
        }
        Err(e) => {
            warn!("Normalization of {} failed: {:#}", tx.id, e);
            tx.error = Some(format!("{:#}", e));
            tx.last_fail = Some(Utc::now());
            store.save_transaction(tx).await?;
            Ok(false)
        }
    }
}

/// Normalize the pending events of a freshly normalized transaction. A
/// failed event stays pending and is logged.
async fn normalize_events(
    store: &dyn Store,
    normalizer: &dyn Normalizer,
    tx: &Transaction,
    contract: &Transaction,
) -> RelayerResult<usize> {
    let mut normalized = 0;
    for mut event in store.events_of(tx.id).await? {
        if event.normalized {
            continue;
        }
        match normalizer.normalize_event(&event, tx, contract, store).await {
            Ok(()) => {
                event.normalized = true;
                store.save_event(&event).await?;
                normalized += 1;
            }
            Err(e) => warn!(
                "Normalization of event {} #{} of {} failed: {:#}",
                event.name, event.index, tx.id, e
            ),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use tokio::sync::Mutex;

    /// Records the order of normalized transactions, fails on `fail` calls
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Normalizer for Recorder {
        async fn normalize(
            &self,
            tx: &Transaction,
            _contract: &Transaction,
            _store: &dyn Store,
        ) -> anyhow::Result<()> {
            let name = tx.function.clone().unwrap_or_else(|| "origination".into());
            if name == "fail" {
                anyhow::bail!("cannot normalize {}", name);
            }
            self.seen.lock().await.push(name);
            Ok(())
        }

        async fn normalize_event(
            &self,
            event: &Event,
            _tx: &Transaction,
            _contract: &Transaction,
            _store: &dyn Store,
        ) -> anyhow::Result<()> {
            if event.name == "Broken" {
                anyhow::bail!("cannot decode {}", event.name);
            }
            self.seen.lock().await.push(format!("event:{}", event.name));
            Ok(())
        }
    }

    fn done(kind: TxKind, function: Option<&str>) -> Transaction {
        let mut tx = Transaction::new(1, kind);
        tx.state = TxState::Done;
        tx.function = function.map(String::from);
        tx
    }

    #[tokio::test]
    async fn test_internal_operations_follow_their_caller() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut registry = NormalizerRegistry::new();
        registry.register("token", recorder.clone());

        let mut contract = done(TxKind::Contract, None);
        contract.normalizer = Some("token".into());
        store.insert_transaction(&contract).await.unwrap();

        let mut call = done(TxKind::Function, Some("swap"));
        call.contract = Some(contract.id);
        store.insert_transaction(&call).await.unwrap();

        let mut first = None;
        for (nonce, name) in [(2, "second"), (1, "first")] {
            let mut internal = done(TxKind::Function, Some(name));
            internal.contract = Some(contract.id);
            internal.caller = Some(call.id);
            internal.nonce = nonce;
            store.insert_transaction(&internal).await.unwrap();
            first = Some(internal.id);
        }

        let mut nested = done(TxKind::Function, Some("nested"));
        nested.contract = Some(contract.id);
        nested.caller = first;
        nested.nonce = 3;
        store.insert_transaction(&nested).await.unwrap();

        assert_eq!(normalize_chain(&store, &registry, 1).await.unwrap(), 5);
        assert_eq!(
            *recorder.seen.lock().await,
            vec!["origination", "swap", "first", "nested", "second"]
        );
        assert_eq!(normalize_chain(&store, &registry, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_events_follow_their_transaction() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut registry = NormalizerRegistry::new();
        registry.register("token", recorder.clone());

        let mut contract = done(TxKind::Contract, None);
        contract.normalizer = Some("token".into());
        contract.normalized = true;
        store.insert_transaction(&contract).await.unwrap();

        let mut call = done(TxKind::Function, Some("mint"));
        call.contract = Some(contract.id);
        store.insert_transaction(&call).await.unwrap();
        for (index, name) in ["Minted", "Broken"].iter().enumerate() {
            let event = Event::new(1, call.id, index as u32, *name, serde_json::json!({}));
            store.save_event(&event).await.unwrap();
        }

        assert_eq!(normalize_chain(&store, &registry, 1).await.unwrap(), 1);
        assert_eq!(*recorder.seen.lock().await, vec!["mint", "event:Minted"]);

        let events = store.events_of(call.id).await.unwrap();
        assert!(events[0].normalized);
        assert!(!events[1].normalized);
        assert!(store.get_transaction(call.id).await.unwrap().normalized);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let store = MemoryStore::new();
        let mut registry = NormalizerRegistry::new();
        registry.register("token", Arc::new(Recorder::default()));

        let mut contract = done(TxKind::Contract, None);
        contract.normalizer = Some("token".into());
        contract.normalized = true;
        store.insert_transaction(&contract).await.unwrap();

        let mut call = done(TxKind::Function, Some("fail"));
        call.contract = Some(contract.id);
        store.insert_transaction(&call).await.unwrap();

        assert_eq!(normalize_chain(&store, &registry, 1).await.unwrap(), 0);
        let call = store.get_transaction(call.id).await.unwrap();
        assert!(!call.normalized);
        assert!(call.error.unwrap().contains("cannot normalize fail"));
        assert!(call.last_fail.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_contracts_are_skipped() {
        let store = MemoryStore::new();
        let mut registry = NormalizerRegistry::new();
        registry.register("token", Arc::new(Recorder::default()));

        let mut contract = done(TxKind::Contract, None);
        contract.normalizer = Some("unknown".into());
        store.insert_transaction(&contract).await.unwrap();

        assert_eq!(normalize_chain(&store, &registry, 1).await.unwrap(), 0);
        assert!(!store.get_transaction(contract.id).await.unwrap().normalized);
    }
}
