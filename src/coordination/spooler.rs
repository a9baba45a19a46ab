//! Spooler: picks the next transactions to get airborne on one chain
//!
//! Each call makes one scheduling decision, in this order:
//! 1. the oldest never-failed transfer
//! 2. the oldest never-failed contract, or the dependency it waits for
//! 3. up to `max_parallel_calls` never-failed calls, one per sender, sent
//!    concurrently
//! 4. the oldest failure among transfers, then contracts, then calls
//!
//! A sender gets at most one transaction per block: candidates whose
//! sender already submitted at the current head are never picked.

use super::dependency::DependencyGraph;
use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Chain, Transaction, TxKind};
use crate::state::{SpoolQuery, Store};
use crate::tx::{machine, TransactionSender};

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one spool cycle acted on
#[derive(Debug)]
pub enum SpoolOutcome {
    /// No eligible work
    Idle,
    Submitted(Transaction),
    /// Concurrent call batch, failed submissions included
    Batch(Vec<Transaction>),
}

impl SpoolOutcome {
    pub fn transactions(&self) -> Vec<&Transaction> {
        match self {
            SpoolOutcome::Idle => Vec::new(),
            SpoolOutcome::Submitted(tx) => vec![tx],
            SpoolOutcome::Batch(txs) => txs.iter().collect(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SpoolOutcome::Idle)
    }

    fn label(&self) -> &'static str {
        match self {
            SpoolOutcome::Idle => "idle",
            SpoolOutcome::Submitted(_) => "submitted",
            SpoolOutcome::Batch(_) => "batch",
        }
    }
}

pub struct Spooler {
    /// Store for persistence
    store: Arc<dyn Store>,
    /// Dependency resolution
    graph: Arc<DependencyGraph>,
    /// Submission wrapper
    sender: TransactionSender,
    /// Upper bound of one call batch
    max_parallel_calls: usize,
}

impl Spooler {
    pub fn new(store: Arc<dyn Store>, max_parallel_calls: usize) -> Self {
        Self {
            graph: Arc::new(DependencyGraph::new(store.clone())),
            sender: TransactionSender::new(store.clone()),
            store,
            max_parallel_calls: max_parallel_calls.max(1),
        }
    }

    /// Run one scheduling decision on `chain`
    pub async fn spool(
        &self,
        chain: &Chain,
        client: Arc<dyn ChainClient>,
    ) -> RelayerResult<SpoolOutcome> {
        if !chain.is_active {
            debug!("Chain {} inactive, not spooling", chain);
            return Ok(SpoolOutcome::Idle);
        }

        let head = client.head().await?;
        let outcome = self.spool_at(chain, client, head).await;
        if let Ok(outcome) = &outcome {
            crate::metrics::record_spool_cycle(chain.id, outcome.label());
        }
        outcome
    }

    async fn spool_at(
        &self,
        chain: &Chain,
        client: Arc<dyn ChainClient>,
        head: u64,
    ) -> RelayerResult<SpoolOutcome> {
        if let Some(transfer) = self
            .candidates(chain, TxKind::Transfer, head, false)
            .await?
            .into_iter()
            .next()
        {
            info!("Deploying transfer {}", transfer);
            return self.submit(chain, client.as_ref(), transfer, head).await;
        }
        debug!("Found 0 transfers to deploy on chain {}", chain);

        for contract in self.candidates(chain, TxKind::Contract, head, false).await? {
            if let Some(target) = self.settle(contract, head).await? {
                info!("Deploying contract {}", target);
                return self.submit(chain, client.as_ref(), target, head).await;
            }
        }
        debug!("Found 0 contracts to deploy on chain {}", chain);

        let batch = self.call_batch(chain, head).await?;
        if !batch.is_empty() {
            return self.submit_batch(chain, client, batch, head).await;
        }
        debug!("Found 0 calls to send on chain {}", chain);

        for kind in [TxKind::Transfer, TxKind::Contract, TxKind::Function] {
            for candidate in self.candidates(chain, kind, head, true).await? {
                if let Some(target) = self.settle(candidate, head).await? {
                    info!("Retrying {} {}", kind, target);
                    return self.submit(chain, client.as_ref(), target, head).await;
                }
            }
            debug!("Found 0 {} to retry on chain {}", kind, chain);
        }

        Ok(SpoolOutcome::Idle)
    }

    async fn candidates(
        &self,
        chain: &Chain,
        kind: TxKind,
        head: u64,
        failed: bool,
    ) -> RelayerResult<Vec<Transaction>> {
        self.store
            .spool_candidates(&SpoolQuery {
                chain_id: chain.id,
                kind,
                head,
                failed,
                limit: None,
            })
            .await
    }

    /// First call per distinct sender, each replaced by what it waits for
    async fn call_batch(&self, chain: &Chain, head: u64) -> RelayerResult<Vec<Transaction>> {
        let mut senders: HashSet<Uuid> = HashSet::new();
        let mut picked: HashSet<Uuid> = HashSet::new();
        let mut batch = Vec::new();

        for call in self.candidates(chain, TxKind::Function, head, false).await? {
            if batch.len() >= self.max_parallel_calls {
                break;
            }
            let Some(sender) = call.sender else { continue };
            if senders.contains(&sender) {
                continue;
            }

            let Some(target) = self.settle(call, head).await? else {
                continue;
            };
            let target_sender = target.sender.unwrap_or(sender);
            if picked.contains(&target.id) || senders.contains(&target_sender) {
                continue;
            }

            senders.insert(sender);
            senders.insert(target_sender);
            picked.insert(target.id);
            batch.push(target);
        }

        Ok(batch)
    }

    /// Run the dependency resolver on a candidate. Returns what should be
    /// submitted instead, or `None` to skip the candidate.
    async fn settle(&self, candidate: Transaction, head: u64) -> RelayerResult<Option<Transaction>> {
        let target = match self.graph.resolve(&candidate).await {
            Ok(target) => target,
            Err(RelayerError::AbortedDependency {
                dependency,
                ascendency,
            }) => {
                let reason = format!("Aborting because dependency {} is aborted", dependency);
                let count = machine::abort_all(self.store.as_ref(), &ascendency, &reason).await?;
                warn!(
                    "Dependency {} of {} is aborted, aborted {} transactions",
                    dependency, candidate.id, count
                );
                for _ in 0..count {
                    crate::metrics::record_tx_aborted(candidate.chain_id);
                }
                return Ok(None);
            }
            Err(RelayerError::ExcludedDependency { dependency, state }) => {
                debug!(
                    "Skipping {}: dependency {} is {}",
                    candidate.id, dependency, state
                );
                return Ok(None);
            }
            Err(e @ (RelayerError::DependencyDepth { .. } | RelayerError::DependencyCycle { .. })) => {
                error!("Skipping {}: {}", candidate.id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if target.id == candidate.id || self.eligible(&target, head).await? {
            if target.id != candidate.id {
                info!("{} waits for {}", candidate, target);
            }
            Ok(Some(target))
        } else {
            debug!("Dependency {} of {} is not ready", target.id, candidate.id);
            Ok(None)
        }
    }

    /// Whether a substitute picked by the resolver can be submitted now
    async fn eligible(&self, tx: &Transaction, head: u64) -> RelayerResult<bool> {
        if tx.hash.is_some() || tx.state.is_excluded() {
            return Ok(false);
        }
        let Some(sender_id) = tx.sender else {
            return Ok(false);
        };
        if !self.store.get_account(sender_id).await?.can_send_at(head) {
            return Ok(false);
        }
        if tx.kind == TxKind::Contract && !tx.has_code {
            return Ok(false);
        }
        Ok(true)
    }

    async fn submit(
        &self,
        chain: &Chain,
        client: &dyn ChainClient,
        tx: Transaction,
        head: u64,
    ) -> RelayerResult<SpoolOutcome> {
        let sent = self
            .sender
            .send(client, tx.id, head, chain.min_confirmations)
            .await?;
        Ok(SpoolOutcome::Submitted(sent))
    }

    /// Send a batch concurrently, one client session per worker. Failures
    /// are recorded on their transaction and never stop siblings.
    async fn submit_batch(
        &self,
        chain: &Chain,
        client: Arc<dyn ChainClient>,
        batch: Vec<Transaction>,
        head: u64,
    ) -> RelayerResult<SpoolOutcome> {
        info!(
            "Sending {} calls from distinct senders on chain {}",
            batch.len(),
            chain
        );

        let handles: Vec<_> = batch
            .iter()
            .map(|tx| {
                let session = client.session();
                let sender = self.sender.clone();
                let tx_id = tx.id;
                let min_confirmations = chain.min_confirmations;
                tokio::spawn(async move {
                    sender
                        .send(session.as_ref(), tx_id, head, min_confirmations)
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;

        let mut acted = Vec::with_capacity(batch.len());
        for (tx, result) in batch.into_iter().zip(results) {
            match result {
                Ok(Ok(sent)) => acted.push(sent),
                Ok(Err(e)) => {
                    warn!("Call {} failed: {}", tx.id, e);
                    acted.push(self.store.get_transaction(tx.id).await?);
                }
                Err(e) => {
                    error!("Submission worker for {} panicked: {}", tx.id, e);
                    acted.push(self.store.get_transaction(tx.id).await?);
                }
            }
        }

        if acted.len() == 1 {
            if let Some(tx) = acted.pop() {
                return Ok(SpoolOutcome::Submitted(tx));
            }
        }
        Ok(SpoolOutcome::Batch(acted))
    }
}
