//! Transaction sender: one submission attempt and its recorded outcome

use super::machine;
use crate::chain::{accounts, ChainClient, SubmitRequest};
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Transaction, TxState};
use crate::state::Store;

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Submits transactions and records every outcome on the transaction
#[derive(Clone)]
pub struct TransactionSender {
    /// Store for persistence
    store: Arc<dyn Store>,
}

impl TransactionSender {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Submit one transaction at chain level `head`.
    ///
    /// On success the transaction gets its hash and lands in `confirm` (or
    /// `done` without confirmation depth) and its sender is marked busy for
    /// this level. On failure the error is recorded, the transaction moves
    /// to `retry` or `aborted`, and the error is returned.
    pub async fn send(
        &self,
        client: &dyn ChainClient,
        tx_id: Uuid,
        head: u64,
        min_confirmations: u64,
    ) -> RelayerResult<Transaction> {
        let mut tx = self.store.get_transaction(tx_id).await?;
        let sender_id = tx.sender.ok_or_else(|| RelayerError::AccountNotFound {
            account: format!("sender of {}", tx.id),
        })?;
        let sender = self.store.get_account(sender_id).await?;

        // A record left in `deploying`/`retrying` restarts its attempt
        let attempt = match tx.state {
            TxState::Retry | TxState::Retrying => TxState::Retrying,
            TxState::Deploying | TxState::Deleted if tx.last_fail.is_some() => TxState::Retrying,
            _ => TxState::Deploying,
        };
        machine::state_set(&mut tx, attempt, head, min_confirmations)?;
        self.store.save_transaction(&tx).await?;

        let request = self.request(&tx, &sender).await?;
        let started = Instant::now();
        let result = client.submit(&request).await;
        crate::metrics::record_tx_latency(tx.chain_id, started.elapsed().as_secs_f64());

        match result {
            Ok(submission) => {
                info!(
                    "Submitted {} on chain {} as {} (sender {})",
                    tx, tx.chain_id, submission.hash, sender
                );
                tx.hash = Some(submission.hash);
                tx.counter = submission.counter;
                tx.nonce = submission.nonce;
                if submission.address.is_some() {
                    tx.address = submission.address;
                }
                tx.gas = submission.gas;
                tx.level = Some(head);
                // Not yet seen by the indexer
                tx.metadata = serde_json::Value::Null;
                tx.error = None;
                tx.last_fail = None;
                machine::state_set(&mut tx, TxState::Done, head, min_confirmations)?;
                self.store.save_transaction(&tx).await?;

                // Fresh copy, the account may have changed during submission
                let mut sender = self.store.get_account(sender_id).await?;
                sender.last_level = Some(head);
                if submission.counter.is_some() {
                    sender.counter = submission.counter;
                }
                self.store.save_account(&sender).await?;
                if let Err(e) = accounts::refresh_balance(self.store.as_ref(), client, &mut sender).await {
                    warn!("Failed to refresh balance of {}: {}", sender, e);
                }

                crate::metrics::record_tx_submitted(tx.chain_id);
                Ok(tx)
            }
            Err(e) => {
                let state = machine::record_failure(&mut tx, &e)?;
                self.store.save_transaction(&tx).await?;

                warn!("Submission of {} failed ({}): {}", tx.id, state, e);
                crate::metrics::record_tx_failed(tx.chain_id);
                if state == TxState::Aborted {
                    crate::metrics::record_tx_aborted(tx.chain_id);
                }
                Err(e)
            }
        }
    }

    async fn request(
        &self,
        tx: &Transaction,
        sender: &crate::model::Account,
    ) -> RelayerResult<SubmitRequest> {
        let contract_address = match tx.contract {
            Some(contract_id) => self.store.get_transaction(contract_id).await?.address,
            None => None,
        };
        let receiver_address = match tx.receiver {
            Some(receiver_id) => self.store.get_account(receiver_id).await?.address,
            None => None,
        };
        debug!(
            "Prepared submission of {} to {:?}",
            tx.id,
            contract_address.as_ref().or(receiver_address.as_ref())
        );

        Ok(SubmitRequest {
            tx: tx.clone(),
            sender: sender.clone(),
            contract_address,
            receiver_address,
        })
    }
}
