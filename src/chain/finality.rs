//! Waiting for confirmation depth between spool and index passes
//!
//! Submitted transactions sit in `confirm` until their level is buried
//! under `min_confirmations` blocks. The driver waits for the deepest of
//! them before indexing, so one index pass settles the whole batch.

use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Chain, TxState};
use crate::state::{Store, TxFilter};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Polls the chain head until pending confirmations are reachable
pub struct ConfirmationWaiter {
    /// Store for persistence
    store: Arc<dyn Store>,
    /// Delay between head polls
    poll_interval: Duration,
    /// Give up after this long
    timeout: Duration,
}

impl ConfirmationWaiter {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            timeout,
        }
    }

    /// Level the head must reach for every `confirm` transaction of `chain`
    /// to become final, `None` when nothing awaits confirmation
    pub async fn target_level(&self, chain: &Chain) -> RelayerResult<Option<u64>> {
        let pending = self
            .store
            .find_transactions(&TxFilter::chain(chain.id).states(&[TxState::Confirm]))
            .await?;

        Ok(pending
            .iter()
            .filter_map(|tx| tx.level)
            .max()
            .map(|level| chain.confirmed_level(level)))
    }

    /// Wait until the head reaches the target level. Returns the head seen
    /// last, or `None` when there was nothing to wait for.
    pub async fn wait(
        &self,
        chain: &Chain,
        client: &dyn ChainClient,
    ) -> RelayerResult<Option<u64>> {
        let target = match self.target_level(chain).await? {
            Some(target) => target,
            None => return Ok(None),
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            let head = client.head().await?;
            if head >= target {
                info!(
                    "Chain {} reached level {} for pending confirmations",
                    chain, head
                );
                return Ok(Some(head));
            }

            if Instant::now() >= deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("confirmation level {} on chain {}", target, chain),
                });
            }

            debug!(
                "Chain {} at level {}, waiting for {}",
                chain, head, target
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SandboxChain;
    use crate::model::{ChainFamily, Transaction, TxKind};
    use crate::state::MemoryStore;

    async fn store_with_confirm(level: u64) -> (Arc<MemoryStore>, Chain) {
        let store = Arc::new(MemoryStore::new());
        let chain = Chain::new(1, "sandbox", ChainFamily::Sandbox);
        store.save_chain(&chain).await.unwrap();

        let mut tx = Transaction::new(1, TxKind::Contract);
        tx.state = TxState::Confirm;
        tx.level = Some(level);
        store.insert_transaction(&tx).await.unwrap();
        (store, chain)
    }

    #[tokio::test]
    async fn test_nothing_to_wait_for() {
        let store = Arc::new(MemoryStore::new());
        let chain = Chain::new(1, "sandbox", ChainFamily::Sandbox);
        let waiter = ConfirmationWaiter::new(store, Duration::from_millis(1), Duration::ZERO);

        let result = waiter.wait(&chain, &SandboxChain::new(1)).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_waits_for_baked_blocks() {
        let (store, chain) = store_with_confirm(1).await;
        let waiter =
            ConfirmationWaiter::new(store, Duration::from_millis(5), Duration::from_secs(5));
        assert_eq!(waiter.target_level(&chain).await.unwrap(), Some(3));

        let sandbox = SandboxChain::new(1);
        let baker = sandbox.spawn_baker(Duration::from_millis(10));
        let head = waiter.wait(&chain, &sandbox).await.unwrap();
        baker.abort();
        assert!(head.unwrap() >= 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let (store, chain) = store_with_confirm(10).await;
        let waiter =
            ConfirmationWaiter::new(store, Duration::from_millis(1), Duration::from_millis(20));

        let err = waiter.wait(&chain, &SandboxChain::new(1)).await.unwrap_err();
        assert!(matches!(err, RelayerError::Timeout { .. }));
    }
}
