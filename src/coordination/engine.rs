//! Main coordination engine: the per-chain spool, wait, index loop

use super::dependency::DependencyGraph;
use super::spooler::{SpoolOutcome, Spooler};
use crate::chain::{accounts, ChainRegistry, ConfirmationWaiter};
use crate::config::{RelayerConfig, Settings};
use crate::error::{RelayerError, RelayerResult};
use crate::index::{IndexOutcome, Indexer, NormalizerRegistry};
use crate::model::{Chain, Transaction};
use crate::state::Store;
use crate::tx::{create_transaction, NewTransaction};

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Drives every active chain through spool, confirmation wait, index and
/// normalization passes
pub struct CoordinationEngine {
    /// Store for persistence
    store: Arc<dyn Store>,
    /// Chain clients by chain id
    registry: Arc<ChainRegistry>,
    graph: DependencyGraph,
    spooler: Spooler,
    indexer: Indexer,
    waiter: ConfirmationWaiter,
    /// Configuration
    config: RelayerConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl CoordinationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ChainRegistry>,
        normalizers: Arc<NormalizerRegistry>,
        config: RelayerConfig,
    ) -> Self {
        let waiter = ConfirmationWaiter::new(
            store.clone(),
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.confirmation_timeout_secs),
        );

        Self {
            graph: DependencyGraph::new(store.clone()),
            spooler: Spooler::new(store.clone(), config.max_parallel_calls),
            indexer: Indexer::new(store.clone(), normalizers),
            waiter,
            store,
            registry,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Create or update chain records from the configuration. Indexing
    /// progress of known chains is kept. Returns the number of active chains.
    pub async fn sync_chains(&self, settings: &Settings) -> RelayerResult<usize> {
        let mut active = 0;

        for (name, chain_config) in &settings.chains {
            let mut chain = match self.store.get_chain(chain_config.chain_id).await {
                Ok(chain) => chain,
                Err(RelayerError::ChainNotFound { .. }) if chain_config.enabled => Chain::new(
                    chain_config.chain_id,
                    chain_config.name.clone(),
                    chain_config.family,
                ),
                Err(RelayerError::ChainNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            chain.name = chain_config.name.clone();
            chain.family = chain_config.family;
            chain.is_active = chain_config.enabled;
            chain.min_confirmations = chain_config.min_confirmations;
            chain.configuration = chain_config.configuration.clone();
            self.store.save_chain(&chain).await?;

            if chain.is_active {
                active += 1;
            }
            debug!("Synced chain {} ({}) active={}", chain, name, chain.is_active);
        }

        info!("{} active chains", active);
        Ok(active)
    }

    /// Main coordination loop, returns once [`stop`](Self::stop) was called
    pub async fn run(&self) -> RelayerResult<()> {
        let mut process_interval = interval(Duration::from_millis(self.config.poll_interval_ms));

        info!(
            "Coordination engine {} started",
            self.config.instance_id
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            process_interval.tick().await;

            let chains = match self.store.chains(true).await {
                Ok(chains) => chains,
                Err(e) => {
                    error!("Failed to load chains: {}", e);
                    continue;
                }
            };

            for chain in chains {
                if *self.shutdown.read().await {
                    break;
                }
                if let Err(e) = self.cycle(&chain).await {
                    error!("Cycle on chain {} failed: {}", chain, e);
                }
            }
        }

        info!("Coordination engine stopped");
        Ok(())
    }

    /// One spool, wait, index and normalize pass on one chain
    async fn cycle(&self, chain: &Chain) -> RelayerResult<()> {
        let client = self.registry.get(chain.id)?;

        match self.spooler.spool(chain, client.clone()).await {
            Ok(SpoolOutcome::Idle) => debug!("Nothing to spool on chain {}", chain),
            Ok(outcome) => info!(
                "Spooled {} transactions on chain {}",
                outcome.transactions().len(),
                chain
            ),
            // Submission errors are already recorded on the transaction
            Err(e) if e.is_retryable() || e.is_permanent() => {
                warn!("Spooling on chain {} failed: {}", chain, e)
            }
            // Not fatal, indexing still runs
            Err(e) => error!("Spool cycle on chain {} failed: {}", chain, e),
        }

        if let Err(e) = self.waiter.wait(chain, client.as_ref()).await {
            warn!("Confirmation wait on chain {}: {}", chain, e);
        }

        match self.indexer.index(chain.id, client.as_ref()).await? {
            IndexOutcome::Reorg { .. } => return Ok(()),
            outcome => debug!("Index pass on chain {}: {:?}", chain, outcome),
        }

        self.indexer.normalize(chain.id).await?;
        Ok(())
    }

    /// Create a transaction, applying the configured failure ceiling when
    /// the request names none
    pub async fn submit(&self, mut new: NewTransaction) -> RelayerResult<Transaction> {
        new.max_fails.get_or_insert(self.config.default_max_fails);
        create_transaction(self.store.as_ref(), &self.graph, new).await
    }

    /// Single spool cycle on a chain
    pub async fn spool_once(&self, chain_id: u64) -> RelayerResult<SpoolOutcome> {
        let chain = self.store.get_chain(chain_id).await?;
        let client = self.registry.get(chain_id)?;
        self.spooler.spool(&chain, client).await
    }

    /// Single index pass on a chain
    pub async fn index_once(&self, chain_id: u64) -> RelayerResult<IndexOutcome> {
        let client = self.registry.get(chain_id)?;
        self.indexer.index(chain_id, client.as_ref()).await
    }

    /// Single normalization pass on a chain
    pub async fn normalize_once(&self, chain_id: u64) -> RelayerResult<usize> {
        self.indexer.normalize(chain_id).await
    }

    /// Refresh the balance of every account of a chain
    pub async fn refresh_balances(&self, chain_id: u64) -> RelayerResult<usize> {
        let client = self.registry.get(chain_id)?;
        accounts::refresh_balances(self.store.as_ref(), client.as_ref()).await
    }

    /// Stop the coordination engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordination engine shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SandboxChain;
    use crate::model::{Account, ChainFamily, TxKind, TxState};
    use crate::state::MemoryStore;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    const SETTINGS: &str = r#"
        [relayer]
        instance_id = "engine-test"
        poll_interval_ms = 10
        confirmation_timeout_secs = 1
        default_max_fails = 3

        [database]
        backend = "memory"

        [chains.local]
        chain_id = 1
        name = "local"
        family = "sandbox"
        min_confirmations = 0
        enabled = true

        [chains.old]
        chain_id = 2
        name = "old"
        family = "sandbox"
        enabled = false
    "#;

    async fn engine() -> (Arc<MemoryStore>, Arc<SandboxChain>, CoordinationEngine) {
        let settings = Settings::parse(SETTINGS).unwrap();
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(SandboxChain::new(1));
        let registry = Arc::new(ChainRegistry::new());
        registry.register(chain.clone());

        let engine = CoordinationEngine::new(
            store.clone(),
            registry,
            Arc::new(NormalizerRegistry::new()),
            settings.relayer.clone(),
        );
        engine.sync_chains(&settings).await.unwrap();
        (store, chain, engine)
    }

    #[tokio::test]
    async fn test_sync_keeps_index_level() {
        let (store, _, engine) = engine().await;
        assert_eq!(store.chains(false).await.unwrap().len(), 1);

        store.set_index_level(1, 12).await.unwrap();
        let settings = Settings::parse(SETTINGS).unwrap();
        assert_eq!(engine.sync_chains(&settings).await.unwrap(), 1);

        let chain = store.get_chain(1).await.unwrap();
        assert_eq!(chain.index_level, Some(12));
        assert_eq!(chain.min_confirmations, 0);
        assert_eq!(chain.family, ChainFamily::Sandbox);
    }

    #[tokio::test]
    async fn test_spool_then_index_once() {
        let (store, chain, engine) = engine().await;
        let mut sender = Account::new(1, Some("tz1alice".into()));
        sender.balance = Decimal::new(10, 0);
        store.save_account(&sender).await.unwrap();
        chain.fund("tz1alice", Decimal::new(10, 0)).await;

        let contract = engine
            .submit(NewTransaction {
                sender: Some(sender.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(contract.max_fails, 3);

        let outcome = engine.spool_once(1).await.unwrap();
        assert_eq!(outcome.transactions().len(), 1);
        chain.bake().await;

        engine.index_once(1).await.unwrap();
        let contract = store.get_transaction(contract.id).await.unwrap();
        assert_eq!(contract.state, TxState::Done);
        assert_eq!(contract.level, Some(1));
        assert_eq!(store.get_chain(1).await.unwrap().index_level, Some(1));
    }

    #[tokio::test]
    async fn test_spool_error_does_not_stop_indexing() {
        let (store, chain, engine) = engine().await;
        let mut sender = Account::new(1, Some("tz1alice".into()));
        sender.balance = Decimal::new(10, 0);
        store.save_account(&sender).await.unwrap();

        let mut broken = Transaction::new(1, TxKind::Transfer);
        broken.sender = Some(sender.id);
        broken.receiver = Some(Uuid::new_v4());
        store.insert_transaction(&broken).await.unwrap();
        assert!(engine.spool_once(1).await.is_err());

        chain.bake().await;
        chain.bake().await;
        let record = store.get_chain(1).await.unwrap();
        assert!(engine.cycle(&record).await.is_ok());
        assert_eq!(store.get_chain(1).await.unwrap().index_level, Some(2));
        assert_eq!(
            store.get_transaction(broken.id).await.unwrap().state,
            TxState::Deploying
        );
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let (_, _, engine) = engine().await;
        let engine = Arc::new(engine);

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_client_is_an_error() {
        let (store, _, engine) = engine().await;
        store
            .save_chain(&Chain::new(3, "remote", ChainFamily::Tezos))
            .await
            .unwrap();
        assert!(matches!(
            engine.index_once(3).await,
            Err(RelayerError::NoClient { chain_id: 3 })
        ));
    }
}
