//! Chain module - the capability the engine needs from a blockchain
//!
//! This module provides:
//! - The `ChainClient` capability trait and the normalized `Operation` record
//! - A registry of clients keyed by chain id, built once at start-up
//! - Confirmation waiting between spool and index passes
//! - Account provisioning and balance refresh
//! - An in-process sandbox chain for development and tests

pub mod accounts;
pub mod finality;
pub mod sandbox;

pub use finality::ConfirmationWaiter;
pub use sandbox::SandboxChain;

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Account, ChainFamily, Secret, Transaction};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Kind of an on-chain operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Origination,
    Call,
    Transfer,
}

/// One operation of a block, as seen by the indexer.
///
/// Internal operations produced while executing this one are nested in
/// `internal`, each with its own `nonce`. Top-level operations carry
/// nonce `-1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub hash: String,
    pub counter: Option<u64>,
    pub nonce: i64,
    /// Sender address
    pub source: String,
    /// Target address of calls and transfers
    pub destination: Option<String>,
    /// Resulting address of originations
    pub address: Option<String>,
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub amount: Decimal,
    pub fee: Option<i64>,
    #[serde(default)]
    pub internal: Vec<Operation>,
    /// Events emitted by this operation, in emission order
    #[serde(default)]
    pub events: Vec<OperationEvent>,
}

/// Event log of an operation, decoded by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A call decoded against the target contract interface
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCall {
    pub function: String,
    pub args: serde_json::Value,
}

/// Everything a client needs to get one transaction airborne
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tx: Transaction,
    pub sender: Account,
    /// Address of the target contract, for calls
    pub contract_address: Option<String>,
    /// Address of the receiver, for transfers
    pub receiver_address: Option<String>,
}

/// Outcome of an accepted submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub hash: String,
    pub counter: Option<u64>,
    pub nonce: i64,
    /// Predicted address, for originations
    pub address: Option<String>,
    pub gas: Option<i64>,
}

/// Per-chain capability. Implementations own all wire encoding; the engine
/// only ever sees normalized records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Current head level
    async fn head(&self) -> RelayerResult<u64>;

    async fn balance(&self, address: &str) -> RelayerResult<Decimal>;

    /// Broadcast a transaction. `PermanentSubmission` errors mean the
    /// transaction can never succeed as is.
    async fn submit(&self, request: &SubmitRequest) -> RelayerResult<Submission>;

    /// Operations included at `level`, in block order
    async fn block_at(&self, level: u64) -> RelayerResult<Vec<Operation>>;

    /// New key pair, returns the address and its secret
    async fn generate_key(&self) -> RelayerResult<(String, Secret)>;

    /// Decode the function name and arguments of a call to `contract`
    async fn decode_call(
        &self,
        contract: &Transaction,
        operation: &Operation,
    ) -> RelayerResult<DecodedCall>;

    /// Independent handle for one concurrent submission worker
    fn session(&self) -> Arc<dyn ChainClient>;
}

/// Chain clients indexed by chain ID
pub struct ChainRegistry {
    clients: DashMap<u64, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Build clients for every enabled chain whose family has a built-in client.
    /// Sandbox chains with a `block_time_ms` setting start baking when a
    /// runtime is available.
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            match chain_config.family {
                ChainFamily::Sandbox => {
                    info!(
                        "Initializing sandbox chain {} (ID: {})",
                        name, chain_config.chain_id
                    );
                    let client = Arc::new(SandboxChain::with_configuration(
                        chain_config.chain_id,
                        &chain_config.configuration,
                    ));
                    let block_time = chain_config
                        .configuration
                        .get("block_time_ms")
                        .and_then(|ms| ms.as_u64());
                    if let (Some(ms), Ok(_)) = (block_time, tokio::runtime::Handle::try_current()) {
                        info!("Sandbox chain {} bakes every {}ms", chain_config.chain_id, ms);
                        drop(client.spawn_baker(Duration::from_millis(ms)));
                    }
                    registry.register(client);
                }
                family => {
                    warn!(
                        "Chain {} uses family {}, register its client before starting",
                        name, family
                    );
                }
            }
        }

        registry
    }

    /// Register or replace the client of a chain
    pub fn register(&self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.chain_id(), client);
    }

    /// Get client for a specific chain
    pub fn get(&self, chain_id: u64) -> RelayerResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(RelayerError::NoClient { chain_id })
    }

    /// Get all registered chain IDs
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();

        for chain_id in self.chain_ids() {
            let healthy = match self.get(chain_id) {
                Ok(client) => client.head().await.is_ok(),
                Err(_) => false,
            };
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ChainRegistry::new();
        registry.register(Arc::new(SandboxChain::new(7)));

        assert_eq!(registry.chain_ids(), vec![7]);
        assert_eq!(registry.get(7).unwrap().chain_id(), 7);
        assert!(matches!(
            registry.get(8),
            Err(RelayerError::NoClient { chain_id: 8 })
        ));
    }

    #[test]
    fn test_registry_from_settings_skips_external_families() {
        let settings = Settings::parse(
            r#"
            [relayer]
            instance_id = "test"

            [database]
            backend = "memory"

            [chains.local]
            chain_id = 1
            name = "local"
            family = "sandbox"
            enabled = true

            [chains.tezos]
            chain_id = 2
            name = "tezos"
            family = "tezos"
            endpoints = ["http://localhost:8732"]
            enabled = true
            "#,
        )
        .unwrap();

        let registry = ChainRegistry::from_settings(&settings);
        assert_eq!(registry.chain_ids(), vec![1]);
    }

    #[test]
    fn test_operation_deserializes_with_defaults() {
        let op: Operation = serde_json::from_str(
            r#"{"kind":"call","hash":"oo1","counter":3,"nonce":-1,"source":"tz1",
                "destination":"KT1","address":null,"entrypoint":"mint","fee":100}"#,
        )
        .unwrap();
        assert_eq!(op.kind, OperationKind::Call);
        assert!(op.internal.is_empty());
        assert!(op.amount.is_zero());
    }
}
