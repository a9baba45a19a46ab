//! In-process chain for development and tests
//!
//! Submissions land in a mempool until `bake()` seals them into a block.
//! `rewind()` drops blocks above a level to simulate a reorganization.
//! Hashes and addresses are derived from keccak digests of a sequence
//! number, so runs are deterministic.

use super::{
    ChainClient, DecodedCall, Operation, OperationKind, Submission, SubmitRequest,
};
use crate::error::{RelayerError, RelayerResult};
use crate::model::{Secret, Transaction, TxKind};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Fee charged for every sandbox operation
const SANDBOX_FEE: i64 = 1_000;

/// Scripted outcome of the next submission
#[derive(Debug, Clone)]
enum ScriptedFailure {
    Temporary(String),
    Permanent(String),
}

#[derive(Default)]
struct SandboxState {
    /// `blocks[level]`, level 0 is the empty genesis block
    blocks: Vec<Vec<Operation>>,
    mempool: Vec<Operation>,
    balances: HashMap<String, Decimal>,
    counters: HashMap<String, u64>,
    failures: VecDeque<ScriptedFailure>,
    sequence: u64,
}

impl SandboxState {
    fn head(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    fn next_digest(&mut self, chain_id: u64, tag: &str) -> String {
        self.sequence += 1;
        let mut hasher = Keccak256::new();
        hasher.update(chain_id.to_be_bytes());
        hasher.update(tag.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Sandbox chain client. Clones from [`ChainClient::session`] share the
/// same chain.
pub struct SandboxChain {
    chain_id: u64,
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxChain {
    pub fn new(chain_id: u64) -> Self {
        let state = SandboxState {
            blocks: vec![Vec::new()],
            ..Default::default()
        };
        Self {
            chain_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Build from the `configuration` table of a chain, reading the
    /// `funded` map of address to balance
    pub fn with_configuration(chain_id: u64, configuration: &serde_json::Value) -> Self {
        let chain = Self::new(chain_id);
        if let Some(funded) = configuration.get("funded").and_then(|f| f.as_object()) {
            let balances = funded
                .iter()
                .filter_map(|(address, amount)| {
                    let amount = match amount {
                        serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
                        serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
                        _ => None,
                    };
                    amount.map(|amount| (address.clone(), amount))
                })
                .collect::<HashMap<_, _>>();

            if let Ok(mut state) = chain.state.try_lock() {
                state.balances.extend(balances);
            }
        }
        chain
    }

    /// Set the balance of an address
    pub async fn fund(&self, address: &str, amount: Decimal) {
        self.state
            .lock()
            .await
            .balances
            .insert(address.to_string(), amount);
    }

    /// Make the next submission fail with a retryable error
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .push_back(ScriptedFailure::Temporary(message.into()));
    }

    /// Make the next submission fail permanently
    pub async fn reject_next(&self, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .push_back(ScriptedFailure::Permanent(message.into()));
    }

    /// Seal the mempool into a new block, returns its level
    pub async fn bake(&self) -> u64 {
        let mut state = self.state.lock().await;
        let operations = std::mem::take(&mut state.mempool);
        let count = operations.len();
        state.blocks.push(operations);
        let level = state.head();
        debug!(
            "Sandbox chain {} baked level {} with {} operations",
            self.chain_id, level, count
        );
        level
    }

    /// Append a block built by hand, returns its level
    pub async fn push_block(&self, operations: Vec<Operation>) -> u64 {
        let mut state = self.state.lock().await;
        state.blocks.push(operations);
        state.head()
    }

    /// Drop every block above `level`
    pub async fn rewind(&self, level: u64) {
        let mut state = self.state.lock().await;
        state.blocks.truncate(level as usize + 1);
        state.mempool.clear();
        info!("Sandbox chain {} rewound to level {}", self.chain_id, level);
    }

    /// Bake a block every `interval` until the handle is aborted
    pub fn spawn_baker(&self, interval: Duration) -> JoinHandle<()> {
        let chain = Self {
            chain_id: self.chain_id,
            state: self.state.clone(),
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                chain.bake().await;
            }
        })
    }

    fn operation_for(request: &SubmitRequest, source: &str) -> RelayerResult<Operation> {
        let tx = &request.tx;
        let mut operation = Operation {
            kind: OperationKind::Transfer,
            hash: String::new(),
            counter: None,
            nonce: -1,
            source: source.to_string(),
            destination: None,
            address: None,
            entrypoint: None,
            parameters: serde_json::Value::Null,
            amount: tx.amount,
            fee: Some(SANDBOX_FEE),
            internal: Vec::new(),
            events: Vec::new(),
        };

        match tx.kind {
            TxKind::Contract => {
                operation.kind = OperationKind::Origination;
                operation.parameters = tx.args.clone();
            }
            TxKind::Function => {
                if !matches!(
                    tx.args,
                    serde_json::Value::Array(_)
                        | serde_json::Value::Object(_)
                        | serde_json::Value::Null
                ) {
                    return Err(RelayerError::PermanentSubmission(format!(
                        "arguments of {} must be a list or a mapping",
                        tx
                    )));
                }
                let destination = request.contract_address.clone().ok_or_else(|| {
                    RelayerError::PermanentSubmission(format!("{} has no target contract", tx))
                })?;
                operation.kind = OperationKind::Call;
                operation.destination = Some(destination);
                operation.entrypoint = tx.function.clone();
                operation.parameters = tx.args.clone();
            }
            TxKind::Transfer => {
                let destination = request.receiver_address.clone().ok_or_else(|| {
                    RelayerError::PermanentSubmission(format!("{} has no receiver", tx))
                })?;
                operation.destination = Some(destination);
            }
        }

        Ok(operation)
    }
}

#[async_trait]
impl ChainClient for SandboxChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().await.head())
    }

    async fn balance(&self, address: &str) -> RelayerResult<Decimal> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn submit(&self, request: &SubmitRequest) -> RelayerResult<Submission> {
        let mut state = self.state.lock().await;

        if let Some(failure) = state.failures.pop_front() {
            return Err(match failure {
                ScriptedFailure::Temporary(message) => RelayerError::Submission(message),
                ScriptedFailure::Permanent(message) => RelayerError::PermanentSubmission(message),
            });
        }

        let source = request.sender.address.clone().ok_or_else(|| {
            RelayerError::PermanentSubmission(format!("sender {} has no address", request.sender))
        })?;
        let mut operation = Self::operation_for(request, &source)?;

        let balance = state.balances.get(&source).copied().unwrap_or_default();
        let cost = operation.amount + Decimal::from(SANDBOX_FEE) / Decimal::from(1_000_000);
        if balance < cost {
            return Err(RelayerError::Submission(format!(
                "balance of {} too low: {} < {}",
                source, balance, cost
            )));
        }

        let counter = state.counters.get(&source).copied().unwrap_or(0) + 1;
        state.counters.insert(source.clone(), counter);
        state.balances.insert(source.clone(), balance - cost);
        if let Some(destination) = &operation.destination {
            *state.balances.entry(destination.clone()).or_default() += operation.amount;
        }

        operation.hash = format!("oo{}", &state.next_digest(self.chain_id, "op")[..48]);
        operation.counter = Some(counter);
        if operation.kind == OperationKind::Origination {
            let address = format!("KT1{}", &state.next_digest(self.chain_id, "kt")[..33]);
            operation.address = Some(address);
        }

        let submission = Submission {
            hash: operation.hash.clone(),
            counter: operation.counter,
            nonce: operation.nonce,
            address: operation.address.clone(),
            gas: operation.fee,
        };
        state.mempool.push(operation);

        debug!(
            "Sandbox chain {} accepted {} as {}",
            self.chain_id, request.tx.id, submission.hash
        );
        Ok(submission)
    }

    async fn block_at(&self, level: u64) -> RelayerResult<Vec<Operation>> {
        let state = self.state.lock().await;
        state
            .blocks
            .get(level as usize)
            .cloned()
            .ok_or_else(|| RelayerError::Chain {
                chain_id: self.chain_id,
                message: format!("level {} is above head {}", level, state.head()),
            })
    }

    async fn generate_key(&self) -> RelayerResult<(String, Secret)> {
        let mut state = self.state.lock().await;
        let digest = state.next_digest(self.chain_id, "key");
        let secret = Secret::new(Keccak256::digest(digest.as_bytes()).to_vec());
        Ok((format!("tz1{}", &digest[..33]), secret))
    }

    async fn decode_call(
        &self,
        _contract: &Transaction,
        operation: &Operation,
    ) -> RelayerResult<DecodedCall> {
        Ok(DecodedCall {
            function: operation
                .entrypoint
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            args: operation.parameters.clone(),
        })
    }

    fn session(&self) -> Arc<dyn ChainClient> {
        Arc::new(Self {
            chain_id: self.chain_id,
            state: self.state.clone(),
        })
    }
}
