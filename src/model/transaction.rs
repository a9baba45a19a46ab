use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transaction kind, derived once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Contract,
    Function,
    Transfer,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Contract => "contract",
            TxKind::Function => "function",
            TxKind::Transfer => "transfer",
        }
    }

    /// Contract unless there is a function name or a receiver. A function
    /// name wins over a receiver. An amount alone is an origination balance.
    pub fn derive(function: Option<&str>, has_receiver: bool) -> Self {
        if function.is_some() {
            TxKind::Function
        } else if has_receiver {
            TxKind::Transfer
        } else {
            TxKind::Contract
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contract" => Ok(TxKind::Contract),
            "function" => Ok(TxKind::Function),
            "transfer" => Ok(TxKind::Transfer),
            other => Err(format!("unknown transaction kind {}", other)),
        }
    }
}

/// Lifecycle state of a transaction, see [`crate::tx::machine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Held,
    Deploy,
    Deploying,
    Retry,
    Retrying,
    Confirm,
    Done,
    Aborted,
    Deleted,
}

impl TxState {
    pub const ALL: [TxState; 9] = [
        TxState::Held,
        TxState::Deploy,
        TxState::Deploying,
        TxState::Retry,
        TxState::Retrying,
        TxState::Confirm,
        TxState::Done,
        TxState::Aborted,
        TxState::Deleted,
    ];

    /// States never picked up by the spooler
    pub const EXCLUDED: [TxState; 4] = [
        TxState::Held,
        TxState::Aborted,
        TxState::Confirm,
        TxState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Held => "held",
            TxState::Deploy => "deploy",
            TxState::Deploying => "deploying",
            TxState::Retry => "retry",
            TxState::Retrying => "retrying",
            TxState::Confirm => "confirm",
            TxState::Done => "done",
            TxState::Aborted => "aborted",
            TxState::Deleted => "deleted",
        }
    }

    pub fn is_excluded(&self) -> bool {
        Self::EXCLUDED.contains(self)
    }

    /// A submission attempt is in progress
    pub fn is_submitting(&self) -> bool {
        matches!(self, TxState::Deploying | TxState::Retrying)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown transaction state {}", s))
    }
}

/// One `[state, unix timestamp]` entry of a transaction history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry(pub TxState, pub i64);

/// The central record: a contract origination, a function call or a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub chain_id: u64,
    pub kind: TxKind,
    pub state: TxState,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sender: Option<Uuid>,
    /// Receiver account, for transfers
    pub receiver: Option<Uuid>,
    /// Target contract transaction, for calls
    pub contract: Option<Uuid>,
    /// Operation that produced this one, for internal operations
    pub caller: Option<Uuid>,
    /// On-chain address, for contracts
    pub address: Option<String>,
    pub function: Option<String>,
    pub args: serde_json::Value,
    pub amount: Decimal,
    pub hash: Option<String>,
    pub counter: Option<u64>,
    pub nonce: i64,
    pub level: Option<u64>,
    pub gas: Option<i64>,
    pub last_fail: Option<DateTime<Utc>>,
    pub max_fails: u32,
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
    /// Raw operation captured at index time
    pub metadata: serde_json::Value,
    /// Chain specific extension: code, ABI, storage...
    pub payload: serde_json::Value,
    pub has_code: bool,
    /// False for contracts discovered on chain but never registered
    pub index: bool,
    pub normalized: bool,
    /// Name of the registered normalizer, for contracts
    pub normalizer: Option<String>,
}

impl Transaction {
    pub fn new(chain_id: u64, kind: TxKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            chain_id,
            kind,
            state: TxState::Deploy,
            name: None,
            description: None,
            created_at: now,
            updated_at: now,
            sender: None,
            receiver: None,
            contract: None,
            caller: None,
            address: None,
            function: None,
            args: serde_json::Value::Null,
            amount: Decimal::ZERO,
            hash: None,
            counter: None,
            nonce: -1,
            level: None,
            gas: None,
            last_fail: None,
            max_fails: 10,
            error: None,
            history: Vec::new(),
            metadata: serde_json::Value::Null,
            payload: serde_json::Value::Null,
            has_code: false,
            index: true,
            normalized: false,
            normalizer: None,
        }
    }

    /// Whether the contract this record stands for has an on-chain address
    pub fn is_deployed(&self) -> bool {
        self.address.as_deref().map_or(false, |a| !a.is_empty())
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            return f.write_str(name);
        }
        match (&self.kind, &self.address, &self.hash, &self.function) {
            (TxKind::Contract, Some(address), _, _) if !address.is_empty() => f.write_str(address),
            (_, _, Some(hash), _) => f.write_str(hash),
            (_, _, _, Some(function)) => write!(f, "{}()", function),
            _ if !self.amount.is_zero() => write!(f, "{}", self.amount),
            _ => write!(f, "{}", self.id),
        }
    }
}

/// Edge `dependency -> dependent` inside the graph rooted at `graph`
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub id: Uuid,
    pub dependent: Uuid,
    pub dependency: Uuid,
    pub graph: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    pub fn new(dependency: Uuid, dependent: Uuid, graph: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            dependent,
            dependency,
            graph,
            created_at: Utc::now(),
        }
    }
}
