use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

/// Signing material of an account. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(value).map(Self)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// A signing entity on one chain
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub chain_id: u64,
    pub name: Option<String>,
    /// Unique per chain
    pub address: Option<String>,
    pub balance: Decimal,
    pub secret: Option<Secret>,
    pub revealed: bool,
    pub counter: Option<u64>,
    /// Head level when this account last submitted a transaction
    pub last_level: Option<u64>,
    /// Whether the indexer should pick up every origination sent from here
    pub index: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(chain_id: u64, address: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            chain_id,
            name: None,
            address,
            balance: Decimal::ZERO,
            secret: None,
            revealed: false,
            counter: None,
            last_level: None,
            index: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this account may get a new transaction airborne at `head`
    pub fn can_send_at(&self, head: u64) -> bool {
        self.balance > Decimal::ZERO && self.last_level.map_or(true, |level| level < head)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.address) {
            (Some(name), _) => f.write_str(name),
            (None, Some(address)) => f.write_str(address),
            (None, None) => write!(f, "{}", self.id),
        }
    }
}
