use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event emitted by a confirmed transaction, such as an EVM log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub chain_id: u64,
    pub transaction: Uuid,
    pub name: String,
    pub args: serde_json::Value,
    /// Position among the events of `transaction`
    pub index: u32,
    pub normalized: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        chain_id: u64,
        transaction: Uuid,
        index: u32,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_id,
            transaction,
            name: name.into(),
            args,
            index,
            normalized: false,
            created_at: Utc::now(),
        }
    }
}
