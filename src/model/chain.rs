use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Blockchain family, selects the chain client implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Tezos,
    Ethereum,
    /// In-process chain, see [`crate::chain::SandboxChain`]
    Sandbox,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Tezos => "tezos",
            ChainFamily::Ethereum => "ethereum",
            ChainFamily::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tezos" => Ok(ChainFamily::Tezos),
            "ethereum" => Ok(ChainFamily::Ethereum),
            "sandbox" => Ok(ChainFamily::Sandbox),
            other => Err(format!("unknown chain family {}", other)),
        }
    }
}

/// A blockchain the relayer spools to and indexes
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub id: u64,
    pub name: String,
    pub family: ChainFamily,
    pub is_active: bool,
    /// Highest indexed level
    pub index_level: Option<u64>,
    /// Lowest indexed level
    pub min_level: Option<u64>,
    /// Blocks required on top of a transaction level before `confirm` becomes `done`
    pub min_confirmations: u64,
    pub configuration: serde_json::Value,
}

impl Chain {
    pub fn new(id: u64, name: impl Into<String>, family: ChainFamily) -> Self {
        Self {
            id,
            name: name.into(),
            family,
            is_active: true,
            index_level: None,
            min_level: None,
            min_confirmations: 2,
            configuration: serde_json::Value::Null,
        }
    }

    /// Level at which a transaction included at `level` becomes final
    pub fn confirmed_level(&self, level: u64) -> u64 {
        level + self.min_confirmations
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}
