//! Configuration management for the dapp relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::model::ChainFamily;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;

/// Environment variable pointing at the configuration file, read by the CLI
pub const CONFIG_ENV: &str = "DAPP_RELAYER_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound of distinct-sender calls submitted in one spool cycle
    #[serde(default = "default_max_parallel_calls")]
    pub max_parallel_calls: usize,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_max_fails")]
    pub default_max_fails: u32,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: "default".to_string(),
            poll_interval_ms: default_poll_interval_ms(),
            max_parallel_calls: default_max_parallel_calls(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            default_max_fails: default_max_fails(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub family: ChainFamily,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u64,
    pub enabled: bool,
    /// Chain-specific settings handed to the chain client untouched
    #[serde(default)]
    pub configuration: serde_json::Value,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_parallel_calls() -> usize {
    15
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_max_fails() -> u32 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_min_confirmations() -> u64 {
    2
}

impl Settings {
    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text, substituting environment variables
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.relayer.max_parallel_calls == 0 {
            anyhow::bail!("relayer.max_parallel_calls must be at least 1");
        }

        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }

        for (name, chain) in &self.chains {
            if chain.enabled
                && chain.family != ChainFamily::Sandbox
                && chain.endpoints.is_empty()
            {
                anyhow::bail!("Chain {} has no endpoints configured", name);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .expect("static pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [relayer]
        instance_id = "test"

        [database]
        backend = "memory"

        [chains.sandbox]
        chain_id = 1
        name = "sandbox"
        family = "sandbox"
        enabled = true

        [chains.tezos]
        chain_id = 2
        name = "ghostnet"
        family = "tezos"
        endpoints = ["${DAPP_TEST_TEZOS_NODE}"]
        min_confirmations = 3
        enabled = false
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.relayer.max_parallel_calls, 15);
        assert_eq!(settings.relayer.default_max_fails, 10);
        assert_eq!(settings.enabled_chains().len(), 1);

        let sandbox = settings.get_chain_by_id(1).unwrap();
        assert_eq!(sandbox.min_confirmations, 2);
        assert_eq!(sandbox.family, ChainFamily::Sandbox);
        assert_eq!(settings.get_chain_by_id(2).unwrap().min_confirmations, 3);
    }

    #[test]
    fn test_load_from_file_substitutes_endpoints() {
        env::set_var("DAPP_TEST_TEZOS_NODE", "http://tezos.local:8732");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        let tezos = settings.get_chain_by_id(2).unwrap();
        assert_eq!(tezos.endpoints, vec!["http://tezos.local:8732".to_string()]);
    }

    #[test]
    fn test_rejects_no_enabled_chain() {
        let input = SAMPLE.replace("enabled = true", "enabled = false");
        assert!(Settings::parse(&input).is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        let input = SAMPLE.replace("backend = \"memory\"", "backend = \"postgres\"");
        assert!(Settings::parse(&input).is_err());
    }
}
