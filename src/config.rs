//! Configuration management for the intent bridge
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::{is_valid_account_id, u128_string};

use alloy_primitives::Address;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub max_concurrent_relays: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub submit_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// How often the listener re-evaluates its persisted checkpoint
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,
    pub health_check_interval_secs: u64,
    /// Destination account the relayer signs as
    pub signer_account: String,
    /// Hex-encoded ed25519 secret keys used to attest proofs
    #[serde(default)]
    pub attester_keys: Vec<String>,
}

impl RelayerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub chain: String,
    /// May change the Lock Store asset allow-list
    pub owner: Address,
    /// Registry operator and Lock Store operator
    pub operator: Address,
    /// Account intents are created for when a request names no sender
    pub default_sender: Address,
    pub lock_store_address: Address,
    pub registry_address: Address,
    pub supported_assets: Vec<Address>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Expiration window applied to new intents
    #[serde(default = "default_intent_ttl")]
    pub intent_ttl_secs: u64,
    #[serde(default)]
    pub genesis: Vec<GenesisAllocation>,
}

/// Initial token balance and registry allowance for one account
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisAllocation {
    pub asset: Address,
    pub account: Address,
    #[serde(with = "u128_string")]
    pub balance: u128,
    #[serde(default, with = "u128_string")]
    pub registry_allowance: u128,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub chain: String,
    /// Contract account executing intents on the destination
    pub executor_account: String,
    pub owner_account: String,
    pub required_signatures: usize,
    /// Hex-encoded ed25519 public keys of the validator set
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub token_mappings: Vec<TokenMapping>,
}

/// Source asset and the destination token contract representing it
#[derive(Debug, Clone, Deserialize)]
pub struct TokenMapping {
    pub asset: Address,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub lock_timeout_secs: u64,
    pub relay_timeout_secs: u64,
    pub routes: Vec<Route>,
}

impl OrchestratorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn supports_route(&self, source: &str, target: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.source.eq_ignore_ascii_case(source) && r.target.eq_ignore_ascii_case(target))
    }
}

/// A supported (source chain, target chain) pair
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_checkpoint_interval() -> u64 {
    1_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_intent_ttl() -> u64 {
    3600
}

impl Settings {
    /// Load settings from the file named by `INTENT_BRIDGE_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("INTENT_BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&config_str)
    }

    /// Parse, substitute and validate a configuration document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.source.operator == Address::ZERO {
            anyhow::bail!("source.operator must not be the zero address");
        }
        if self.source.lock_store_address == self.source.registry_address {
            anyhow::bail!("Lock Store and Intent Registry must have distinct addresses");
        }
        if self.source.supported_assets.is_empty() {
            anyhow::bail!("At least one supported asset must be configured");
        }

        for account in [
            &self.relayer.signer_account,
            &self.destination.executor_account,
            &self.destination.owner_account,
        ] {
            if !is_valid_account_id(account) {
                anyhow::bail!("Invalid destination account id: {}", account);
            }
        }

        if !self.destination.validators.is_empty() {
            if self.destination.required_signatures == 0 {
                anyhow::bail!("destination.required_signatures must be greater than zero");
            }
            if self.destination.required_signatures > self.destination.validators.len() {
                anyhow::bail!(
                    "destination.required_signatures ({}) exceeds validator count ({})",
                    self.destination.required_signatures,
                    self.destination.validators.len()
                );
            }
            if self.relayer.attester_keys.len() < self.destination.required_signatures {
                tracing::warn!(
                    "Relayer holds {} attester keys but destination requires {} signatures",
                    self.relayer.attester_keys.len(),
                    self.destination.required_signatures
                );
            }
        }

        for asset in &self.source.supported_assets {
            if !self.destination.token_mappings.iter().any(|m| &m.asset == asset) {
                anyhow::bail!("Supported asset {} has no destination token mapping", asset);
            }
        }

        if self.orchestrator.routes.is_empty() {
            anyhow::bail!("At least one route must be configured");
        }
        if self.orchestrator.lock_timeout_secs == 0 || self.orchestrator.relay_timeout_secs == 0 {
            anyhow::bail!("Orchestrator timeouts must be greater than zero");
        }
        if self.relayer.max_concurrent_relays == 0 {
            anyhow::bail!("relayer.max_concurrent_relays must be greater than zero");
        }
        if self.relayer.retry_delay_ms > self.relayer.max_retry_delay_ms {
            anyhow::bail!("relayer.retry_delay_ms exceeds relayer.max_retry_delay_ms");
        }
        if self.relayer.checkpoint_interval_ms == 0 {
            anyhow::bail!("relayer.checkpoint_interval_ms must be greater than zero");
        }

        Ok(())
    }

    /// Destination token contract for a source asset
    pub fn token_for(&self, asset: Address) -> Option<&str> {
        self.destination
            .token_mappings
            .iter()
            .find(|m| m.asset == asset)
            .map(|m| m.token.as_str())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name)
            .with_context(|| format!("Environment variable {} is not set", var_name))?;
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
