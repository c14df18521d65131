//! Agent configuration
//!
//! Assembled from two sources:
//! 1. `.env` — infrastructure env vars (manager address, database, fee parties)
//! 2. `agent.toml` — tunables (pricing floor, fee schedule, lock timings)

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::fees::BPS_DENOMINATOR;
use crate::ledger::is_valid_address;

// ============================================================================
// Agent TOML (agent.toml)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentToml {
    #[serde(default = "default_min_price")]
    min_price: String,
    #[serde(default = "default_fee_bps")]
    fee_bps: u32,
    #[serde(default = "default_operator_share_bps")]
    operator_share_bps: u32,
    #[serde(default = "default_lock_ttl_ms")]
    lock_ttl_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    cooldown_ms: u64,
    #[serde(default = "default_reject_contract_addresses")]
    reject_contract_addresses: bool,
    #[serde(default = "default_backfill_on_start")]
    backfill_on_start: bool,
    #[serde(default = "default_background_queue_capacity")]
    background_queue_capacity: usize,
    #[serde(default = "default_quote_pair")]
    quote_pair: String,
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Full agent configuration, validated at load time
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // From .env
    pub manager_address: String,
    pub operator_address: String,
    pub fee_receiver_address: String,
    pub database_url: String,

    // From agent.toml
    pub min_price: Decimal,
    pub fee_bps: u32,
    pub operator_share_bps: u32,
    pub lock_ttl_ms: u64,
    pub cooldown_ms: u64,
    pub reject_contract_addresses: bool,
    pub backfill_on_start: bool,
    pub background_queue_capacity: usize,
    pub quote_pair: String,
}

impl AgentConfig {
    /// Load configuration from .env + agent.toml
    pub fn load<P: AsRef<Path>>(agent_toml_path: P) -> Result<Self> {
        // 1. Read agent.toml (optional, defaults apply when absent)
        let agent: AgentToml = match fs::read_to_string(agent_toml_path.as_ref()) {
            Ok(contents) => toml::from_str(&contents).with_context(|| {
                format!("Failed to parse {}", agent_toml_path.as_ref().display())
            })?,
            Err(_) => {
                tracing::warn!(
                    "{} not found, using default tunables",
                    agent_toml_path.as_ref().display()
                );
                toml::from_str("").context("Failed to build default tunables")?
            }
        };

        // 2. Read env vars
        let manager_address = std::env::var("ESCROW_MANAGER_ADDRESS")
            .map_err(|_| anyhow!("ESCROW_MANAGER_ADDRESS env var is required"))?;
        if !is_valid_address(&manager_address) {
            anyhow::bail!(
                "ESCROW_MANAGER_ADDRESS is not a valid address: {}",
                manager_address
            );
        }

        let operator_address = std::env::var("OPERATOR_FEE_ADDRESS")
            .map_err(|_| anyhow!("OPERATOR_FEE_ADDRESS env var is required"))?;
        if !is_valid_address(&operator_address) {
            anyhow::bail!(
                "OPERATOR_FEE_ADDRESS is not a valid address: {}",
                operator_address
            );
        }

        let fee_receiver_address = std::env::var("FEE_RECEIVER_ADDRESS")
            .map_err(|_| anyhow!("FEE_RECEIVER_ADDRESS env var is required"))?;
        if !is_valid_address(&fee_receiver_address) {
            anyhow::bail!(
                "FEE_RECEIVER_ADDRESS is not a valid address: {}",
                fee_receiver_address
            );
        }

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://escrow-agent.db".to_string());

        // 3. Validate tunables
        let min_price = Decimal::from_str(&agent.min_price)
            .map_err(|_| anyhow!("min_price must be a valid decimal: {}", agent.min_price))?;
        if min_price <= Decimal::ZERO {
            anyhow::bail!("min_price must be positive: {}", min_price);
        }
        if u128::from(agent.fee_bps) >= BPS_DENOMINATOR {
            anyhow::bail!("fee_bps must be below 10000: {}", agent.fee_bps);
        }
        if u128::from(agent.operator_share_bps) > BPS_DENOMINATOR {
            anyhow::bail!(
                "operator_share_bps must be at most 10000: {}",
                agent.operator_share_bps
            );
        }

        Ok(AgentConfig {
            manager_address,
            operator_address,
            fee_receiver_address,
            database_url,
            min_price,
            fee_bps: agent.fee_bps,
            operator_share_bps: agent.operator_share_bps,
            lock_ttl_ms: agent.lock_ttl_ms,
            cooldown_ms: agent.cooldown_ms,
            reject_contract_addresses: agent.reject_contract_addresses,
            backfill_on_start: agent.backfill_on_start,
            background_queue_capacity: agent.background_queue_capacity,
            quote_pair: agent.quote_pair,
        })
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_min_price() -> String {
    "0.000001".to_string()
}

fn default_fee_bps() -> u32 {
    250
}

fn default_operator_share_bps() -> u32 {
    5000
}

fn default_lock_ttl_ms() -> u64 {
    120_000
}

fn default_cooldown_ms() -> u64 {
    3_000
}

fn default_reject_contract_addresses() -> bool {
    true
}

fn default_backfill_on_start() -> bool {
    true
}

fn default_background_queue_capacity() -> usize {
    64
}

fn default_quote_pair() -> String {
    "TOKEN/USD".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_toml_defaults() {
        let agent: AgentToml = toml::from_str("").unwrap();
        assert_eq!(agent.min_price, "0.000001");
        assert_eq!(agent.fee_bps, 250);
        assert_eq!(agent.operator_share_bps, 5000);
        assert_eq!(agent.lock_ttl_ms, 120_000);
        assert_eq!(agent.cooldown_ms, 3_000);
        assert!(agent.reject_contract_addresses);
        assert!(agent.backfill_on_start);
    }

    #[test]
    fn test_agent_toml_overrides() {
        let agent: AgentToml = toml::from_str(
            r#"
            min_price = "5.00"
            fee_bps = 100
            reject_contract_addresses = false
            "#,
        )
        .unwrap();
        assert_eq!(agent.min_price, "5.00");
        assert_eq!(agent.fee_bps, 100);
        assert!(!agent.reject_contract_addresses);
        assert_eq!(agent.cooldown_ms, 3_000);
    }
}
