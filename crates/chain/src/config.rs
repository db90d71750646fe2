//! Node configuration and genesis description.
//!
//! Every field has a serde default so partial JSON files are accepted;
//! `ChainConfig::default()` reproduces the network constants in `types`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::epoch::EpochConfig;
use crate::types::{self, Address, Amount};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub rewards: RewardConfig,
    #[serde(default)]
    pub slashing: SlashingConfig,
    #[serde(default)]
    pub staking: StakingConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_chain_id() -> String {
    "apex-local".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            consensus: ConsensusConfig::default(),
            rewards: RewardConfig::default(),
            slashing: SlashingConfig::default(),
            staking: StakingConfig::default(),
            mempool: MempoolConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Read a JSON config file; missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: ChainConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consensus.epoch_length == 0 {
            anyhow::bail!("consensus.epoch_length must be > 0");
        }
        if self.consensus.max_validators == 0 {
            anyhow::bail!("consensus.max_validators must be > 0");
        }
        if self.mempool.max_size == 0 {
            anyhow::bail!("mempool.max_size must be > 0");
        }
        if self.rewards.min_reward > self.rewards.base_reward {
            anyhow::bail!("rewards.min_reward exceeds rewards.base_reward");
        }
        Ok(())
    }

    pub fn epoch(&self) -> EpochConfig {
        EpochConfig::new(self.consensus.epoch_length, self.consensus.max_validators)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_max_validators")]
    pub max_validators: usize,
    #[serde(default = "default_min_validator_stake")]
    pub min_validator_stake: Amount,
    #[serde(default = "default_epoch_length")]
    pub epoch_length: u64,
    #[serde(default = "default_block_time")]
    pub block_time_secs: u64,
    #[serde(default = "default_block_gas_limit")]
    pub block_gas_limit: u64,
    /// how far in the future a block timestamp may be
    #[serde(default = "default_clock_tolerance")]
    pub max_future_drift_secs: i64,
    /// how old a block may be when it is validated
    #[serde(default = "default_clock_tolerance")]
    pub max_block_age_secs: i64,
    #[serde(default = "default_unbonding_period")]
    pub unbonding_period: u64,
}

fn default_max_validators() -> usize { types::MAX_VALIDATORS }
fn default_min_validator_stake() -> Amount { types::MIN_VALIDATOR_STAKE }
fn default_epoch_length() -> u64 { types::EPOCH_LENGTH }
fn default_block_time() -> u64 { types::BLOCK_TIME_SECS }
fn default_block_gas_limit() -> u64 { types::BLOCK_GAS_LIMIT }
fn default_clock_tolerance() -> i64 { 60 }
fn default_unbonding_period() -> u64 { types::UNBONDING_PERIOD }

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_validators: default_max_validators(),
            min_validator_stake: default_min_validator_stake(),
            epoch_length: default_epoch_length(),
            block_time_secs: default_block_time(),
            block_gas_limit: default_block_gas_limit(),
            max_future_drift_secs: default_clock_tolerance(),
            max_block_age_secs: default_clock_tolerance(),
            unbonding_period: default_unbonding_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default = "default_base_reward")]
    pub base_reward: Amount,
    #[serde(default = "default_min_reward")]
    pub min_reward: Amount,
    /// blocks between halvings; 0 derives four years of blocks from block time
    #[serde(default)]
    pub halving_interval: u64,
}

fn default_base_reward() -> Amount { 2 * types::ONE_TOKEN }
fn default_min_reward() -> Amount { types::ONE_TOKEN / 10 }

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            base_reward: default_base_reward(),
            min_reward: default_min_reward(),
            halving_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashingConfig {
    #[serde(default = "default_double_sign_bp")]
    pub double_sign_bp: u16,
    #[serde(default = "default_downtime_bp")]
    pub downtime_bp: u16,
    #[serde(default = "default_invalid_block_bp")]
    pub invalid_block_bp: u16,
    /// consecutive missed blocks before a validator is jailed
    #[serde(default = "default_downtime_threshold")]
    pub downtime_threshold: u64,
    #[serde(default = "default_jail_duration")]
    pub jail_duration_secs: i64,
}

fn default_double_sign_bp() -> u16 {
    500 // 5%
}

fn default_downtime_bp() -> u16 {
    100 // 1%
}

fn default_invalid_block_bp() -> u16 {
    300 // 3%
}

fn default_downtime_threshold() -> u64 {
    100
}

fn default_jail_duration() -> i64 {
    24 * 60 * 60
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            double_sign_bp: default_double_sign_bp(),
            downtime_bp: default_downtime_bp(),
            invalid_block_bp: default_invalid_block_bp(),
            downtime_threshold: default_downtime_threshold(),
            jail_duration_secs: default_jail_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingConfig {
    #[serde(default = "default_min_delegation")]
    pub min_delegation: Amount,
}

fn default_min_delegation() -> Amount { types::MIN_DELEGATION }

impl Default for StakingConfig {
    fn default() -> Self {
        Self { min_delegation: default_min_delegation() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    #[serde(default = "default_mempool_size")]
    pub max_size: usize,
}

fn default_mempool_size() -> usize { 10_000 }

impl Default for MempoolConfig {
    fn default() -> Self {
        Self { max_size: default_mempool_size() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// LMDB directory; `None` keeps everything in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub map_size: Option<usize>,
}

// ============================================================
// GENESIS
// ============================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: Amount,
}

/// Self-stake of a genesis validator is part of the genesis allocation:
/// it is credited to the owner and then bonded through registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub self_stake: Amount,
    #[serde(default)]
    pub commission: u16,
    #[serde(default)]
    pub moniker: String,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw.strip_prefix("0x").unwrap_or(&raw)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_network_constants() {
        let cfg = ChainConfig::default();
        assert_eq!(cfg.consensus.max_validators, 21);
        assert_eq!(cfg.consensus.epoch_length, 1200);
        assert_eq!(cfg.consensus.unbonding_period, 201_600);
        assert_eq!(cfg.slashing.downtime_bp, 100);
        assert_eq!(cfg.rewards.base_reward, 2 * types::ONE_TOKEN);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: ChainConfig =
            serde_json::from_str(r#"{"chain_id":"t","consensus":{"epoch_length":10}}"#).unwrap();
        assert_eq!(cfg.chain_id, "t");
        assert_eq!(cfg.consensus.epoch_length, 10);
        assert_eq!(cfg.consensus.max_validators, 21);
        assert_eq!(cfg.mempool.max_size, 10_000);
    }

    #[test]
    fn load_rejects_zero_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"consensus":{"epoch_length":0}}"#).unwrap();
        assert!(ChainConfig::load(&path).is_err());
    }

    #[test]
    fn genesis_validator_pubkey_hex() {
        let json = r#"{"public_key":"0x0102","self_stake":5}"#;
        let v: GenesisValidator = serde_json::from_str(json).unwrap();
        assert_eq!(v.public_key, vec![1, 2]);
        assert_eq!(v.commission, 0);
    }
}
