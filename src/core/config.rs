//! Configuration - Type-safe, validated config loaded from TOML

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::core::history::HistoryPolicy;
use crate::core::{EntityType, Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine behaviour switches
    #[serde(default)]
    pub engine: EngineConfig,

    /// Parties written at genesis
    #[serde(default)]
    pub genesis: GenesisConfig,
}

/// How the sequence allocator hands out IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    /// Read now, store the incremented value after the operation's writes
    Deferred,
    /// Compare-and-swap increment against the ledger at allocation time
    Atomic,
}

/// Where a failure status record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureRecordMode {
    /// Under the transaction ID itself, replacing whatever was there
    SameKey,
    /// Under `<id>.status`
    StatusKey,
}

/// Fate of writes staged before a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Commit them; nothing is rolled back
    Keep,
    /// Drop them
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of notional charged as commission (0.001 = 0.1%)
    pub commission_rate: Decimal,

    /// Value every counter starts from at genesis
    pub counter_baseline: u64,

    pub sequence: SequenceMode,

    /// CAS attempts before an atomic allocation gives up
    pub cas_retries: u32,

    pub failure_records: FailureRecordMode,

    pub on_failure: OnFailure,

    /// Policy for entity instrument references
    pub instrument_history: HistoryPolicy,

    /// Commit staged writes with compare-and-swap against the versions read
    pub optimistic_commit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(1, 3),
            counter_baseline: 1000,
            sequence: SequenceMode::Atomic,
            cas_retries: 8,
            failure_records: FailureRecordMode::StatusKey,
            on_failure: OnFailure::Keep,
            instrument_history: HistoryPolicy::MoveToEnd,
            optimistic_commit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub entities: Vec<SeedEntity>,
}

/// Party written at genesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    pub balance: Decimal,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub credit_rating: Option<String>,
}

impl SeedEntity {
    fn new(id: &str, name: &str, kind: EntityType, balance: i64, address: &str, rating: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            balance: Decimal::from(balance),
            address: Some(address.to_string()),
            credit_rating: Some(rating.to_string()),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            entities: vec![
                SeedEntity::new("ISS1", "Issuer 1", EntityType::Issuer, 50_000_000, "Client", "A"),
                SeedEntity::new("ISS2", "Issuer 2", EntityType::Issuer, 25_000_000, "Client", "BBB"),
                SeedEntity::new("BANK1", "Bank of America", EntityType::Bank, 100_000_000, "NYC", "A"),
                SeedEntity::new("BANK2", "Bank 2", EntityType::Bank, 80_000_000, "London", "A"),
                SeedEntity::new("INV1", "Investor 1", EntityType::Investor, 10_000_000, "Investor NYC", "A+"),
                SeedEntity::new("INV2", "Investor 2", EntityType::Investor, 5_000_000, "Investor SF", "A"),
                SeedEntity::new("REG1", "Regulator", EntityType::Regulator, 0, "Washington", "AAA"),
            ],
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `mktplace.toml` in the working directory, or defaults.
    pub fn load_default() -> Self {
        let path = Path::new("mktplace.toml");
        match Self::load(path) {
            Ok(cfg) => {
                tracing::info!("Loaded config from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!("No usable mktplace.toml ({}), using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let rate = self.engine.commission_rate;
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(Error::Config(format!("commission_rate {} must be in [0, 1)", rate)));
        }
        if self.engine.cas_retries == 0 {
            return Err(Error::Config("cas_retries must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for seed in &self.genesis.entities {
            if !seen.insert(seed.id.as_str()) {
                return Err(Error::Config(format!("duplicate genesis entity {}", seed.id)));
            }
            if seed.balance < Decimal::ZERO {
                return Err(Error::Config(format!("negative starting balance for {}", seed.id)));
            }
        }
        Ok(())
    }
}
