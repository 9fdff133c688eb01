//! Ledger configuration loaded from TOML with environment overrides.

use crate::events::DEFAULT_BROADCAST_CAPACITY;
use crate::fee::MAX_FEE_BPS;
use crate::types::AccountId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub fees: FeeSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Hex account id of the owner.
    pub owner: String,
    /// Hex account id credited with every fee.
    pub fee_recipient: String,
    #[serde(default)]
    pub operators: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeSettings {
    #[serde(default)]
    pub transfer_fee_bps: u16,
    #[serde(default)]
    pub withdrawal_fee_bps: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    pub broadcast_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
    #[serde(default)]
    pub file_output: Option<PathBuf>,
    #[serde(default)]
    pub module_filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: BTreeMap::new(),
        }
    }
}

impl LedgerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading ledger configuration");

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            owner = %config.governance.owner,
            operators = config.governance.operators.len(),
            transfer_fee_bps = config.fees.transfer_fee_bps,
            withdrawal_fee_bps = config.fees.withdrawal_fee_bps,
            "Configuration loaded successfully"
        );
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Runtime overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(owner) = env::var("SETTLE_OWNER") {
            self.governance.owner = owner;
        }
        if let Ok(recipient) = env::var("SETTLE_FEE_RECIPIENT") {
            self.governance.fee_recipient = recipient;
        }
        if let Ok(bps) = env::var("SETTLE_TRANSFER_FEE_BPS") {
            if let Ok(val) = bps.parse() {
                self.fees.transfer_fee_bps = val;
            }
        }
        if let Ok(bps) = env::var("SETTLE_WITHDRAWAL_FEE_BPS") {
            if let Ok(val) = bps.parse() {
                self.fees.withdrawal_fee_bps = val;
            }
        }
        if let Ok(level) = env::var("SETTLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("SETTLE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let owner = self.owner()?;
        if owner.is_null() {
            bail!("governance.owner must not be the null account");
        }
        if self.fee_recipient()?.is_null() {
            bail!("governance.fee_recipient must not be the null account");
        }
        let operators = self.operators()?;
        if operators.iter().any(|op| op.is_null() || *op == owner) {
            bail!("governance.operators must not contain the null account or the owner");
        }
        for (name, bps) in [
            ("transfer_fee_bps", self.fees.transfer_fee_bps),
            ("withdrawal_fee_bps", self.fees.withdrawal_fee_bps),
        ] {
            if bps > MAX_FEE_BPS {
                bail!("fees.{} = {} exceeds maximum of {}", name, bps, MAX_FEE_BPS);
            }
        }
        if self.events.broadcast_capacity == 0 {
            bail!("events.broadcast_capacity must be greater than zero");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            bail!("logging.format must be one of pretty, compact, json");
        }
        Ok(())
    }

    pub fn owner(&self) -> Result<AccountId> {
        AccountId::from_hex(&self.governance.owner).context("governance.owner")
    }

    pub fn fee_recipient(&self) -> Result<AccountId> {
        AccountId::from_hex(&self.governance.fee_recipient).context("governance.fee_recipient")
    }

    pub fn operators(&self) -> Result<Vec<AccountId>> {
        self.governance
            .operators
            .iter()
            .map(|op| AccountId::from_hex(op).with_context(|| format!("operator {}", op)))
            .collect()
    }
}
