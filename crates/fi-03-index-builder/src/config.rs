//! Index builder configuration.
//!
//! Loaded from JSON with every field optional, then overridden from
//! `FI_DATA_DIR`, `FI_NETWORK` and `FI_FILTER_P`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::Network;
use fi_01_golomb_filters::{DEFAULT_P, MAX_P};
use fi_02_record_store::UtxoStoreConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// First height with segwit outputs on mainnet.
pub const MAINNET_START_HEIGHT: u32 = 481_824;
pub const TESTNET_START_HEIGHT: u32 = 828_575;
pub const REGTEST_START_HEIGHT: u32 = 0;

/// How the scan loop reacts to consecutive failed iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Delay after the first failure (milliseconds)
    pub base_backoff_ms: u64,
    /// Upper bound for the doubled delay (milliseconds)
    pub max_backoff_ms: u64,
    /// Halt after this many failures in a row; `None` retries forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_consecutive_failures: Some(20),
        }
    }
}

impl FailurePolicy {
    /// Delay before retrying after `failures` consecutive failures (>= 1).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(32);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn should_halt(&self, failures: u32) -> bool {
        self.max_consecutive_failures
            .is_some_and(|max| failures >= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub network: Network,
    /// Parent of the per-network data directory
    pub data_dir: PathBuf,
    /// Golomb-Rice parameter for new filters
    pub filter_p: u8,
    /// Overrides the network's default first height
    pub start_height: Option<u32>,
    /// Wait before asking again for a block that is not mined yet (milliseconds)
    pub retry_delay_ms: u64,
    /// Blocks fetched per chain source round trip
    pub prefetch_depth: u32,
    /// Start from an empty index; defaults to true on regtest only
    pub wipe_on_start: Option<bool>,
    pub event_capacity: usize,
    pub utxo: UtxoStoreConfig,
    pub failure: FailurePolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self::for_network(Network::Bitcoin)
    }
}

impl IndexerConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            data_dir: PathBuf::from("data"),
            filter_p: DEFAULT_P,
            start_height: None,
            retry_delay_ms: 1_000,
            prefetch_depth: 4,
            wipe_on_start: None,
            event_capacity: 1_024,
            utxo: UtxoStoreConfig::default(),
            failure: FailurePolicy::default(),
        }
    }

    /// Regtest in `data_dir` with short delays and small stores.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            retry_delay_ms: 10,
            prefetch_depth: 1,
            utxo: UtxoStoreConfig::for_testing(),
            failure: FailurePolicy {
                base_backoff_ms: 5,
                max_backoff_ms: 20,
                max_consecutive_failures: Some(3),
            },
            ..Self::for_network(Network::Regtest)
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), network = %config.network, "Loaded config");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("FI_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(network) = lookup("FI_NETWORK") {
            self.network = parse_network(&network)?;
        }
        if let Some(p) = lookup("FI_FILTER_P") {
            self.filter_p = p
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("FI_FILTER_P", format!("not a number: {p}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter_p == 0 || self.filter_p > MAX_P {
            return Err(ConfigError::invalid(
                "filter_p",
                format!("{} is outside 1..={MAX_P}", self.filter_p),
            ));
        }
        if self.prefetch_depth == 0 {
            return Err(ConfigError::invalid("prefetch_depth", "must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("event_capacity", "must be at least 1"));
        }
        if self.failure.base_backoff_ms > self.failure.max_backoff_ms {
            return Err(ConfigError::invalid(
                "failure",
                "base_backoff_ms exceeds max_backoff_ms",
            ));
        }
        self.utxo
            .validate()
            .map_err(|e| ConfigError::invalid("utxo", e.to_string()))?;
        self.resolved_start_height()?;
        Ok(())
    }

    /// First height to index when the filter index is empty.
    pub fn resolved_start_height(&self) -> Result<u32, ConfigError> {
        if let Some(height) = self.start_height {
            return Ok(height);
        }
        match self.network {
            Network::Bitcoin => Ok(MAINNET_START_HEIGHT),
            Network::Testnet => Ok(TESTNET_START_HEIGHT),
            Network::Regtest => Ok(REGTEST_START_HEIGHT),
            other => Err(ConfigError::UnsupportedNetwork(other)),
        }
    }

    pub fn should_wipe(&self) -> bool {
        self.wipe_on_start
            .unwrap_or(self.network == Network::Regtest)
    }

    /// `<data_dir>/<network>`, holding the lock and both repositories.
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.to_core_arg())
    }

    pub fn filter_dir(&self) -> PathBuf {
        self.network_dir().join("filters")
    }

    /// Base path of the unspent-output files.
    pub fn utxo_base(&self) -> PathBuf {
        self.network_dir().join("utxos")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Accepts both `bitcoin`/`testnet` and the node's `main`/`test` spellings.
pub fn parse_network(value: &str) -> Result<Network, ConfigError> {
    let value = value.trim();
    value
        .parse::<Network>()
        .ok()
        .or_else(|| Network::from_core_arg(value).ok())
        .ok_or_else(|| ConfigError::invalid("network", format!("unknown network {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        assert!(IndexerConfig::default().validate().is_ok());
        assert!(IndexerConfig::for_testing("/tmp/x").validate().is_ok());
    }

    #[test]
    fn test_start_heights() {
        let height = |network| IndexerConfig::for_network(network).resolved_start_height();
        assert_eq!(height(Network::Bitcoin).unwrap(), 481_824);
        assert_eq!(height(Network::Testnet).unwrap(), 828_575);
        assert_eq!(height(Network::Regtest).unwrap(), 0);
        assert!(matches!(
            height(Network::Signet),
            Err(ConfigError::UnsupportedNetwork(Network::Signet))
        ));

        let mut signet = IndexerConfig::for_network(Network::Signet);
        signet.start_height = Some(10);
        assert_eq!(signet.resolved_start_height().unwrap(), 10);
    }

    #[test]
    fn test_wipe_defaults_to_regtest_only() {
        assert!(IndexerConfig::for_network(Network::Regtest).should_wipe());
        assert!(!IndexerConfig::for_network(Network::Bitcoin).should_wipe());

        let mut config = IndexerConfig::for_network(Network::Regtest);
        config.wipe_on_start = Some(false);
        assert!(!config.should_wipe());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FI_DATA_DIR", "/var/lib/fi"),
            ("FI_NETWORK", "test"),
            ("FI_FILTER_P", "19"),
        ]
        .into();
        let mut config = IndexerConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fi"));
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.filter_p, 19);
        assert_eq!(config.network_dir(), PathBuf::from("/var/lib/fi/test"));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = IndexerConfig::default();
        let result = config.apply_overrides(|name| (name == "FI_FILTER_P").then(|| "x".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid { field: "FI_FILTER_P", .. })));
    }

    #[test]
    fn test_partial_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("indexer.json");
        fs::write(&path, r#"{"network": "regtest", "utxo": {"pack_threshold": 50}}"#).unwrap();

        let config = IndexerConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.filter_p, DEFAULT_P);
        assert_eq!(config.utxo.pack_threshold, 50);
        assert_eq!(config.utxo.checkpoint_high_water, 1_000);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));

        assert!(!policy.should_halt(19));
        assert!(policy.should_halt(20));
        let forever = FailurePolicy {
            max_consecutive_failures: None,
            ..policy
        };
        assert!(!forever.should_halt(u32::MAX));
    }
}
