//! Configuration file support for backtests.
//!
//! Allows loading backtest configurations from TOML files for reproducibility.

use crate::backtest::BacktestConfig;
use crate::cash::CashMode;
use crate::constraints::ExposureLimits;
use crate::data::{DataConfig, ReturnMethod};
use crate::error::{AllocationError, Result};
use crate::types::{Algorithm, ClusterCount, ErrorPolicy, Linkage, RebalanceFrequency};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFileConfig {
    /// Allocation and schedule settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Data settings.
    #[serde(default)]
    pub data: DataSettings,
    /// Cash settings.
    #[serde(default)]
    pub cash: CashSettings,
    /// Exposure limits; omitted means unconstrained.
    #[serde(default)]
    pub exposure: Option<ExposureLimits>,
    /// Benchmark settings.
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
}

/// Allocation and schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub frequency: RebalanceFrequency,
    #[serde(default = "default_lookback")]
    pub lookback_days: usize,
    /// Defaults to `lookback_days` when omitted.
    #[serde(default)]
    pub min_history: Option<usize>,
    /// HERC cluster count; `"max_gap"` or a positive integer.
    #[serde(default = "default_cluster_count")]
    pub clusters: String,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default = "default_initial_value")]
    pub initial_value: f64,
}

fn default_lookback() -> usize { 252 }
fn default_cluster_count() -> String { "2".to_string() }
fn default_initial_value() -> f64 { 100.0 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Hrp,
            linkage: Linkage::Single,
            frequency: RebalanceFrequency::Monthly,
            lookback_days: 252,
            min_history: None,
            clusters: "2".to_string(),
            error_policy: ErrorPolicy::Abort,
            initial_value: 100.0,
        }
    }
}

/// Data settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to a wide price CSV (date column, one column per symbol).
    pub path: Option<String>,
    /// Date format in CSV; detected when omitted.
    pub date_format: Option<String>,
    /// CSV delimiter; detected when omitted.
    pub delimiter: Option<char>,
    /// Drop rows with unparseable dates or prices instead of failing.
    #[serde(default)]
    pub skip_invalid: bool,
    #[serde(default)]
    pub returns: ReturnMethod,
}

/// Cash settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashSettings {
    #[serde(default = "default_cash_symbol")]
    pub symbol: String,
    /// Fixed cash weight; ignored when `target_volatility` is set.
    #[serde(default = "default_cash_weight")]
    pub weight: f64,
    /// Annualized volatility target.
    #[serde(default)]
    pub target_volatility: Option<f64>,
}

fn default_cash_symbol() -> String { "CASH".to_string() }
fn default_cash_weight() -> f64 { 0.10 }

impl Default for CashSettings {
    fn default() -> Self {
        Self {
            symbol: "CASH".to_string(),
            weight: 0.10,
            target_volatility: None,
        }
    }
}

/// Benchmark settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkSettings {
    /// Risk proxy held by the benchmark run.
    pub symbol: Option<String>,
}

impl RunFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: RunFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AllocationError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to a validated [`BacktestConfig`].
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let cluster_count = parse_cluster_count(&self.backtest.clusters)?;

        let cash_mode = match self.cash.target_volatility {
            Some(target_vol) => CashMode::VolTarget { target_vol },
            None => CashMode::Fixed {
                weight: self.cash.weight,
            },
        };

        let config = BacktestConfig {
            algorithm: self.backtest.algorithm,
            linkage: self.backtest.linkage,
            frequency: self.backtest.frequency,
            lookback_days: self.backtest.lookback_days,
            min_history: self.backtest.min_history.unwrap_or(self.backtest.lookback_days),
            cash_symbol: self.cash.symbol.clone(),
            cash_mode,
            cluster_count,
            error_policy: self.backtest.error_policy,
            exposure: self.exposure.clone(),
            initial_value: self.backtest.initial_value,
        };
        config.validate()?;
        Ok(config)
    }

    /// CSV loading options for [`crate::data::load_prices_csv`].
    pub fn to_data_config(&self) -> Result<DataConfig> {
        let delimiter = match self.data.delimiter {
            Some(c) if c.is_ascii() => Some(c as u8),
            Some(c) => {
                return Err(AllocationError::ConfigError(format!(
                    "Delimiter must be a single ASCII character, got {:?}",
                    c
                )))
            }
            None => None,
        };

        Ok(DataConfig {
            date_format: self.data.date_format.clone(),
            delimiter,
            skip_invalid: self.data.skip_invalid,
        })
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Hierarchical allocation backtest

[backtest]
algorithm = "herc"        # "hrp" or "herc"
linkage = "ward"          # single, average, complete, ward
frequency = "monthly"     # monthly, quarterly, yearly
lookback_days = 252
# min_history = 252
clusters = "max_gap"      # or a number such as "3"
error_policy = "abort"    # or "carry_forward"
initial_value = 100.0

[data]
path = "data/prices.csv"
# date_format = "%Y-%m-%d"
# delimiter = ","
skip_invalid = false
returns = "simple"

[cash]
symbol = "XEON"
weight = 0.10
# target_volatility = 0.10

[exposure]
max_weight = 0.30
exempt = ["SWDA", "XEON"]
core_symbol = "SWDA"
core_min_weight = 0.15

[benchmark]
symbol = "SWDA"
"#
        .to_string()
    }
}

fn parse_cluster_count(value: &str) -> Result<ClusterCount> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("max_gap") {
        return Ok(ClusterCount::MaxGap);
    }
    match trimmed.parse::<usize>() {
        Ok(k) if k > 0 => Ok(ClusterCount::Fixed(k)),
        _ => Err(AllocationError::ConfigError(format!(
            "clusters must be \"max_gap\" or a positive integer, got {:?}",
            value
        ))),
    }
}
