//! Error types for the allocation engine.

use crate::types::PeriodState;
use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for the allocation engine.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// Misaligned, malformed or otherwise unusable return series.
    #[error("Input error: {0}")]
    InputError(String),

    #[error("Insufficient assets: need at least {required}, got {actual}")]
    InsufficientAssets { required: usize, actual: usize },

    #[error("Insufficient history: {available} observations available, need at least {required}")]
    InsufficientHistory { available: usize, required: usize },

    #[error("Invalid cluster count {requested} for {assets} assets")]
    InvalidClusterCount { requested: usize, assets: usize },

    /// Non-finite variance, correlation or volatility after computation.
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// A rebalancing period failed; carries the offending date and stage.
    #[error("Rebalance on {date} failed during {stage}: {source}")]
    Period {
        date: NaiveDate,
        stage: PeriodState,
        source: Box<AllocationError>,
    },

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl AllocationError {
    /// Wrap an error with the rebalancing date and stage it happened in.
    pub fn at_period(self, date: NaiveDate, stage: PeriodState) -> Self {
        AllocationError::Period {
            date,
            stage,
            source: Box::new(self),
        }
    }

    /// The rebalancing date, when this error came out of a backtest period.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            AllocationError::Period { date, .. } => Some(*date),
            _ => None,
        }
    }
}

/// Result type alias for allocation operations.
pub type Result<T> = std::result::Result<T, AllocationError>;
