//! Core data types shared across the allocation engine.

use crate::error::{AllocationError, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance used when checking that a weight vector sums to one.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Trading days per year, used to annualize daily statistics.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Allocation algorithm run at every rebalancing date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Hierarchical Risk Parity.
    #[default]
    Hrp,
    /// Hierarchical Equal Risk Contribution.
    Herc,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Hrp => write!(f, "HRP"),
            Algorithm::Herc => write!(f, "HERC"),
        }
    }
}

/// Rule for the distance between two clusters during agglomeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Minimum pairwise distance.
    #[default]
    Single,
    /// Mean pairwise distance (UPGMA).
    Average,
    /// Maximum pairwise distance.
    Complete,
    /// Ward's minimum variance criterion.
    Ward,
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Linkage::Single => "single",
            Linkage::Average => "average",
            Linkage::Complete => "complete",
            Linkage::Ward => "ward",
        };
        write!(f, "{}", name)
    }
}

/// How often the portfolio is rebalanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceFrequency {
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

impl RebalanceFrequency {
    /// Calendar bucket a date falls in; a change of bucket marks a period end.
    pub fn period_key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            RebalanceFrequency::Monthly => (date.year(), date.month()),
            RebalanceFrequency::Quarterly => (date.year(), (date.month() - 1) / 3),
            RebalanceFrequency::Yearly => (date.year(), 0),
        }
    }

    /// Indices of the last trading date of every period in `dates`.
    ///
    /// The final date of the index always closes a period, even a partial one.
    pub fn period_ends(&self, dates: &[NaiveDate]) -> Vec<usize> {
        let mut ends = Vec::new();
        for (i, date) in dates.iter().enumerate() {
            let closes_period = match dates.get(i + 1) {
                Some(next) => self.period_key(*next) != self.period_key(*date),
                None => true,
            };
            if closes_period {
                ends.push(i);
            }
        }
        ends
    }
}

impl fmt::Display for RebalanceFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebalanceFrequency::Monthly => "monthly",
            RebalanceFrequency::Quarterly => "quarterly",
            RebalanceFrequency::Yearly => "yearly",
        };
        write!(f, "{}", name)
    }
}

/// What the backtest does when a rebalancing period fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop the backtest and return the period error.
    #[default]
    Abort,
    /// Record the error and keep the previous weights for the period.
    CarryForward,
}

/// How many top-level clusters HERC allocates across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "k")]
pub enum ClusterCount {
    /// Explicit number of clusters.
    Fixed(usize),
    /// Cut the dendrogram at the largest gap between consecutive merge distances.
    MaxGap,
}

impl Default for ClusterCount {
    fn default() -> Self {
        ClusterCount::Fixed(2)
    }
}

/// Stage of a single rebalancing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodState {
    AwaitingLookback,
    Clustering,
    Allocating,
    CashAdjusting,
    Applying,
    Settled,
}

impl PeriodState {
    /// The stage that follows this one, `None` once settled.
    pub fn next(self) -> Option<PeriodState> {
        match self {
            PeriodState::AwaitingLookback => Some(PeriodState::Clustering),
            PeriodState::Clustering => Some(PeriodState::Allocating),
            PeriodState::Allocating => Some(PeriodState::CashAdjusting),
            PeriodState::CashAdjusting => Some(PeriodState::Applying),
            PeriodState::Applying => Some(PeriodState::Settled),
            PeriodState::Settled => None,
        }
    }
}

impl fmt::Display for PeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeriodState::AwaitingLookback => "lookback",
            PeriodState::Clustering => "clustering",
            PeriodState::Allocating => "allocation",
            PeriodState::CashAdjusting => "cash adjustment",
            PeriodState::Applying => "application",
            PeriodState::Settled => "settlement",
        };
        write!(f, "{}", name)
    }
}

/// A point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    /// Portfolio return realized on this date.
    pub daily_return: f64,
}

/// Portfolio weights for the risk assets plus the cash proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub symbols: Vec<String>,
    pub weights: Vec<f64>,
    pub cash_symbol: String,
    pub cash: f64,
}

impl WeightVector {
    /// Create a weight vector, checking non-negativity and the unit sum.
    pub fn new(
        symbols: Vec<String>,
        weights: Vec<f64>,
        cash_symbol: impl Into<String>,
        cash: f64,
    ) -> Result<Self> {
        if symbols.len() != weights.len() {
            return Err(AllocationError::InputError(format!(
                "{} symbols but {} weights",
                symbols.len(),
                weights.len()
            )));
        }

        let mut wv = Self {
            symbols,
            weights,
            cash_symbol: cash_symbol.into(),
            cash,
        };

        if let Some((symbol, w)) = wv.iter().find(|(_, w)| !w.is_finite() || *w < -WEIGHT_TOLERANCE) {
            return Err(AllocationError::NumericalInstability(format!(
                "weight for {} is {}",
                symbol, w
            )));
        }
        // Rounding residue below zero is stored as exactly zero.
        for w in wv.weights.iter_mut().chain(std::iter::once(&mut wv.cash)) {
            *w = w.max(0.0);
        }
        if (wv.total() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AllocationError::NumericalInstability(format!(
                "weights sum to {:.10}, expected 1.0",
                wv.total()
            )));
        }

        Ok(wv)
    }

    /// Weight of a symbol, including the cash symbol.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        if symbol == self.cash_symbol {
            return Some(self.cash);
        }
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|i| self.weights[i])
    }

    /// Sum of the risk-asset weights.
    pub fn invested(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Sum of all weights including cash.
    pub fn total(&self) -> f64 {
        self.invested() + self.cash
    }

    /// Iterate over `(symbol, weight)` pairs, cash last.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.symbols
            .iter()
            .map(String::as_str)
            .zip(self.weights.iter().copied())
            .chain(std::iter::once((self.cash_symbol.as_str(), self.cash)))
    }

    /// Weights keyed by symbol.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.iter().map(|(s, w)| (s.to_string(), w)).collect()
    }

    /// Portfolio return for one day given risk-asset returns aligned with `symbols`.
    pub fn portfolio_return(&self, risk_returns: &[f64], cash_return: f64) -> f64 {
        self.weights
            .iter()
            .zip(risk_returns)
            .map(|(w, r)| w * r)
            .sum::<f64>()
            + self.cash * cash_return
    }
}
