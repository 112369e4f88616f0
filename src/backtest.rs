//! Rolling rebalancing backtester.
//!
//! Every scheduled date goes through the same stages: slice the trailing
//! window, cluster it, allocate, adjust for cash and exposure limits, then hold
//! the weights over the following days. The first four stages depend only on
//! the window and the configuration and run in parallel; compounding runs in
//! schedule order afterwards.

use crate::allocator::{allocator_for, AllocationInput, Allocator};
use crate::analytics::{BenchmarkMetrics, PerformanceMetrics, DEFAULT_RISK_FREE_RATE};
use crate::cash::{CashController, CashMode};
use crate::cluster::{cluster, ClusterSnapshot};
use crate::constraints::ExposureLimits;
use crate::data::ReturnTable;
use crate::distance::distance_matrix;
use crate::error::{AllocationError, Result};
use crate::stats::{correlation_from_covariance, covariance_matrix};
use crate::types::{
    Algorithm, ClusterCount, EquityPoint, ErrorPolicy, Linkage, PeriodState, RebalanceFrequency,
    WeightVector,
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Backtest configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub algorithm: Algorithm,
    pub linkage: Linkage,
    pub frequency: RebalanceFrequency,
    /// Trailing observations used to estimate covariance at each rebalance.
    pub lookback_days: usize,
    /// Minimum trailing observations before a date can be rebalanced.
    pub min_history: usize,
    /// Column holding the cash proxy's returns; never clustered.
    pub cash_symbol: String,
    pub cash_mode: CashMode,
    /// Top-level cluster count for HERC.
    pub cluster_count: ClusterCount,
    pub error_policy: ErrorPolicy,
    /// Optional per-asset exposure limits applied after cash control.
    /// Benchmark runs ignore them.
    pub exposure: Option<ExposureLimits>,
    pub initial_value: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Hrp,
            linkage: Linkage::Single,
            frequency: RebalanceFrequency::Monthly,
            lookback_days: 252,
            min_history: 252,
            cash_symbol: "CASH".to_string(),
            cash_mode: CashMode::default(),
            cluster_count: ClusterCount::default(),
            error_policy: ErrorPolicy::Abort,
            exposure: None,
            initial_value: 100.0,
        }
    }
}

impl BacktestConfig {
    /// Check parameter ranges that do not depend on the data.
    pub fn validate(&self) -> Result<()> {
        if self.min_history < 2 {
            return Err(AllocationError::ConfigError(format!(
                "min_history must be at least 2, got {}",
                self.min_history
            )));
        }
        if self.lookback_days < self.min_history {
            return Err(AllocationError::ConfigError(format!(
                "lookback_days ({}) must be at least min_history ({})",
                self.lookback_days, self.min_history
            )));
        }
        if !self.initial_value.is_finite() || self.initial_value <= 0.0 {
            return Err(AllocationError::ConfigError(format!(
                "initial_value must be positive, got {}",
                self.initial_value
            )));
        }
        if self.cash_symbol.is_empty() {
            return Err(AllocationError::ConfigError(
                "cash_symbol must not be empty".to_string(),
            ));
        }
        self.cash_mode.validate()?;
        if let Some(limits) = &self.exposure {
            limits.validate()?;
        }
        Ok(())
    }
}

/// Where a rebalance's weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Computed for this date.
    Fresh,
    /// The period failed and the previous weights were kept.
    CarriedForward,
}

/// One entry of the weight history.
///
/// The final row always closes a period, so the last record may have no
/// holding days after it. It still reports the latest target weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub date: NaiveDate,
    /// Portfolio value at the rebalance, before the new weights earn anything.
    pub value: f64,
    pub weights: WeightVector,
    pub provenance: Provenance,
    /// Dendrogram of the period, absent for benchmark and carried-forward periods.
    pub snapshot: Option<ClusterSnapshot>,
}

/// A period that failed under [`ErrorPolicy::CarryForward`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPeriod {
    pub date: NaiveDate,
    pub stage: PeriodState,
    pub reason: String,
}

/// Outcome of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Allocation name, or `Benchmark(<symbol>)` for benchmark runs.
    pub label: String,
    pub config: BacktestConfig,
    /// Daily values; the first point is the starting value on the first rebalance date.
    pub equity_curve: Vec<EquityPoint>,
    pub rebalances: Vec<RebalanceRecord>,
    pub skipped: Vec<SkippedPeriod>,
}

impl BacktestResult {
    pub fn final_value(&self) -> f64 {
        self.equity_curve
            .last()
            .map(|p| p.value)
            .unwrap_or(self.config.initial_value)
    }

    pub fn total_return(&self) -> f64 {
        self.final_value() / self.config.initial_value - 1.0
    }

    /// Daily portfolio returns, excluding the starting point.
    pub fn daily_returns(&self) -> Vec<f64> {
        self.equity_curve
            .iter()
            .skip(1)
            .map(|p| p.daily_return)
            .collect()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::from_equity_curve(&self.equity_curve, DEFAULT_RISK_FREE_RATE)
    }

    /// Pretty-printed JSON of the whole result.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Strategy and benchmark runs over the same data, with relative metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub strategy: BacktestResult,
    pub benchmark: BacktestResult,
    /// `None` when the two runs share no return dates.
    pub relative: Option<BenchmarkMetrics>,
}

/// How the risk sleeve is built in each period.
enum Sleeve<'a> {
    Hierarchical(&'a dyn Allocator),
    /// Everything in the single column of the risk table.
    Proxy,
}

/// Weights settled for one date, before they are applied.
struct PlannedPeriod {
    weights: WeightVector,
    snapshot: Option<ClusterSnapshot>,
}

/// Rolling backtester over a return table.
#[derive(Debug, Clone)]
pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the configured hierarchical allocation over `returns`.
    pub fn run(&self, returns: &ReturnTable) -> Result<BacktestResult> {
        self.config.validate()?;
        let cash = self.cash_returns(returns)?;
        let risk = returns.without(&self.config.cash_symbol);
        if risk.n_assets() < 2 {
            return Err(AllocationError::InsufficientAssets {
                required: 2,
                actual: risk.n_assets(),
            });
        }

        let allocator = allocator_for(self.config.algorithm, self.config.cluster_count);
        info!(
            "Running backtest: {} ({} linkage) on {} assets, {} observations",
            allocator.name(),
            self.config.linkage,
            risk.n_assets(),
            risk.len()
        );

        let result = self.simulate(
            allocator.name().to_string(),
            &risk,
            &cash,
            &Sleeve::Hierarchical(allocator.as_ref()),
        )?;

        info!(
            "Backtest complete: {} rebalances, {} skipped, {:.2}% total return",
            result.rebalances.len(),
            result.skipped.len(),
            result.total_return() * 100.0
        );
        Ok(result)
    }

    /// Run the same schedule holding only `proxy_symbol` plus cash.
    ///
    /// The cash mode matches the strategy's; exposure limits are not applied.
    pub fn run_benchmark(&self, returns: &ReturnTable, proxy_symbol: &str) -> Result<BacktestResult> {
        self.config.validate()?;
        if proxy_symbol == self.config.cash_symbol {
            return Err(AllocationError::InputError(format!(
                "Benchmark proxy {} is the cash symbol",
                proxy_symbol
            )));
        }
        let cash = self.cash_returns(returns)?;
        let proxy = returns.select(&[proxy_symbol.to_string()])?;

        info!("Running benchmark backtest on {}", proxy_symbol);
        self.simulate(format!("Benchmark({})", proxy_symbol), &proxy, &cash, &Sleeve::Proxy)
    }

    /// Run strategy and benchmark, and compare them over their common dates.
    pub fn run_with_benchmark(
        &self,
        returns: &ReturnTable,
        proxy_symbol: &str,
    ) -> Result<BenchmarkComparison> {
        let strategy = self.run(returns)?;
        let benchmark = self.run_benchmark(returns, proxy_symbol)?;
        let relative = BenchmarkMetrics::from_curves(
            proxy_symbol,
            &strategy.equity_curve,
            &benchmark.equity_curve,
            DEFAULT_RISK_FREE_RATE,
        );

        Ok(BenchmarkComparison {
            strategy,
            benchmark,
            relative,
        })
    }

    /// Indices of the scheduled rebalance dates.
    pub fn schedule(&self, dates: &[NaiveDate]) -> Vec<usize> {
        self.config
            .frequency
            .period_ends(dates)
            .into_iter()
            .filter(|&idx| idx + 1 >= self.config.min_history)
            .collect()
    }

    fn cash_returns(&self, returns: &ReturnTable) -> Result<Vec<f64>> {
        returns
            .column(&self.config.cash_symbol)
            .map(<[f64]>::to_vec)
            .ok_or_else(|| {
                AllocationError::InputError(format!(
                    "Cash symbol {} not found in return table",
                    self.config.cash_symbol
                ))
            })
    }

    fn simulate(
        &self,
        label: String,
        risk: &ReturnTable,
        cash: &[f64],
        sleeve: &Sleeve<'_>,
    ) -> Result<BacktestResult> {
        let dates = risk.dates();
        let schedule = self.schedule(dates);
        if schedule.is_empty() {
            return Err(AllocationError::InsufficientHistory {
                available: risk.len(),
                required: self.config.min_history,
            });
        }
        debug!("{} rebalance dates scheduled", schedule.len());

        let planned: Vec<Result<PlannedPeriod>> = schedule
            .par_iter()
            .map(|&idx| self.plan_period(risk, idx, sleeve))
            .collect();

        let mut value = self.config.initial_value;
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut rebalances: Vec<RebalanceRecord> = Vec::new();
        let mut skipped = Vec::new();
        let mut current: Option<WeightVector> = None;
        let last = risk.len() - 1;

        for (k, (&idx, outcome)) in schedule.iter().zip(planned).enumerate() {
            let date = dates[idx];
            let (weights, provenance, snapshot) = match outcome {
                Ok(plan) => (plan.weights, Provenance::Fresh, plan.snapshot),
                Err(err) => {
                    if self.config.error_policy == ErrorPolicy::Abort {
                        return Err(err);
                    }
                    warn!("Skipping rebalance: {}", err);
                    skipped.push(skipped_period(date, err));
                    match &current {
                        Some(previous) => (previous.clone(), Provenance::CarriedForward, None),
                        None => continue,
                    }
                }
            };

            debug!("{}: {} on {}", date, PeriodState::Applying, label);
            if equity_curve.is_empty() {
                equity_curve.push(EquityPoint {
                    date,
                    value,
                    daily_return: 0.0,
                });
            }
            rebalances.push(RebalanceRecord {
                date,
                value,
                weights: weights.clone(),
                provenance,
                snapshot,
            });

            let end = schedule.get(k + 1).copied().unwrap_or(last);
            for t in (idx + 1)..=end {
                let r = weights.portfolio_return(&risk.row(t), cash[t]);
                value *= 1.0 + r;
                equity_curve.push(EquityPoint {
                    date: dates[t],
                    value,
                    daily_return: r,
                });
            }
            current = Some(weights);
            debug!("{}: {} at {:.4}", date, PeriodState::Settled, value);
        }

        Ok(BacktestResult {
            label,
            config: self.config.clone(),
            equity_curve,
            rebalances,
            skipped,
        })
    }

    /// Stages up to cash adjustment for the rebalance on row `idx`.
    fn plan_period(&self, risk: &ReturnTable, idx: usize, sleeve: &Sleeve<'_>) -> Result<PlannedPeriod> {
        let date = risk.dates()[idx];
        let stage_err = move |stage: PeriodState| move |e: AllocationError| e.at_period(date, stage);

        let window = risk.trailing(idx, self.config.lookback_days);
        if window.len() < self.config.min_history {
            return Err(AllocationError::InsufficientHistory {
                available: window.len(),
                required: self.config.min_history,
            }
            .at_period(date, PeriodState::AwaitingLookback));
        }

        debug!("{}: {} over {} rows", date, PeriodState::Clustering, window.len());
        let covariance =
            covariance_matrix(&window).map_err(stage_err(PeriodState::Clustering))?;

        let (risk_weights, snapshot) = match sleeve {
            Sleeve::Hierarchical(allocator) => {
                let correlation = correlation_from_covariance(&covariance);
                let tree = distance_matrix(&correlation)
                    .and_then(|d| cluster(&d, self.config.linkage))
                    .map_err(stage_err(PeriodState::Clustering))?;
                let order = tree.leaf_order();

                debug!("{}: {} with {}", date, PeriodState::Allocating, allocator.name());
                let weights = allocator
                    .allocate(&AllocationInput::new(&tree, &order, &covariance))
                    .map_err(stage_err(PeriodState::Allocating))?;
                let snapshot = ClusterSnapshot::new(&tree, &order, window.symbols());
                (weights, Some(snapshot))
            }
            Sleeve::Proxy => (vec![1.0], None),
        };

        debug!("{}: {}", date, PeriodState::CashAdjusting);
        let limits = match sleeve {
            Sleeve::Hierarchical(_) => self.config.exposure.as_ref(),
            Sleeve::Proxy => None,
        };
        let weights = self
            .adjust(&risk_weights, &covariance, window.symbols(), limits)
            .map_err(stage_err(PeriodState::CashAdjusting))?;

        Ok(PlannedPeriod { weights, snapshot })
    }

    fn adjust(
        &self,
        risk_weights: &[f64],
        covariance: &[Vec<f64>],
        symbols: &[String],
        limits: Option<&ExposureLimits>,
    ) -> Result<WeightVector> {
        let adjustment = CashController::new(self.config.cash_mode).apply(risk_weights, covariance)?;
        let weights = WeightVector::new(
            symbols.to_vec(),
            adjustment.risk_weights,
            self.config.cash_symbol.clone(),
            adjustment.cash_weight,
        )?;

        match limits {
            Some(limits) => limits.apply(&weights),
            None => Ok(weights),
        }
    }
}

fn skipped_period(date: NaiveDate, err: AllocationError) -> SkippedPeriod {
    match err {
        AllocationError::Period { stage, source, .. } => SkippedPeriod {
            date,
            stage,
            reason: source.to_string(),
        },
        other => SkippedPeriod {
            date,
            stage: PeriodState::AwaitingLookback,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TRADING_DAYS_PER_YEAR;
    use chrono::Days;

    fn dates(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..n).map(|i| start + Days::new(i as u64)).collect()
    }

    /// Three risk assets with deterministic, distinct return patterns plus cash.
    fn sample_returns(n: usize) -> ReturnTable {
        let a: Vec<f64> = (0..n).map(|i| 0.01 * ((i as f64) * 0.7).sin()).collect();
        let b: Vec<f64> = (0..n)
            .map(|i| 0.008 * ((i as f64) * 0.7).sin() + 0.002 * ((i as f64) * 1.3).cos())
            .collect();
        let c: Vec<f64> = (0..n).map(|i| 0.015 * ((i as f64) * 0.31).cos()).collect();
        let cash = vec![0.0001; n];
        ReturnTable::new(
            dates(n),
            vec!["A".into(), "B".into(), "C".into(), "CASH".into()],
            vec![a, b, c, cash],
        )
        .unwrap()
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            lookback_days: 30,
            min_history: 20,
            cash_mode: CashMode::Fixed { weight: 0.1 },
            ..Default::default()
        }
    }

    #[test]
    fn test_schedule_skips_warm_up() {
        let returns = sample_returns(100);
        let backtester = Backtester::new(config());
        let schedule = backtester.schedule(returns.dates());
        // Month ends in 2024: Jan 31 (30), Feb 29 (59), Mar 31 (90), last date Apr 9 (99).
        assert_eq!(schedule, vec![30, 59, 90, 99]);
    }

    #[test]
    fn test_run_produces_valid_weights() {
        let returns = sample_returns(100);
        let result = Backtester::new(config()).run(&returns).unwrap();

        assert_eq!(result.rebalances.len(), 4);
        assert_eq!(result.label, "HRP");
        for record in &result.rebalances {
            assert!((record.weights.total() - 1.0).abs() < 1e-6);
            assert!((record.weights.cash - 0.1).abs() < 1e-9);
            assert!(record.weights.iter().all(|(_, w)| w >= 0.0));
            assert_eq!(record.provenance, Provenance::Fresh);
            assert!(record.snapshot.is_some());
        }
        // Starting point plus every day after the first rebalance.
        assert_eq!(result.equity_curve.len(), 1 + (99 - 30));
        assert_eq!(result.equity_curve[0].date, returns.dates()[30]);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_missing_cash_column() {
        let returns = sample_returns(40).without("CASH");
        let result = Backtester::new(config()).run(&returns);
        assert!(matches!(result, Err(AllocationError::InputError(_))));
    }

    #[test]
    fn test_nothing_scheduled_is_insufficient_history() {
        let returns = sample_returns(15);
        let result = Backtester::new(config()).run(&returns);
        assert!(matches!(
            result,
            Err(AllocationError::InsufficientHistory { required: 20, .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let returns = sample_returns(40);
        let bad = BacktestConfig {
            lookback_days: 10,
            min_history: 20,
            ..Default::default()
        };
        assert!(matches!(
            Backtester::new(bad).run(&returns),
            Err(AllocationError::ConfigError(_))
        ));
    }

    #[test]
    fn test_abort_wraps_period_error() {
        let returns = sample_returns(100);
        let cfg = BacktestConfig {
            algorithm: Algorithm::Herc,
            cluster_count: ClusterCount::Fixed(5),
            ..config()
        };
        let err = Backtester::new(cfg).run(&returns).unwrap_err();
        match err {
            AllocationError::Period { date, stage, source } => {
                assert_eq!(date, returns.dates()[30]);
                assert_eq!(stage, PeriodState::Allocating);
                assert!(matches!(*source, AllocationError::InvalidClusterCount { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_carry_forward_skips_without_prior_weights() {
        let returns = sample_returns(100);
        let cfg = BacktestConfig {
            algorithm: Algorithm::Herc,
            cluster_count: ClusterCount::Fixed(5),
            error_policy: ErrorPolicy::CarryForward,
            ..config()
        };
        let result = Backtester::new(cfg).run(&returns).unwrap();
        assert_eq!(result.skipped.len(), 4);
        assert!(result.rebalances.is_empty());
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.final_value(), 100.0);
    }

    #[test]
    fn test_benchmark_holds_proxy_and_cash() {
        let returns = sample_returns(100);
        let result = Backtester::new(config()).run_benchmark(&returns, "A").unwrap();

        assert_eq!(result.label, "Benchmark(A)");
        for record in &result.rebalances {
            assert_eq!(record.weights.symbols, vec!["A".to_string()]);
            assert!((record.weights.weights[0] - 0.9).abs() < 1e-12);
            assert!(record.snapshot.is_none());
        }

        assert!(Backtester::new(config()).run_benchmark(&returns, "CASH").is_err());
        assert!(Backtester::new(config()).run_benchmark(&returns, "ZZZ").is_err());
    }

    #[test]
    fn test_benchmark_ignores_exposure_limits() {
        let returns = sample_returns(100);
        let cfg = BacktestConfig {
            exposure: Some(ExposureLimits::new(0.3)),
            ..config()
        };
        let result = Backtester::new(cfg).run_benchmark(&returns, "A").unwrap();

        assert_eq!(result.rebalances.len(), 4);
        for record in &result.rebalances {
            assert!((record.weights.weights[0] - 0.9).abs() < 1e-12);
            assert!((record.weights.weights[0] - (1.0 - record.weights.cash)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_vol_targeted_benchmark_scales_proxy() {
        let returns = sample_returns(100);
        let target = 0.05;
        let cfg = BacktestConfig {
            cash_mode: CashMode::VolTarget { target_vol: target },
            ..config()
        };
        let backtester = Backtester::new(cfg);
        let result = backtester.run_benchmark(&returns, "A").unwrap();
        let proxy = returns.select(&["A".to_string()]).unwrap();

        assert_eq!(result.rebalances.len(), 4);
        for record in &result.rebalances {
            let idx = returns.position(record.date).unwrap();
            let cov = covariance_matrix(&proxy.trailing(idx, 30)).unwrap();
            let vol = cov[0][0].sqrt() * TRADING_DAYS_PER_YEAR.sqrt();
            let expected = (target / vol).min(1.0);

            assert!((record.weights.weights[0] - expected).abs() < 1e-9);
            assert!((record.weights.total() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_result_serializes_to_json() {
        let returns = sample_returns(70);
        let result = Backtester::new(config()).run(&returns).unwrap();
        let json = result.to_json().unwrap();
        assert!(json.contains("\"equity_curve\""));
        assert!(json.contains("\"leaf_order\""));
    }
}
