//! Performance analytics and reporting.

use crate::types::{EquityPoint, TRADING_DAYS_PER_YEAR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tabled::{builder::Builder, settings::Style};

/// Default annual risk-free rate used for Sharpe and Sortino ratios.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

/// Confidence level for VaR and CVaR.
pub const VAR_CONFIDENCE: f64 = 0.95;

/// Benchmark comparison metrics.
/// These metrics compare portfolio performance against a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    /// Benchmark name (e.g. the proxy symbol).
    pub benchmark_name: String,
    /// Annualized Jensen's alpha.
    pub alpha: f64,
    /// Sensitivity to benchmark movements.
    pub beta: f64,
    /// Annualized standard deviation of daily excess returns.
    pub tracking_error: f64,
    /// Annualized mean excess return over tracking error.
    pub information_ratio: f64,
    /// Correlation coefficient with benchmark (-1 to 1).
    pub correlation: f64,
    /// Share of benchmark gains captured on up days.
    pub up_capture: f64,
    /// Share of benchmark losses taken on down days.
    pub down_capture: f64,
    /// Benchmark total return over the common dates.
    pub benchmark_return: f64,
    /// Portfolio total return minus benchmark total return.
    pub excess_return: f64,
    /// Number of common daily observations.
    pub observations: usize,
}

impl BenchmarkMetrics {
    /// Calculate benchmark comparison metrics from aligned daily return series.
    ///
    /// Returns `None` when the series are empty or have different lengths.
    pub fn calculate(
        benchmark_name: impl Into<String>,
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
        risk_free_rate: f64,
    ) -> Option<Self> {
        if portfolio_returns.is_empty()
            || benchmark_returns.is_empty()
            || portfolio_returns.len() != benchmark_returns.len()
        {
            return None;
        }

        let n = portfolio_returns.len();
        let port_mean = mean(portfolio_returns);
        let bench_mean = mean(benchmark_returns);

        let covariance = if n > 1 {
            portfolio_returns
                .iter()
                .zip(benchmark_returns)
                .map(|(p, b)| (p - port_mean) * (b - bench_mean))
                .sum::<f64>()
                / (n - 1) as f64
        } else {
            0.0
        };
        let bench_variance = sample_std(benchmark_returns).powi(2);
        let port_std = sample_std(portfolio_returns);
        let bench_std = bench_variance.sqrt();

        let beta = if bench_variance > 0.0 {
            covariance / bench_variance
        } else {
            1.0
        };

        let correlation = if port_std > 0.0 && bench_std > 0.0 {
            (covariance / (port_std * bench_std)).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let annualized_port = annualized_return(portfolio_returns);
        let annualized_bench = annualized_return(benchmark_returns);
        let alpha =
            (annualized_port - risk_free_rate) - beta * (annualized_bench - risk_free_rate);

        let excess: Vec<f64> = portfolio_returns
            .iter()
            .zip(benchmark_returns)
            .map(|(p, b)| p - b)
            .collect();
        let excess_std = sample_std(&excess);
        let tracking_error = excess_std * TRADING_DAYS_PER_YEAR.sqrt();
        let information_ratio = if excess_std > 0.0 {
            mean(&excess) / excess_std * TRADING_DAYS_PER_YEAR.sqrt()
        } else {
            0.0
        };

        let (up_capture, down_capture) =
            Self::calculate_capture_ratios(portfolio_returns, benchmark_returns);

        let portfolio_total = total_return(portfolio_returns);
        let benchmark_total = total_return(benchmark_returns);

        Some(Self {
            benchmark_name: benchmark_name.into(),
            alpha,
            beta,
            tracking_error,
            information_ratio,
            correlation,
            up_capture,
            down_capture,
            benchmark_return: benchmark_total,
            excess_return: portfolio_total - benchmark_total,
            observations: n,
        })
    }

    /// Compare two equity curves over the dates they share.
    pub fn from_curves(
        benchmark_name: impl Into<String>,
        portfolio: &[EquityPoint],
        benchmark: &[EquityPoint],
        risk_free_rate: f64,
    ) -> Option<Self> {
        let (port, bench) = common_returns(portfolio, benchmark);
        Self::calculate(benchmark_name, &port, &bench, risk_free_rate)
    }

    /// Upside and downside capture ratios.
    fn calculate_capture_ratios(
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
    ) -> (f64, f64) {
        let capture = |keep: fn(f64) -> bool| {
            let (port, bench) = portfolio_returns
                .iter()
                .zip(benchmark_returns)
                .filter(|&(_, &b)| keep(b))
                .fold((0.0f64, 0.0f64), |(p_sum, b_sum), (p, b)| (p_sum + *p, b_sum + *b));
            if bench != 0.0 {
                port / bench
            } else {
                1.0
            }
        };

        (capture(|b| b > 0.0), capture(|b| b < 0.0))
    }
}

/// Daily returns of both curves on the dates present in both.
///
/// Each curve's returns are taken from its own `daily_return` field, so the
/// starting points (which carry a zero return) are dropped.
pub fn common_returns(a: &[EquityPoint], b: &[EquityPoint]) -> (Vec<f64>, Vec<f64>) {
    let b_by_date: HashMap<_, _> = b
        .iter()
        .skip(1)
        .map(|p| (p.date, p.daily_return))
        .collect();

    a.iter()
        .skip(1)
        .filter_map(|p| b_by_date.get(&p.date).map(|&rb| (p.daily_return, rb)))
        .unzip()
}

/// Comprehensive performance metrics for a daily return series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Largest peak-to-trough loss, as a negative fraction.
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    /// Daily 5% quantile of returns.
    pub var_95: f64,
    /// Mean of the returns at or below `var_95`.
    pub cvar_95: f64,
    pub observations: usize,
}

impl PerformanceMetrics {
    /// Calculate metrics from daily returns. Empty input gives all zeros.
    pub fn from_returns(returns: &[f64], risk_free_rate: f64) -> Self {
        if returns.is_empty() {
            return Self::default();
        }

        let annual_return = annualized_return(returns);
        let annual_volatility = sample_std(returns) * TRADING_DAYS_PER_YEAR.sqrt();
        let sharpe_ratio = if annual_volatility > 0.0 {
            (annual_return - risk_free_rate) / annual_volatility
        } else {
            0.0
        };

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_deviation = sample_std(&downside) * TRADING_DAYS_PER_YEAR.sqrt();
        let sortino_ratio = if downside_deviation > 0.0 {
            (annual_return - risk_free_rate) / downside_deviation
        } else {
            0.0
        };

        let max_drawdown = max_drawdown(returns);
        let calmar_ratio = if max_drawdown < 0.0 {
            annual_return / max_drawdown.abs()
        } else {
            0.0
        };

        let var_95 = percentile(returns, 1.0 - VAR_CONFIDENCE);
        let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= var_95).collect();
        let cvar_95 = if tail.is_empty() { var_95 } else { mean(&tail) };

        Self {
            total_return: total_return(returns),
            annual_return,
            annual_volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            calmar_ratio,
            var_95,
            cvar_95,
            observations: returns.len(),
        }
    }

    /// Calculate metrics from an equity curve, skipping its starting point.
    pub fn from_equity_curve(curve: &[EquityPoint], risk_free_rate: f64) -> Self {
        let returns: Vec<f64> = curve.iter().skip(1).map(|p| p.daily_return).collect();
        Self::from_returns(&returns, risk_free_rate)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation, zero for fewer than two values.
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}

fn total_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Geometric annualized return over 252 trading days per year.
fn annualized_return(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let years = returns.len() as f64 / TRADING_DAYS_PER_YEAR;
    (1.0 + total_return(returns)).powf(1.0 / years) - 1.0
}

/// Largest drawdown of the compounded series, as a negative fraction.
fn max_drawdown(returns: &[f64]) -> f64 {
    let mut value = 1.0;
    let mut peak = 1.0;
    let mut worst = 0.0f64;
    for r in returns {
        value *= 1.0 + r;
        peak = f64::max(peak, value);
        worst = worst.min((value - peak) / peak);
    }
    worst
}

/// Linearly interpolated quantile, `q` in `[0, 1]`.
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Plain-text table with one row per labelled metrics set.
pub fn summary_table(rows: &[(&str, &PerformanceMetrics)]) -> String {
    let mut builder = Builder::new();
    builder.push_record([
        "Portfolio", "Total %", "Annual %", "Vol %", "Sharpe", "Sortino", "Max DD %", "Calmar",
        "VaR 95%", "CVaR 95%",
    ]);

    for (label, m) in rows {
        builder.push_record([
            label.to_string(),
            format!("{:.2}", m.total_return * 100.0),
            format!("{:.2}", m.annual_return * 100.0),
            format!("{:.2}", m.annual_volatility * 100.0),
            format!("{:.2}", m.sharpe_ratio),
            format!("{:.2}", m.sortino_ratio),
            format!("{:.2}", m.max_drawdown * 100.0),
            format!("{:.2}", m.calmar_ratio),
            format!("{:.2}%", m.var_95 * 100.0),
            format!("{:.2}%", m.cvar_95 * 100.0),
        ]);
    }

    builder.build().with(Style::rounded()).to_string()
}

/// Plain-text table of benchmark-relative metrics.
pub fn benchmark_table(metrics: &BenchmarkMetrics) -> String {
    let mut builder = Builder::new();
    builder.push_record(["Metric", "Value"]);
    builder.push_record(["Benchmark".to_string(), metrics.benchmark_name.clone()]);
    builder.push_record(["Alpha %".to_string(), format!("{:.2}", metrics.alpha * 100.0)]);
    builder.push_record(["Beta".to_string(), format!("{:.3}", metrics.beta)]);
    builder.push_record([
        "Tracking error %".to_string(),
        format!("{:.2}", metrics.tracking_error * 100.0),
    ]);
    builder.push_record([
        "Information ratio".to_string(),
        format!("{:.2}", metrics.information_ratio),
    ]);
    builder.push_record(["Correlation".to_string(), format!("{:.3}", metrics.correlation)]);
    builder.push_record([
        "Up / down capture".to_string(),
        format!("{:.2} / {:.2}", metrics.up_capture, metrics.down_capture),
    ]);
    builder.push_record([
        "Excess return %".to_string(),
        format!("{:.2}", metrics.excess_return * 100.0),
    ]);

    builder.build().with(Style::rounded()).to_string()
}
