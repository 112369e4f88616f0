//! Covariance and correlation estimation over a return window.

use crate::data::ReturnTable;
use crate::error::{AllocationError, Result};

/// Variance floor used wherever a variance ends up in a denominator.
pub const VARIANCE_FLOOR: f64 = 1e-8;

/// Sample covariance matrix (denominator `n - 1`) of daily returns.
pub fn covariance_matrix(returns: &ReturnTable) -> Result<Vec<Vec<f64>>> {
    let n_obs = returns.len();
    if n_obs < 2 {
        return Err(AllocationError::InsufficientHistory {
            available: n_obs,
            required: 2,
        });
    }

    let columns = returns.columns();
    let means: Vec<f64> = columns
        .iter()
        .map(|c| c.iter().sum::<f64>() / n_obs as f64)
        .collect();

    let n = columns.len();
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = columns[i]
                .iter()
                .zip(&columns[j])
                .map(|(ri, rj)| (ri - means[i]) * (rj - means[j]))
                .sum::<f64>()
                / (n_obs - 1) as f64;
            if !c.is_finite() {
                return Err(AllocationError::NumericalInstability(format!(
                    "covariance of {} and {} is {}",
                    returns.symbols()[i],
                    returns.symbols()[j],
                    c
                )));
            }
            cov[i][j] = c;
            cov[j][i] = c;
        }
    }

    Ok(cov)
}

/// Correlation matrix implied by a covariance matrix.
///
/// Assets with (near) zero variance are treated as uncorrelated with everything else.
pub fn correlation_from_covariance(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = cov.len();
    let std: Vec<f64> = (0..n).map(|i| cov[i][i].max(0.0).sqrt()).collect();

    let mut corr = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            corr[i][j] = if i == j {
                1.0
            } else if std[i] > 1e-12 && std[j] > 1e-12 {
                (cov[i][j] / (std[i] * std[j])).clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }
    }
    corr
}

/// Correlation matrix of daily returns.
pub fn correlation_matrix(returns: &ReturnTable) -> Result<Vec<Vec<f64>>> {
    Ok(correlation_from_covariance(&covariance_matrix(returns)?))
}

/// Diagonal of a square matrix.
pub fn diagonal(matrix: &[Vec<f64>]) -> Vec<f64> {
    matrix.iter().enumerate().map(|(i, row)| row[i]).collect()
}

/// Portfolio variance `wᵀ Σ w` over the given asset indices.
pub fn quadratic_form(weights: &[f64], cov: &[Vec<f64>], indices: &[usize]) -> f64 {
    let mut variance = 0.0;
    for (a, &i) in indices.iter().enumerate() {
        for (b, &j) in indices.iter().enumerate() {
            variance += weights[a] * weights[b] * cov[i][j];
        }
    }
    variance
}

/// Portfolio variance `wᵀ Σ w` for a full weight vector.
pub fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let indices: Vec<usize> = (0..weights.len()).collect();
    quadratic_form(weights, cov, &indices)
}

/// Inverse-variance weights, normalized to one. Variances are floored at [`VARIANCE_FLOOR`].
pub fn inverse_variance_weights(variances: &[f64]) -> Vec<f64> {
    let inv: Vec<f64> = variances.iter().map(|v| 1.0 / v.max(VARIANCE_FLOOR)).collect();
    let total: f64 = inv.iter().sum();
    inv.into_iter().map(|x| x / total).collect()
}
