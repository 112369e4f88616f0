//! Correlation-based distance matrix used by the clusterer.

use crate::error::{AllocationError, Result};
use tracing::warn;

/// Correlations this far outside `[-1, 1]` are logged before being clamped.
const CORRELATION_OVERSHOOT: f64 = 1e-9;

/// Convert a correlation matrix into `d(i,j) = sqrt(0.5 * (1 - ρ(i,j)))`.
///
/// Entries are clamped to `[-1, 1]` first, the result is symmetrized and has a
/// zero diagonal.
pub fn distance_matrix(correlation: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let n = correlation.len();
    if let Some(row) = correlation.iter().find(|row| row.len() != n) {
        return Err(AllocationError::InputError(format!(
            "Correlation matrix is not square: {} rows, found a row of length {}",
            n,
            row.len()
        )));
    }

    let mut dist = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            let rho = correlation[i][j];
            if !rho.is_finite() {
                return Err(AllocationError::NumericalInstability(format!(
                    "correlation ({}, {}) is {}",
                    i, j, rho
                )));
            }
            if rho.abs() > 1.0 + CORRELATION_OVERSHOOT {
                warn!("Clamping correlation ({}, {}) = {} to [-1, 1]", i, j, rho);
            }
        }
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let rho = 0.5 * (correlation[i][j] + correlation[j][i]);
            let d = (0.5 * (1.0 - rho.clamp(-1.0, 1.0))).sqrt();
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    Ok(dist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_transform() {
        let corr = vec![vec![1.0, 0.5, -1.0], vec![0.5, 1.0, 0.0], vec![-1.0, 0.0, 1.0]];
        let d = distance_matrix(&corr).unwrap();

        assert_eq!(d[0][0], 0.0);
        assert!((d[0][1] - 0.5).abs() < 1e-12);
        assert!((d[0][2] - 1.0).abs() < 1e-12);
        assert!((d[1][2] - 0.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(d[1][0], d[0][1]);
    }

    #[test]
    fn test_overshoot_is_clamped() {
        let corr = vec![vec![1.0, 1.0000001], vec![1.0000001, 1.0]];
        let d = distance_matrix(&corr).unwrap();
        assert_eq!(d[0][1], 0.0);
    }

    #[test]
    fn test_non_finite_correlation_rejected() {
        let corr = vec![vec![1.0, f64::NAN], vec![f64::NAN, 1.0]];
        assert!(matches!(
            distance_matrix(&corr),
            Err(AllocationError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_non_square_rejected() {
        let corr = vec![vec![1.0, 0.2], vec![0.2]];
        assert!(matches!(distance_matrix(&corr), Err(AllocationError::InputError(_))));
    }
}
