//! Cash weight control: a fixed cash sleeve or volatility targeting.

use crate::error::{AllocationError, Result};
use crate::stats::portfolio_variance;
use crate::types::TRADING_DAYS_PER_YEAR;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How much of the portfolio is held in the cash proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CashMode {
    /// Hold a constant fraction in cash.
    Fixed { weight: f64 },
    /// Scale risk exposure so annualized portfolio volatility is at most `target_vol`.
    VolTarget { target_vol: f64 },
}

impl Default for CashMode {
    fn default() -> Self {
        CashMode::Fixed { weight: 0.10 }
    }
}

impl CashMode {
    /// Check the mode's parameter range.
    pub fn validate(&self) -> Result<()> {
        match *self {
            CashMode::Fixed { weight } if !(0.0..=1.0).contains(&weight) => {
                Err(AllocationError::ConfigError(format!(
                    "Fixed cash weight must be in [0, 1], got {}",
                    weight
                )))
            }
            CashMode::VolTarget { target_vol } if !target_vol.is_finite() || target_vol < 0.0 => {
                Err(AllocationError::ConfigError(format!(
                    "Volatility target must be non-negative, got {}",
                    target_vol
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of a cash adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashAdjustment {
    /// Risk weights after scaling, aligned with the input.
    pub risk_weights: Vec<f64>,
    pub cash_weight: f64,
    /// Factor applied to the normalized risk weights.
    pub scale: f64,
    /// Annualized volatility of the unscaled risk portfolio (vol-target mode only).
    pub portfolio_vol: Option<f64>,
}

/// Splits a fully invested risk portfolio between risk assets and cash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CashController {
    mode: CashMode,
}

impl CashController {
    pub fn new(mode: CashMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> CashMode {
        self.mode
    }

    /// Normalize `risk_weights`, scale them down per the cash mode, and put the rest in cash.
    pub fn apply(&self, risk_weights: &[f64], covariance: &[Vec<f64>]) -> Result<CashAdjustment> {
        self.mode.validate()?;

        if risk_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AllocationError::InputError(format!(
                "Risk weights must be finite and non-negative: {:?}",
                risk_weights
            )));
        }
        let total: f64 = risk_weights.iter().sum();
        if total <= 0.0 {
            return Err(AllocationError::InputError(
                "Risk weights are all zero".to_string(),
            ));
        }
        let normalized: Vec<f64> = risk_weights.iter().map(|w| w / total).collect();

        let (scale, portfolio_vol) = match self.mode {
            CashMode::Fixed { weight } => (1.0 - weight, None),
            CashMode::VolTarget { target_vol } => {
                if covariance.len() != normalized.len()
                    || covariance.iter().any(|row| row.len() != normalized.len())
                {
                    return Err(AllocationError::InputError(format!(
                        "Covariance matrix does not match {} risk weights",
                        normalized.len()
                    )));
                }
                let variance = portfolio_variance(&normalized, covariance);
                if !variance.is_finite() {
                    return Err(AllocationError::NumericalInstability(format!(
                        "Portfolio variance is {}",
                        variance
                    )));
                }
                let vol = variance.max(0.0).sqrt() * TRADING_DAYS_PER_YEAR.sqrt();

                let scale = if target_vol <= 0.0 {
                    0.0
                } else if vol == 0.0 {
                    1.0
                } else {
                    (target_vol / vol).clamp(0.0, 1.0)
                };
                debug!(
                    "Volatility target {:.4}, portfolio volatility {:.4}, scale {:.4}",
                    target_vol, vol, scale
                );
                (scale, Some(vol))
            }
        };

        let scaled: Vec<f64> = normalized.iter().map(|w| w * scale).collect();
        let cash_weight = (1.0 - scaled.iter().sum::<f64>()).max(0.0);

        Ok(CashAdjustment {
            risk_weights: scaled,
            cash_weight,
            scale,
            portfolio_vol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cov() -> Vec<Vec<f64>> {
        // Daily variances of 4e-4 and 1e-4, correlation 0.5.
        vec![vec![4e-4, 1e-4], vec![1e-4, 1e-4]]
    }

    #[test]
    fn test_fixed_cash() {
        let adj = CashController::new(CashMode::Fixed { weight: 0.1 })
            .apply(&[0.6, 0.4], &cov())
            .unwrap();
        assert!((adj.risk_weights[0] - 0.54).abs() < 1e-12);
        assert!((adj.risk_weights[1] - 0.36).abs() < 1e-12);
        assert!((adj.cash_weight - 0.1).abs() < 1e-12);
        assert_eq!(adj.portfolio_vol, None);
    }

    #[test]
    fn test_weights_are_normalized_first() {
        let adj = CashController::new(CashMode::Fixed { weight: 0.0 })
            .apply(&[2.0, 2.0], &cov())
            .unwrap();
        assert_eq!(adj.risk_weights, vec![0.5, 0.5]);
        assert_eq!(adj.cash_weight, 0.0);
    }

    #[test]
    fn test_vol_target_reaches_target() {
        let weights = [0.5, 0.5];
        let adj = CashController::new(CashMode::VolTarget { target_vol: 0.10 })
            .apply(&weights, &cov())
            .unwrap();

        let vol = adj.portfolio_vol.unwrap();
        assert!(vol > 0.10);
        let realized = portfolio_variance(&adj.risk_weights, &cov()).sqrt() * 252f64.sqrt();
        assert!((realized - 0.10).abs() / 0.10 < 0.01);
        assert!((adj.risk_weights.iter().sum::<f64>() + adj.cash_weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_vol_target_never_levers_up() {
        let adj = CashController::new(CashMode::VolTarget { target_vol: 5.0 })
            .apply(&[0.5, 0.5], &cov())
            .unwrap();
        assert_eq!(adj.scale, 1.0);
        assert_eq!(adj.cash_weight, 0.0);
    }

    #[test]
    fn test_vol_target_edge_cases() {
        let zero_target = CashController::new(CashMode::VolTarget { target_vol: 0.0 })
            .apply(&[0.5, 0.5], &cov())
            .unwrap();
        assert_eq!(zero_target.scale, 0.0);
        assert_eq!(zero_target.cash_weight, 1.0);

        let flat = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        let zero_vol = CashController::new(CashMode::VolTarget { target_vol: 0.1 })
            .apply(&[0.5, 0.5], &flat)
            .unwrap();
        assert_eq!(zero_vol.scale, 1.0);

        let nan = vec![vec![f64::NAN, 0.0], vec![0.0, 1e-4]];
        let unstable = CashController::new(CashMode::VolTarget { target_vol: 0.1 })
            .apply(&[0.5, 0.5], &nan);
        assert!(matches!(unstable, Err(AllocationError::NumericalInstability(_))));
    }

    #[test]
    fn test_invalid_inputs() {
        let controller = CashController::new(CashMode::Fixed { weight: 0.1 });
        assert!(matches!(
            controller.apply(&[0.0, 0.0], &cov()),
            Err(AllocationError::InputError(_))
        ));

        for mode in [
            CashMode::Fixed { weight: 1.5 },
            CashMode::Fixed { weight: -0.1 },
            CashMode::VolTarget { target_vol: -0.2 },
        ] {
            assert!(matches!(
                CashController::new(mode).apply(&[1.0, 1.0], &cov()),
                Err(AllocationError::ConfigError(_))
            ));
        }
    }
}
