//! Per-asset exposure limits applied after cash control.

use crate::error::{AllocationError, Result};
use crate::types::WeightVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Maximum number of cap-and-redistribute passes.
pub const MAX_LIMIT_PASSES: usize = 20;

const EXCESS_EPSILON: f64 = 1e-8;

/// Caps on single-asset exposure, with an optional core holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureLimits {
    /// Largest weight any non-exempt, non-core risk asset may hold.
    pub max_weight: f64,
    /// Symbols the cap does not apply to.
    #[serde(default)]
    pub exempt: Vec<String>,
    /// Asset that absorbs capped excess and holds at least `core_min_weight`.
    #[serde(default)]
    pub core_symbol: Option<String>,
    #[serde(default)]
    pub core_min_weight: f64,
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            max_weight: 0.30,
            exempt: Vec::new(),
            core_symbol: None,
            core_min_weight: 0.0,
        }
    }
}

impl ExposureLimits {
    pub fn new(max_weight: f64) -> Self {
        Self {
            max_weight,
            ..Default::default()
        }
    }

    pub fn with_exempt(mut self, symbols: &[&str]) -> Self {
        self.exempt = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_core(mut self, symbol: impl Into<String>, min_weight: f64) -> Self {
        self.core_symbol = Some(symbol.into());
        self.core_min_weight = min_weight;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_weight > 0.0 && self.max_weight <= 1.0) {
            return Err(AllocationError::ConfigError(format!(
                "max_weight must be in (0, 1], got {}",
                self.max_weight
            )));
        }
        if !(0.0..=1.0).contains(&self.core_min_weight) {
            return Err(AllocationError::ConfigError(format!(
                "core_min_weight must be in [0, 1], got {}",
                self.core_min_weight
            )));
        }
        Ok(())
    }

    fn is_capped(&self, symbol: &str) -> bool {
        self.core_symbol.as_deref() != Some(symbol) && !self.exempt.iter().any(|s| s == symbol)
    }

    /// Apply the limits, returning a new weight vector whose cash absorbs any
    /// excess that could not be placed on risk assets.
    pub fn apply(&self, weights: &WeightVector) -> Result<WeightVector> {
        self.validate()?;

        let mut w = weights.weights.clone();
        let mut cash = weights.cash;
        let core = self
            .core_symbol
            .as_deref()
            .and_then(|c| weights.symbols.iter().position(|s| s == c));

        if let Some(core_idx) = core {
            let needed = self.core_min_weight - w[core_idx];
            if needed > 0.0 {
                let others: f64 = w
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != core_idx)
                    .map(|(_, x)| x)
                    .sum();
                if others > needed {
                    let factor = (others - needed) / others;
                    for (i, x) in w.iter_mut().enumerate() {
                        if i != core_idx {
                            *x *= factor;
                        }
                    }
                    w[core_idx] = self.core_min_weight;
                } else {
                    // Fund what the other assets cannot from cash.
                    let funded = needed.min(cash);
                    w[core_idx] += funded;
                    cash -= funded;
                }
                debug!(
                    "Raised core asset {} to {:.4}",
                    weights.symbols[core_idx], w[core_idx]
                );
            }
        }

        let capped: Vec<bool> = weights.symbols.iter().map(|s| self.is_capped(s)).collect();
        let mut converged = false;

        for pass in 0..MAX_LIMIT_PASSES {
            let mut excess = 0.0;
            for (x, &is_capped) in w.iter_mut().zip(&capped) {
                if is_capped && *x > self.max_weight {
                    excess += *x - self.max_weight;
                    *x = self.max_weight;
                }
            }
            if excess < EXCESS_EPSILON {
                converged = true;
                break;
            }
            debug!("Exposure pass {}: redistributing {:.6}", pass + 1, excess);

            if let Some(core_idx) = core {
                w[core_idx] += excess;
                continue;
            }

            let headroom: Vec<f64> = w
                .iter()
                .zip(&capped)
                .map(|(&x, &is_capped)| {
                    if is_capped {
                        (self.max_weight - x).max(0.0)
                    } else {
                        0.0
                    }
                })
                .collect();
            let room: f64 = headroom.iter().sum();
            if room > EXCESS_EPSILON {
                let ratio = (excess / room).min(1.0);
                for (x, h) in w.iter_mut().zip(&headroom) {
                    *x += h * ratio;
                }
            }
            if excess - room > EXCESS_EPSILON {
                debug!("Excess {:.6} moved to cash", excess - room);
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                "Exposure limits did not settle within {} passes",
                MAX_LIMIT_PASSES
            );
        }

        let invested: f64 = w.iter().sum();
        WeightVector::new(
            weights.symbols.clone(),
            w,
            weights.cash_symbol.clone(),
            (1.0 - invested).max(0.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wv(pairs: &[(&str, f64)], cash: f64) -> WeightVector {
        WeightVector::new(
            pairs.iter().map(|(s, _)| s.to_string()).collect(),
            pairs.iter().map(|(_, w)| *w).collect(),
            "CASH",
            cash,
        )
        .unwrap()
    }

    #[test]
    fn test_cap_redistributes_by_headroom() {
        let limits = ExposureLimits::new(0.4);
        let out = limits
            .apply(&wv(&[("A", 0.6), ("B", 0.2), ("C", 0.1)], 0.1))
            .unwrap();

        assert!((out.get("A").unwrap() - 0.4).abs() < 1e-12);
        // Headroom 0.2 and 0.3 share the 0.2 excess.
        assert!((out.get("B").unwrap() - 0.28).abs() < 1e-12);
        assert!((out.get("C").unwrap() - 0.22).abs() < 1e-12);
        assert!((out.cash - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_unplaceable_excess_goes_to_cash() {
        let limits = ExposureLimits::new(0.3);
        let out = limits.apply(&wv(&[("A", 0.7), ("B", 0.3)], 0.0)).unwrap();

        assert!((out.get("A").unwrap() - 0.3).abs() < 1e-12);
        assert!((out.get("B").unwrap() - 0.3).abs() < 1e-12);
        assert!((out.cash - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_core_absorbs_excess_and_has_minimum() {
        let limits = ExposureLimits::new(0.3)
            .with_core("CORE", 0.15)
            .with_exempt(&["CORE"]);
        let out = limits
            .apply(&wv(&[("CORE", 0.05), ("A", 0.5), ("B", 0.35)], 0.1))
            .unwrap();

        // Raising CORE to 0.15 scales A and B by 0.75/0.85 first.
        let a = 0.5 * 0.75 / 0.85;
        let b = 0.35 * 0.75 / 0.85;
        let excess = (a - 0.3) + 0.0f64.max(b - 0.3);
        assert!((out.get("A").unwrap() - 0.3).abs() < 1e-12);
        assert!((out.get("B").unwrap() - b.min(0.3)).abs() < 1e-12);
        assert!((out.get("CORE").unwrap() - (0.15 + excess)).abs() < 1e-9);
        assert!((out.cash - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_exempt_assets_are_not_capped() {
        let limits = ExposureLimits::new(0.2).with_exempt(&["BOND"]);
        let out = limits.apply(&wv(&[("BOND", 0.7), ("A", 0.2)], 0.1)).unwrap();
        assert_eq!(out.get("BOND"), Some(0.7));
        assert!((out.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_limits() {
        let w = wv(&[("A", 1.0)], 0.0);
        assert!(ExposureLimits::new(0.0).apply(&w).is_err());
        assert!(ExposureLimits::new(0.5).with_core("A", 1.5).apply(&w).is_err());
    }
}
