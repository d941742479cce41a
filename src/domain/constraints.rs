//! Allocation constraints and immutable weight vectors.

use crate::domain::error::FiioptError;
use crate::domain::simplex::CappedSimplex;
use serde::Serialize;

/// Tolerance for sum-to-one and bound checks on produced weights.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Constraints {
    pub asset_count: usize,
    pub max_weight: f64,
    pub risk_free_rate: f64,
    pub target_return: Option<f64>,
}

impl Constraints {
    /// Checks `asset_count > 0`, `max_weight` in (0, 1], a finite risk-free
    /// rate and target, and `max_weight * asset_count >= 1`.
    pub fn validate(&self) -> Result<(), FiioptError> {
        if self.asset_count == 0 {
            return Err(FiioptError::invalid(
                "optimization",
                "asset_count",
                "asset_count must be positive",
            ));
        }
        if !(self.max_weight > 0.0 && self.max_weight <= 1.0) {
            return Err(FiioptError::invalid(
                "optimization",
                "max_weight_per_asset",
                "max_weight_per_asset must be in (0, 1]",
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(FiioptError::invalid(
                "optimization",
                "risk_free_rate",
                "risk_free_rate must be finite",
            ));
        }
        if self.target_return.is_some_and(|t| !t.is_finite()) {
            return Err(FiioptError::invalid(
                "optimization",
                "target_return",
                "target_return must be finite",
            ));
        }
        if self.simplex().is_err() {
            return Err(self.infeasible(format!(
                "max weight {} times {} assets is below 1",
                self.max_weight, self.asset_count
            )));
        }
        Ok(())
    }

    pub fn simplex(&self) -> Result<CappedSimplex, FiioptError> {
        CappedSimplex::new(self.asset_count, self.max_weight)
    }

    pub(crate) fn infeasible(&self, reason: String) -> FiioptError {
        FiioptError::InfeasibleConstraints {
            reason,
            asset_count: self.asset_count,
            max_weight: self.max_weight,
            target_return: self.target_return,
        }
    }
}

/// A weight vector over named assets. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Weights {
    assets: Vec<String>,
    values: Vec<f64>,
}

impl Weights {
    pub fn new(assets: Vec<String>, values: Vec<f64>) -> Result<Self, FiioptError> {
        if assets.len() != values.len() {
            return Err(FiioptError::Data {
                reason: format!("{} weights for {} assets", values.len(), assets.len()),
            });
        }
        Ok(Self { assets, values })
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn get(&self, asset: &str) -> Option<f64> {
        self.assets
            .iter()
            .position(|a| a == asset)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.assets
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Positions above `cutoff`, largest first.
    pub fn nonzero(&self, cutoff: f64) -> Vec<(&str, f64)> {
        let mut out: Vec<(&str, f64)> = self.iter().filter(|(_, w)| *w > cutoff).collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Finite, summing to one and inside `[0, cap]`, all within `tolerance`.
    pub fn is_feasible(&self, cap: f64, tolerance: f64) -> bool {
        !self.values.is_empty()
            && self
                .values
                .iter()
                .all(|&w| w.is_finite() && w >= -tolerance && w <= cap + tolerance)
            && (self.sum() - 1.0).abs() <= tolerance
    }
}
