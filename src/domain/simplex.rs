//! Euclidean projection onto the capped simplex
//! `{ w : w_i >= 0, w_i <= cap, sum(w) = 1 }`.

use crate::domain::error::FiioptError;

const BISECTION_ROUNDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CappedSimplex {
    dim: usize,
    cap: f64,
}

impl CappedSimplex {
    /// Fails when the set is empty (`cap * dim < 1`) or the cap is outside (0, 1].
    pub fn new(dim: usize, cap: f64) -> Result<Self, FiioptError> {
        let infeasible = |reason: String| FiioptError::InfeasibleConstraints {
            reason,
            asset_count: dim,
            max_weight: cap,
            target_return: None,
        };
        if dim == 0 {
            return Err(infeasible("no assets to allocate".to_string()));
        }
        if !(cap > 0.0 && cap <= 1.0) {
            return Err(infeasible("max weight must lie in (0, 1]".to_string()));
        }
        // Tolerate float noise such as 0.1 * 10.
        if cap * (dim as f64) < 1.0 - 1e-12 {
            return Err(infeasible(format!(
                "max weight {} times {} assets is below 1",
                cap, dim
            )));
        }
        Ok(Self { dim, cap })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn cap(&self) -> f64 {
        self.cap
    }

    /// `1/n` on every asset, always inside the set.
    pub fn uniform(&self) -> Vec<f64> {
        vec![1.0 / self.dim as f64; self.dim]
    }

    pub fn contains(&self, w: &[f64], tolerance: f64) -> bool {
        w.len() == self.dim
            && w.iter()
                .all(|&x| x.is_finite() && x >= -tolerance && x <= self.cap + tolerance)
            && (w.iter().sum::<f64>() - 1.0).abs() <= tolerance
    }

    /// Closest point of the set to `v`.
    ///
    /// Solves `sum(clamp(v_i - tau, 0, cap)) = 1` for `tau` by bisection.
    /// Non-finite entries are treated as zero.
    pub fn project(&self, v: &[f64]) -> Vec<f64> {
        debug_assert_eq!(v.len(), self.dim);
        let v: Vec<f64> = v
            .iter()
            .map(|x| if x.is_finite() { *x } else { 0.0 })
            .collect();

        let mass = |tau: f64| -> f64 { v.iter().map(|x| (x - tau).clamp(0.0, self.cap)).sum() };

        let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = v.iter().copied().fold(f64::INFINITY, f64::min);
        // mass(lo) = dim * cap >= 1, mass(hi) = 0
        let mut lo = min - self.cap;
        let mut hi = max;
        for _ in 0..BISECTION_ROUNDS {
            let mid = 0.5 * (lo + hi);
            if mid <= lo || mid >= hi {
                break;
            }
            if mass(mid) > 1.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let tau = 0.5 * (lo + hi);
        let mut w: Vec<f64> = v.iter().map(|x| (x - tau).clamp(0.0, self.cap)).collect();

        // Spread any residual from the bisection over the free coordinates.
        let residual = 1.0 - w.iter().sum::<f64>();
        if residual.abs() > 0.0 {
            let free: Vec<usize> = (0..self.dim)
                .filter(|&i| {
                    if residual > 0.0 {
                        w[i] < self.cap
                    } else {
                        w[i] > 0.0
                    }
                })
                .collect();
            if !free.is_empty() {
                let share = residual / free.len() as f64;
                for i in free {
                    w[i] = (w[i] + share).clamp(0.0, self.cap);
                }
            }
        }
        w
    }

    /// Clip every entry into `[0, cap]`, then project.
    pub fn clip_and_project(&self, v: &[f64]) -> Vec<f64> {
        let clipped: Vec<f64> = v
            .iter()
            .map(|x| if x.is_finite() { x.clamp(0.0, self.cap) } else { 0.0 })
            .collect();
        self.project(&clipped)
    }
}
