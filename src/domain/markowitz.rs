//! Mean-variance (Markowitz) optimizer under long-only box constraints.
//!
//! Feasible set: `sum(w) = 1`, `0 <= w_i <= max_weight`, optionally
//! `mu'w >= target_return`.
//!
//! - With a target: minimize `w'Σw`. The minimizers of the Lagrangian
//!   `w'Σw - λ mu'w` over the capped simplex trace the efficient frontier as
//!   λ grows, so λ is found by bisection and the result is moved along the
//!   segment towards the max-return vertex until the target holds exactly.
//! - Without a target: maximize the Sharpe ratio by golden-section search
//!   over λ (log scale) along the same frontier.
//!
//! The inner problem is solved by accelerated projected gradient (FISTA with
//! adaptive restart). Every solution is verified; a violating solution is
//! re-solved once with [`SolverConfig::fallback`] before failing with
//! `NumericalInstability`.

use crate::domain::constraints::{Constraints, WEIGHT_TOLERANCE, Weights};
use crate::domain::error::FiioptError;
use crate::domain::returns::RiskModel;
use crate::domain::simplex::CappedSimplex;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info, warn};

const GOLDEN: f64 = 0.618_033_988_749_895;
const RETURN_TOLERANCE: f64 = 1e-9;
const MAX_DOUBLINGS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    /// Iterations of the inner projected-gradient solve.
    pub max_iterations: usize,
    /// Stop when no weight moves more than this between iterations.
    pub tolerance: f64,
    /// Fraction of the `1 / L` step (L = Lipschitz constant of the gradient).
    pub step_scale: f64,
    /// Rounds of bisection on λ for a return target.
    pub bisection_rounds: usize,
    /// Rounds of golden-section search for the max-Sharpe portfolio.
    pub search_rounds: usize,
}

impl SolverConfig {
    pub fn primary() -> Self {
        Self {
            max_iterations: 5_000,
            tolerance: 1e-11,
            step_scale: 1.0,
            bisection_rounds: 80,
            search_rounds: 80,
        }
    }

    pub fn fallback() -> Self {
        Self {
            max_iterations: 50_000,
            tolerance: 1e-13,
            step_scale: 0.5,
            bisection_rounds: 120,
            search_rounds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Objective {
    MinVariance { target_return: f64 },
    MaxSharpe,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkowitzSolution {
    pub weights: Weights,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub objective: Objective,
    pub used_fallback: bool,
}

/// A point of the efficient frontier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrontierPoint {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub weights: Vec<f64>,
}

/// Optimal weights for `risk` and annualized `expected` returns.
pub fn optimize(
    risk: &RiskModel,
    expected: &DVector<f64>,
    constraints: &Constraints,
) -> Result<MarkowitzSolution, FiioptError> {
    let problem = Problem::new(risk, expected, constraints)?;

    let objective = match constraints.target_return {
        Some(target) => {
            let max_return = problem.max_return();
            if target > max_return + RETURN_TOLERANCE {
                return Err(constraints.infeasible(format!(
                    "target return {:.6} above maximum achievable return {:.6}",
                    target, max_return
                )));
            }
            Objective::MinVariance {
                target_return: target,
            }
        }
        None => Objective::MaxSharpe,
    };

    let mut used_fallback = false;
    let weights = match problem.solve_verified(objective, SolverConfig::primary()) {
        Ok(w) => w,
        Err(reason) => {
            warn!("markowitz solution rejected ({}), retrying with fallback solver", reason);
            used_fallback = true;
            problem
                .solve_verified(objective, SolverConfig::fallback())
                .map_err(|reason| FiioptError::NumericalInstability {
                    reason: format!("markowitz solver failed after fallback: {}", reason),
                })?
        }
    };

    let expected_return = problem.ret(&weights);
    let volatility = risk.portfolio_volatility(weights.as_slice());
    let sharpe_ratio = if volatility > 0.0 {
        (expected_return - constraints.risk_free_rate) / volatility
    } else {
        0.0
    };
    info!(
        "markowitz {:?}: return {:.4}, volatility {:.4}, sharpe {:.3}",
        objective, expected_return, volatility, sharpe_ratio
    );

    Ok(MarkowitzSolution {
        weights: Weights::new(risk.assets.clone(), weights.as_slice().to_vec())?,
        expected_return,
        volatility,
        sharpe_ratio,
        objective,
        used_fallback,
    })
}

/// `points` minimum-variance portfolios with targets evenly spaced between
/// the global minimum-variance return and the maximum achievable return.
pub fn efficient_frontier(
    risk: &RiskModel,
    expected: &DVector<f64>,
    constraints: &Constraints,
    points: usize,
) -> Result<Vec<FrontierPoint>, FiioptError> {
    let problem = Problem::new(risk, expected, constraints)?;
    let config = SolverConfig::primary();
    let min_var = problem.minimize(0.0, &problem.simplex.uniform(), config);
    let lo = problem.ret(&min_var);
    let hi = problem.max_return();

    let mut frontier = Vec::with_capacity(points);
    for k in 0..points {
        let target = if points <= 1 {
            lo
        } else {
            lo + (hi - lo) * k as f64 / (points - 1) as f64
        };
        let w = problem.solve_verified(
            Objective::MinVariance {
                target_return: target,
            },
            config,
        );
        let w = match w {
            Ok(w) => w,
            Err(reason) => {
                debug!("frontier point {} skipped: {}", k, reason);
                continue;
            }
        };
        let expected_return = problem.ret(&w);
        let volatility = problem.vol(&w);
        frontier.push(FrontierPoint {
            expected_return,
            volatility,
            sharpe_ratio: if volatility > 0.0 {
                (expected_return - constraints.risk_free_rate) / volatility
            } else {
                0.0
            },
            weights: w.as_slice().to_vec(),
        });
    }
    Ok(frontier)
}

struct Problem<'a> {
    sigma: &'a DMatrix<f64>,
    mu: &'a DVector<f64>,
    simplex: CappedSimplex,
    risk_free_rate: f64,
    lipschitz: f64,
}

impl<'a> Problem<'a> {
    fn new(
        risk: &'a RiskModel,
        expected: &'a DVector<f64>,
        constraints: &Constraints,
    ) -> Result<Self, FiioptError> {
        constraints.validate()?;
        let n = risk.asset_count();
        if n != constraints.asset_count || expected.len() != n {
            return Err(FiioptError::Data {
                reason: format!(
                    "risk model has {} assets, expected returns {}, constraints ask for {}",
                    n,
                    expected.len(),
                    constraints.asset_count
                ),
            });
        }
        if expected.iter().any(|m| !m.is_finite()) {
            return Err(FiioptError::NumericalInstability {
                reason: "expected returns contain non-finite values".to_string(),
            });
        }
        let simplex = constraints.simplex()?;
        let lipschitz = (2.0 * risk.max_eigenvalue()).max(1e-12);
        Ok(Self {
            sigma: &risk.covariance,
            mu: expected,
            simplex,
            risk_free_rate: constraints.risk_free_rate,
            lipschitz,
        })
    }

    fn ret(&self, w: &DVector<f64>) -> f64 {
        self.mu.dot(w)
    }

    fn vol(&self, w: &DVector<f64>) -> f64 {
        w.dot(&(self.sigma * w)).max(0.0).sqrt()
    }

    fn sharpe(&self, w: &DVector<f64>) -> f64 {
        let vol = self.vol(w);
        let excess = self.ret(w) - self.risk_free_rate;
        if vol > 0.0 {
            excess / vol
        } else if excess > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Max-return vertex: fill the highest expected returns up to the cap.
    fn max_return_weights(&self) -> DVector<f64> {
        let n = self.mu.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            self.mu[b]
                .partial_cmp(&self.mu[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut w = DVector::zeros(n);
        let mut left = 1.0_f64;
        for i in order {
            let take = left.min(self.simplex.cap());
            w[i] = take;
            left -= take;
            if left <= 0.0 {
                break;
            }
        }
        w
    }

    fn max_return(&self) -> f64 {
        self.ret(&self.max_return_weights())
    }

    /// Minimizer of `w'Σw - λ mu'w` over the capped simplex.
    fn minimize(&self, lambda: f64, warm: &[f64], config: SolverConfig) -> DVector<f64> {
        let step = config.step_scale / self.lipschitz;
        let mut x = DVector::from_column_slice(&self.simplex.project(warm));
        let mut y = x.clone();
        let mut t = 1.0_f64;

        for _ in 0..config.max_iterations {
            let grad = (self.sigma * &y) * 2.0 - self.mu * lambda;
            let trial = &y - grad * step;
            let next = DVector::from_vec(self.simplex.project(trial.as_slice()));
            let moved = (&next - &x).amax();

            if (&y - &next).dot(&(&next - &x)) > 0.0 {
                // momentum points uphill: restart
                t = 1.0;
                y = next.clone();
            } else {
                let t_next = 0.5 * (1.0 + (1.0 + 4.0 * t * t).sqrt());
                y = &next + (&next - &x) * ((t - 1.0) / t_next);
                t = t_next;
            }
            x = next;
            if moved < config.tolerance {
                break;
            }
        }
        x
    }

    fn solve_target(&self, target: f64, config: SolverConfig) -> DVector<f64> {
        let w_max = self.max_return_weights();
        let w0 = self.minimize(0.0, &self.simplex.uniform(), config);
        if self.ret(&w0) >= target {
            return w0;
        }

        let mut lo = 0.0_f64;
        let mut hi = 1.0_f64;
        let mut w_hi = self.minimize(hi, w0.as_slice(), config);
        let mut doublings = 0;
        while self.ret(&w_hi) < target && doublings < MAX_DOUBLINGS {
            lo = hi;
            hi *= 2.0;
            w_hi = self.minimize(hi, w_hi.as_slice(), config);
            doublings += 1;
        }

        for _ in 0..config.bisection_rounds {
            if hi - lo <= 1e-12 * hi {
                break;
            }
            let mid = 0.5 * (lo + hi);
            let w_mid = self.minimize(mid, w_hi.as_slice(), config);
            if self.ret(&w_mid) >= target {
                hi = mid;
                w_hi = w_mid;
            } else {
                lo = mid;
            }
        }

        self.repair_towards(w_hi, &w_max, target)
    }

    /// Move along the segment to `w_max` until `mu'w >= target`; the segment
    /// stays inside the (convex) feasible set.
    fn repair_towards(&self, w: DVector<f64>, w_max: &DVector<f64>, target: f64) -> DVector<f64> {
        let r = self.ret(&w);
        if r >= target {
            return w;
        }
        let r_max = self.ret(w_max);
        if r_max <= r {
            return w;
        }
        let theta = (((target - r) / (r_max - r)) * (1.0 + 1e-9)).clamp(0.0, 1.0);
        &w + (w_max - &w) * theta
    }

    fn solve_max_sharpe(&self, config: SolverConfig) -> DVector<f64> {
        let w_max = self.max_return_weights();
        let max_return = self.ret(&w_max);
        let w0 = self.minimize(0.0, &self.simplex.uniform(), config);

        let mut best = w0.clone();
        let mut best_sharpe = self.sharpe(&w0);
        let consider = |w: &DVector<f64>, best: &mut DVector<f64>, best_sharpe: &mut f64| {
            let s = self.sharpe(w);
            if s > *best_sharpe {
                *best_sharpe = s;
                *best = w.clone();
            }
        };
        consider(&w_max, &mut best, &mut best_sharpe);

        // Upper end of the frontier parameter.
        let mut hi = 1.0_f64;
        let mut w_hi = self.minimize(hi, w0.as_slice(), config);
        let mut doublings = 0;
        while self.ret(&w_hi) < max_return - RETURN_TOLERANCE && doublings < MAX_DOUBLINGS {
            hi *= 2.0;
            w_hi = self.minimize(hi, w_hi.as_slice(), config);
            doublings += 1;
        }
        consider(&w_hi, &mut best, &mut best_sharpe);

        let mut a = (hi * 1e-10).ln();
        let mut b = hi.ln();
        let mut warm = w0.clone();
        let eval = |u: f64, warm: &mut DVector<f64>| -> (f64, DVector<f64>) {
            let w = self.minimize(u.exp(), warm.as_slice(), config);
            *warm = w.clone();
            (self.sharpe(&w), w)
        };

        let mut c = b - GOLDEN * (b - a);
        let mut d = a + GOLDEN * (b - a);
        let (mut fc, wc) = eval(c, &mut warm);
        let (mut fd, wd) = eval(d, &mut warm);
        consider(&wc, &mut best, &mut best_sharpe);
        consider(&wd, &mut best, &mut best_sharpe);

        for _ in 0..config.search_rounds {
            if (b - a).abs() < 1e-9 {
                break;
            }
            if fc >= fd {
                b = d;
                d = c;
                fd = fc;
                c = b - GOLDEN * (b - a);
                let (f, w) = eval(c, &mut warm);
                fc = f;
                consider(&w, &mut best, &mut best_sharpe);
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + GOLDEN * (b - a);
                let (f, w) = eval(d, &mut warm);
                fd = f;
                consider(&w, &mut best, &mut best_sharpe);
            }
        }

        debug!("max sharpe search: best sharpe {:.4}", best_sharpe);
        best
    }

    fn solve_verified(
        &self,
        objective: Objective,
        config: SolverConfig,
    ) -> Result<DVector<f64>, String> {
        let w = match objective {
            Objective::MinVariance { target_return } => self.solve_target(target_return, config),
            Objective::MaxSharpe => self.solve_max_sharpe(config),
        };
        self.verify(&w, objective)?;
        Ok(w)
    }

    fn verify(&self, w: &DVector<f64>, objective: Objective) -> Result<(), String> {
        if w.iter().any(|x| !x.is_finite()) {
            return Err("non-finite weight".to_string());
        }
        let sum = w.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(format!("weights sum to {}", sum));
        }
        let cap = self.simplex.cap();
        if let Some(x) = w
            .iter()
            .find(|&&x| x < -WEIGHT_TOLERANCE || x > cap + WEIGHT_TOLERANCE)
        {
            return Err(format!("weight {} outside [0, {}]", x, cap));
        }
        if let Objective::MinVariance { target_return } = objective {
            let r = self.ret(w);
            if r < target_return - RETURN_TOLERANCE {
                return Err(format!("return {} below target {}", r, target_return));
            }
        }
        Ok(())
    }
}
