//! Out-of-sample backtest of a fixed allocation or a policy.

use crate::domain::constraints::Weights;
use crate::domain::environment::AllocationEnv;
use crate::domain::error::FiioptError;
use crate::domain::metrics::Metrics;
use crate::domain::policy::AllocationPolicy;
use crate::domain::returns::{ReturnMatrix, TRADING_DAYS_PER_YEAR};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub risk_free_rate: f64,
    pub periods_per_year: f64,
    /// Periods between policy queries when backtesting a policy.
    pub rebalance_every: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100.0,
            risk_free_rate: 0.0,
            periods_per_year: TRADING_DAYS_PER_YEAR,
            rebalance_every: 1,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), FiioptError> {
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(FiioptError::invalid(
                "backtest",
                "initial_capital",
                "initial_capital must be positive",
            ));
        }
        if self.rebalance_every == 0 {
            return Err(FiioptError::invalid(
                "backtest",
                "rebalance_every",
                "rebalance_every must be at least 1",
            ));
        }
        if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
            return Err(FiioptError::invalid(
                "backtest",
                "periods_per_year",
                "periods_per_year must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub period_return: f64,
}

/// Weights set on `date`, held from that period on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub date: NaiveDate,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub assets: Vec<String>,
    pub curve: Vec<EquityPoint>,
    pub allocations: Vec<AllocationRecord>,
    pub metrics: Metrics,
}

impl BacktestResult {
    pub fn final_value(&self) -> f64 {
        self.metrics.final_value
    }
}

/// Hold `weights` every period: the period return is `w · r_t`.
pub fn run_fixed_weights(
    strategy: &str,
    weights: &Weights,
    returns: &ReturnMatrix,
    config: &BacktestConfig,
) -> Result<BacktestResult, FiioptError> {
    config.validate()?;
    let returns = returns.select(weights.assets())?;
    if returns.periods() == 0 {
        return Err(empty_window());
    }

    let w = weights.values();
    let mut value = config.initial_capital;
    let mut curve = Vec::with_capacity(returns.periods());
    let mut period_returns = Vec::with_capacity(returns.periods());
    for (date, row) in returns.dates().iter().zip(returns.rows()) {
        let r: f64 = w.iter().zip(row).map(|(a, b)| a * b).sum();
        value *= 1.0 + r;
        period_returns.push(r);
        curve.push(EquityPoint {
            date: *date,
            value,
            period_return: r,
        });
    }

    let allocations = vec![AllocationRecord {
        date: returns.dates()[0],
        weights: w.to_vec(),
    }];
    finish(strategy, weights.assets().to_vec(), curve, allocations, &period_returns, config)
}

/// Step `env` to the end of its episode, querying `policy` with the current
/// observation every `rebalance_every` periods and holding its allocation
/// in between. The environment must advance one period per step.
pub fn run_policy(
    strategy: &str,
    policy: &dyn AllocationPolicy,
    mut env: AllocationEnv,
    config: &BacktestConfig,
) -> Result<BacktestResult, FiioptError> {
    config.validate()?;
    if env.config().step_size != 1 {
        return Err(FiioptError::invalid(
            "drl",
            "step_size",
            "policy backtests need an environment stepping one period at a time",
        ));
    }
    if policy.asset_count() != env.asset_count() {
        return Err(FiioptError::Data {
            reason: format!(
                "policy allocates {} assets, environment has {}",
                policy.asset_count(),
                env.asset_count()
            ),
        });
    }

    let mut observation = env.reset();
    let mut target = env.weights().to_vec();
    let mut value = config.initial_capital;
    let mut curve = Vec::with_capacity(env.horizon());
    let mut period_returns = Vec::with_capacity(env.horizon());
    let mut allocations = Vec::new();

    for k in 0..env.horizon() {
        let rebalance = k % config.rebalance_every == 0;
        if rebalance {
            target = policy.allocate(&observation)?;
        }
        let outcome = env.step(&target)?;
        if rebalance {
            allocations.push(AllocationRecord {
                date: outcome.date,
                weights: outcome.weights.clone(),
            });
        }
        value *= 1.0 + outcome.portfolio_return;
        period_returns.push(outcome.portfolio_return);
        curve.push(EquityPoint {
            date: outcome.date,
            value,
            period_return: outcome.portfolio_return,
        });
        observation = outcome.observation;
        if outcome.done {
            break;
        }
    }

    if curve.is_empty() {
        return Err(empty_window());
    }
    let assets = env.returns().assets().to_vec();
    finish(strategy, assets, curve, allocations, &period_returns, config)
}

fn finish(
    strategy: &str,
    assets: Vec<String>,
    curve: Vec<EquityPoint>,
    allocations: Vec<AllocationRecord>,
    period_returns: &[f64],
    config: &BacktestConfig,
) -> Result<BacktestResult, FiioptError> {
    let metrics = Metrics::compute(
        config.initial_capital,
        period_returns,
        config.risk_free_rate,
        config.periods_per_year,
    );
    if !metrics.final_value.is_finite() {
        return Err(FiioptError::NumericalInstability {
            reason: format!("{} backtest produced a non-finite value", strategy),
        });
    }
    info!(
        "{} backtest: {} periods, cumulative return {:.2}%, sharpe {:.3}",
        strategy,
        metrics.periods,
        metrics.cumulative_return * 100.0,
        metrics.sharpe_ratio
    );
    Ok(BacktestResult {
        strategy: strategy.to_string(),
        assets,
        curve,
        allocations,
        metrics,
    })
}

fn empty_window() -> FiioptError {
    FiioptError::InsufficientHistory {
        asset: "backtest window".to_string(),
        observations: 0,
        minimum: 1,
    }
}
