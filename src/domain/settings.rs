//! Run settings, validated once before any work starts.

use crate::domain::backtest::BacktestConfig;
use crate::domain::constraints::Constraints;
use crate::domain::environment::{EnvConfig, RewardMode, RiskPenalty};
use crate::domain::error::FiioptError;
use crate::domain::returns::{CovarianceEstimator, ExpectedReturnMethod, TRADING_DAYS_PER_YEAR};
use crate::domain::training::TrainingConfig;
use crate::domain::universe::DEFAULT_MIN_OBSERVATIONS;
use chrono::NaiveDate;

/// Fit window `[start, holdout_start)` and holdout window `[holdout_start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub holdout_start: NaiveDate,
}

impl DataWindow {
    pub fn validate(&self) -> Result<(), FiioptError> {
        if self.start >= self.end {
            return Err(FiioptError::invalid(
                "data",
                "start_date",
                "start_date must be before end_date",
            ));
        }
        if self.holdout_start <= self.start || self.holdout_start > self.end {
            return Err(FiioptError::invalid(
                "data",
                "holdout_start",
                "holdout_start must be after start_date and not after end_date",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationSettings {
    pub asset_count: usize,
    pub max_weight_per_asset: f64,
    pub risk_free_rate: f64,
    pub target_return: Option<f64>,
    pub training_timesteps: usize,
    pub random_seed: Option<u64>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            asset_count: 10,
            max_weight_per_asset: 0.2,
            risk_free_rate: 0.10,
            target_return: None,
            training_timesteps: 10_000,
            random_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    pub covariance: CovarianceEstimator,
    pub expected_returns: ExpectedReturnMethod,
    pub periods_per_year: f64,
    /// Minimum number of fit-window returns.
    pub min_observations: usize,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            covariance: CovarianceEstimator::default(),
            expected_returns: ExpectedReturnMethod::default(),
            periods_per_year: TRADING_DAYS_PER_YEAR,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrlSettings {
    pub lookback: usize,
    pub risk_penalty: f64,
    pub penalty: RiskPenalty,
    /// Reward the policy for tracking `target_return` instead of risk-adjusted
    /// return. Needs a target.
    pub track_target: bool,
    pub learning_rate: f64,
    pub exploration_std: f64,
    pub discount: f64,
    pub envs_per_phase: usize,
    pub max_grad_norm: f64,
}

impl Default for DrlSettings {
    fn default() -> Self {
        let training = TrainingConfig::default();
        let env = EnvConfig::default();
        Self {
            lookback: env.lookback,
            risk_penalty: env.risk_penalty,
            penalty: env.penalty,
            track_target: false,
            learning_rate: training.learning_rate,
            exploration_std: training.exploration_std,
            discount: training.discount,
            envs_per_phase: training.envs_per_phase,
            max_grad_norm: training.max_grad_norm,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonSettings {
    pub window: DataWindow,
    pub optimization: OptimizationSettings,
    pub risk: RiskSettings,
    pub drl: DrlSettings,
    pub initial_capital: f64,
    pub rebalance_every: usize,
}

impl ComparisonSettings {
    pub fn new(window: DataWindow) -> Self {
        let backtest = BacktestConfig::default();
        Self {
            window,
            optimization: OptimizationSettings::default(),
            risk: RiskSettings::default(),
            drl: DrlSettings::default(),
            initial_capital: backtest.initial_capital,
            rebalance_every: backtest.rebalance_every,
        }
    }

    pub fn validate(&self) -> Result<(), FiioptError> {
        self.window.validate()?;
        self.constraints().validate()?;
        if !(self.risk.periods_per_year.is_finite() && self.risk.periods_per_year > 0.0) {
            return Err(FiioptError::invalid(
                "optimization",
                "periods_per_year",
                "periods_per_year must be positive",
            ));
        }
        if self.risk.min_observations < 2 {
            return Err(FiioptError::invalid(
                "data",
                "min_observations",
                "min_observations must be at least 2",
            ));
        }
        if self.drl.lookback < 2 {
            return Err(FiioptError::invalid(
                "drl",
                "lookback",
                "lookback must be at least 2 periods",
            ));
        }
        if !(self.drl.risk_penalty.is_finite() && self.drl.risk_penalty >= 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "risk_penalty",
                "risk_penalty must be a non-negative number",
            ));
        }
        if self.drl.track_target && self.optimization.target_return.is_none() {
            return Err(FiioptError::invalid(
                "drl",
                "reward",
                "target_tracking reward needs [optimization] target_return",
            ));
        }
        self.training_config().validate()?;
        self.backtest_config().validate()
    }

    pub fn constraints(&self) -> Constraints {
        Constraints {
            asset_count: self.optimization.asset_count,
            max_weight: self.optimization.max_weight_per_asset,
            risk_free_rate: self.optimization.risk_free_rate,
            target_return: self.optimization.target_return,
        }
    }

    pub fn env_config(&self) -> EnvConfig {
        let reward = match (self.drl.track_target, self.optimization.target_return) {
            (true, Some(annual_target)) => RewardMode::TargetTracking { annual_target },
            _ => RewardMode::RiskAdjusted,
        };
        EnvConfig {
            lookback: self.drl.lookback,
            step_size: 1,
            max_weight: self.optimization.max_weight_per_asset,
            risk_penalty: self.drl.risk_penalty,
            penalty: self.drl.penalty,
            reward,
            periods_per_year: self.risk.periods_per_year,
        }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            timesteps: self.optimization.training_timesteps,
            seed: self.optimization.random_seed,
            learning_rate: self.drl.learning_rate,
            exploration_std: self.drl.exploration_std,
            discount: self.drl.discount,
            envs_per_phase: self.drl.envs_per_phase,
            max_grad_norm: self.drl.max_grad_norm,
        }
    }

    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            initial_capital: self.initial_capital,
            risk_free_rate: self.optimization.risk_free_rate,
            periods_per_year: self.risk.periods_per_year,
            rebalance_every: self.rebalance_every,
        }
    }
}
