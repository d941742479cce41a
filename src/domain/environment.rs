//! Allocation environment: an episodic MDP over a return matrix.
//!
//! An episode starts `lookback` periods into the data with uniform weights
//! and a portfolio value of 1. Each step takes a target allocation, holds it
//! for `step_size` periods and pays a reward. The episode ends exactly after
//! `(T - lookback) / step_size` steps.

use crate::domain::error::FiioptError;
use crate::domain::returns::{ReturnMatrix, TRADING_DAYS_PER_YEAR};
use crate::domain::simplex::CappedSimplex;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Scale applied to returns and volatilities in observations (percent units).
const OBSERVATION_SCALE: f64 = 100.0;
/// Scale of the squared tracking error in the target-tracking reward.
const TRACKING_SCALE: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskPenalty {
    /// Trailing realized volatility of the chosen allocation.
    #[default]
    Volatility,
    /// Increase of the episode drawdown caused by the step.
    Drawdown,
}

impl FromStr for RiskPenalty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "volatility" => Ok(RiskPenalty::Volatility),
            "drawdown" => Ok(RiskPenalty::Drawdown),
            other => Err(format!(
                "unknown penalty '{}', expected volatility or drawdown",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RewardMode {
    /// `return - risk_penalty * risk`.
    #[default]
    RiskAdjusted,
    /// Squared deviation from a per-step return derived from an annual target.
    TargetTracking { annual_target: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub lookback: usize,
    pub step_size: usize,
    pub max_weight: f64,
    pub risk_penalty: f64,
    pub penalty: RiskPenalty,
    pub reward: RewardMode,
    pub periods_per_year: f64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            lookback: 30,
            step_size: 1,
            max_weight: 1.0,
            risk_penalty: 0.1,
            penalty: RiskPenalty::Volatility,
            reward: RewardMode::RiskAdjusted,
            periods_per_year: TRADING_DAYS_PER_YEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Ready,
    InEpisode,
    Terminated,
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvState::Ready => write!(f, "Ready"),
            EnvState::InEpisode => write!(f, "InEpisode"),
            EnvState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Vec<f64>,
    pub reward: f64,
    pub done: bool,
    /// Allocation actually held during the step (after projection).
    pub weights: Vec<f64>,
    /// Compounded portfolio return over the step.
    pub portfolio_return: f64,
    /// Date of the last period consumed by the step.
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct AllocationEnv {
    returns: Arc<ReturnMatrix>,
    config: EnvConfig,
    simplex: CappedSimplex,
    horizon: usize,
    state: EnvState,
    cursor: usize,
    step_index: usize,
    value: f64,
    peak: f64,
    weights: Vec<f64>,
}

impl AllocationEnv {
    pub fn new(returns: Arc<ReturnMatrix>, config: EnvConfig) -> Result<Self, FiioptError> {
        if config.lookback < 2 {
            return Err(FiioptError::invalid(
                "drl",
                "lookback",
                "lookback must be at least 2 periods",
            ));
        }
        if config.step_size == 0 {
            return Err(FiioptError::invalid(
                "drl",
                "step_size",
                "step_size must be positive",
            ));
        }
        if !(config.risk_penalty.is_finite() && config.risk_penalty >= 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "risk_penalty",
                "risk_penalty must be a non-negative number",
            ));
        }
        if !(config.periods_per_year.is_finite() && config.periods_per_year > 0.0) {
            return Err(FiioptError::Data {
                reason: format!("invalid periods per year {}", config.periods_per_year),
            });
        }
        let simplex = CappedSimplex::new(returns.asset_count(), config.max_weight)?;

        let periods = returns.periods();
        let minimum = config.lookback + config.step_size;
        if periods < minimum {
            return Err(FiioptError::InsufficientHistory {
                asset: "environment".to_string(),
                observations: periods,
                minimum,
            });
        }
        let horizon = (periods - config.lookback) / config.step_size;

        Ok(Self {
            weights: simplex.uniform(),
            returns,
            simplex,
            horizon,
            state: EnvState::Ready,
            cursor: config.lookback,
            step_index: 0,
            value: 1.0,
            peak: 1.0,
            config,
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn returns(&self) -> &ReturnMatrix {
        &self.returns
    }

    pub fn simplex(&self) -> CappedSimplex {
        self.simplex
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    /// Steps per episode.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn asset_count(&self) -> usize {
        self.returns.asset_count()
    }

    pub fn observation_dim(&self) -> usize {
        let n = self.asset_count();
        self.config.lookback * n + 2 * n
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Start a new episode from any state and return the first observation.
    pub fn reset(&mut self) -> Vec<f64> {
        self.state = EnvState::InEpisode;
        self.cursor = self.config.lookback;
        self.step_index = 0;
        self.value = 1.0;
        self.peak = 1.0;
        self.weights = self.simplex.uniform();
        self.observation()
    }

    pub fn step(&mut self, action: &[f64]) -> Result<StepOutcome, FiioptError> {
        if self.state != EnvState::InEpisode {
            return Err(self.misuse("step"));
        }
        if action.len() != self.asset_count() {
            return Err(self.misuse(&format!(
                "step with {} action values for {} assets",
                action.len(),
                self.asset_count()
            )));
        }

        let weights = self.simplex.clip_and_project(action);
        let rows = &self.returns.rows()[self.cursor..self.cursor + self.config.step_size];
        let growth: f64 = rows
            .iter()
            .map(|r| 1.0 + dot(&weights, r))
            .product();
        let portfolio_return = growth - 1.0;

        let drawdown_before = 1.0 - self.value / self.peak;
        self.value *= growth;
        self.peak = self.peak.max(self.value);
        let drawdown_after = 1.0 - self.value / self.peak;

        self.cursor += self.config.step_size;
        self.step_index += 1;
        self.weights = weights;

        let reward = match self.config.reward {
            RewardMode::RiskAdjusted => {
                let risk = match self.config.penalty {
                    RiskPenalty::Volatility => self.trailing_volatility(&self.weights),
                    RiskPenalty::Drawdown => (drawdown_after - drawdown_before).max(0.0),
                };
                portfolio_return - self.config.risk_penalty * risk
            }
            RewardMode::TargetTracking { annual_target } => {
                let per_step = (1.0 + annual_target)
                    .powf(self.config.step_size as f64 / self.config.periods_per_year)
                    - 1.0;
                -(portfolio_return - per_step).powi(2) * TRACKING_SCALE
            }
        };

        let done = self.step_index == self.horizon;
        if done {
            self.state = EnvState::Terminated;
        }

        Ok(StepOutcome {
            observation: self.observation(),
            reward,
            done,
            weights: self.weights.clone(),
            portfolio_return,
            date: self.returns.dates()[self.cursor - 1],
        })
    }

    /// Trailing returns, per-asset trailing volatility, current weights.
    fn observation(&self) -> Vec<f64> {
        let n = self.asset_count();
        let window = &self.returns.rows()[self.cursor - self.config.lookback..self.cursor];
        let mut obs = Vec::with_capacity(self.observation_dim());
        for row in window {
            obs.extend(row.iter().map(|r| r * OBSERVATION_SCALE));
        }
        for i in 0..n {
            let series: Vec<f64> = window.iter().map(|r| r[i]).collect();
            obs.push(sample_std(&series) * OBSERVATION_SCALE);
        }
        obs.extend_from_slice(&self.weights);
        obs
    }

    /// Per-period volatility of `weights` over the last `lookback` periods.
    fn trailing_volatility(&self, weights: &[f64]) -> f64 {
        let window = &self.returns.rows()[self.cursor - self.config.lookback..self.cursor];
        let series: Vec<f64> = window.iter().map(|r| dot(weights, r)).collect();
        sample_std(&series)
    }

    fn misuse(&self, operation: &str) -> FiioptError {
        FiioptError::EnvironmentMisuse {
            operation: operation.to_string(),
            state: self.state.to_string(),
            step: self.step_index,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}
