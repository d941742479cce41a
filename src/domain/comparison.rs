//! End-to-end comparison: fit both allocators on the fit window, evaluate
//! them on the disjoint holdout window under the same backtest convention.

use crate::domain::backtest::{BacktestResult, run_fixed_weights, run_policy};
use crate::domain::constraints::Weights;
use crate::domain::environment::AllocationEnv;
use crate::domain::error::FiioptError;
use crate::domain::markowitz::{FrontierPoint, MarkowitzSolution, efficient_frontier, optimize};
use crate::domain::policy::AllocationPolicy;
use crate::domain::returns::{ReturnMatrix, RiskModel, asset_volatilities, expected_returns};
use crate::domain::selection::select_assets;
use crate::domain::settings::{ComparisonSettings, DataWindow};
use crate::domain::training::{CancellationToken, TrainingReport, train};
use crate::domain::universe::{AssetPanel, SkippedAsset, UniverseValidationResult};
use nalgebra::DVector;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

pub const MARKOWITZ: &str = "markowitz";
pub const REINFORCEMENT: &str = "rl";
pub const EQUAL_WEIGHT: &str = "equal_weight";

#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub fingerprint: String,
    pub window: DataWindow,
    pub selected: Vec<String>,
    pub skipped: Vec<SkippedAsset>,
    pub fit_periods: usize,
    pub markowitz: MarkowitzSolution,
    pub markowitz_backtest: BacktestResult,
    /// Policy allocation at the start of the holdout.
    pub rl_weights: Weights,
    pub rl_backtest: BacktestResult,
    pub training: TrainingReport,
    pub benchmark: BacktestResult,
}

impl ComparisonReport {
    pub fn backtests(&self) -> [&BacktestResult; 3] {
        [&self.markowitz_backtest, &self.rl_backtest, &self.benchmark]
    }
}

/// Split point of `returns`: periods dated before `holdout_start` form the
/// fit window.
fn fit_len(returns: &ReturnMatrix, window: &DataWindow) -> usize {
    returns
        .dates()
        .partition_point(|d| *d < window.holdout_start)
}

/// Fit-window inputs shared by the comparison and the standalone optimizer.
struct FitWindow {
    adjusted: ReturnMatrix,
    split: usize,
    selected: Vec<String>,
    risk: RiskModel,
    mu: DVector<f64>,
}

fn prepare_fit(panel: &AssetPanel, settings: &ComparisonSettings) -> Result<FitWindow, FiioptError> {
    let window = settings.window;
    let adjusted = ReturnMatrix::adjusted(panel)?;
    let market = ReturnMatrix::market(panel)?;
    let split = fit_len(&adjusted, &window);

    let minimum = settings
        .risk
        .min_observations
        .max(settings.drl.lookback + 1);
    if split < minimum {
        return Err(FiioptError::InsufficientHistory {
            asset: "fit window".to_string(),
            observations: split,
            minimum,
        });
    }

    let fit_adjusted = adjusted.slice(0..split);
    let fit_market = market.slice(0..split);
    let ppy = settings.risk.periods_per_year;
    let mu = expected_returns(&fit_adjusted, settings.risk.expected_returns, ppy);
    let constraints = settings.constraints();
    // Rank on stand-alone volatility so the covariance only spans the selection.
    let selected = select_assets(
        fit_market.assets(),
        &mu,
        &asset_volatilities(&fit_market, ppy),
        constraints.risk_free_rate,
        constraints.asset_count,
    )?;
    let risk = RiskModel::estimate(&fit_market.select(&selected)?, settings.risk.covariance, ppy)?;
    let mu = select_entries(&mu, fit_adjusted.assets(), &selected);

    Ok(FitWindow {
        adjusted,
        split,
        selected,
        risk,
        mu,
    })
}

/// Markowitz allocation of the fit window alone, with its efficient frontier.
#[derive(Debug, Clone)]
pub struct MarkowitzFit {
    pub selected: Vec<String>,
    pub fit_periods: usize,
    pub solution: MarkowitzSolution,
    pub frontier: Vec<FrontierPoint>,
}

pub fn fit_markowitz(
    universe: &UniverseValidationResult,
    settings: &ComparisonSettings,
    frontier_points: usize,
) -> Result<MarkowitzFit, FiioptError> {
    settings.validate()?;
    let panel = universe
        .panel
        .window(settings.window.start, settings.window.end);
    let fit = prepare_fit(&panel, settings)?;
    let constraints = settings.constraints();
    let solution = optimize(&fit.risk, &fit.mu, &constraints)?;
    let frontier = if frontier_points > 0 {
        efficient_frontier(&fit.risk, &fit.mu, &constraints, frontier_points)?
    } else {
        Vec::new()
    };
    Ok(MarkowitzFit {
        selected: fit.selected,
        fit_periods: fit.split,
        solution,
        frontier,
    })
}

pub fn run_comparison(
    universe: &UniverseValidationResult,
    settings: &ComparisonSettings,
    cancel: &CancellationToken,
) -> Result<ComparisonReport, FiioptError> {
    settings.validate()?;
    let window = settings.window;
    let panel = universe.panel.window(window.start, window.end);
    let fingerprint = fingerprint(&panel, settings);
    info!(
        "comparing on {} assets, {} dates, fingerprint {}",
        panel.count(),
        panel.dates.len(),
        &fingerprint[..12]
    );

    let FitWindow {
        adjusted,
        split,
        selected,
        risk,
        mu,
    } = prepare_fit(&panel, settings)?;
    let total = adjusted.periods();
    if total == split {
        return Err(FiioptError::InsufficientHistory {
            asset: "holdout window".to_string(),
            observations: 0,
            minimum: 1,
        });
    }

    // Fit window
    let markowitz = optimize(&risk, &mu, &settings.constraints())?;

    let selected_adjusted = adjusted.select(&selected)?;
    let train_env = AllocationEnv::new(
        Arc::new(selected_adjusted.slice(0..split)),
        settings.env_config(),
    )?;
    let outcome = train(&train_env, &settings.training_config(), cancel)?;

    // Holdout window
    let backtest_config = settings.backtest_config();
    let holdout = selected_adjusted.slice(split..total);
    let markowitz_backtest =
        run_fixed_weights(MARKOWITZ, &markowitz.weights, &holdout, &backtest_config)?;

    let lookback = settings.drl.lookback;
    let eval_env = AllocationEnv::new(
        Arc::new(selected_adjusted.slice(split - lookback..total)),
        settings.env_config(),
    )?;
    let rl_weights = {
        let mut first_day = eval_env.clone();
        let observation = first_day.reset();
        Weights::new(selected.clone(), outcome.policy.allocate(&observation)?)?
    };
    let cap = settings.optimization.max_weight_per_asset;
    for (name, weights) in [(MARKOWITZ, &markowitz.weights), (REINFORCEMENT, &rl_weights)] {
        if !weights.is_feasible(cap, 1e-6) {
            return Err(FiioptError::NumericalInstability {
                reason: format!("{} weights leave the capped simplex", name),
            });
        }
    }
    let rl_backtest = run_policy(REINFORCEMENT, &outcome.policy, eval_env, &backtest_config)?;

    let n = selected.len();
    let equal = Weights::new(selected.clone(), vec![1.0 / n as f64; n])?;
    let benchmark = run_fixed_weights(EQUAL_WEIGHT, &equal, &holdout, &backtest_config)?;

    Ok(ComparisonReport {
        fingerprint,
        window,
        selected,
        skipped: universe.skipped.clone(),
        fit_periods: split,
        markowitz,
        markowitz_backtest,
        rl_weights,
        rl_backtest,
        training: outcome.report,
        benchmark,
    })
}

fn select_entries(values: &DVector<f64>, assets: &[String], selected: &[String]) -> DVector<f64> {
    DVector::from_iterator(
        selected.len(),
        selected.iter().map(|id| {
            assets
                .iter()
                .position(|a| a == id)
                .map(|i| values[i])
                .unwrap_or(f64::NAN)
        }),
    )
}

/// SHA-256 (hex) of the data window, prices and constraints.
pub fn fingerprint(panel: &AssetPanel, settings: &ComparisonSettings) -> String {
    let mut hasher = Sha256::new();
    let window = &settings.window;
    hasher.update(window.start.to_string().as_bytes());
    hasher.update(window.end.to_string().as_bytes());
    hasher.update(window.holdout_start.to_string().as_bytes());
    for date in &panel.dates {
        hasher.update(date.to_string().as_bytes());
    }
    for asset in &panel.assets {
        hasher.update(asset.id.as_bytes());
        for p in asset.adjusted.iter().chain(&asset.market) {
            hasher.update(p.to_le_bytes());
        }
    }
    let c = settings.constraints();
    hasher.update((c.asset_count as u64).to_le_bytes());
    hasher.update(c.max_weight.to_le_bytes());
    hasher.update(c.risk_free_rate.to_le_bytes());
    match c.target_return {
        Some(t) => {
            hasher.update([1u8]);
            hasher.update(t.to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
    hex::encode(hasher.finalize())
}
