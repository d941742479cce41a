//! Configuration validation.
//!
//! Validates every config field before any data is loaded.

use crate::domain::environment::RiskPenalty;
use crate::domain::error::FiioptError;
use crate::domain::returns::{CovarianceEstimator, ExpectedReturnMethod};
use crate::domain::universe::parse_tickers;
use crate::ports::config_port::ConfigPort;

pub fn validate_config(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    validate_data_config(config)?;
    validate_optimization_config(config)?;
    validate_drl_config(config)?;
    validate_backtest_config(config)?;
    Ok(())
}

pub fn validate_data_config(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    validate_paths(config)?;
    validate_dates(config)?;
    validate_coverage(config)?;
    validate_min_observations(config)?;
    validate_tickers(config)?;
    Ok(())
}

pub fn validate_optimization_config(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    validate_asset_count(config)?;
    validate_max_weight(config)?;
    validate_risk_free_rate(config)?;
    validate_target_return(config)?;
    validate_estimators(config)?;
    validate_cap_covers_assets(config)?;
    Ok(())
}

pub fn validate_drl_config(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    validate_timesteps_and_seed(config)?;
    validate_lookback(config)?;
    validate_penalty(config)?;
    validate_reward(config)?;
    validate_hyperparameters(config)?;
    Ok(())
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(capital) = config.get_optional_double("backtest", "initial_capital")? {
        if capital <= 0.0 {
            return Err(FiioptError::invalid(
                "backtest",
                "initial_capital",
                "initial_capital must be positive",
            ));
        }
    }
    if config.get_optional_usize("backtest", "rebalance_every")? == Some(0) {
        return Err(FiioptError::invalid(
            "backtest",
            "rebalance_every",
            "rebalance_every must be at least 1",
        ));
    }
    Ok(())
}

fn validate_paths(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    for key in ["adjusted_path", "market_path"] {
        match config.get_string("data", key) {
            Some(s) if !s.trim().is_empty() => {}
            _ => return Err(FiioptError::missing("data", key)),
        }
    }
    Ok(())
}

fn validate_dates(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    let start = config.get_date("data", "start_date")?;
    let end = config.get_date("data", "end_date")?;
    let holdout = config.get_date("data", "holdout_start")?;

    if start >= end {
        return Err(FiioptError::invalid(
            "data",
            "start_date",
            "start_date must be before end_date",
        ));
    }
    if holdout <= start || holdout > end {
        return Err(FiioptError::invalid(
            "data",
            "holdout_start",
            "holdout_start must be after start_date and not after end_date",
        ));
    }
    Ok(())
}

fn validate_coverage(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_double("data", "min_coverage")? {
        if !(value > 0.0 && value <= 1.0) {
            return Err(FiioptError::invalid(
                "data",
                "min_coverage",
                "min_coverage must be in (0, 1]",
            ));
        }
    }
    Ok(())
}

fn validate_min_observations(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_usize("data", "min_observations")? {
        if value < 2 {
            return Err(FiioptError::invalid(
                "data",
                "min_observations",
                "min_observations must be at least 2",
            ));
        }
    }
    Ok(())
}

fn validate_tickers(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    match config.get_string("data", "tickers") {
        Some(s) if !s.trim().is_empty() => parse_tickers(&s)
            .map(|_| ())
            .map_err(|e| FiioptError::invalid("data", "tickers", e.to_string())),
        _ => Ok(()),
    }
}

fn validate_asset_count(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    match config.get_optional_usize("optimization", "asset_count")? {
        None => Err(FiioptError::missing("optimization", "asset_count")),
        Some(0) => Err(FiioptError::invalid(
            "optimization",
            "asset_count",
            "asset_count must be at least 1",
        )),
        Some(_) => Ok(()),
    }
}

fn validate_max_weight(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    match config.get_optional_double("optimization", "max_weight_per_asset")? {
        None => Err(FiioptError::missing("optimization", "max_weight_per_asset")),
        Some(v) if !(v > 0.0 && v <= 1.0) => Err(FiioptError::invalid(
            "optimization",
            "max_weight_per_asset",
            "max_weight_per_asset must be in (0, 1]",
        )),
        Some(_) => Ok(()),
    }
}

fn validate_risk_free_rate(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_double("optimization", "risk_free_rate")? {
        if !(0.0..1.0).contains(&value) {
            return Err(FiioptError::invalid(
                "optimization",
                "risk_free_rate",
                "risk_free_rate must be between 0 and 1",
            ));
        }
    }
    Ok(())
}

fn validate_target_return(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_double("optimization", "target_return")? {
        if !value.is_finite() {
            return Err(FiioptError::invalid(
                "optimization",
                "target_return",
                "target_return must be finite",
            ));
        }
    }
    Ok(())
}

fn validate_estimators(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(s) = config.get_string("optimization", "covariance") {
        s.parse::<CovarianceEstimator>()
            .map_err(|e| FiioptError::invalid("optimization", "covariance", e))?;
    }
    if let Some(s) = config.get_string("optimization", "expected_returns") {
        s.parse::<ExpectedReturnMethod>()
            .map_err(|e| FiioptError::invalid("optimization", "expected_returns", e))?;
    }
    Ok(())
}

fn validate_cap_covers_assets(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    let count = config
        .get_optional_usize("optimization", "asset_count")?
        .unwrap_or(0);
    let cap = config
        .get_optional_double("optimization", "max_weight_per_asset")?
        .unwrap_or(0.0);
    if cap * (count as f64) < 1.0 - 1e-12 {
        return Err(FiioptError::InfeasibleConstraints {
            reason: format!("max weight {} times {} assets is below 1", cap, count),
            asset_count: count,
            max_weight: cap,
            target_return: config.get_optional_double("optimization", "target_return")?,
        });
    }
    Ok(())
}

fn validate_timesteps_and_seed(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    config.get_optional_usize("drl", "training_timesteps")?;
    if let Some(s) = config.get_string("drl", "random_seed") {
        if !s.trim().is_empty() && s.trim().parse::<u64>().is_err() {
            return Err(FiioptError::invalid(
                "drl",
                "random_seed",
                "random_seed must be a non-negative integer",
            ));
        }
    }
    Ok(())
}

fn validate_lookback(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_usize("drl", "lookback")? {
        if value < 2 {
            return Err(FiioptError::invalid(
                "drl",
                "lookback",
                "lookback must be at least 2 periods",
            ));
        }
    }
    Ok(())
}

fn validate_penalty(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    if let Some(value) = config.get_optional_double("drl", "risk_penalty")? {
        if !(value.is_finite() && value >= 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "risk_penalty",
                "risk_penalty must be non-negative",
            ));
        }
    }
    if let Some(s) = config.get_string("drl", "penalty") {
        s.parse::<RiskPenalty>()
            .map_err(|e| FiioptError::invalid("drl", "penalty", e))?;
    }
    Ok(())
}

fn validate_reward(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    match config.get_string("drl", "reward").as_deref().map(str::trim) {
        None | Some("") | Some("risk_adjusted") => Ok(()),
        Some("target_tracking") => {
            if config
                .get_optional_double("optimization", "target_return")?
                .is_none()
            {
                return Err(FiioptError::invalid(
                    "drl",
                    "reward",
                    "target_tracking reward needs [optimization] target_return",
                ));
            }
            Ok(())
        }
        Some(other) => Err(FiioptError::invalid(
            "drl",
            "reward",
            format!(
                "unknown reward '{}', expected risk_adjusted or target_tracking",
                other
            ),
        )),
    }
}

fn validate_hyperparameters(config: &dyn ConfigPort) -> Result<(), FiioptError> {
    for key in ["learning_rate", "exploration_std", "max_grad_norm"] {
        if let Some(value) = config.get_optional_double("drl", key)? {
            if !(value.is_finite() && value > 0.0) {
                return Err(FiioptError::invalid(
                    "drl",
                    key,
                    format!("{} must be positive", key),
                ));
            }
        }
    }
    if let Some(value) = config.get_optional_double("drl", "discount")? {
        if !(0.0..=1.0).contains(&value) {
            return Err(FiioptError::invalid(
                "drl",
                "discount",
                "discount must be in [0, 1]",
            ));
        }
    }
    if config.get_optional_usize("drl", "envs_per_phase")? == Some(0) {
        return Err(FiioptError::invalid(
            "drl",
            "envs_per_phase",
            "envs_per_phase must be at least 1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    const VALID: &str = r#"
[data]
adjusted_path = data/Base Cota Ajustada.csv
market_path = data/Base Cota Mercado.csv
start_date = 2019-01-01
end_date = 2023-12-31
holdout_start = 2022-01-01
min_coverage = 0.9
min_observations = 120

[optimization]
asset_count = 5
max_weight_per_asset = 0.3
risk_free_rate = 0.10
covariance = ledoit_wolf

[drl]
training_timesteps = 20000
random_seed = 42
lookback = 30
risk_penalty = 0.1
penalty = drawdown

[backtest]
initial_capital = 100
rebalance_every = 1
"#;

    fn replace(key_line: &str, with: &str) -> FileConfigAdapter {
        make_config(&VALID.replace(key_line, with))
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate_config(&make_config(VALID)).is_ok());
    }

    #[test]
    fn missing_adjusted_path_fails() {
        let config = replace("adjusted_path = data/Base Cota Ajustada.csv", "");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigMissing { key, .. } if key == "adjusted_path"));
    }

    #[test]
    fn invalid_date_format_fails() {
        let config = replace("start_date = 2019-01-01", "start_date = 2019/01/01");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "start_date"));
    }

    #[test]
    fn missing_holdout_fails() {
        let config = replace("holdout_start = 2022-01-01", "");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigMissing { key, .. } if key == "holdout_start"));
    }

    #[test]
    fn holdout_after_end_fails() {
        let config = replace("holdout_start = 2022-01-01", "holdout_start = 2024-01-01");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "holdout_start"));
    }

    #[test]
    fn start_after_end_fails() {
        let config = replace("start_date = 2019-01-01", "start_date = 2024-06-01");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "start_date"));
    }

    #[test]
    fn coverage_out_of_range_fails() {
        let config = replace("min_coverage = 0.9", "min_coverage = 1.5");
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "min_coverage"));
    }

    #[test]
    fn duplicate_tickers_fail() {
        let config = replace(
            "min_observations = 120",
            "min_observations = 120\ntickers = HGLG11,hglg11",
        );
        let err = validate_data_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "tickers"));
    }

    #[test]
    fn missing_asset_count_fails() {
        let config = replace("asset_count = 5", "");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigMissing { key, .. } if key == "asset_count"));
    }

    #[test]
    fn non_numeric_asset_count_fails() {
        let config = replace("asset_count = 5", "asset_count = five");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "asset_count"));
    }

    #[test]
    fn max_weight_above_one_fails() {
        let config = replace("max_weight_per_asset = 0.3", "max_weight_per_asset = 1.2");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(
            matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "max_weight_per_asset")
        );
    }

    #[test]
    fn cap_too_small_for_asset_count_is_infeasible() {
        let config = replace("max_weight_per_asset = 0.3", "max_weight_per_asset = 0.15");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(matches!(
            err,
            FiioptError::InfeasibleConstraints { asset_count: 5, .. }
        ));
    }

    #[test]
    fn risk_free_rate_out_of_range_fails() {
        let config = replace("risk_free_rate = 0.10", "risk_free_rate = 10");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "risk_free_rate"));
    }

    #[test]
    fn unknown_covariance_fails() {
        let config = replace("covariance = ledoit_wolf", "covariance = oas");
        let err = validate_optimization_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "covariance"));
    }

    #[test]
    fn negative_seed_fails() {
        let config = replace("random_seed = 42", "random_seed = -1");
        let err = validate_drl_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "random_seed"));
    }

    #[test]
    fn short_lookback_fails() {
        let config = replace("lookback = 30", "lookback = 1");
        let err = validate_drl_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "lookback"));
    }

    #[test]
    fn unknown_penalty_fails() {
        let config = replace("penalty = drawdown", "penalty = cvar");
        let err = validate_drl_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "penalty"));
    }

    #[test]
    fn target_tracking_without_target_fails() {
        let config = replace("penalty = drawdown", "reward = target_tracking");
        let err = validate_drl_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "reward"));
    }

    #[test]
    fn target_tracking_with_target_passes() {
        let config = make_config(&VALID.replace(
            "covariance = ledoit_wolf",
            "covariance = ledoit_wolf\ntarget_return = 0.12",
        )
        .replace("penalty = drawdown", "reward = target_tracking"));
        assert!(validate_drl_config(&config).is_ok());
    }

    #[test]
    fn zero_rebalance_fails() {
        let config = replace("rebalance_every = 1", "rebalance_every = 0");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "rebalance_every"));
    }

    #[test]
    fn non_positive_capital_fails() {
        let config = replace("initial_capital = 100", "initial_capital = 0");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, FiioptError::ConfigInvalid { key, .. } if key == "initial_capital"));
    }
}
