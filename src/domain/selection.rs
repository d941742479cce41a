//! Pre-selection of the assets to allocate.
//!
//! When the universe holds more funds than requested, keep the ones with the
//! highest stand-alone Sharpe ratio `(mu_i - rf) / sigma_i`.

use crate::domain::error::FiioptError;
use nalgebra::DVector;
use std::cmp::Ordering;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedAsset {
    pub id: String,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe: f64,
}

/// Rank every asset by stand-alone Sharpe, best first. Ties go to the
/// alphabetically first ticker; zero-volatility assets rank last.
///
/// `expected` and `volatility` are annualized and indexed like `assets`.
pub fn rank_by_sharpe(
    assets: &[String],
    expected: &DVector<f64>,
    volatility: &DVector<f64>,
    risk_free_rate: f64,
) -> Vec<RankedAsset> {
    let mut ranked: Vec<RankedAsset> = assets
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let vol = volatility[i];
            let sharpe = if vol > 0.0 {
                (expected[i] - risk_free_rate) / vol
            } else {
                f64::NEG_INFINITY
            };
            RankedAsset {
                id: id.clone(),
                expected_return: expected[i],
                volatility: vol,
                sharpe,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.sharpe
            .partial_cmp(&a.sharpe)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Ids of the `count` best assets. Fails closed when fewer are available.
pub fn select_assets(
    assets: &[String],
    expected: &DVector<f64>,
    volatility: &DVector<f64>,
    risk_free_rate: f64,
    count: usize,
) -> Result<Vec<String>, FiioptError> {
    let available = assets.len();
    if expected.len() != available || volatility.len() != available {
        return Err(FiioptError::Data {
            reason: format!(
                "{} assets but {} expected returns and {} volatilities",
                available,
                expected.len(),
                volatility.len()
            ),
        });
    }
    if available < count {
        return Err(FiioptError::InsufficientHistory {
            asset: format!("universe ({} assets requested)", count),
            observations: available,
            minimum: count,
        });
    }
    if available == count {
        return Ok(assets.to_vec());
    }
    let selected: Vec<String> = rank_by_sharpe(assets, expected, volatility, risk_free_rate)
        .into_iter()
        .take(count)
        .map(|r| r.id)
        .collect();
    info!("selected {} of {} assets: {}", count, available, selected.join(","));
    Ok(selected)
}
