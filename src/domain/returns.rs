//! Returns & risk model.
//!
//! Periodic simple returns come from adjusted quotas (they reflect
//! distributions and splits); the covariance comes from market-quota returns
//! over the same window. Both are annualized with `periods_per_year`.

use crate::domain::error::FiioptError;
use crate::domain::universe::AssetPanel;
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

const SYMMETRY_TOLERANCE: f64 = 1e-9;
const EIGEN_TOLERANCE: f64 = 1e-10;

/// Period-major matrix of simple returns: `rows[t][i]` is asset `i`'s return
/// between price `t` and price `t + 1`, dated at the later price.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnMatrix {
    dates: Vec<NaiveDate>,
    assets: Vec<String>,
    rows: Vec<Vec<f64>>,
}

/// Ordered returns of one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSeries {
    pub asset: String,
    pub returns: Vec<f64>,
}

impl ReturnSeries {
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.returns.is_empty() {
            0.0
        } else {
            self.returns.iter().sum::<f64>() / self.returns.len() as f64
        }
    }
}

impl ReturnMatrix {
    /// Simple returns `(p_t / p_{t-1}) - 1` of each price column.
    ///
    /// `prices[i]` is asset `i`'s price series on `dates`.
    pub fn from_prices(
        dates: &[NaiveDate],
        assets: Vec<String>,
        prices: &[&[f64]],
    ) -> Result<Self, FiioptError> {
        if prices.len() != assets.len() {
            return Err(FiioptError::Data {
                reason: format!(
                    "{} price series for {} assets",
                    prices.len(),
                    assets.len()
                ),
            });
        }
        if let Some((i, p)) = prices.iter().enumerate().find(|(_, p)| p.len() != dates.len()) {
            return Err(FiioptError::Data {
                reason: format!(
                    "{} has {} prices for {} dates",
                    assets[i],
                    p.len(),
                    dates.len()
                ),
            });
        }

        let periods = dates.len().saturating_sub(1);
        let mut rows = Vec::with_capacity(periods);
        for t in 1..dates.len() {
            let mut row = Vec::with_capacity(assets.len());
            for (i, series) in prices.iter().enumerate() {
                let prev = series[t - 1];
                let curr = series[t];
                if !(prev.is_finite() && curr.is_finite()) || prev <= 0.0 {
                    return Err(FiioptError::Data {
                        reason: format!("invalid price for {} on {}", assets[i], dates[t]),
                    });
                }
                row.push(curr / prev - 1.0);
            }
            rows.push(row);
        }

        Self::from_rows(dates.iter().skip(1).copied().collect(), assets, rows)
    }

    /// Returns of the adjusted quotas of every panel asset.
    pub fn adjusted(panel: &AssetPanel) -> Result<Self, FiioptError> {
        let prices: Vec<&[f64]> = panel.assets.iter().map(|a| a.adjusted.as_slice()).collect();
        Self::from_prices(&panel.dates, panel.ids(), &prices)
    }

    /// Returns of the market quotas of every panel asset.
    pub fn market(panel: &AssetPanel) -> Result<Self, FiioptError> {
        let prices: Vec<&[f64]> = panel.assets.iter().map(|a| a.market.as_slice()).collect();
        Self::from_prices(&panel.dates, panel.ids(), &prices)
    }

    /// Build directly from period rows. Every row must have one return per asset.
    pub fn from_rows(
        dates: Vec<NaiveDate>,
        assets: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, FiioptError> {
        if dates.len() != rows.len() {
            return Err(FiioptError::Data {
                reason: format!("{} dates for {} return rows", dates.len(), rows.len()),
            });
        }
        if let Some(row) = rows.iter().find(|r| r.len() != assets.len()) {
            return Err(FiioptError::Data {
                reason: format!("return row of {} values for {} assets", row.len(), assets.len()),
            });
        }
        Ok(Self {
            dates,
            assets,
            rows,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn periods(&self) -> usize {
        self.rows.len()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn all_series(&self) -> Vec<ReturnSeries> {
        (0..self.assets.len())
            .map(|i| ReturnSeries {
                asset: self.assets[i].clone(),
                returns: self.rows.iter().map(|r| r[i]).collect(),
            })
            .collect()
    }

    /// Restrict to `assets`, in that order.
    pub fn select(&self, assets: &[String]) -> Result<Self, FiioptError> {
        let idx = assets
            .iter()
            .map(|a| {
                self.assets
                    .iter()
                    .position(|x| x == a)
                    .ok_or_else(|| FiioptError::Data {
                        reason: format!("no return series for {}", a),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dates: self.dates.clone(),
            assets: assets.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|&i| r[i]).collect())
                .collect(),
        })
    }

    /// Periods in `range` (by index).
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        Self {
            dates: self.dates[start..end].to_vec(),
            assets: self.assets.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// `periods x assets` matrix view for the estimators.
    fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.rows.len(), self.assets.len(), |t, i| self.rows[t][i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovarianceEstimator {
    /// Unbiased sample covariance.
    #[default]
    Sample,
    /// Ledoit-Wolf shrinkage towards a scaled identity.
    LedoitWolf,
}

impl std::str::FromStr for CovarianceEstimator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sample" => Ok(CovarianceEstimator::Sample),
            "ledoit_wolf" | "ledoit-wolf" | "ledoitwolf" => Ok(CovarianceEstimator::LedoitWolf),
            other => Err(format!("unknown covariance estimator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedReturnMethod {
    /// Mean periodic return times periods per year.
    #[default]
    Arithmetic,
    /// Geometric growth rate compounded to a year.
    Compounded,
}

impl std::str::FromStr for ExpectedReturnMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "arithmetic" | "mean" => Ok(ExpectedReturnMethod::Arithmetic),
            "compounded" | "geometric" | "cagr" => Ok(ExpectedReturnMethod::Compounded),
            other => Err(format!("unknown expected return method '{}'", other)),
        }
    }
}

/// Annualized expected returns of every column of `returns`.
pub fn expected_returns(
    returns: &ReturnMatrix,
    method: ExpectedReturnMethod,
    periods_per_year: f64,
) -> DVector<f64> {
    let n = returns.periods();
    DVector::from_iterator(
        returns.asset_count(),
        returns.all_series().iter().map(|s| {
            if n == 0 {
                return 0.0;
            }
            match method {
                ExpectedReturnMethod::Arithmetic => s.mean() * periods_per_year,
                ExpectedReturnMethod::Compounded => {
                    let growth: f64 = s.returns.iter().map(|r| 1.0 + r).product();
                    growth.powf(periods_per_year / n as f64) - 1.0
                }
            }
        }),
    )
}

/// Annualized stand-alone volatility of every column (unbiased, n-1),
/// without forming the covariance matrix.
pub fn asset_volatilities(returns: &ReturnMatrix, periods_per_year: f64) -> DVector<f64> {
    let n = returns.periods();
    DVector::from_iterator(
        returns.asset_count(),
        returns.all_series().iter().map(|s| {
            if n < 2 {
                return 0.0;
            }
            let mean = s.mean();
            let var = s.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            (var * periods_per_year).sqrt()
        }),
    )
}

/// Annualized covariance and volatility of a set of assets.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskModel {
    pub assets: Vec<String>,
    pub covariance: DMatrix<f64>,
    pub volatility: DVector<f64>,
    pub observations: usize,
}

impl RiskModel {
    /// Estimate from market-quota returns.
    ///
    /// Fails with `NumericalInstability` when the result is not a finite,
    /// symmetric, positive semi-definite matrix, or when the sample estimator
    /// has no more observations than assets.
    pub fn estimate(
        returns: &ReturnMatrix,
        estimator: CovarianceEstimator,
        periods_per_year: f64,
    ) -> Result<Self, FiioptError> {
        let n_assets = returns.asset_count();
        let n_obs = returns.periods();
        if n_assets == 0 {
            return Err(FiioptError::Data {
                reason: "risk model needs at least one asset".to_string(),
            });
        }
        if n_obs < 2 {
            return Err(FiioptError::InsufficientHistory {
                asset: "risk model".to_string(),
                observations: n_obs,
                minimum: 2,
            });
        }
        if estimator == CovarianceEstimator::Sample && n_obs <= n_assets {
            return Err(FiioptError::NumericalInstability {
                reason: format!(
                    "sample covariance from {} observations for {} assets is singular",
                    n_obs, n_assets
                ),
            });
        }

        let x = returns.to_matrix();
        let periodic = match estimator {
            CovarianceEstimator::Sample => sample_covariance(&x),
            CovarianceEstimator::LedoitWolf => ledoit_wolf(&x),
        };
        let covariance = periodic * periods_per_year;
        check_psd(&covariance)?;

        let volatility = DVector::from_iterator(
            n_assets,
            (0..n_assets).map(|i| covariance[(i, i)].max(0.0).sqrt()),
        );

        debug!(
            "risk model: {} assets, {} observations, {:?}",
            n_assets, n_obs, estimator
        );

        Ok(Self {
            assets: returns.assets().to_vec(),
            covariance,
            volatility,
            observations: n_obs,
        })
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Annualized variance `wᵀΣw`.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let w = DVector::from_column_slice(weights);
        (w.transpose() * &self.covariance * &w)[(0, 0)]
    }

    pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
        self.portfolio_variance(weights).max(0.0).sqrt()
    }

    pub fn max_eigenvalue(&self) -> f64 {
        SymmetricEigen::new(self.covariance.clone())
            .eigenvalues
            .iter()
            .copied()
            .fold(0.0, f64::max)
    }
}

fn centered(x: &DMatrix<f64>) -> DMatrix<f64> {
    let means = x.row_mean();
    DMatrix::from_fn(x.nrows(), x.ncols(), |t, i| x[(t, i)] - means[i])
}

fn sample_covariance(x: &DMatrix<f64>) -> DMatrix<f64> {
    let n = x.nrows() as f64;
    let c = centered(x);
    (c.transpose() * &c) / (n - 1.0)
}

/// Ledoit-Wolf shrinkage of the (biased) empirical covariance towards
/// `mu * I`, `mu` being the average variance.
fn ledoit_wolf(x: &DMatrix<f64>) -> DMatrix<f64> {
    let n = x.nrows() as f64;
    let p = x.ncols();
    let c = centered(x);
    let emp = (c.transpose() * &c) / n;
    let mu = emp.trace() / p as f64;

    let c2 = c.map(|v| v * v);
    let beta_matrix = (c2.transpose() * &c2) / n - emp.map(|v| v * v);
    let beta_raw = beta_matrix.sum() / (p as f64 * n);

    let target = DMatrix::<f64>::identity(p, p) * mu;
    let delta = (&emp - &target).map(|v| v * v).sum() / p as f64;

    let shrinkage = if delta > 0.0 {
        beta_raw.min(delta) / delta
    } else {
        0.0
    };
    debug!("ledoit-wolf shrinkage {:.4}", shrinkage);
    emp * (1.0 - shrinkage) + target * shrinkage
}

fn check_psd(covariance: &DMatrix<f64>) -> Result<(), FiioptError> {
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(FiioptError::NumericalInstability {
            reason: "covariance contains non-finite values".to_string(),
        });
    }
    let scale = covariance.amax().max(f64::MIN_POSITIVE);
    let asymmetry = (covariance - covariance.transpose()).amax();
    if asymmetry > SYMMETRY_TOLERANCE * scale {
        return Err(FiioptError::NumericalInstability {
            reason: format!("covariance is not symmetric (max deviation {:e})", asymmetry),
        });
    }
    let eigen = SymmetricEigen::new(covariance.clone());
    let min_eigen = eigen.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_eigen < -EIGEN_TOLERANCE * scale.max(1.0) {
        return Err(FiioptError::NumericalInstability {
            reason: format!(
                "covariance is not positive semi-definite (min eigenvalue {:e})",
                min_eigen
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn matrix(rows: Vec<Vec<f64>>) -> ReturnMatrix {
        let dates = (1..=rows.len() as u32).map(d).collect();
        let assets = (0..rows[0].len()).map(|i| format!("A{}", i)).collect();
        ReturnMatrix::from_rows(dates, assets, rows).unwrap()
    }

    #[test]
    fn simple_returns_from_prices() {
        let a = [100.0, 110.0, 99.0];
        let b = [50.0, 50.0, 55.0];
        let m = ReturnMatrix::from_prices(
            &[d(1), d(2), d(3)],
            vec!["A".into(), "B".into()],
            &[&a, &b],
        )
        .unwrap();
        assert_eq!(m.periods(), 2);
        assert_eq!(m.dates(), &[d(2), d(3)]);
        assert_relative_eq!(m.rows()[0][0], 0.10, epsilon = 1e-12);
        assert_relative_eq!(m.rows()[1][0], -0.10, epsilon = 1e-12);
        assert_relative_eq!(m.rows()[1][1], 0.10, epsilon = 1e-12);
    }

    #[test]
    fn invalid_price_is_reported() {
        let a = [100.0, 0.0, 99.0];
        let err = ReturnMatrix::from_prices(&[d(1), d(2), d(3)], vec!["A".into()], &[&a])
            .unwrap_err();
        assert!(matches!(err, FiioptError::Data { .. }));
    }

    #[test]
    fn asset_volatilities_match_sample_diagonal() {
        let m = matrix(vec![
            vec![0.01, 0.02, -0.01],
            vec![-0.02, 0.00, 0.03],
            vec![0.015, -0.01, 0.00],
            vec![0.00, 0.01, 0.02],
            vec![0.005, 0.03, -0.02],
        ]);
        let risk = RiskModel::estimate(&m, CovarianceEstimator::Sample, 252.0).unwrap();
        let vols = asset_volatilities(&m, 252.0);
        for i in 0..3 {
            assert_relative_eq!(vols[i], risk.volatility[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn asset_volatilities_need_no_more_periods_than_assets() {
        let rows = (0..3)
            .map(|t| (0..6).map(|i| 0.001 * ((t * 7 + i) % 5) as f64).collect())
            .collect();
        let m = matrix(rows);
        let vols = asset_volatilities(&m, 252.0);
        assert_eq!(vols.len(), 6);
        assert!(vols.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn series_and_select() {
        let m = matrix(vec![vec![0.01, 0.02], vec![0.03, 0.04]]);
        let s = &m.all_series()[1];
        assert_eq!(s.asset, "A1");
        assert_eq!(s.returns, vec![0.02, 0.04]);
        assert_relative_eq!(s.mean(), 0.03, epsilon = 1e-12);
        let sel = m.select(&["A1".to_string()]).unwrap();
        assert_eq!(sel.rows(), &[vec![0.02], vec![0.04]]);
        assert!(m.select(&["ZZ".to_string()]).is_err());
    }

    #[test]
    fn arithmetic_expected_returns_are_annualized_means() {
        let m = matrix(vec![vec![0.01], vec![0.03]]);
        let mu = expected_returns(&m, ExpectedReturnMethod::Arithmetic, 252.0);
        assert_relative_eq!(mu[0], 0.02 * 252.0, epsilon = 1e-12);
    }

    #[test]
    fn compounded_expected_returns() {
        let m = matrix(vec![vec![0.10], vec![0.10]]);
        let mu = expected_returns(&m, ExpectedReturnMethod::Compounded, 2.0);
        assert_relative_eq!(mu[0], 0.21, epsilon = 1e-12);
    }

    #[test]
    fn sample_covariance_matches_hand_computation() {
        let m = matrix(vec![
            vec![0.01, 0.02],
            vec![0.03, 0.00],
            vec![0.02, 0.01],
        ]);
        let risk = RiskModel::estimate(&m, CovarianceEstimator::Sample, 1.0).unwrap();
        // var(A0) = ((-.01)^2 + (.01)^2 + 0) / 2 = 1e-4
        assert_relative_eq!(risk.covariance[(0, 0)], 1e-4, epsilon = 1e-15);
        // cov = ((-.01)(.01) + (.01)(-.01) + 0) / 2 = -1e-4
        assert_relative_eq!(risk.covariance[(0, 1)], -1e-4, epsilon = 1e-15);
        assert_relative_eq!(risk.volatility[0], 1e-2, epsilon = 1e-12);
    }

    #[test]
    fn covariance_is_annualized() {
        let m = matrix(vec![
            vec![0.01, 0.02],
            vec![0.03, 0.00],
            vec![0.02, 0.01],
        ]);
        let daily = RiskModel::estimate(&m, CovarianceEstimator::Sample, 1.0).unwrap();
        let annual = RiskModel::estimate(&m, CovarianceEstimator::Sample, 252.0).unwrap();
        assert_relative_eq!(
            annual.covariance[(0, 1)],
            daily.covariance[(0, 1)] * 252.0,
            epsilon = 1e-15
        );
    }

    #[test]
    fn sample_estimator_rejects_too_few_observations() {
        let m = matrix(vec![vec![0.01, 0.02, 0.0], vec![0.03, 0.00, 0.01]]);
        let err = RiskModel::estimate(&m, CovarianceEstimator::Sample, 252.0).unwrap_err();
        assert!(matches!(err, FiioptError::NumericalInstability { .. }));
    }

    #[test]
    fn ledoit_wolf_handles_few_observations() {
        let m = matrix(vec![vec![0.01, 0.02, 0.0], vec![0.03, 0.00, 0.01]]);
        let risk = RiskModel::estimate(&m, CovarianceEstimator::LedoitWolf, 252.0).unwrap();
        let eig = SymmetricEigen::new(risk.covariance.clone()).eigenvalues;
        assert!(eig.iter().all(|&e| e >= -1e-12));
    }

    #[test]
    fn ledoit_wolf_shrinks_off_diagonal() {
        let m = matrix(vec![
            vec![0.01, 0.012],
            vec![-0.02, -0.018],
            vec![0.015, 0.011],
            vec![0.0, 0.002],
        ]);
        let sample = RiskModel::estimate(&m, CovarianceEstimator::Sample, 1.0).unwrap();
        let shrunk = RiskModel::estimate(&m, CovarianceEstimator::LedoitWolf, 1.0).unwrap();
        assert!(shrunk.covariance[(0, 1)].abs() <= sample.covariance[(0, 1)].abs());
    }

    #[test]
    fn non_finite_returns_are_numerical_instability() {
        let m = matrix(vec![vec![0.01], vec![f64::NAN], vec![0.02]]);
        let err = RiskModel::estimate(&m, CovarianceEstimator::Sample, 252.0).unwrap_err();
        assert!(matches!(err, FiioptError::NumericalInstability { .. }));
    }

    #[test]
    fn covariance_of_a_selection_is_the_full_sub_block() {
        let m = matrix(vec![
            vec![0.01, 0.02, -0.01],
            vec![0.03, 0.00, 0.02],
            vec![0.02, 0.01, 0.00],
            vec![-0.01, 0.03, 0.01],
        ]);
        let full = RiskModel::estimate(&m, CovarianceEstimator::Sample, 1.0).unwrap();
        let picked = m.select(&["A2".to_string(), "A0".to_string()]).unwrap();
        let part = RiskModel::estimate(&picked, CovarianceEstimator::Sample, 1.0).unwrap();
        assert_eq!(part.assets, vec!["A2", "A0"]);
        assert_relative_eq!(part.covariance[(0, 0)], full.covariance[(2, 2)], epsilon = 1e-15);
        assert_relative_eq!(part.covariance[(0, 1)], full.covariance[(2, 0)], epsilon = 1e-15);
        assert_relative_eq!(part.volatility[1], full.volatility[0], epsilon = 1e-15);
    }

    #[test]
    fn portfolio_variance_of_single_asset() {
        let m = matrix(vec![
            vec![0.01, 0.02],
            vec![0.03, 0.00],
            vec![0.02, 0.01],
        ]);
        let risk = RiskModel::estimate(&m, CovarianceEstimator::Sample, 1.0).unwrap();
        assert_relative_eq!(risk.portfolio_variance(&[1.0, 0.0]), 1e-4, epsilon = 1e-15);
        // perfectly negatively correlated, equal variance
        assert_relative_eq!(risk.portfolio_variance(&[0.5, 0.5]), 0.0, epsilon = 1e-15);
    }
}
