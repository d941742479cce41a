//! Performance metrics of an equity curve.
//!
//! Both strategies are measured with the same convention: annualized return
//! `(1 + mean)^ppy - 1` from the mean period return, annualized volatility
//! from the sample standard deviation, Sharpe as their excess ratio.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub periods: usize,
    pub final_value: f64,
    pub cumulative_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Largest peak-to-trough loss as a positive fraction.
    pub max_drawdown: f64,
    /// Longest run of periods spent below a previous peak.
    pub max_drawdown_duration: usize,
}

impl Metrics {
    /// `period_returns[t]` is the return that took the value from
    /// `values[t]` to `values[t + 1]`, with `values[0] = initial_capital`.
    pub fn compute(
        initial_capital: f64,
        period_returns: &[f64],
        risk_free_rate: f64,
        periods_per_year: f64,
    ) -> Self {
        let mut values = Vec::with_capacity(period_returns.len() + 1);
        values.push(initial_capital);
        let mut value = initial_capital;
        for r in period_returns {
            value *= 1.0 + r;
            values.push(value);
        }

        let cumulative_return = if initial_capital > 0.0 {
            (value - initial_capital) / initial_capital
        } else {
            0.0
        };

        let (annualized_return, annualized_volatility) =
            annualize(period_returns, periods_per_year);
        let sharpe_ratio = if annualized_volatility > 0.0 {
            (annualized_return - risk_free_rate) / annualized_volatility
        } else {
            0.0
        };
        let sortino_ratio = compute_sortino(
            period_returns,
            annualized_return,
            risk_free_rate,
            periods_per_year,
        );
        let (max_drawdown, max_drawdown_duration) = compute_drawdown(&values);

        Metrics {
            periods: period_returns.len(),
            final_value: value,
            cumulative_return,
            annualized_return,
            annualized_volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
        }
    }
}

fn annualize(returns: &[f64], periods_per_year: f64) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let annualized_return = (1.0 + mean).powf(periods_per_year) - 1.0;
    if returns.len() < 2 {
        return (annualized_return, 0.0);
    }
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (annualized_return, variance.sqrt() * periods_per_year.sqrt())
}

fn compute_sortino(
    returns: &[f64],
    annualized_return: f64,
    risk_free_rate: f64,
    periods_per_year: f64,
) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let period_rf = risk_free_rate / periods_per_year;
    let downside: f64 = returns
        .iter()
        .filter(|&&r| r < period_rf)
        .map(|&r| (r - period_rf).powi(2))
        .sum();
    let downside_dev = (downside / returns.len() as f64).sqrt() * periods_per_year.sqrt();
    if downside_dev > 0.0 {
        (annualized_return - risk_free_rate) / downside_dev
    } else {
        0.0
    }
}

fn compute_drawdown(values: &[f64]) -> (f64, usize) {
    let Some(&first) = values.first() else {
        return (0.0, 0);
    };

    let mut peak = first;
    let mut max_dd = 0.0_f64;
    let mut max_duration = 0usize;
    let mut duration = 0usize;

    for &v in values {
        if v >= peak {
            peak = v;
            duration = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - v) / peak);
            duration += 1;
            max_duration = max_duration.max(duration);
        }
    }

    (max_dd, max_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_curve() {
        let m = Metrics::compute(100.0, &[], 0.1, 252.0);
        assert_eq!(m.periods, 0);
        assert_abs_diff_eq!(m.cumulative_return, 0.0);
        assert_abs_diff_eq!(m.sharpe_ratio, 0.0);
        assert_abs_diff_eq!(m.final_value, 100.0);
    }

    #[test]
    fn cumulative_return_compounds() {
        let m = Metrics::compute(100.0, &[0.10, -0.05, 0.02], 0.0, 252.0);
        assert_abs_diff_eq!(m.final_value, 100.0 * 1.10 * 0.95 * 1.02, epsilon = 1e-9);
        assert_abs_diff_eq!(m.cumulative_return, 1.10 * 0.95 * 1.02 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn annualization_convention() {
        let r = [0.001, 0.003, -0.002, 0.002];
        let m = Metrics::compute(1.0, &r, 0.10, 252.0);
        let mean = 0.001;
        assert_abs_diff_eq!(m.annualized_return, 1.001_f64.powf(252.0) - 1.0, epsilon = 1e-12);
        let var = r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 3.0;
        assert_abs_diff_eq!(m.annualized_volatility, var.sqrt() * 252.0_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            m.sharpe_ratio,
            (m.annualized_return - 0.10) / m.annualized_volatility,
            epsilon = 1e-12
        );
    }

    #[test]
    fn zero_volatility_gives_zero_sharpe() {
        let m = Metrics::compute(100.0, &[0.0078125; 8], 0.0, 252.0);
        assert_abs_diff_eq!(m.annualized_volatility, 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(m.sharpe_ratio, 0.0);
        assert_abs_diff_eq!(m.max_drawdown, 0.0);
    }

    #[test]
    fn max_drawdown() {
        let (dd, _) = compute_drawdown(&[100.0, 110.0, 90.0, 95.0, 80.0, 100.0]);
        assert_abs_diff_eq!(dd, (110.0 - 80.0) / 110.0, epsilon = 1e-12);
    }

    #[test]
    fn max_drawdown_duration() {
        let (_, duration) = compute_drawdown(&[100.0, 110.0, 100.0, 90.0, 85.0, 95.0]);
        assert_eq!(duration, 4);
    }

    #[test]
    fn drawdown_counts_loss_from_initial_capital() {
        let m = Metrics::compute(100.0, &[-0.10, 0.05], 0.0, 252.0);
        assert_abs_diff_eq!(m.max_drawdown, 0.10, epsilon = 1e-12);
    }

    #[test]
    fn sortino_is_finite_with_losses() {
        let m = Metrics::compute(100.0, &[0.01, -0.005, 0.01, -0.015, 0.02], 0.0, 252.0);
        assert!(m.sortino_ratio.is_finite());
        assert!(m.sortino_ratio != 0.0);
    }
}
