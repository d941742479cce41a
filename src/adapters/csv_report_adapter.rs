//! CSV report adapter implementing `ReportPort`.
//!
//! Writes one file per table into the output directory so the comparison can
//! be loaded into a spreadsheet or a notebook.

use crate::domain::backtest::{BacktestResult, EquityPoint};
use crate::domain::comparison::{ComparisonReport, EQUAL_WEIGHT, MARKOWITZ, REINFORCEMENT};
use crate::domain::error::FiioptError;
use crate::domain::markowitz::Objective;
use crate::ports::report_port::ReportPort;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize)]
struct WeightRow<'a> {
    strategy: &'a str,
    asset: &'a str,
    weight: f64,
}

#[derive(Serialize)]
struct EquityRow<'a> {
    strategy: &'a str,
    date: NaiveDate,
    value: f64,
    period_return: f64,
}

#[derive(Serialize)]
struct MetricsRow<'a> {
    strategy: &'a str,
    periods: usize,
    final_value: f64,
    cumulative_return: f64,
    annualized_return: f64,
    annualized_volatility: f64,
    sharpe_ratio: f64,
    sortino_ratio: f64,
    max_drawdown: f64,
    max_drawdown_duration: usize,
}

impl<'a> From<&'a BacktestResult> for MetricsRow<'a> {
    fn from(result: &'a BacktestResult) -> Self {
        let m = &result.metrics;
        Self {
            strategy: &result.strategy,
            periods: m.periods,
            final_value: m.final_value,
            cumulative_return: m.cumulative_return,
            annualized_return: m.annualized_return,
            annualized_volatility: m.annualized_volatility,
            sharpe_ratio: m.sharpe_ratio,
            sortino_ratio: m.sortino_ratio,
            max_drawdown: m.max_drawdown,
            max_drawdown_duration: m.max_drawdown_duration,
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct MonthlyReturnRow<'a> {
    strategy: &'a str,
    year: i32,
    month: u32,
    #[serde(rename = "return")]
    compounded: f64,
}

#[derive(Serialize)]
struct SkippedRow<'a> {
    ticker: &'a str,
    reason: String,
}

#[derive(Serialize)]
struct SummaryRow {
    key: &'static str,
    value: String,
}

/// Compounded return per calendar month of an equity curve.
fn monthly_returns<'a>(strategy: &'a str, curve: &[EquityPoint]) -> Vec<MonthlyReturnRow<'a>> {
    let mut growth: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for point in curve {
        let key = (point.date.year(), point.date.month());
        *growth.entry(key).or_insert(1.0) *= 1.0 + point.period_return;
    }
    growth
        .into_iter()
        .map(|((year, month), g)| MonthlyReturnRow {
            strategy,
            year,
            month,
            compounded: g - 1.0,
        })
        .collect()
}

fn write_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<(), FiioptError> {
    let mut writer = csv::Writer::from_path(path).map_err(std::io::Error::from)?;
    for row in rows {
        writer.serialize(row).map_err(std::io::Error::from)?;
    }
    writer.flush()?;
    Ok(())
}

fn summary(report: &ComparisonReport) -> Vec<SummaryRow> {
    let row = |key, value: String| SummaryRow { key, value };
    let objective = match report.markowitz.objective {
        Objective::MinVariance { target_return } => {
            format!("min_variance(target_return={})", target_return)
        }
        Objective::MaxSharpe => "max_sharpe".to_string(),
    };
    vec![
        row("fingerprint", report.fingerprint.clone()),
        row("start_date", report.window.start.to_string()),
        row("holdout_start", report.window.holdout_start.to_string()),
        row("end_date", report.window.end.to_string()),
        row("fit_periods", report.fit_periods.to_string()),
        row(
            "holdout_periods",
            report.markowitz_backtest.curve.len().to_string(),
        ),
        row("selected", report.selected.join(" ")),
        row("markowitz_objective", objective),
        row(
            "markowitz_expected_return",
            report.markowitz.expected_return.to_string(),
        ),
        row("markowitz_volatility", report.markowitz.volatility.to_string()),
        row(
            "markowitz_sharpe_ratio",
            report.markowitz.sharpe_ratio.to_string(),
        ),
        row(
            "markowitz_used_fallback",
            report.markowitz.used_fallback.to_string(),
        ),
        row("training_seed", report.training.seed.to_string()),
        row("training_timesteps", report.training.timesteps.to_string()),
    ]
}

#[derive(Debug, Default)]
pub struct CsvReportAdapter;

impl CsvReportAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ReportPort for CsvReportAdapter {
    fn write(
        &self,
        report: &ComparisonReport,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, FiioptError> {
        fs::create_dir_all(output_dir)?;
        let mut written = Vec::new();
        let mut file = |name: &str| {
            let path = output_dir.join(name);
            written.push(path.clone());
            path
        };

        let benchmark_weights = report
            .benchmark
            .allocations
            .first()
            .map(|a| a.weights.clone())
            .unwrap_or_default();
        let weights = report
            .markowitz
            .weights
            .iter()
            .map(|(asset, weight)| WeightRow {
                strategy: MARKOWITZ,
                asset,
                weight,
            })
            .chain(report.rl_weights.iter().map(|(asset, weight)| WeightRow {
                strategy: REINFORCEMENT,
                asset,
                weight,
            }))
            .chain(
                report
                    .benchmark
                    .assets
                    .iter()
                    .zip(benchmark_weights)
                    .map(|(asset, weight)| WeightRow {
                        strategy: EQUAL_WEIGHT,
                        asset,
                        weight,
                    }),
            );
        write_rows(&file("weights.csv"), weights)?;

        let equity = report.backtests().into_iter().flat_map(|b| {
            b.curve.iter().map(move |p| EquityRow {
                strategy: &b.strategy,
                date: p.date,
                value: p.value,
                period_return: p.period_return,
            })
        });
        write_rows(&file("equity.csv"), equity)?;

        let metrics = report.backtests().into_iter().map(MetricsRow::from);
        write_rows(&file("metrics.csv"), metrics)?;

        let monthly = report
            .backtests()
            .into_iter()
            .flat_map(|b| monthly_returns(&b.strategy, &b.curve));
        write_rows(&file("monthly_returns.csv"), monthly)?;

        write_rows(&file("training.csv"), &report.training.phases)?;

        let skipped = report.skipped.iter().map(|s| SkippedRow {
            ticker: &s.id,
            reason: s.reason.to_string(),
        });
        write_rows(&file("skipped.csv"), skipped)?;

        write_rows(&file("summary.csv"), summary(report))?;

        info!("wrote {} report files to {}", written.len(), output_dir.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn point(y: i32, m: u32, d: u32, r: f64) -> EquityPoint {
        EquityPoint {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            value: 0.0,
            period_return: r,
        }
    }

    #[test]
    fn monthly_returns_compound_within_month() {
        let curve = vec![
            point(2023, 1, 30, 0.10),
            point(2023, 1, 31, -0.10),
            point(2023, 2, 1, 0.05),
        ];
        let rows = monthly_returns("rl", &curve);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].year, rows[0].month), (2023, 1));
        assert_abs_diff_eq!(rows[0].compounded, 1.1 * 0.9 - 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[1].compounded, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn monthly_returns_empty_curve() {
        assert!(monthly_returns("rl", &[]).is_empty());
    }

    #[test]
    fn write_rows_emits_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("w.csv");
        write_rows(
            &path,
            [WeightRow {
                strategy: MARKOWITZ,
                asset: "HGLG11",
                weight: 0.25,
            }],
        )
        .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "strategy,asset,weight\nmarkowitz,HGLG11,0.25\n");
    }

    #[test]
    fn equity_rows_serialize_iso_dates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("e.csv");
        write_rows(
            &path,
            [EquityRow {
                strategy: MARKOWITZ,
                date: NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
                value: 1.5,
                period_return: 0.5,
            }],
        )
        .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "strategy,date,value,period_return\nmarkowitz,2023-01-31,1.5,0.5\n"
        );
    }
}
