//! Asset universe construction.
//!
//! Aligns the adjusted-quota and market-quota tables into an [`AssetPanel`]:
//! every asset shares one gap-free date index. Tickers that cannot be used
//! are reported in [`UniverseValidationResult::skipped`], never dropped
//! silently.

use crate::domain::error::FiioptError;
use crate::domain::price_table::{PriceTable, QuotaKind};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

pub const DEFAULT_MIN_COVERAGE: f64 = 0.90;
pub const DEFAULT_MIN_OBSERVATIONS: usize = 60;

/// One fund with both quota series on the panel's date index.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: String,
    pub adjusted: Vec<f64>,
    pub market: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetPanel {
    pub dates: Vec<NaiveDate>,
    pub assets: Vec<Asset>,
}

impl AssetPanel {
    pub fn count(&self) -> usize {
        self.assets.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.id.clone()).collect()
    }

    /// Rows with `start <= date <= end`.
    pub fn window(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end).max(lo);
        Self {
            dates: self.dates[lo..hi].to_vec(),
            assets: self
                .assets
                .iter()
                .map(|a| Asset {
                    id: a.id.clone(),
                    adjusted: a.adjusted[lo..hi].to_vec(),
                    market: a.market[lo..hi].to_vec(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRules {
    /// Minimum fraction of dates a ticker must cover in each table.
    pub min_coverage: f64,
    /// Minimum number of aligned prices per asset.
    pub min_observations: usize,
    /// Carry prices forward over gaps before aligning dates.
    pub forward_fill: bool,
    /// Only dates before this one count towards coverage.
    pub coverage_before: Option<NaiveDate>,
}

impl Default for AlignmentRules {
    fn default() -> Self {
        Self {
            min_coverage: DEFAULT_MIN_COVERAGE,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
            forward_fill: false,
            coverage_before: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UniverseError {
    #[error("empty token in ticker list")]
    EmptyToken,

    #[error("duplicate ticker: {0}")]
    DuplicateTicker(String),
}

/// Parse a comma-separated ticker list, normalizing to upper case.
pub fn parse_tickers(input: &str) -> Result<Vec<String>, UniverseError> {
    let mut tickers = Vec::new();
    let mut seen = HashSet::new();

    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(UniverseError::EmptyToken);
        }
        let ticker = trimmed.to_uppercase();
        if !seen.insert(ticker.clone()) {
            return Err(UniverseError::DuplicateTicker(ticker));
        }
        tickers.push(ticker);
    }

    Ok(tickers)
}

#[derive(Debug, Clone)]
pub struct UniverseValidationResult {
    pub panel: AssetPanel,
    pub skipped: Vec<SkippedAsset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedAsset {
    pub id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    MissingSeries { kind: QuotaKind },
    LowCoverage { kind: QuotaKind, coverage: f64 },
    InsufficientHistory { observations: usize, minimum: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingSeries { kind } => write!(f, "no {kind} quota series"),
            SkipReason::LowCoverage { kind, coverage } => {
                write!(f, "{kind} quota coverage {:.1}%", coverage * 100.0)
            }
            SkipReason::InsufficientHistory {
                observations,
                minimum,
            } => write!(f, "{observations} observations, minimum {minimum}"),
        }
    }
}

/// Align the two quota tables into a gap-free panel.
///
/// Tickers short of `min_observations` on their own are excluded first. When
/// the dates shared by the rest still fall short, tickers are dropped one at
/// a time until they do not. `only` optionally restricts the candidate
/// tickers.
pub fn align_universe(
    adjusted: &PriceTable,
    market: &PriceTable,
    rules: &AlignmentRules,
    only: Option<&[String]>,
) -> Result<UniverseValidationResult, FiioptError> {
    let mut skipped = Vec::new();
    let mut candidates = Vec::new();

    let wanted: Option<HashSet<&str>> = only.map(|o| o.iter().map(String::as_str).collect());
    let mut all_tickers: Vec<&String> = adjusted
        .tickers()
        .iter()
        .chain(market.tickers().iter())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    if let Some(ref w) = wanted {
        all_tickers.retain(|t| w.contains(t.as_str()));
    }

    let fit_tables = match rules.coverage_before {
        Some(cutoff) => (adjusted.before(cutoff), market.before(cutoff)),
        None => (adjusted.clone(), market.clone()),
    };

    for ticker in all_tickers {
        let missing = if !adjusted.has_ticker(ticker) {
            Some(QuotaKind::Adjusted)
        } else if !market.has_ticker(ticker) {
            Some(QuotaKind::Market)
        } else {
            None
        };
        if let Some(kind) = missing {
            warn!("skipping {} (no {} quota series)", ticker, kind);
            skipped.push(SkippedAsset {
                id: ticker.clone(),
                reason: SkipReason::MissingSeries { kind },
            });
            continue;
        }

        let low = [(QuotaKind::Adjusted, &fit_tables.0), (QuotaKind::Market, &fit_tables.1)]
            .into_iter()
            .map(|(kind, table)| (kind, table.coverage(ticker)))
            .find(|(_, coverage)| *coverage < rules.min_coverage);
        if let Some((kind, coverage)) = low {
            warn!(
                "skipping {} ({} coverage {:.1}% below {:.1}%)",
                ticker,
                kind,
                coverage * 100.0,
                rules.min_coverage * 100.0
            );
            skipped.push(SkippedAsset {
                id: ticker.clone(),
                reason: SkipReason::LowCoverage { kind, coverage },
            });
            continue;
        }

        candidates.push(ticker.clone());
    }

    let (adjusted, market) = if rules.forward_fill {
        (adjusted.forward_fill(), market.forward_fill())
    } else {
        (adjusted.clone(), market.clone())
    };

    // Dates present in both tables.
    let market_rows: HashMap<NaiveDate, usize> = market
        .dates()
        .iter()
        .enumerate()
        .map(|(i, d)| (*d, i))
        .collect();
    let common: Vec<(NaiveDate, usize, usize)> = adjusted
        .dates()
        .iter()
        .enumerate()
        .filter_map(|(adj_row, date)| market_rows.get(date).map(|&m| (*date, adj_row, m)))
        .collect();

    let mut histories = Vec::new();
    let mut longest = 0;
    for ticker in candidates {
        let priced: Vec<bool> = common
            .iter()
            .map(|&(_, a, m)| {
                adjusted.get(&ticker, a).is_some() && market.get(&ticker, m).is_some()
            })
            .collect();
        let observations = priced.iter().filter(|&&p| p).count();
        longest = longest.max(observations);
        if observations < rules.min_observations {
            skip_short(&mut skipped, ticker, observations, rules.min_observations);
            continue;
        }
        histories.push((ticker, priced));
    }

    if histories.is_empty() {
        return Err(FiioptError::InsufficientHistory {
            asset: "universe".to_string(),
            observations: longest,
            minimum: rules.min_observations,
        });
    }
    for (ticker, observations) in prune_to_common_history(&mut histories, rules.min_observations) {
        skip_short(&mut skipped, ticker, observations, rules.min_observations);
    }

    let rows: Vec<(NaiveDate, usize, usize)> = common
        .iter()
        .enumerate()
        .filter(|(t, _)| histories.iter().all(|(_, priced)| priced[*t]))
        .map(|(_, row)| *row)
        .collect();
    let dates: Vec<NaiveDate> = rows.iter().map(|&(d, _, _)| d).collect();

    let assets: Vec<Asset> = histories
        .into_iter()
        .map(|(ticker, _)| {
            let adjusted_series = rows
                .iter()
                .map(|&(_, a, _)| adjusted.get(&ticker, a).unwrap_or(f64::NAN))
                .collect();
            let market_series = rows
                .iter()
                .map(|&(_, _, m)| market.get(&ticker, m).unwrap_or(f64::NAN))
                .collect();
            Asset {
                id: ticker,
                adjusted: adjusted_series,
                market: market_series,
            }
        })
        .collect();

    info!(
        "universe aligned: {} of {} tickers over {} dates",
        assets.len(),
        assets.len() + skipped.len(),
        dates.len()
    );

    Ok(UniverseValidationResult {
        panel: AssetPanel { dates, assets },
        skipped,
    })
}

fn skip_short(skipped: &mut Vec<SkippedAsset>, ticker: String, observations: usize, minimum: usize) {
    warn!(
        "skipping {} (only {} aligned prices, minimum {} required)",
        ticker, observations, minimum
    );
    skipped.push(SkippedAsset {
        id: ticker,
        reason: SkipReason::InsufficientHistory {
            observations,
            minimum,
        },
    });
}

/// Drop tickers until the dates priced by every survivor number at least
/// `minimum`, always removing the one whose absence adds the most dates.
/// Ties go to the ticker with the shorter own history, then the later id.
///
/// Each history must already hold `minimum` priced dates on its own, so a
/// single survivor always qualifies. Returns the dropped tickers with the
/// common history they had when removed.
fn prune_to_common_history(
    histories: &mut Vec<(String, Vec<bool>)>,
    minimum: usize,
) -> Vec<(String, usize)> {
    let mut dropped = Vec::new();
    loop {
        let Some(len) = histories.first().map(|(_, p)| p.len()) else {
            return dropped;
        };
        let missing: Vec<usize> = (0..len)
            .map(|t| histories.iter().filter(|(_, p)| !p[t]).count())
            .collect();
        let shared = missing.iter().filter(|&&m| m == 0).count();
        if shared >= minimum || histories.len() == 1 {
            return dropped;
        }

        let gain = |priced: &[bool]| {
            (0..len)
                .filter(|&t| missing[t] == 1 && !priced[t])
                .count()
        };
        let own = |priced: &[bool]| priced.iter().filter(|&&p| p).count();
        let worst = histories
            .iter()
            .enumerate()
            .max_by(|(_, (a_id, a)), (_, (b_id, b))| {
                gain(a.as_slice())
                    .cmp(&gain(b.as_slice()))
                    .then_with(|| own(b.as_slice()).cmp(&own(a.as_slice())))
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(i, _)| i);
        let Some(i) = worst else {
            return dropped;
        };
        let (ticker, _) = histories.remove(i);
        dropped.push((ticker, shared));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn table(rows: &[(u32, &str, f64)]) -> PriceTable {
        PriceTable::from_observations(rows.iter().map(|&(day, t, p)| (d(day), t.to_string(), p)))
    }

    fn asset<'a>(panel: &'a AssetPanel, id: &str) -> &'a Asset {
        panel.assets.iter().find(|a| a.id == id).unwrap()
    }

    fn rules(min_observations: usize) -> AlignmentRules {
        AlignmentRules {
            min_coverage: 0.5,
            min_observations,
            forward_fill: false,
            coverage_before: None,
        }
    }

    #[test]
    fn test_parse_tickers_basic() {
        let result = parse_tickers("hglg11, KNRI11 ,xpml11").unwrap();
        assert_eq!(result, vec!["HGLG11", "KNRI11", "XPML11"]);
    }

    #[test]
    fn test_parse_tickers_empty_token() {
        assert!(matches!(
            parse_tickers("HGLG11,,KNRI11"),
            Err(UniverseError::EmptyToken)
        ));
    }

    #[test]
    fn test_parse_tickers_duplicate() {
        let result = parse_tickers("HGLG11,KNRI11,hglg11");
        assert!(matches!(result, Err(UniverseError::DuplicateTicker(s)) if s == "HGLG11"));
    }

    #[test]
    fn aligns_on_common_complete_dates() {
        let adjusted = table(&[
            (1, "A", 10.0),
            (2, "A", 11.0),
            (3, "A", 12.0),
            (1, "B", 20.0),
            (3, "B", 21.0),
        ]);
        let market = table(&[
            (1, "A", 9.0),
            (2, "A", 10.0),
            (3, "A", 11.0),
            (1, "B", 19.0),
            (2, "B", 19.5),
            (3, "B", 20.0),
        ]);
        let result = align_universe(&adjusted, &market, &rules(2), None).unwrap();
        assert_eq!(result.panel.dates, vec![d(1), d(3)]);
        assert_eq!(result.panel.count(), 2);
        assert_eq!(asset(&result.panel, "B").adjusted, vec![20.0, 21.0]);
        assert_eq!(asset(&result.panel, "A").market, vec![9.0, 11.0]);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn forward_fill_keeps_gapped_dates() {
        let adjusted = table(&[(1, "A", 10.0), (2, "A", 11.0), (1, "B", 20.0)]);
        let market = table(&[(1, "A", 10.0), (2, "A", 11.0), (1, "B", 20.0), (2, "B", 20.5)]);
        let mut r = rules(2);
        r.forward_fill = true;
        let result = align_universe(&adjusted, &market, &r, None).unwrap();
        assert_eq!(result.panel.dates.len(), 2);
        assert_eq!(asset(&result.panel, "B").adjusted, vec![20.0, 20.0]);
    }

    #[test]
    fn reports_missing_series() {
        let adjusted = table(&[(1, "A", 10.0), (2, "A", 11.0), (1, "C", 5.0), (2, "C", 5.0)]);
        let market = table(&[(1, "A", 10.0), (2, "A", 11.0)]);
        let result = align_universe(&adjusted, &market, &rules(2), None).unwrap();
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].id, "C");
        assert_eq!(
            result.skipped[0].reason,
            SkipReason::MissingSeries {
                kind: QuotaKind::Market
            }
        );
    }

    #[test]
    fn reports_low_coverage() {
        let adjusted = table(&[
            (1, "A", 10.0),
            (2, "A", 11.0),
            (3, "A", 12.0),
            (4, "A", 13.0),
            (1, "B", 1.0),
        ]);
        let market = adjusted.clone();
        let result = align_universe(&adjusted, &market, &rules(2), None).unwrap();
        assert_eq!(result.panel.ids(), vec!["A"]);
        assert!(matches!(
            result.skipped[0].reason,
            SkipReason::LowCoverage { kind: QuotaKind::Adjusted, .. }
        ));
    }

    #[test]
    fn insufficient_history_fails_closed_when_nothing_left() {
        let adjusted = table(&[(1, "A", 10.0), (2, "A", 11.0)]);
        let market = adjusted.clone();
        let err = align_universe(&adjusted, &market, &rules(5), None).unwrap_err();
        assert!(matches!(
            err,
            FiioptError::InsufficientHistory { observations: 2, minimum: 5, .. }
        ));
    }

    #[test]
    fn only_filter_restricts_candidates() {
        let adjusted = table(&[(1, "A", 10.0), (2, "A", 11.0), (1, "B", 1.0), (2, "B", 1.1)]);
        let market = adjusted.clone();
        let only = vec!["B".to_string()];
        let result = align_universe(&adjusted, &market, &rules(2), Some(&only)).unwrap();
        assert_eq!(result.panel.ids(), vec!["B"]);
    }

    #[test]
    fn panel_window_is_inclusive() {
        let adjusted = table(&[
            (1, "A", 10.0),
            (2, "A", 11.0),
            (3, "A", 12.0),
            (1, "B", 1.0),
            (2, "B", 1.1),
            (3, "B", 1.2),
        ]);
        let market = adjusted.clone();
        let panel = align_universe(&adjusted, &market, &rules(2), None)
            .unwrap()
            .panel;
        let windowed = panel.window(d(2), d(3));
        assert_eq!(windowed.dates, vec![d(2), d(3)]);
        assert_eq!(asset(&windowed, "A").adjusted, vec![11.0, 12.0]);
    }

    fn day(n: i64) -> NaiveDate {
        d(1) + chrono::Duration::days(n)
    }

    /// `ticker` priced on days `range` of a 100-day calendar.
    fn listed(ticker: &str, range: std::ops::Range<i64>) -> Vec<(NaiveDate, String, f64)> {
        range
            .map(|n| (day(n), ticker.to_string(), 50.0 + n as f64))
            .collect()
    }

    #[test]
    fn late_and_delisted_tickers_do_not_sink_full_histories() {
        let mut obs = listed("A", 0..100);
        obs.extend(listed("B", 45..100));
        obs.extend(listed("C", 0..50));
        let adjusted = PriceTable::from_observations(obs);
        let market = adjusted.clone();

        let result = align_universe(&adjusted, &market, &rules(40), None).unwrap();

        assert_eq!(result.panel.ids(), vec!["A", "B"]);
        assert_eq!(result.panel.dates.len(), 55);
        assert_eq!(result.panel.dates[0], day(45));
        assert_eq!(
            result.skipped,
            vec![SkippedAsset {
                id: "C".to_string(),
                reason: SkipReason::InsufficientHistory {
                    observations: 5,
                    minimum: 40
                },
            }]
        );
    }

    #[test]
    fn short_history_is_excluded_per_asset() {
        let mut obs = listed("A", 0..10);
        obs.extend(listed("B", 7..10));
        let adjusted = PriceTable::from_observations(obs);
        let mut r = rules(5);
        r.min_coverage = 0.0;

        let result = align_universe(&adjusted, &adjusted.clone(), &r, None).unwrap();

        assert_eq!(result.panel.ids(), vec!["A"]);
        assert_eq!(result.panel.dates.len(), 10);
        assert_eq!(
            result.skipped[0].reason,
            SkipReason::InsufficientHistory {
                observations: 3,
                minimum: 5
            }
        );
    }

    #[test]
    fn empty_column_is_reported() {
        let table = PriceTable::from_columns(
            vec![d(1), d(2)],
            vec!["A".to_string(), "EMPTY".to_string()],
            vec![vec![Some(10.0), Some(11.0)], vec![None, None]],
        )
        .unwrap();

        let result = align_universe(&table, &table.clone(), &rules(2), None).unwrap();

        assert_eq!(result.panel.ids(), vec!["A"]);
        assert_eq!(result.skipped[0].id, "EMPTY");
        assert!(matches!(
            result.skipped[0].reason,
            SkipReason::LowCoverage { coverage, .. } if coverage == 0.0
        ));
    }

    #[test]
    fn coverage_counts_only_dates_before_cutoff() {
        let adjusted = table(&[
            (1, "A", 10.0),
            (2, "A", 11.0),
            (3, "A", 12.0),
            (4, "A", 13.0),
            (3, "B", 5.0),
            (4, "B", 5.5),
        ]);
        let market = adjusted.clone();

        let whole = align_universe(&adjusted, &market, &rules(2), None).unwrap();
        assert_eq!(whole.panel.ids(), vec!["A", "B"]);

        let mut r = rules(2);
        r.coverage_before = Some(d(3));
        let fit_only = align_universe(&adjusted, &market, &r, None).unwrap();
        assert_eq!(fit_only.panel.ids(), vec!["A"]);
        assert_eq!(fit_only.panel.dates.len(), 4);
        assert!(matches!(
            fit_only.skipped[0].reason,
            SkipReason::LowCoverage { kind: QuotaKind::Adjusted, .. }
        ));
    }
}
