//! Wide price tables keyed by (date, ticker).
//!
//! A [`PriceTable`] holds one quota series (adjusted or market) for many
//! tickers on a shared, ascending date index. Missing cells are `None`.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};

/// Which quota series a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    /// Quota adjusted for distributions and splits; drives returns.
    Adjusted,
    /// Raw market quota; drives the risk model.
    Market,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::Adjusted => write!(f, "adjusted"),
            QuotaKind::Market => write!(f, "market"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    tickers: Vec<String>,
    /// Column-major: `columns[ticker_idx][date_idx]`.
    columns: Vec<Vec<Option<f64>>>,
    ticker_index: HashMap<String, usize>,
}

impl PriceTable {
    /// Build a table from unordered `(date, ticker, price)` observations.
    ///
    /// Dates are sorted and deduplicated; a later observation for the same
    /// cell overwrites an earlier one. Non-finite or non-positive prices are
    /// stored as missing.
    pub fn from_observations<I>(observations: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, String, f64)>,
    {
        let observations: Vec<(NaiveDate, String, f64)> = observations.into_iter().collect();
        let dates: Vec<NaiveDate> = observations
            .iter()
            .map(|(d, _, _)| *d)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let tickers: Vec<String> = observations
            .iter()
            .map(|(_, t, _)| t.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let date_index: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let ticker_index: HashMap<String, usize> = tickers
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        let mut columns = vec![vec![None; dates.len()]; tickers.len()];
        for (date, ticker, price) in observations {
            let (Some(&d), Some(&t)) = (date_index.get(&date), ticker_index.get(&ticker)) else {
                continue;
            };
            columns[t][d] = if price.is_finite() && price > 0.0 {
                Some(price)
            } else {
                None
            };
        }

        Self {
            dates,
            tickers,
            columns,
            ticker_index,
        }
    }

    /// Build a table from an already ordered date index and columns.
    ///
    /// Every ticker is kept, even one with no prices at all. Cells are
    /// sanitized like [`PriceTable::from_observations`]. Returns `None` when
    /// column lengths do not match the date index or dates are not strictly
    /// ascending.
    pub fn from_columns(
        dates: Vec<NaiveDate>,
        tickers: Vec<String>,
        columns: Vec<Vec<Option<f64>>>,
    ) -> Option<Self> {
        if tickers.len() != columns.len() || columns.iter().any(|c| c.len() != dates.len()) {
            return None;
        }
        if dates.windows(2).any(|w| w[0] >= w[1]) {
            return None;
        }
        let ticker_index: HashMap<String, usize> = tickers
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        if ticker_index.len() != tickers.len() {
            return None;
        }
        let columns = columns
            .into_iter()
            .map(|col| {
                col.into_iter()
                    .map(|v| v.filter(|p| p.is_finite() && *p > 0.0))
                    .collect()
            })
            .collect();
        Some(Self {
            dates,
            tickers,
            columns,
            ticker_index,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn row_count(&self) -> usize {
        self.dates.len()
    }

    pub fn has_ticker(&self, ticker: &str) -> bool {
        self.ticker_index.contains_key(ticker)
    }

    pub fn column(&self, ticker: &str) -> Option<&[Option<f64>]> {
        self.ticker_index
            .get(ticker)
            .map(|&i| self.columns[i].as_slice())
    }

    pub fn get(&self, ticker: &str, row: usize) -> Option<f64> {
        self.column(ticker).and_then(|c| c.get(row).copied().flatten())
    }

    /// Fraction of dates with a value for `ticker` (0 for unknown tickers).
    pub fn coverage(&self, ticker: &str) -> f64 {
        match self.column(ticker) {
            Some(col) if !col.is_empty() => {
                col.iter().filter(|v| v.is_some()).count() as f64 / col.len() as f64
            }
            _ => 0.0,
        }
    }

    /// Rows with `start <= date <= end`.
    pub fn window(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end);
        self.rows(lo, hi.max(lo))
    }

    /// Rows strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> Self {
        self.rows(0, self.dates.partition_point(|d| *d < date))
    }

    fn rows(&self, lo: usize, hi: usize) -> Self {
        Self {
            dates: self.dates[lo..hi].to_vec(),
            tickers: self.tickers.clone(),
            columns: self.columns.iter().map(|c| c[lo..hi].to_vec()).collect(),
            ticker_index: self.ticker_index.clone(),
        }
    }

    /// Carry the last known price forward over gaps. Leading gaps stay missing.
    pub fn forward_fill(&self) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|col| {
                let mut last = None;
                col.iter()
                    .map(|v| {
                        if v.is_some() {
                            last = *v;
                        }
                        last
                    })
                    .collect()
            })
            .collect();
        Self {
            dates: self.dates.clone(),
            tickers: self.tickers.clone(),
            columns,
            ticker_index: self.ticker_index.clone(),
        }
    }
}
