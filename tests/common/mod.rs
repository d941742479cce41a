#![allow(dead_code)]

use chrono::NaiveDate;
use fiiopt::domain::error::FiioptError;
use fiiopt::domain::price_table::{PriceTable, QuotaKind};
use fiiopt::domain::returns::ReturnMatrix;
use fiiopt::domain::settings::{ComparisonSettings, DataWindow};
use fiiopt::domain::universe::{Asset, AssetPanel, UniverseValidationResult};
use fiiopt::ports::data_port::PriceDataPort;
use std::cell::Cell;

pub struct MockPriceDataPort {
    pub adjusted: PriceTable,
    pub market: PriceTable,
    pub error: Option<String>,
    pub fetches: Cell<usize>,
}

impl MockPriceDataPort {
    pub fn new(adjusted: PriceTable, market: PriceTable) -> Self {
        Self {
            adjusted,
            market,
            error: None,
            fetches: Cell::new(0),
        }
    }

    pub fn from_panel(panel: &AssetPanel) -> Self {
        let (adjusted, market) = tables(panel);
        Self::new(adjusted, market)
    }

    pub fn with_error(mut self, reason: &str) -> Self {
        self.error = Some(reason.to_string());
        self
    }

    fn table(&self, kind: QuotaKind) -> Result<&PriceTable, FiioptError> {
        if let Some(reason) = &self.error {
            return Err(FiioptError::Data {
                reason: reason.clone(),
            });
        }
        Ok(match kind {
            QuotaKind::Adjusted => &self.adjusted,
            QuotaKind::Market => &self.market,
        })
    }
}

impl PriceDataPort for MockPriceDataPort {
    fn fetch_prices(
        &self,
        kind: QuotaKind,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FiioptError> {
        self.fetches.set(self.fetches.get() + 1);
        Ok(self.table(kind)?.window(start_date, end_date))
    }

    fn list_tickers(&self, kind: QuotaKind) -> Result<Vec<String>, FiioptError> {
        Ok(self.table(kind)?.tickers().to_vec())
    }

    fn get_data_range(
        &self,
        kind: QuotaKind,
    ) -> Result<Option<(NaiveDate, NaiveDate, usize)>, FiioptError> {
        let table = self.table(kind)?;
        Ok(match (table.dates().first(), table.dates().last()) {
            (Some(a), Some(b)) => Some((*a, *b, table.row_count())),
            _ => None,
        })
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn ticker(i: usize) -> String {
    format!("FII{:02}11", i)
}

/// Deterministic daily prices: asset `i` drifts by `0.0003 * (i + 1)` with a
/// sawtooth of asset-specific period on top. Market quotas lag adjusted ones
/// by a small distribution-like discount.
pub fn synthetic_panel(days: usize, assets: usize) -> AssetPanel {
    let start = date(2020, 1, 1);
    let dates: Vec<NaiveDate> = (0..days)
        .map(|t| start + chrono::Duration::days(t as i64))
        .collect();
    let assets = (0..assets)
        .map(|i| {
            let drift = 0.0003 * (i + 1) as f64;
            let period = 5 + 2 * i;
            let mut adjusted = Vec::with_capacity(days);
            let mut market = Vec::with_capacity(days);
            let mut p = 100.0;
            for t in 0..days {
                let wave = ((t % period) as f64 - period as f64 / 2.0) * 0.0015;
                p *= 1.0 + drift + wave;
                adjusted.push(p);
                market.push(p * (1.0 - 0.0001 * (t % 21) as f64));
            }
            Asset {
                id: ticker(i),
                adjusted,
                market,
            }
        })
        .collect();
    AssetPanel { dates, assets }
}

pub fn universe(panel: AssetPanel) -> UniverseValidationResult {
    UniverseValidationResult {
        panel,
        skipped: Vec::new(),
    }
}

pub type Observation = (NaiveDate, String, f64);

/// Long-format `(date, ticker, price)` rows of a panel: adjusted, then market.
pub fn observations(panel: &AssetPanel) -> (Vec<Observation>, Vec<Observation>) {
    let (mut adjusted, mut market) = (Vec::new(), Vec::new());
    for a in &panel.assets {
        for (t, d) in panel.dates.iter().enumerate() {
            adjusted.push((*d, a.id.clone(), a.adjusted[t]));
            market.push((*d, a.id.clone(), a.market[t]));
        }
    }
    (adjusted, market)
}

/// `ticker` priced at `price` on `panel` dates `rows`, into both series.
pub fn list_ticker(
    obs: &mut (Vec<Observation>, Vec<Observation>),
    panel: &AssetPanel,
    ticker: &str,
    rows: std::ops::Range<usize>,
) {
    for t in rows {
        let price = 40.0 + 0.01 * t as f64 + 0.3 * (t % 4) as f64;
        obs.0.push((panel.dates[t], ticker.to_string(), price));
        obs.1.push((panel.dates[t], ticker.to_string(), price * 0.99));
    }
}

/// Split a panel back into the two long-format price tables.
pub fn tables(panel: &AssetPanel) -> (PriceTable, PriceTable) {
    let (adjusted, market) = observations(panel);
    (
        PriceTable::from_observations(adjusted),
        PriceTable::from_observations(market),
    )
}

/// One year of data, holdout from October.
pub fn window() -> DataWindow {
    DataWindow {
        start: date(2020, 1, 1),
        end: date(2020, 12, 31),
        holdout_start: date(2020, 10, 1),
    }
}

pub fn settings(asset_count: usize, max_weight: f64) -> ComparisonSettings {
    let mut s = ComparisonSettings::new(window());
    s.optimization.asset_count = asset_count;
    s.optimization.max_weight_per_asset = max_weight;
    s.optimization.risk_free_rate = 0.10;
    s.optimization.training_timesteps = 0;
    s.optimization.random_seed = Some(7);
    s.drl.lookback = 20;
    s
}

pub fn returns(rows: Vec<Vec<f64>>) -> ReturnMatrix {
    let n = rows.first().map_or(0, Vec::len);
    let dates = (0..rows.len())
        .map(|t| date(2021, 1, 1) + chrono::Duration::days(t as i64))
        .collect();
    ReturnMatrix::from_rows(dates, (0..n).map(ticker).collect(), rows).unwrap()
}
