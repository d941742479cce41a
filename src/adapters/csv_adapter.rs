//! Wide CSV price tables.
//!
//! One file per quota kind. The first column holds the trading date
//! (`dt_pregao` or `date`, `YYYY-MM-DD` or `DD/MM/YYYY`), every other column
//! one ticker. Empty cells are missing prices.

use crate::domain::error::FiioptError;
use crate::domain::price_table::{PriceTable, QuotaKind};
use crate::ports::data_port::PriceDataPort;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const DATE_COLUMNS: [&str; 2] = ["dt_pregao", "date"];

pub struct CsvPriceAdapter {
    adjusted_path: PathBuf,
    market_path: PathBuf,
    delimiter: u8,
}

impl CsvPriceAdapter {
    pub fn new(adjusted_path: PathBuf, market_path: PathBuf) -> Self {
        Self {
            adjusted_path,
            market_path,
            delimiter: b',',
        }
    }

    /// Use `;` for files exported with decimal commas.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn path(&self, kind: QuotaKind) -> &Path {
        match kind {
            QuotaKind::Adjusted => &self.adjusted_path,
            QuotaKind::Market => &self.market_path,
        }
    }

    fn reader(&self, kind: QuotaKind) -> Result<csv::Reader<std::fs::File>, FiioptError> {
        let path = self.path(kind);
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| FiioptError::Data {
                reason: format!("failed to open {} quotas {}: {}", kind, path.display(), e),
            })
    }

    /// Date column index and ticker columns of the header.
    fn header(
        &self,
        kind: QuotaKind,
        rdr: &mut csv::Reader<std::fs::File>,
    ) -> Result<(usize, Vec<(usize, String)>), FiioptError> {
        let headers = rdr.headers().map_err(|e| FiioptError::Data {
            reason: format!("CSV header error in {} quotas: {}", kind, e),
        })?;
        let date_col = headers
            .iter()
            .position(|h| DATE_COLUMNS.contains(&h.to_lowercase().as_str()))
            .ok_or_else(|| FiioptError::Data {
                reason: format!("{} quotas have no dt_pregao/date column", kind),
            })?;

        let mut seen = HashSet::new();
        let mut tickers = Vec::new();
        for (i, h) in headers.iter().enumerate() {
            if i == date_col || h.is_empty() {
                continue;
            }
            let ticker = h.to_uppercase();
            if !seen.insert(ticker.clone()) {
                return Err(FiioptError::Data {
                    reason: format!("duplicate ticker column {} in {} quotas", ticker, kind),
                });
            }
            tickers.push((i, ticker));
        }
        Ok((date_col, tickers))
    }

    fn parse_price(&self, raw: &str) -> Option<Result<f64, std::num::ParseFloatError>> {
        if raw.is_empty() {
            return None;
        }
        if self.delimiter == b';' {
            Some(raw.replace('.', "").replace(',', ".").parse())
        } else {
            Some(raw.parse())
        }
    }

    fn read(
        &self,
        kind: QuotaKind,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<PriceTable, FiioptError> {
        let mut rdr = self.reader(kind)?;
        let (date_col, tickers) = self.header(kind, &mut rdr)?;

        let mut rows: Vec<(NaiveDate, Vec<Option<f64>>)> = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| FiioptError::Data {
                reason: format!("CSV parse error in {} quotas: {}", kind, e),
            })?;
            let raw_date = record.get(date_col).unwrap_or_default();
            let date = parse_date(raw_date).ok_or_else(|| FiioptError::Data {
                reason: format!(
                    "invalid date '{}' on line {} of {} quotas",
                    raw_date,
                    line + 2,
                    kind
                ),
            })?;
            if let Some((start, end)) = range {
                if date < start || date > end {
                    continue;
                }
            }

            let mut cells = Vec::with_capacity(tickers.len());
            for (col, ticker) in &tickers {
                let raw = record.get(*col).unwrap_or_default();
                cells.push(match self.parse_price(raw) {
                    None => None,
                    Some(Ok(price)) => Some(price),
                    Some(Err(_)) => {
                        return Err(FiioptError::Data {
                            reason: format!(
                                "invalid price '{}' for {} on {} in {} quotas",
                                raw, ticker, date, kind
                            ),
                        });
                    }
                });
            }
            rows.push((date, cells));
        }

        rows.sort_by_key(|(date, _)| *date);
        if let Some(pair) = rows.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(FiioptError::Data {
                reason: format!("duplicate date {} in {} quotas", pair[0].0, kind),
            });
        }

        // Every header ticker becomes a column, priced or not.
        let mut order: Vec<usize> = (0..tickers.len()).collect();
        order.sort_by(|&a, &b| tickers[a].1.cmp(&tickers[b].1));
        let dates = rows.iter().map(|(date, _)| *date).collect();
        let names = order.iter().map(|&j| tickers[j].1.clone()).collect();
        let columns = order
            .iter()
            .map(|&j| rows.iter().map(|(_, cells)| cells[j]).collect())
            .collect();
        let table =
            PriceTable::from_columns(dates, names, columns).ok_or_else(|| FiioptError::Data {
                reason: format!("malformed {} quota table", kind),
            })?;
        debug!(
            "loaded {} quotas: {} dates, {} tickers",
            kind,
            table.row_count(),
            table.tickers().len()
        );
        Ok(table)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

impl PriceDataPort for CsvPriceAdapter {
    fn fetch_prices(
        &self,
        kind: QuotaKind,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FiioptError> {
        self.read(kind, Some((start_date, end_date)))
    }

    fn list_tickers(&self, kind: QuotaKind) -> Result<Vec<String>, FiioptError> {
        let mut rdr = self.reader(kind)?;
        let (_, tickers) = self.header(kind, &mut rdr)?;
        let mut tickers: Vec<String> = tickers.into_iter().map(|(_, t)| t).collect();
        tickers.sort();
        Ok(tickers)
    }

    fn get_data_range(
        &self,
        kind: QuotaKind,
    ) -> Result<Option<(NaiveDate, NaiveDate, usize)>, FiioptError> {
        let table = self.read(kind, None)?;
        Ok(match (table.dates().first(), table.dates().last()) {
            (Some(first), Some(last)) => Some((*first, *last, table.row_count())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup(adjusted: &str, market: &str) -> (TempDir, CsvPriceAdapter) {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("Base Cota Ajustada.csv");
        let m = dir.path().join("Base Cota Mercado.csv");
        fs::write(&a, adjusted).unwrap();
        fs::write(&m, market).unwrap();
        (dir, CsvPriceAdapter::new(a, m))
    }

    const ADJUSTED: &str = "dt_pregao,HGLG11,knri11,MXRF11\n\
        2024-01-03,160.5,140.0,\n\
        2024-01-02,160.0,139.5,10.1\n\
        2024-01-04,161.0,,10.2\n";

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn reads_wide_table_sorted() {
        let (_dir, adapter) = setup(ADJUSTED, ADJUSTED);
        let table = adapter
            .fetch_prices(QuotaKind::Adjusted, d(1), d(31))
            .unwrap();
        assert_eq!(table.dates(), &[d(2), d(3), d(4)]);
        assert_eq!(table.tickers(), &["HGLG11", "KNRI11", "MXRF11"]);
        assert_eq!(table.get("HGLG11", 0), Some(160.0));
        assert_eq!(table.get("KNRI11", 2), None);
        assert_eq!(table.get("MXRF11", 1), None);
    }

    #[test]
    fn filters_by_date() {
        let (_dir, adapter) = setup(ADJUSTED, ADJUSTED);
        let table = adapter.fetch_prices(QuotaKind::Market, d(3), d(3)).unwrap();
        assert_eq!(table.dates(), &[d(3)]);
    }

    #[test]
    fn brazilian_format_with_semicolons() {
        let csv = "dt_pregao;HGLG11\n02/01/2024;1.160,50\n03/01/2024;161,25\n";
        let (_dir, adapter) = setup(csv, csv);
        let adapter = adapter.with_delimiter(b';');
        let table = adapter
            .fetch_prices(QuotaKind::Adjusted, d(1), d(31))
            .unwrap();
        assert_eq!(table.get("HGLG11", 0), Some(1160.5));
        assert_eq!(table.get("HGLG11", 1), Some(161.25));
    }

    #[test]
    fn invalid_price_is_a_data_error() {
        let (_dir, adapter) = setup("dt_pregao,HGLG11\n2024-01-02,abc\n", ADJUSTED);
        let err = adapter
            .fetch_prices(QuotaKind::Adjusted, d(1), d(31))
            .unwrap_err();
        assert!(matches!(err, FiioptError::Data { reason } if reason.contains("HGLG11")));
    }

    #[test]
    fn missing_date_column_is_a_data_error() {
        let (_dir, adapter) = setup("when,HGLG11\n2024-01-02,1\n", ADJUSTED);
        assert!(adapter.list_tickers(QuotaKind::Adjusted).is_err());
    }

    #[test]
    fn missing_file_is_a_data_error() {
        let adapter = CsvPriceAdapter::new("/nonexistent/a.csv".into(), "/nonexistent/m.csv".into());
        assert!(matches!(
            adapter.fetch_prices(QuotaKind::Market, d(1), d(2)).unwrap_err(),
            FiioptError::Data { .. }
        ));
    }

    #[test]
    fn unpriced_header_ticker_is_kept() {
        let csv = "dt_pregao,HGLG11,VAZIO11\n2024-01-02,160.0,\n2024-01-03,161.0,\n";
        let (_dir, adapter) = setup(csv, csv);
        let table = adapter
            .fetch_prices(QuotaKind::Adjusted, d(1), d(31))
            .unwrap();
        assert_eq!(table.tickers(), &["HGLG11", "VAZIO11"]);
        assert_eq!(table.coverage("VAZIO11"), 0.0);
    }

    #[test]
    fn duplicate_date_is_a_data_error() {
        let csv = "dt_pregao,HGLG11\n2024-01-02,160.0\n02/01/2024,161.0\n";
        let (_dir, adapter) = setup(csv, csv);
        let err = adapter
            .fetch_prices(QuotaKind::Market, d(1), d(31))
            .unwrap_err();
        assert!(matches!(err, FiioptError::Data { reason } if reason.contains("duplicate date")));
    }

    #[test]
    fn lists_tickers_and_range() {
        let (_dir, adapter) = setup(ADJUSTED, ADJUSTED);
        assert_eq!(
            adapter.list_tickers(QuotaKind::Market).unwrap(),
            vec!["HGLG11", "KNRI11", "MXRF11"]
        );
        assert_eq!(
            adapter.get_data_range(QuotaKind::Adjusted).unwrap(),
            Some((d(2), d(4), 3))
        );
    }
}
