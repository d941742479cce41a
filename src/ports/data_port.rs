//! Price data access port.

use crate::domain::error::FiioptError;
use crate::domain::price_table::{PriceTable, QuotaKind};
use chrono::NaiveDate;

pub trait PriceDataPort {
    /// Every ticker's quotas of `kind` dated within `[start_date, end_date]`.
    fn fetch_prices(
        &self,
        kind: QuotaKind,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FiioptError>;

    fn list_tickers(&self, kind: QuotaKind) -> Result<Vec<String>, FiioptError>;

    /// First date, last date and row count of the `kind` table.
    fn get_data_range(
        &self,
        kind: QuotaKind,
    ) -> Result<Option<(NaiveDate, NaiveDate, usize)>, FiioptError>;
}
