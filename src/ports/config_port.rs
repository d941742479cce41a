//! Configuration access port.

use crate::domain::error::FiioptError;
use chrono::NaiveDate;

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;
    fn get_double(&self, section: &str, key: &str, default: f64) -> f64;
    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool;

    /// Like `get_double`, but a present, non-numeric value is an error
    /// instead of falling back.
    fn get_optional_double(&self, section: &str, key: &str) -> Result<Option<f64>, FiioptError> {
        match self.get_string(section, key) {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => s.trim().parse::<f64>().map(Some).map_err(|_| {
                FiioptError::invalid(section, key, format!("'{}' is not a number", s.trim()))
            }),
        }
    }

    /// Like `get_int` for non-negative values; a malformed value is an error.
    fn get_optional_usize(&self, section: &str, key: &str) -> Result<Option<usize>, FiioptError> {
        match self.get_string(section, key) {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => s.trim().parse::<usize>().map(Some).map_err(|_| {
                FiioptError::invalid(
                    section,
                    key,
                    format!("'{}' is not a non-negative integer", s.trim()),
                )
            }),
        }
    }

    /// A required `YYYY-MM-DD` date.
    fn get_date(&self, section: &str, key: &str) -> Result<NaiveDate, FiioptError> {
        let value = self
            .get_string(section, key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FiioptError::missing(section, key))?;
        NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
            FiioptError::invalid(
                section,
                key,
                format!("invalid {} format, expected YYYY-MM-DD", key),
            )
        })
    }
}
