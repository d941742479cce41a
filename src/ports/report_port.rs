//! Report generation port.

use crate::domain::comparison::ComparisonReport;
use crate::domain::error::FiioptError;
use std::path::{Path, PathBuf};

/// Port for persisting a comparison.
pub trait ReportPort {
    /// Write `report` under `output_dir`, returning the files created.
    fn write(
        &self,
        report: &ComparisonReport,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, FiioptError>;
}
