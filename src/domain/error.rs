//! Domain error types.

/// Top-level error type for fiiopt.
#[derive(Debug, thiserror::Error)]
pub enum FiioptError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error(
        "infeasible constraints: {reason} (asset_count={asset_count}, max_weight={max_weight}, target_return={target_return:?})"
    )]
    InfeasibleConstraints {
        reason: String,
        asset_count: usize,
        max_weight: f64,
        target_return: Option<f64>,
    },

    #[error("insufficient history for {asset}: have {observations} observations, need {minimum}")]
    InsufficientHistory {
        asset: String,
        observations: usize,
        minimum: usize,
    },

    #[error("environment misuse at step {step}: {operation} called in state {state}")]
    EnvironmentMisuse {
        operation: String,
        state: String,
        step: usize,
    },

    #[error("numerical instability: {reason}")]
    NumericalInstability { reason: String },

    #[error("training cancelled after {completed_timesteps} timesteps")]
    Cancelled { completed_timesteps: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FiioptError {
    pub(crate) fn invalid(section: &str, key: &str, reason: impl Into<String>) -> Self {
        FiioptError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(section: &str, key: &str) -> Self {
        FiioptError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<&FiioptError> for std::process::ExitCode {
    fn from(err: &FiioptError) -> Self {
        let code: u8 = match err {
            FiioptError::Io(_) => 1,
            FiioptError::ConfigParse { .. }
            | FiioptError::ConfigMissing { .. }
            | FiioptError::ConfigInvalid { .. } => 2,
            FiioptError::Data { .. } | FiioptError::InsufficientHistory { .. } => 3,
            FiioptError::InfeasibleConstraints { .. } => 4,
            FiioptError::NumericalInstability { .. } => 5,
            FiioptError::EnvironmentMisuse { .. } => 6,
            FiioptError::Cancelled { .. } => 130,
        };
        std::process::ExitCode::from(code)
    }
}
