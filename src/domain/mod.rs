//! Allocation engine: data alignment, risk model, optimizers, environment,
//! training, backtests.

pub mod backtest;
pub mod comparison;
pub mod config_validation;
pub mod constraints;
pub mod environment;
pub mod error;
pub mod markowitz;
pub mod metrics;
pub mod policy;
pub mod price_table;
pub mod returns;
pub mod selection;
pub mod settings;
pub mod simplex;
pub mod training;
pub mod universe;
