//! fiiopt: Markowitz vs. reinforcement-learning allocation for FII portfolios.
//!
//! Hexagonal architecture: the allocation engine lives in [`domain`], port
//! traits in [`ports`], concrete I/O in [`adapters`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
