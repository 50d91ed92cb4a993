//! Core domain types and logic.

pub mod company;
pub mod financials;
pub mod price;
pub mod price_panel;
pub mod rule;
pub mod rule_eval;
pub mod universe;
pub mod weighting;
pub mod metrics;
pub mod portfolio;
pub mod backtest;
pub mod evolution;
pub mod config_validation;
pub mod error;
