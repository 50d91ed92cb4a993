//! rulefolio: rule-based stock screening and portfolio backtesting.
//!
//! Each stored rule is screened against lagged fundamentals, ranked into a
//! capped universe, weighted under several schemes and evaluated over the
//! following calendar year.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
