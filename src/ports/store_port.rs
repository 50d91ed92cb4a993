//! Write-side port for the two output entities and new rules.

use crate::domain::error::RulefolioError;
use crate::domain::portfolio::{RuleBacktestMetric, YearlyPortfolio};
use crate::domain::rule::{RuleDefinition, RuleId};

pub trait StorePort: Send + Sync {
    /// Inserts or replaces the portfolio keyed by `(rule_id, year)`; the
    /// weight mapping is replaced wholesale.
    fn upsert_yearly_portfolio(&self, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError>;

    /// Appends metric rows in a single transaction.
    fn insert_backtest_metrics(&self, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError>;

    /// Writes a unit's portfolio and its metric rows all-or-nothing.
    fn commit_unit(
        &self,
        portfolio: &YearlyPortfolio,
        rows: &[RuleBacktestMetric],
    ) -> Result<(), RulefolioError>;

    fn insert_rule(&self, name: &str, definition: &RuleDefinition)
    -> Result<RuleId, RulefolioError>;
}
