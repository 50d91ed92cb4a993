//! Read-side data access port.
//!
//! Rules and portfolios are listed as stored records; their JSON columns are
//! parsed by the caller, so one malformed row only affects the work that
//! needs it.

use crate::domain::company::{Company, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::evolution::FilterCatalogEntry;
use crate::domain::financials::{FactQuery, FinancialFact, Metric};
use crate::domain::portfolio::{PortfolioRecord, RuleBacktestMetric, YearlyPortfolio};
use crate::domain::price::{DateWindow, PricePoint};
use crate::domain::rule::{Rule, RuleId, RuleRecord};

pub trait DataPort: Send + Sync {
    fn list_companies(&self) -> Result<Vec<Company>, RulefolioError>;

    fn find_metric(&self, name: &str) -> Result<Option<Metric>, RulefolioError>;

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<FinancialFact>, RulefolioError>;

    /// Price rows for `company_ids` with `window.start <= date <= window.end`.
    fn list_prices(
        &self,
        company_ids: &[CompanyId],
        window: DateWindow,
    ) -> Result<Vec<PricePoint>, RulefolioError>;

    /// Stored rules ordered by id.
    fn list_rule_records(&self) -> Result<Vec<RuleRecord>, RulefolioError>;

    fn list_filter_catalog(&self) -> Result<Vec<FilterCatalogEntry>, RulefolioError>;

    /// Portfolios with `start_year <= year <= end_year`, ordered by rule then year.
    fn list_portfolio_records(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<PortfolioRecord>, RulefolioError>;

    fn list_backtest_metrics(
        &self,
        rule_id: Option<RuleId>,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError>;

    /// Every stored rule, parsed. Fails on the first malformed definition.
    fn list_rules(&self) -> Result<Vec<Rule>, RulefolioError> {
        self.list_rule_records()?
            .iter()
            .map(RuleRecord::parse)
            .collect()
    }

    /// Scheme-keyed portfolios in the year range. Fails on the first row
    /// that does not parse.
    fn list_yearly_portfolios(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<YearlyPortfolio>, RulefolioError> {
        self.list_portfolio_records(start_year, end_year)?
            .iter()
            .map(PortfolioRecord::parse)
            .collect()
    }
}
