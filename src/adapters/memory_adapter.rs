//! In-process implementation of both data ports.
//!
//! Holds every table in memory behind a single lock. Used for dry runs and
//! as the reference store in tests; natural keys are honoured the same way
//! the SQL adapters honour them.

use crate::domain::company::{Company, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::evolution::FilterCatalogEntry;
use crate::domain::financials::{FactQuery, FinancialFact, Metric};
use crate::domain::portfolio::{
    PortfolioRecord, RuleBacktestMetric, SchemeWeights, YearlyPortfolio,
};
use crate::domain::price::{DateWindow, PricePoint};
use crate::domain::rule::{Rule, RuleDefinition, RuleId, RuleRecord};
use crate::ports::data_port::DataPort;
use crate::ports::store_port::StorePort;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Rows written through the typed API are kept typed; raw rows are kept
/// verbatim, the way a SQL column would hold them.
enum RuleRow {
    Typed(Rule),
    Raw(RuleRecord),
}

impl RuleRow {
    fn record(&self) -> Result<RuleRecord, RulefolioError> {
        match self {
            RuleRow::Typed(rule) => RuleRecord::from_rule(rule),
            RuleRow::Raw(record) => Ok(record.clone()),
        }
    }
}

enum WeightsRow {
    Typed(SchemeWeights),
    Raw(String),
}

#[derive(Default)]
struct Tables {
    companies: BTreeMap<CompanyId, Company>,
    metrics: Vec<Metric>,
    facts: Vec<FinancialFact>,
    prices: Vec<PricePoint>,
    rules: BTreeMap<RuleId, RuleRow>,
    catalog: Vec<FilterCatalogEntry>,
    portfolios: BTreeMap<(RuleId, i32), WeightsRow>,
    backtest_metrics: Vec<RuleBacktestMetric>,
}

#[derive(Default)]
pub struct InMemoryAdapter {
    tables: RwLock<Tables>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_company(self, company: Company) -> Self {
        self.tables.write().companies.insert(company.id, company);
        self
    }

    pub fn with_metric(self, metric: Metric) -> Self {
        {
            let mut t = self.tables.write();
            t.metrics.retain(|m| m.id != metric.id && m.name != metric.name);
            t.metrics.push(metric);
        }
        self
    }

    /// Replaces any fact with the same (company, metric, period label).
    pub fn with_fact(self, fact: FinancialFact) -> Self {
        {
            let mut t = self.tables.write();
            t.facts.retain(|f| {
                !(f.company_id == fact.company_id
                    && f.metric_id == fact.metric_id
                    && f.period_label == fact.period_label)
            });
            t.facts.push(fact);
        }
        self
    }

    /// Replaces any row with the same (company, date).
    pub fn with_prices(self, prices: Vec<PricePoint>) -> Self {
        {
            let mut t = self.tables.write();
            for p in prices {
                t.prices
                    .retain(|q| !(q.company_id == p.company_id && q.date == p.date));
                t.prices.push(p);
            }
        }
        self
    }

    pub fn with_rule(self, rule: Rule) -> Self {
        self.tables.write().rules.insert(rule.id, RuleRow::Typed(rule));
        self
    }

    /// Stores the rule JSON as given, without validating it.
    pub fn with_rule_record(self, record: RuleRecord) -> Self {
        self.tables.write().rules.insert(record.id, RuleRow::Raw(record));
        self
    }

    pub fn with_catalog(self, entries: Vec<FilterCatalogEntry>) -> Self {
        self.tables.write().catalog.extend(entries);
        self
    }

    /// Stores the weights JSON as given, without validating it.
    pub fn with_portfolio_record(self, record: PortfolioRecord) -> Self {
        self.tables
            .write()
            .portfolios
            .insert((record.rule_id, record.year), WeightsRow::Raw(record.weights_json));
        self
    }
}

impl DataPort for InMemoryAdapter {
    fn list_companies(&self) -> Result<Vec<Company>, RulefolioError> {
        Ok(self.tables.read().companies.values().cloned().collect())
    }

    fn find_metric(&self, name: &str) -> Result<Option<Metric>, RulefolioError> {
        Ok(self
            .tables
            .read()
            .metrics
            .iter()
            .find(|m| m.name == name)
            .cloned())
    }

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<FinancialFact>, RulefolioError> {
        Ok(self
            .tables
            .read()
            .facts
            .iter()
            .filter(|f| query.matches(f))
            .cloned()
            .collect())
    }

    fn list_prices(
        &self,
        company_ids: &[CompanyId],
        window: DateWindow,
    ) -> Result<Vec<PricePoint>, RulefolioError> {
        let wanted: HashSet<CompanyId> = company_ids.iter().copied().collect();
        let mut rows: Vec<PricePoint> = self
            .tables
            .read()
            .prices
            .iter()
            .filter(|p| wanted.contains(&p.company_id) && window.contains(p.date))
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.company_id, p.date));
        Ok(rows)
    }

    fn list_rule_records(&self) -> Result<Vec<RuleRecord>, RulefolioError> {
        self.tables.read().rules.values().map(RuleRow::record).collect()
    }

    fn list_filter_catalog(&self) -> Result<Vec<FilterCatalogEntry>, RulefolioError> {
        Ok(self.tables.read().catalog.clone())
    }

    fn list_portfolio_records(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<PortfolioRecord>, RulefolioError> {
        self.tables
            .read()
            .portfolios
            .iter()
            .filter(|((_, year), _)| (start_year..=end_year).contains(year))
            .map(|(&(rule_id, year), row)| -> Result<PortfolioRecord, RulefolioError> {
                let weights_json = match row {
                    WeightsRow::Typed(weights) => serde_json::to_string(weights)?,
                    WeightsRow::Raw(json) => json.clone(),
                };
                Ok(PortfolioRecord {
                    rule_id,
                    year,
                    weights_json,
                })
            })
            .collect()
    }

    fn list_backtest_metrics(
        &self,
        rule_id: Option<RuleId>,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError> {
        Ok(self
            .tables
            .read()
            .backtest_metrics
            .iter()
            .filter(|m| rule_id.is_none_or(|id| m.rule_id == id))
            .cloned()
            .collect())
    }
}

impl StorePort for InMemoryAdapter {
    fn upsert_yearly_portfolio(&self, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError> {
        self.tables
            .write()
            .portfolios
            .insert(
                (portfolio.rule_id, portfolio.year),
                WeightsRow::Typed(portfolio.weights.clone()),
            );
        Ok(())
    }

    fn insert_backtest_metrics(&self, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError> {
        self.tables
            .write()
            .backtest_metrics
            .extend_from_slice(rows);
        Ok(())
    }

    fn commit_unit(
        &self,
        portfolio: &YearlyPortfolio,
        rows: &[RuleBacktestMetric],
    ) -> Result<(), RulefolioError> {
        let mut t = self.tables.write();
        t.portfolios.insert(
            (portfolio.rule_id, portfolio.year),
            WeightsRow::Typed(portfolio.weights.clone()),
        );
        t.backtest_metrics.extend_from_slice(rows);
        Ok(())
    }

    fn insert_rule(
        &self,
        name: &str,
        definition: &RuleDefinition,
    ) -> Result<RuleId, RulefolioError> {
        let mut t = self.tables.write();
        let id = t.rules.keys().next_back().copied().unwrap_or(0) + 1;
        t.rules.insert(
            id,
            RuleRow::Typed(Rule {
                id,
                name: name.to_string(),
                definition: definition.clone(),
            }),
        );
        Ok(id)
    }
}
