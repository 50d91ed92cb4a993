#![allow(dead_code)]

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rulefolio::adapters::memory_adapter::InMemoryAdapter;
use rulefolio::domain::company::{Company, CompanyId};
use rulefolio::domain::error::RulefolioError;
use rulefolio::domain::evolution::FilterCatalogEntry;
use rulefolio::domain::financials::{
    FactQuery, FinancialFact, Metric, MetricFrequency, PeriodType, MARKET_CAP_METRIC,
};
use rulefolio::domain::portfolio::{PortfolioRecord, RuleBacktestMetric};
use rulefolio::domain::price::{DateWindow, PricePoint};
use rulefolio::domain::rule::{Comparator, FilterClause, Rule, RuleDefinition, RuleId, RuleRecord};
use rulefolio::ports::data_port::DataPort;

pub const ROE_METRIC_ID: i64 = 1;
pub const MCAP_METRIC_ID: i64 = 2;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One close per weekday starting at `start`.
pub fn weekday_closes(company_id: CompanyId, start: NaiveDate, closes: &[f64]) -> Vec<PricePoint> {
    let mut day = start;
    let mut out = Vec::with_capacity(closes.len());
    for &close in closes {
        while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            day += Duration::days(1);
        }
        out.push(PricePoint::close_only(company_id, day, close));
        day += Duration::days(1);
    }
    out
}

/// Closes whose day-over-day returns are exactly `returns`, starting at 100.
pub fn closes_from_returns(returns: &[f64]) -> Vec<f64> {
    let mut closes = vec![100.0];
    for r in returns {
        let last = closes[closes.len() - 1];
        closes.push(last * (1.0 + r));
    }
    closes
}

pub fn fiscal_fact(company_id: CompanyId, metric_id: i64, year: i32, value: f64) -> FinancialFact {
    FinancialFact {
        company_id,
        metric_id,
        period_type: PeriodType::FiscalYear,
        period_label: format!("FY{}", year),
        period_start: Some(date(year - 1, 4, 1)),
        period_end: Some(date(year, 3, 31)),
        value,
    }
}

pub fn roe_rule(id: RuleId, threshold: f64) -> Rule {
    Rule {
        id,
        name: format!("ROE > {}", threshold),
        definition: RuleDefinition::with_filters(vec![FilterClause::new(
            "ROE",
            Comparator::Gt,
            threshold,
        )]),
    }
}

pub fn catalog() -> Vec<FilterCatalogEntry> {
    ["ROE", "PE", "Debt to Equity", "Dividend Yield"]
        .iter()
        .enumerate()
        .map(|(i, name)| FilterCatalogEntry {
            id: i as i64 + 1,
            name: name.to_string(),
            description: None,
            category: None,
            unit: None,
        })
        .collect()
}

/// Rows shared by every end-to-end scenario.
#[derive(Default)]
pub struct Dataset {
    pub companies: Vec<Company>,
    pub metrics: Vec<Metric>,
    pub facts: Vec<FinancialFact>,
    pub prices: Vec<PricePoint>,
    pub rules: Vec<Rule>,
    pub catalog: Vec<FilterCatalogEntry>,
}

impl Dataset {
    /// Three companies; ROE(FY2020) 20 and 10 for companies 1 and 2, none
    /// for 3; market caps 300 and 100; a year of 2021 prices for 1 and 2.
    pub fn scenario() -> Self {
        let first_trading_day = date(2021, 1, 4);
        let mut prices = weekday_closes(
            1,
            first_trading_day,
            &closes_from_returns(&[0.01, -0.02, 0.015, 0.005, -0.01]),
        );
        prices.extend(weekday_closes(
            2,
            first_trading_day,
            &closes_from_returns(&[-0.01, 0.03, 0.0, -0.005, 0.02]),
        ));
        Self {
            companies: vec![
                Company::new(1, "AAA", "Alpha"),
                Company::new(2, "BBB", "Beta"),
                Company::new(3, "CCC", "Gamma"),
            ],
            metrics: vec![
                Metric {
                    id: ROE_METRIC_ID,
                    name: "ROE".into(),
                    unit: Some("%".into()),
                    frequency: MetricFrequency::Yearly,
                },
                Metric {
                    id: MCAP_METRIC_ID,
                    name: MARKET_CAP_METRIC.into(),
                    unit: None,
                    frequency: MetricFrequency::Yearly,
                },
            ],
            facts: vec![
                fiscal_fact(1, ROE_METRIC_ID, 2020, 20.0),
                fiscal_fact(2, ROE_METRIC_ID, 2020, 10.0),
                fiscal_fact(1, MCAP_METRIC_ID, 2020, 300.0),
                fiscal_fact(2, MCAP_METRIC_ID, 2020, 100.0),
            ],
            prices,
            rules: Vec::new(),
            catalog: catalog(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn without_prices_for(mut self, company_id: CompanyId) -> Self {
        self.prices.retain(|p| p.company_id != company_id);
        self
    }

    pub fn into_memory(self) -> InMemoryAdapter {
        let mut adapter = InMemoryAdapter::new()
            .with_prices(self.prices)
            .with_catalog(self.catalog);
        for c in self.companies {
            adapter = adapter.with_company(c);
        }
        for m in self.metrics {
            adapter = adapter.with_metric(m);
        }
        for f in self.facts {
            adapter = adapter.with_fact(f);
        }
        for r in self.rules {
            adapter = adapter.with_rule(r);
        }
        adapter
    }

    /// Loads the dataset into an initialized SQLite database. Rules must be
    /// numbered 1, 2, ... in order.
    #[cfg(feature = "sqlite")]
    pub fn load_sqlite(self, adapter: &rulefolio::adapters::sqlite_adapter::SqliteAdapter) {
        use rulefolio::ports::store_port::StorePort;

        for c in &self.companies {
            adapter.insert_company(c).unwrap();
        }
        for m in &self.metrics {
            adapter.insert_metric(m).unwrap();
        }
        adapter.upsert_facts(&self.facts).unwrap();
        adapter.upsert_prices(&self.prices).unwrap();
        for r in &self.rules {
            let id = adapter.insert_rule(&r.name, &r.definition).unwrap();
            assert_eq!(id, r.id, "rules must be loaded in id order");
        }
        for e in &self.catalog {
            adapter.insert_filter(e).unwrap();
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn into_sqlite(self) -> rulefolio::adapters::sqlite_adapter::SqliteAdapter {
        let adapter = rulefolio::adapters::sqlite_adapter::SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        self.load_sqlite(&adapter);
        adapter
    }
}

/// Delegates to an inner port but fails fact lookups for one period suffix.
pub struct FailingFacts<'a> {
    pub inner: &'a dyn DataPort,
    pub failing_suffix: String,
}

impl DataPort for FailingFacts<'_> {
    fn list_companies(&self) -> Result<Vec<Company>, RulefolioError> {
        self.inner.list_companies()
    }

    fn find_metric(&self, name: &str) -> Result<Option<Metric>, RulefolioError> {
        self.inner.find_metric(name)
    }

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<FinancialFact>, RulefolioError> {
        if query.period_suffix == self.failing_suffix {
            return Err(RulefolioError::DatabaseQuery {
                reason: "connection reset".into(),
            });
        }
        self.inner.list_facts(query)
    }

    fn list_prices(
        &self,
        company_ids: &[CompanyId],
        window: DateWindow,
    ) -> Result<Vec<PricePoint>, RulefolioError> {
        self.inner.list_prices(company_ids, window)
    }

    fn list_rule_records(&self) -> Result<Vec<RuleRecord>, RulefolioError> {
        self.inner.list_rule_records()
    }

    fn list_filter_catalog(&self) -> Result<Vec<FilterCatalogEntry>, RulefolioError> {
        self.inner.list_filter_catalog()
    }

    fn list_portfolio_records(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<PortfolioRecord>, RulefolioError> {
        self.inner.list_portfolio_records(start_year, end_year)
    }

    fn list_backtest_metrics(
        &self,
        rule_id: Option<RuleId>,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError> {
        self.inner.list_backtest_metrics(rule_id)
    }
}
