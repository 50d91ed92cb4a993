//! Backtest orchestrator over the (rule × year) grid.
//!
//! A unit is one rule in one formation year: screen, rank, weight under
//! every configured scheme, evaluate each scheme over the year, then commit
//! the portfolio and its metric rows together. Units are independent; a
//! failing unit is recorded in the [`GridReport`] and the run moves on.
//!
//! Besides the full pipeline there are two maintenance passes over stored
//! portfolios: [`Backtester::refresh_weights`] recomputes the weight
//! mappings and [`Backtester::evaluate_portfolios`] recomputes the metrics.

use crate::domain::error::RulefolioError;
use crate::domain::metrics::MetricsComputer;
use crate::domain::portfolio::{RuleBacktestMetric, YearlyPortfolio};
use crate::domain::rule::{Rule, RuleId, RuleRecord, ScreeningOptions};
use crate::domain::rule_eval::RuleEvaluator;
use crate::domain::universe::UniverseRanker;
use crate::domain::weighting::{WeightCalculator, WeightingConfig};
use crate::ports::data_port::DataPort;
use crate::ports::store_port::StorePort;
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub start_year: i32,
    pub end_year: i32,
    pub capacity: usize,
    pub screening: ScreeningOptions,
    pub weighting: WeightingConfig,
    pub risk_free_rate: f64,
    pub workers: usize,
    /// Clip each rule's grid to its own `bt_period_start..=bt_period_end`.
    pub respect_rule_period: bool,
}

impl BacktestConfig {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        Self {
            start_year,
            end_year,
            capacity: crate::domain::universe::DEFAULT_CAPACITY,
            screening: ScreeningOptions::default(),
            weighting: WeightingConfig::default(),
            risk_free_rate: crate::domain::metrics::DEFAULT_RISK_FREE_RATE,
            workers: 1,
            respect_rule_period: false,
        }
    }

    /// Formation years to run for `rule`, ascending.
    pub fn years_for(&self, rule: &Rule) -> Vec<i32> {
        let (mut start, mut end) = (self.start_year, self.end_year);
        if self.respect_rule_period {
            if let Some((rule_start, rule_end)) = rule.definition.backtest_years() {
                start = start.max(rule_start);
                end = end.min(rule_end);
            }
        }
        (start..=end).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus {
    Completed { constituents: usize, metric_rows: usize },
    NoEligibleCompanies,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub rule_id: RuleId,
    pub year: i32,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridReport {
    pub units: Vec<UnitReport>,
}

impl GridReport {
    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Completed { .. }))
    }

    pub fn no_eligible(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::NoEligibleCompanies))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Failed { .. }))
    }

    pub fn unit(&self, rule_id: RuleId, year: i32) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.rule_id == rule_id && u.year == year)
    }

    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.status)).count()
    }
}

/// One mutex per (rule, year) so two workers never write the same slice.
#[derive(Default)]
pub struct UnitLocks {
    locks: Mutex<HashMap<(RuleId, i32), Arc<Mutex<()>>>>,
}

impl UnitLocks {
    pub fn with_lock<T>(&self, key: (RuleId, i32), f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.locks.lock().entry(key).or_default());
        let _guard = lock.lock();
        f()
    }
}

pub struct Backtester<'a> {
    data: &'a dyn DataPort,
    store: &'a dyn StorePort,
    config: BacktestConfig,
    locks: UnitLocks,
}

impl<'a> Backtester<'a> {
    pub fn new(data: &'a dyn DataPort, store: &'a dyn StorePort, config: BacktestConfig) -> Self {
        Self {
            data,
            store,
            config,
            locks: UnitLocks::default(),
        }
    }

    /// Full pipeline for every stored rule over the configured years.
    ///
    /// A rule whose definition does not parse fails each of its units; the
    /// other rules still run.
    pub fn run_grid(&self) -> Result<GridReport, RulefolioError> {
        let records = self.data.list_rule_records()?;
        let units: Vec<(&RuleRecord, i32)> = records
            .iter()
            .flat_map(|record| {
                self.grid_years(record)
                    .into_iter()
                    .map(move |year| (record, year))
            })
            .collect();

        info!(
            rules = records.len(),
            units = units.len(),
            start = self.config.start_year,
            end = self.config.end_year,
            "running backtest grid"
        );
        let report = self.execute(&units, |(record, year)| {
            self.contained(record.id, *year, || {
                let rule = record.parse()?;
                self.run_unit(&rule, *year)
            })
        })?;
        log_summary("backtest grid", &report);
        Ok(report)
    }

    /// Unparseable rules get the configured range unclipped.
    fn grid_years(&self, record: &RuleRecord) -> Vec<i32> {
        match record.parse() {
            Ok(rule) => self.config.years_for(&rule),
            Err(_) => (self.config.start_year..=self.config.end_year).collect(),
        }
    }

    /// Screen, rank, weight, evaluate and commit one (rule, year) unit.
    pub fn run_unit(&self, rule: &Rule, year: i32) -> Result<UnitStatus, RulefolioError> {
        self.locks.with_lock((rule.id, year), || {
            let eligible = RuleEvaluator::new(self.data, self.config.screening)
                .eligible_companies(&rule.definition, year)?;
            let Some(universe) =
                UniverseRanker::new(self.config.capacity).rank(self.data, &eligible, year)?
            else {
                warn!(rule_id = rule.id, year, "no eligible companies, skipping");
                return Ok(UnitStatus::NoEligibleCompanies);
            };

            let weights = WeightCalculator::new(self.data, &self.config.weighting)
                .compute_all(&universe.constituents, year)?;
            let portfolio = YearlyPortfolio::new(rule.id, year, weights);
            let rows = self.metric_rows(&portfolio)?;

            self.store.commit_unit(&portfolio, &rows)?;
            Ok(UnitStatus::Completed {
                constituents: universe.count(),
                metric_rows: rows.len(),
            })
        })
    }

    /// Recomputes every configured scheme for stored portfolios in
    /// `[start_year, end_year]` and replaces their weights wholesale.
    /// Constituents come from the stored weights, flat placeholders included.
    pub fn refresh_weights(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<GridReport, RulefolioError> {
        let portfolios = self.data.list_portfolio_records(start_year, end_year)?;
        info!(portfolios = portfolios.len(), start_year, end_year, "refreshing weights");

        let report = self.execute(&portfolios, |stored| {
            self.contained(stored.rule_id, stored.year, || {
                self.locks.with_lock((stored.rule_id, stored.year), || {
                    let constituents = stored.constituents()?;
                    if constituents.is_empty() {
                        warn!(rule_id = stored.rule_id, year = stored.year, "portfolio holds no companies");
                        return Ok(UnitStatus::NoEligibleCompanies);
                    }
                    let weights = WeightCalculator::new(self.data, &self.config.weighting)
                        .compute_all(&constituents, stored.year)?;
                    let refreshed = YearlyPortfolio::new(stored.rule_id, stored.year, weights);
                    self.store.upsert_yearly_portfolio(&refreshed)?;
                    Ok(UnitStatus::Completed {
                        constituents: constituents.len(),
                        metric_rows: 0,
                    })
                })
            })
        })?;
        log_summary("weight refresh", &report);
        Ok(report)
    }

    /// Evaluates every scheme of every stored portfolio in
    /// `[start_year, end_year]` and appends the metric rows.
    pub fn evaluate_portfolios(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<GridReport, RulefolioError> {
        let portfolios = self.data.list_portfolio_records(start_year, end_year)?;
        info!(portfolios = portfolios.len(), start_year, end_year, "evaluating portfolios");

        let report = self.execute(&portfolios, |stored| {
            self.contained(stored.rule_id, stored.year, || {
                self.locks.with_lock((stored.rule_id, stored.year), || {
                    let portfolio = stored.parse()?;
                    let rows = self.metric_rows(&portfolio)?;
                    self.store.insert_backtest_metrics(&rows)?;
                    Ok(UnitStatus::Completed {
                        constituents: portfolio.constituents().len(),
                        metric_rows: rows.len(),
                    })
                })
            })
        })?;
        log_summary("portfolio evaluation", &report);
        Ok(report)
    }

    fn metric_rows(
        &self,
        portfolio: &YearlyPortfolio,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError> {
        let computer = MetricsComputer::new(self.config.risk_free_rate);
        let mut rows = Vec::with_capacity(portfolio.weights.len());
        for (scheme, weights) in &portfolio.weights {
            let metrics = computer.evaluate(self.data, weights, portfolio.year)?;
            rows.push(RuleBacktestMetric::from_metrics(
                portfolio.rule_id,
                portfolio.year,
                *scheme,
                &metrics,
            ));
        }
        Ok(rows)
    }

    fn contained(
        &self,
        rule_id: RuleId,
        year: i32,
        unit: impl FnOnce() -> Result<UnitStatus, RulefolioError>,
    ) -> UnitReport {
        let status = match unit() {
            Ok(status) => status,
            Err(e) => {
                error!(rule_id, year, error = %e, "unit failed");
                UnitStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        UnitReport {
            rule_id,
            year,
            status,
        }
    }

    fn execute<T: Sync>(
        &self,
        items: &[T],
        run: impl Fn(&T) -> UnitReport + Sync,
    ) -> Result<GridReport, RulefolioError> {
        let units: Vec<UnitReport> = if self.config.workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .build()
                .map_err(|e| RulefolioError::ConfigInvalid {
                    section: "backtest".to_string(),
                    key: "workers".to_string(),
                    reason: e.to_string(),
                })?;
            pool.install(|| items.par_iter().map(&run).collect())
        } else {
            items.iter().map(&run).collect()
        };
        Ok(GridReport { units })
    }
}

fn log_summary(pass: &str, report: &GridReport) {
    info!(
        pass,
        completed = report.completed(),
        no_eligible = report.no_eligible(),
        failed = report.failed(),
        "pass complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_adapter::InMemoryAdapter;
    use crate::domain::company::Company;
    use crate::domain::financials::{FinancialFact, Metric, MetricFrequency, PeriodType};
    use crate::domain::price::PricePoint;
    use crate::domain::rule::{Comparator, FilterClause, RuleDefinition};
    use crate::domain::weighting::WeightingScheme;
    use crate::domain::portfolio::PortfolioRecord;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn roe_rule(id: RuleId, threshold: f64) -> Rule {
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

    fn roe(company_id: i64, label: &str, value: f64) -> FinancialFact {
        FinancialFact {
            company_id,
            metric_id: 1,
            period_type: PeriodType::FiscalYear,
            period_label: label.into(),
            period_start: None,
            period_end: None,
            value,
        }
    }

    fn fixture() -> InMemoryAdapter {
        let d = |m, day| NaiveDate::from_ymd_opt(2021, m, day).unwrap();
        InMemoryAdapter::new()
            .with_company(Company::new(1, "AAA", "Alpha"))
            .with_company(Company::new(2, "BBB", "Beta"))
            .with_metric(Metric {
                id: 1,
                name: "ROE".into(),
                unit: Some("%".into()),
                frequency: MetricFrequency::Yearly,
            })
            .with_fact(roe(1, "FY2020", 20.0))
            .with_fact(roe(2, "FY2020", 10.0))
            .with_prices(vec![
                PricePoint::close_only(1, d(1, 4), 100.0),
                PricePoint::close_only(1, d(1, 5), 102.0),
                PricePoint::close_only(1, d(1, 6), 101.0),
            ])
    }

    fn config(start: i32, end: i32) -> BacktestConfig {
        BacktestConfig::new(start, end)
    }

    #[test]
    fn unit_writes_portfolio_and_metrics() {
        let data = fixture().with_rule(roe_rule(1, 15.0));
        let bt = Backtester::new(&data, &data, config(2021, 2021));

        let report = bt.run_grid().unwrap();
        assert_eq!(report.completed(), 1);

        let stored = data.list_yearly_portfolios(2021, 2021).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].weights.len(), 4);
        assert_abs_diff_eq!(stored[0].weights[&WeightingScheme::Equal]["1"], 1.0);

        let rows = data.list_backtest_metrics(Some(1)).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.mean_return.is_some()));
    }

    #[test]
    fn no_eligible_year_writes_nothing() {
        let data = fixture().with_rule(roe_rule(1, 15.0));
        let bt = Backtester::new(&data, &data, config(2020, 2021));

        let report = bt.run_grid().unwrap();
        assert_eq!(
            report.unit(1, 2020).map(|u| &u.status),
            Some(&UnitStatus::NoEligibleCompanies)
        );
        assert_eq!(report.completed(), 1);
        assert_eq!(data.list_yearly_portfolios(2020, 2020).unwrap().len(), 0);
    }

    #[test]
    fn rule_period_clips_grid() {
        let mut rule = roe_rule(1, 15.0);
        rule.definition.bt_period_start = Some("2021".into());
        rule.definition.bt_period_end = Some("2022".into());
        let mut cfg = config(2018, 2025);
        assert_eq!(cfg.years_for(&rule).len(), 8);
        cfg.respect_rule_period = true;
        assert_eq!(cfg.years_for(&rule), vec![2021, 2022]);
    }

    #[test]
    fn parallel_grid_matches_sequential() {
        let data = fixture()
            .with_rule(roe_rule(1, 15.0))
            .with_rule(roe_rule(2, 5.0));
        let mut cfg = config(2019, 2022);
        cfg.workers = 4;
        let report = Backtester::new(&data, &data, cfg).run_grid().unwrap();
        assert_eq!(report.units.len(), 8);
        assert_eq!(report.completed(), 2);
        assert_eq!(report.no_eligible(), 6);
        assert_eq!(report.failed(), 0);
    }

    #[test]
    fn refresh_and_evaluate_passes() {
        let data = fixture().with_rule(roe_rule(1, 5.0));
        let bt = Backtester::new(&data, &data, config(2021, 2021));
        bt.run_grid().unwrap();

        let refreshed = bt.refresh_weights(2021, 2021).unwrap();
        assert_eq!(refreshed.completed(), 1);
        let stored = &data.list_yearly_portfolios(2021, 2021).unwrap()[0];
        assert_eq!(stored.constituents(), vec![1, 2]);

        let evaluated = bt.evaluate_portfolios(2021, 2021).unwrap();
        assert_eq!(evaluated.completed(), 1);
        // appended, not replaced
        assert_eq!(data.list_backtest_metrics(Some(1)).unwrap().len(), 8);
    }

    #[test]
    fn unit_locks_allow_nesting_distinct_keys() {
        let locks = UnitLocks::default();
        let value = locks.with_lock((1, 2021), || locks.with_lock((1, 2022), || 7));
        assert_eq!(value, 7);
    }

    #[test]
    fn unit_locks_serialize_same_key() {
        let locks = UnitLocks::default();
        let inside = AtomicBool::new(false);
        let entered = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        locks.with_lock((1, 2021), || {
                            assert!(!inside.swap(true, Ordering::SeqCst), "two holders of one key");
                            entered.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_micros(50));
                            inside.store(false, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        assert_eq!(entered.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn malformed_rule_fails_its_units_only() {
        let data = fixture()
            .with_rule(roe_rule(1, 15.0))
            .with_rule_record(RuleRecord {
                id: 2,
                name: "string threshold".into(),
                rule_json: r#"{"filters": [{"name": "ROE", "sign": ">", "threshold": "15", "period": "1Y"}]}"#
                    .into(),
            });
        let report = Backtester::new(&data, &data, config(2020, 2021)).run_grid().unwrap();

        assert_eq!(report.units.len(), 4);
        for year in [2020, 2021] {
            match &report.unit(2, year).unwrap().status {
                UnitStatus::Failed { reason } => assert!(reason.contains("rule 2")),
                other => panic!("expected failure, got {other:?}"),
            }
        }
        assert!(matches!(
            report.unit(1, 2021).map(|u| &u.status),
            Some(UnitStatus::Completed { .. })
        ));
        let stored = data.list_yearly_portfolios(2021, 2021).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule_id, 1);
    }

    #[test]
    fn flat_placeholder_portfolio_is_contained_and_reweighted() {
        let data = fixture()
            .with_rule(roe_rule(1, 5.0))
            .with_portfolio_record(PortfolioRecord {
                rule_id: 2,
                year: 2021,
                weights_json: r#"{"1": 0.0, "2": 0.0}"#.into(),
            });
        let bt = Backtester::new(&data, &data, config(2021, 2021));
        bt.run_grid().unwrap();

        let evaluated = bt.evaluate_portfolios(2021, 2021).unwrap();
        assert_eq!(evaluated.completed(), 1);
        assert!(matches!(
            evaluated.unit(2, 2021).map(|u| &u.status),
            Some(UnitStatus::Failed { .. })
        ));
        assert!(data.list_backtest_metrics(Some(2)).unwrap().is_empty());

        let refreshed = bt.refresh_weights(2021, 2021).unwrap();
        assert_eq!(refreshed.completed(), 2);
        let stored = data.list_yearly_portfolios(2021, 2021).unwrap();
        let legacy = stored.iter().find(|p| p.rule_id == 2).unwrap();
        assert_eq!(legacy.constituents(), vec![1, 2]);
        assert_eq!(legacy.weights.len(), 4);
        assert_abs_diff_eq!(legacy.weights[&WeightingScheme::Equal]["2"], 0.5);

        let evaluated = bt.evaluate_portfolios(2021, 2021).unwrap();
        assert_eq!(evaluated.completed(), 2);
    }
}
