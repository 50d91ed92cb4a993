//! PostgreSQL data adapter.

use crate::adapters::sequence_repair::retry_once_after_resync;
use crate::domain::company::{Company, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::evolution::FilterCatalogEntry;
use crate::domain::financials::{FactQuery, FinancialFact, Metric, MetricFrequency, PeriodType};
use crate::domain::portfolio::{PortfolioRecord, RuleBacktestMetric, YearlyPortfolio};
use crate::domain::price::{DateWindow, PricePoint};
use crate::domain::rule::{RuleDefinition, RuleId, RuleRecord};
use crate::domain::weighting::WeightingScheme;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::store_port::StorePort;
use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{NoTls, Row, Transaction};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::info;

type Manager = PostgresConnectionManager<NoTls>;

const SEQUENCED_TABLES: [&str; 4] = ["rules", "filters", "yearly_portfolios", "rule_backtest_metrics"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS companies (
    id BIGSERIAL PRIMARY KEY,
    ticker TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    sector TEXT,
    industry TEXT,
    country TEXT,
    listing_date DATE,
    delisted_date DATE
);
CREATE TABLE IF NOT EXISTS metrics (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    unit TEXT,
    frequency TEXT NOT NULL DEFAULT 'yearly'
);
CREATE TABLE IF NOT EXISTS financials (
    id BIGSERIAL PRIMARY KEY,
    company_id BIGINT NOT NULL REFERENCES companies(id),
    metric_id BIGINT NOT NULL REFERENCES metrics(id),
    period_type TEXT NOT NULL,
    period_label TEXT NOT NULL,
    period_start DATE,
    period_end DATE,
    value DOUBLE PRECISION NOT NULL,
    UNIQUE (company_id, metric_id, period_label)
);
CREATE INDEX IF NOT EXISTS idx_financials_metric_label ON financials(metric_id, period_label);
CREATE TABLE IF NOT EXISTS prices (
    id BIGSERIAL PRIMARY KEY,
    company_id BIGINT NOT NULL REFERENCES companies(id),
    date DATE NOT NULL,
    open DOUBLE PRECISION,
    high DOUBLE PRECISION,
    low DOUBLE PRECISION,
    close DOUBLE PRECISION NOT NULL,
    volume BIGINT,
    adj_close DOUBLE PRECISION,
    UNIQUE (company_id, date)
);
CREATE TABLE IF NOT EXISTS rules (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    rule_json TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS filters (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    category TEXT,
    unit TEXT
);
CREATE TABLE IF NOT EXISTS yearly_portfolios (
    id BIGSERIAL PRIMARY KEY,
    rule_id BIGINT NOT NULL REFERENCES rules(id),
    year INTEGER NOT NULL,
    weights TEXT NOT NULL,
    UNIQUE (rule_id, year)
);
CREATE TABLE IF NOT EXISTS rule_backtest_metrics (
    id BIGSERIAL PRIMARY KEY,
    rule_id BIGINT NOT NULL REFERENCES rules(id),
    year INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    mean_return DOUBLE PRECISION,
    median_return DOUBLE PRECISION,
    volatility DOUBLE PRECISION,
    sharpe DOUBLE PRECISION
);
CREATE INDEX IF NOT EXISTS idx_rbm_rule_year ON rule_backtest_metrics(rule_id, year);";

pub struct PostgresAdapter {
    pool: Pool<Manager>,
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, RulefolioError> {
        // Try [postgres] connection_string first, fall back to [database] conninfo
        let connection_string = config
            .get_string("postgres", "connection_string")
            .or_else(|| config.get_string("database", "conninfo"))
            .ok_or_else(|| RulefolioError::ConfigMissing {
                section: "postgres".into(),
                key: "connection_string".into(),
            })?;
        let pool_size = config.get_int("postgres", "pool_size", 4).max(1) as u32;

        let pg_config = connection_string
            .parse::<postgres::Config>()
            .map_err(|e| RulefolioError::ConfigInvalid {
                section: "postgres".into(),
                key: "connection_string".into(),
                reason: e.to_string(),
            })?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| RulefolioError::Database {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), RulefolioError> {
        self.conn()?.batch_execute(SCHEMA).map_err(query_err)?;
        info!("postgres schema ready");
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, RulefolioError> {
        self.pool.get().map_err(|e| RulefolioError::Database {
            reason: e.to_string(),
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, RulefolioError> {
        self.conn()?.query(sql, params).map_err(query_err)
    }

    /// Moves `table`'s serial sequence past its current maximum id.
    pub fn resync_sequence(&self, table: &str) -> Result<(), RulefolioError> {
        if !SEQUENCED_TABLES.contains(&table) {
            return Err(RulefolioError::DatabaseQuery {
                reason: format!("no identity sequence for table '{}'", table),
            });
        }
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence('{table}', 'id'), COALESCE(MAX(id), 0) + 1, false) FROM {table}"
        );
        self.conn()?.execute(sql.as_str(), &[]).map_err(query_err)?;
        info!(table, "resynchronized identity sequence");
        Ok(())
    }

    fn write_with_repair<T>(
        &self,
        write: impl FnMut() -> Result<T, RulefolioError>,
    ) -> Result<T, RulefolioError> {
        retry_once_after_resync(write, |table| self.resync_sequence(table))
    }
}

fn upsert_portfolio_in(tx: &mut Transaction<'_>, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError> {
    let weights = portfolio.weights_json()?;
    tx.execute(
        "INSERT INTO yearly_portfolios (rule_id, year, weights) VALUES ($1, $2, $3)
         ON CONFLICT (rule_id, year) DO UPDATE SET weights = EXCLUDED.weights",
        &[&portfolio.rule_id, &portfolio.year, &weights],
    )
    .map_err(|e| write_err("yearly_portfolios", e))?;
    Ok(())
}

fn insert_metrics_in(tx: &mut Transaction<'_>, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError> {
    for r in rows {
        tx.execute(
            "INSERT INTO rule_backtest_metrics
                (rule_id, year, scheme, mean_return, median_return, volatility, sharpe)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &r.rule_id,
                &r.year,
                &r.scheme.as_str(),
                &r.mean_return,
                &r.median_return,
                &r.volatility,
                &r.sharpe,
            ],
        )
        .map_err(|e| write_err("rule_backtest_metrics", e))?;
    }
    Ok(())
}

impl DataPort for PostgresAdapter {
    fn list_companies(&self) -> Result<Vec<Company>, RulefolioError> {
        let rows = self.query(
            "SELECT id, ticker, name, sector, industry, country, listing_date, delisted_date
             FROM companies ORDER BY id",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| Company {
                id: row.get(0),
                ticker: row.get(1),
                name: row.get(2),
                sector: row.get(3),
                industry: row.get(4),
                country: row.get(5),
                listing_date: row.get(6),
                delisted_date: row.get(7),
            })
            .collect())
    }

    fn find_metric(&self, name: &str) -> Result<Option<Metric>, RulefolioError> {
        let rows = self.query(
            "SELECT id, name, unit, frequency FROM metrics WHERE name = $1",
            &[&name],
        )?;
        rows.into_iter()
            .next()
            .map(|row| {
                let frequency: String = row.get(3);
                Ok(Metric {
                    id: row.get(0),
                    name: row.get(1),
                    unit: row.get(2),
                    frequency: MetricFrequency::parse(&frequency)
                        .ok_or_else(|| unexpected("metrics.frequency", &frequency))?,
                })
            })
            .transpose()
    }

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<FinancialFact>, RulefolioError> {
        let ids: Option<Vec<CompanyId>> = query.company_ids.clone();
        let rows = self.query(
            "SELECT company_id, metric_id, period_type, period_label, period_start, period_end, value
             FROM financials
             WHERE metric_id = $1
               AND right(period_label, length($2)) = $2
               AND ($3::BIGINT[] IS NULL OR company_id = ANY($3))",
            &[&query.metric_id, &query.period_suffix, &ids],
        )?;
        rows.into_iter()
            .map(|row| {
                let period_type: String = row.get(2);
                Ok(FinancialFact {
                    company_id: row.get(0),
                    metric_id: row.get(1),
                    period_type: PeriodType::parse(&period_type)
                        .ok_or_else(|| unexpected("financials.period_type", &period_type))?,
                    period_label: row.get(3),
                    period_start: row.get(4),
                    period_end: row.get(5),
                    value: row.get(6),
                })
            })
            .collect()
    }

    fn list_prices(
        &self,
        company_ids: &[CompanyId],
        window: DateWindow,
    ) -> Result<Vec<PricePoint>, RulefolioError> {
        if company_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = company_ids.to_vec();
        let rows = self.query(
            "SELECT company_id, date, open, high, low, close, volume, adj_close
             FROM prices
             WHERE company_id = ANY($1) AND date >= $2 AND date <= $3
             ORDER BY company_id, date",
            &[&ids, &window.start, &window.end],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| PricePoint {
                company_id: row.get(0),
                date: row.get(1),
                open: row.get(2),
                high: row.get(3),
                low: row.get(4),
                close: row.get(5),
                volume: row.get(6),
                adj_close: row.get(7),
            })
            .collect())
    }

    fn list_rule_records(&self) -> Result<Vec<RuleRecord>, RulefolioError> {
        let rows = self.query("SELECT id, name, rule_json FROM rules ORDER BY id", &[])?;
        Ok(rows
            .into_iter()
            .map(|row| RuleRecord {
                id: row.get(0),
                name: row.get(1),
                rule_json: row.get(2),
            })
            .collect())
    }

    fn list_filter_catalog(&self) -> Result<Vec<FilterCatalogEntry>, RulefolioError> {
        let rows = self.query(
            "SELECT id, name, description, category, unit FROM filters ORDER BY id",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| FilterCatalogEntry {
                id: row.get(0),
                name: row.get(1),
                description: row.get(2),
                category: row.get(3),
                unit: row.get(4),
            })
            .collect())
    }

    fn list_portfolio_records(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<PortfolioRecord>, RulefolioError> {
        let rows = self.query(
            "SELECT rule_id, year, weights FROM yearly_portfolios
             WHERE year >= $1 AND year <= $2 ORDER BY rule_id, year",
            &[&start_year, &end_year],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| PortfolioRecord {
                rule_id: row.get(0),
                year: row.get(1),
                weights_json: row.get(2),
            })
            .collect())
    }

    fn list_backtest_metrics(
        &self,
        rule_id: Option<RuleId>,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError> {
        let rows = self.query(
            "SELECT rule_id, year, scheme, mean_return, median_return, volatility, sharpe
             FROM rule_backtest_metrics
             WHERE $1::BIGINT IS NULL OR rule_id = $1
             ORDER BY id",
            &[&rule_id],
        )?;
        rows.into_iter()
            .map(|row| {
                let scheme: String = row.get(2);
                Ok(RuleBacktestMetric {
                    rule_id: row.get(0),
                    year: row.get(1),
                    scheme: WeightingScheme::parse(&scheme)
                        .ok_or_else(|| unexpected("rule_backtest_metrics.scheme", &scheme))?,
                    mean_return: row.get(3),
                    median_return: row.get(4),
                    volatility: row.get(5),
                    sharpe: row.get(6),
                })
            })
            .collect()
    }
}

impl StorePort for PostgresAdapter {
    fn upsert_yearly_portfolio(&self, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError> {
        self.write_with_repair(|| {
            let mut conn = self.conn()?;
            let mut tx = conn.transaction().map_err(query_err)?;
            upsert_portfolio_in(&mut tx, portfolio)?;
            tx.commit().map_err(query_err)
        })
    }

    fn insert_backtest_metrics(&self, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError> {
        self.write_with_repair(|| {
            let mut conn = self.conn()?;
            let mut tx = conn.transaction().map_err(query_err)?;
            insert_metrics_in(&mut tx, rows)?;
            tx.commit().map_err(query_err)
        })
    }

    fn commit_unit(
        &self,
        portfolio: &YearlyPortfolio,
        rows: &[RuleBacktestMetric],
    ) -> Result<(), RulefolioError> {
        self.write_with_repair(|| {
            let mut conn = self.conn()?;
            let mut tx = conn.transaction().map_err(query_err)?;
            upsert_portfolio_in(&mut tx, portfolio)?;
            insert_metrics_in(&mut tx, rows)?;
            tx.commit().map_err(query_err)
        })
    }

    fn insert_rule(
        &self,
        name: &str,
        definition: &RuleDefinition,
    ) -> Result<RuleId, RulefolioError> {
        let json = definition.to_json()?;
        self.write_with_repair(|| {
            let row = self
                .conn()?
                .query_one(
                    "INSERT INTO rules (name, rule_json) VALUES ($1, $2) RETURNING id",
                    &[&name, &json],
                )
                .map_err(|e| write_err("rules", e))?;
            Ok(row.get(0))
        })
    }
}

fn query_err(e: postgres::Error) -> RulefolioError {
    RulefolioError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn write_err(table: &str, e: postgres::Error) -> RulefolioError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return RulefolioError::KeyConflict {
            table: table.to_string(),
            reason: e.to_string(),
        };
    }
    query_err(e)
}

fn unexpected(column: &str, value: &str) -> RulefolioError {
    RulefolioError::DatabaseQuery {
        reason: format!("unexpected value '{}' in {}", value, column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_double(&self, _section: &str, _key: &str, default: f64) -> f64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    struct BadConnString;

    impl ConfigPort for BadConnString {
        fn get_string(&self, section: &str, key: &str) -> Option<String> {
            (section == "postgres" && key == "connection_string").then(|| "host='unterminated".to_string())
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_double(&self, _section: &str, _key: &str, default: f64) -> f64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    #[test]
    fn from_config_missing_connection_string() {
        let config = EmptyConfig;
        let result = PostgresAdapter::from_config(&config);
        match result {
            Err(RulefolioError::ConfigMissing { section, key }) => {
                assert_eq!(section, "postgres");
                assert_eq!(key, "connection_string");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn from_config_rejects_malformed_connection_string() {
        let result = PostgresAdapter::from_config(&BadConnString);
        assert!(matches!(result, Err(RulefolioError::ConfigInvalid { .. })));
    }
}
