//! SQLite data adapter.

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
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use tracing::info;

/// Bound parameters per `IN (...)` chunk.
const MAX_IN_PARAMS: usize = 500;

/// Tables whose ids come from an AUTOINCREMENT sequence.
const SEQUENCED_TABLES: [&str; 4] = ["rules", "filters", "yearly_portfolios", "rule_backtest_metrics"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS companies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    sector TEXT,
    industry TEXT,
    country TEXT,
    listing_date TEXT,
    delisted_date TEXT
);
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    unit TEXT,
    frequency TEXT NOT NULL DEFAULT 'yearly'
);
CREATE TABLE IF NOT EXISTS financials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL REFERENCES companies(id),
    metric_id INTEGER NOT NULL REFERENCES metrics(id),
    period_type TEXT NOT NULL,
    period_label TEXT NOT NULL,
    period_start TEXT,
    period_end TEXT,
    value REAL NOT NULL,
    UNIQUE (company_id, metric_id, period_label)
);
CREATE INDEX IF NOT EXISTS idx_financials_metric_label ON financials(metric_id, period_label);
CREATE TABLE IF NOT EXISTS prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL REFERENCES companies(id),
    date TEXT NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL NOT NULL,
    volume INTEGER,
    adj_close REAL,
    UNIQUE (company_id, date)
);
CREATE INDEX IF NOT EXISTS idx_prices_company_date ON prices(company_id, date);
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    rule_json TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS filters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    category TEXT,
    unit TEXT
);
CREATE TABLE IF NOT EXISTS yearly_portfolios (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL REFERENCES rules(id),
    year INTEGER NOT NULL,
    weights TEXT NOT NULL,
    UNIQUE (rule_id, year)
);
CREATE TABLE IF NOT EXISTS rule_backtest_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL REFERENCES rules(id),
    year INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    mean_return REAL,
    median_return REAL,
    volatility REAL,
    sharpe REAL
);
CREATE INDEX IF NOT EXISTS idx_rbm_rule_year ON rule_backtest_metrics(rule_id, year);";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, RulefolioError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| RulefolioError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database.
    pub fn in_memory() -> Result<Self, RulefolioError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), RulefolioError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)?;
        info!("sqlite schema ready");
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, RulefolioError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn insert_company(&self, company: &Company) -> Result<(), RulefolioError> {
        self.conn()?
            .execute(
                "INSERT INTO companies (id, ticker, name, sector, industry, country, listing_date, delisted_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ticker) DO UPDATE SET
                    name = excluded.name, sector = excluded.sector, industry = excluded.industry,
                    country = excluded.country, listing_date = excluded.listing_date,
                    delisted_date = excluded.delisted_date",
                params![
                    company.id,
                    company.ticker,
                    company.name,
                    company.sector,
                    company.industry,
                    company.country,
                    company.listing_date.map(fmt_date),
                    company.delisted_date.map(fmt_date),
                ],
            )
            .map_err(|e| write_err("companies", e))?;
        Ok(())
    }

    pub fn insert_metric(&self, metric: &Metric) -> Result<(), RulefolioError> {
        self.conn()?
            .execute(
                "INSERT INTO metrics (id, name, unit, frequency) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, unit = excluded.unit, frequency = excluded.frequency",
                params![metric.id, metric.name, metric.unit, metric.frequency.as_str()],
            )
            .map_err(|e| write_err("metrics", e))?;
        Ok(())
    }

    /// Upserts facts on (company, metric, period label).
    pub fn upsert_facts(&self, facts: &[FinancialFact]) -> Result<(), RulefolioError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        for f in facts {
            tx.execute(
                "INSERT INTO financials
                    (company_id, metric_id, period_type, period_label, period_start, period_end, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(company_id, metric_id, period_label) DO UPDATE SET
                    period_type = excluded.period_type, period_start = excluded.period_start,
                    period_end = excluded.period_end, value = excluded.value",
                params![
                    f.company_id,
                    f.metric_id,
                    f.period_type.as_str(),
                    f.period_label,
                    f.period_start.map(fmt_date),
                    f.period_end.map(fmt_date),
                    f.value,
                ],
            )
            .map_err(|e| write_err("financials", e))?;
        }
        tx.commit().map_err(query_err)
    }

    /// Upserts price rows on (company, date).
    pub fn upsert_prices(&self, prices: &[PricePoint]) -> Result<(), RulefolioError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        for p in prices {
            tx.execute(
                "INSERT INTO prices (company_id, date, open, high, low, close, volume, adj_close)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(company_id, date) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume, adj_close = excluded.adj_close",
                params![
                    p.company_id,
                    fmt_date(p.date),
                    p.open,
                    p.high,
                    p.low,
                    p.close,
                    p.volume,
                    p.adj_close,
                ],
            )
            .map_err(|e| write_err("prices", e))?;
        }
        tx.commit().map_err(query_err)
    }

    pub fn insert_filter(&self, entry: &FilterCatalogEntry) -> Result<(), RulefolioError> {
        self.conn()?
            .execute(
                "INSERT INTO filters (id, name, description, category, unit) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    description = excluded.description, category = excluded.category, unit = excluded.unit",
                params![entry.id, entry.name, entry.description, entry.category, entry.unit],
            )
            .map_err(|e| write_err("filters", e))?;
        Ok(())
    }

    /// Imports a rule row as-is, keeping its id. The JSON is not validated.
    pub fn import_rule_record(&self, record: &RuleRecord) -> Result<(), RulefolioError> {
        self.conn()?
            .execute(
                "INSERT INTO rules (id, name, rule_json) VALUES (?1, ?2, ?3)",
                params![record.id, record.name, record.rule_json],
            )
            .map_err(|e| write_err("rules", e))?;
        Ok(())
    }

    /// Imports a portfolio row as-is, replacing any row for the same
    /// (rule, year). The JSON is not validated.
    pub fn import_portfolio_record(&self, record: &PortfolioRecord) -> Result<(), RulefolioError> {
        self.conn()?
            .execute(
                "INSERT INTO yearly_portfolios (rule_id, year, weights) VALUES (?1, ?2, ?3)
                 ON CONFLICT(rule_id, year) DO UPDATE SET weights = excluded.weights",
                params![record.rule_id, record.year, record.weights_json],
            )
            .map_err(|e| write_err("yearly_portfolios", e))?;
        Ok(())
    }

    /// Moves `table`'s AUTOINCREMENT counter up to its current maximum id.
    pub fn resync_sequence(&self, table: &str) -> Result<(), RulefolioError> {
        if !SEQUENCED_TABLES.contains(&table) {
            return Err(RulefolioError::DatabaseQuery {
                reason: format!("no identity sequence for table '{}'", table),
            });
        }
        let sql = format!(
            "UPDATE sqlite_sequence SET seq = (SELECT COALESCE(MAX(id), 0) FROM {table}) WHERE name = ?1"
        );
        self.conn()?.execute(&sql, params![table]).map_err(query_err)?;
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

fn upsert_portfolio_in(tx: &Transaction<'_>, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError> {
    tx.execute(
        "INSERT INTO yearly_portfolios (rule_id, year, weights) VALUES (?1, ?2, ?3)
         ON CONFLICT(rule_id, year) DO UPDATE SET weights = excluded.weights",
        params![portfolio.rule_id, portfolio.year, portfolio.weights_json()?],
    )
    .map_err(|e| write_err("yearly_portfolios", e))?;
    Ok(())
}

fn insert_metrics_in(tx: &Transaction<'_>, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError> {
    for r in rows {
        tx.execute(
            "INSERT INTO rule_backtest_metrics
                (rule_id, year, scheme, mean_return, median_return, volatility, sharpe)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                r.rule_id,
                r.year,
                r.scheme.as_str(),
                r.mean_return,
                r.median_return,
                r.volatility,
                r.sharpe,
            ],
        )
        .map_err(|e| write_err("rule_backtest_metrics", e))?;
    }
    Ok(())
}

impl DataPort for SqliteAdapter {
    fn list_companies(&self) -> Result<Vec<Company>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, ticker, name, sector, industry, country, listing_date, delisted_date
                 FROM companies ORDER BY id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Company {
                    id: row.get(0)?,
                    ticker: row.get(1)?,
                    name: row.get(2)?,
                    sector: row.get(3)?,
                    industry: row.get(4)?,
                    country: row.get(5)?,
                    listing_date: opt_date(row.get(6)?)?,
                    delisted_date: opt_date(row.get(7)?)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<_, _>>().map_err(query_err)
    }

    fn find_metric(&self, name: &str) -> Result<Option<Metric>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, unit, frequency FROM metrics WHERE name = ?1")
            .map_err(query_err)?;
        let mut rows = stmt
            .query_map(params![name], |row| {
                let frequency: String = row.get(3)?;
                Ok(Metric {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    unit: row.get(2)?,
                    frequency: MetricFrequency::parse(&frequency)
                        .ok_or_else(|| conversion_err(3, &frequency))?,
                })
            })
            .map_err(query_err)?;
        rows.next().transpose().map_err(query_err)
    }

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<FinancialFact>, RulefolioError> {
        let base = "SELECT company_id, metric_id, period_type, period_label, period_start, period_end, value
                    FROM financials
                    WHERE metric_id = ?1 AND substr(period_label, -length(?2)) = ?2";
        let conn = self.conn()?;

        let fixed = vec![
            Value::Integer(query.metric_id),
            Value::Text(query.period_suffix.clone()),
        ];
        let mut facts = Vec::new();
        match &query.company_ids {
            None => facts.extend(select_facts(&conn, base, fixed)?),
            Some(ids) => {
                for chunk in ids.chunks(MAX_IN_PARAMS) {
                    let sql = format!("{} AND company_id IN ({})", base, placeholders(3, chunk.len()));
                    let mut values = fixed.clone();
                    values.extend(chunk.iter().map(|id| Value::Integer(*id)));
                    facts.extend(select_facts(&conn, &sql, values)?);
                }
            }
        }
        Ok(facts)
    }

    fn list_prices(
        &self,
        company_ids: &[CompanyId],
        window: DateWindow,
    ) -> Result<Vec<PricePoint>, RulefolioError> {
        let conn = self.conn()?;
        let mut prices = Vec::new();
        for chunk in company_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT company_id, date, open, high, low, close, volume, adj_close
                 FROM prices
                 WHERE date >= ?1 AND date <= ?2 AND company_id IN ({})
                 ORDER BY company_id, date",
                placeholders(3, chunk.len())
            );
            let mut values = vec![
                Value::Text(fmt_date(window.start)),
                Value::Text(fmt_date(window.end)),
            ];
            values.extend(chunk.iter().map(|id| Value::Integer(*id)));

            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    let date: String = row.get(1)?;
                    Ok(PricePoint {
                        company_id: row.get(0)?,
                        date: parse_date(&date)?,
                        open: row.get(2)?,
                        high: row.get(3)?,
                        low: row.get(4)?,
                        close: row.get(5)?,
                        volume: row.get(6)?,
                        adj_close: row.get(7)?,
                    })
                })
                .map_err(query_err)?;
            for row in rows {
                prices.push(row.map_err(query_err)?);
            }
        }
        Ok(prices)
    }

    fn list_rule_records(&self) -> Result<Vec<RuleRecord>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, rule_json FROM rules ORDER BY id")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RuleRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    rule_json: row.get(2)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<_, _>>().map_err(query_err)
    }

    fn list_filter_catalog(&self) -> Result<Vec<FilterCatalogEntry>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, description, category, unit FROM filters ORDER BY id")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FilterCatalogEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    category: row.get(3)?,
                    unit: row.get(4)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<_, _>>().map_err(query_err)
    }

    fn list_portfolio_records(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<PortfolioRecord>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, year, weights FROM yearly_portfolios
                 WHERE year >= ?1 AND year <= ?2 ORDER BY rule_id, year",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![start_year, end_year], |row| {
                Ok(PortfolioRecord {
                    rule_id: row.get(0)?,
                    year: row.get(1)?,
                    weights_json: row.get(2)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<_, _>>().map_err(query_err)
    }

    fn list_backtest_metrics(
        &self,
        rule_id: Option<RuleId>,
    ) -> Result<Vec<RuleBacktestMetric>, RulefolioError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, year, scheme, mean_return, median_return, volatility, sharpe
                 FROM rule_backtest_metrics
                 WHERE ?1 IS NULL OR rule_id = ?1
                 ORDER BY id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![rule_id], |row| {
                let scheme: String = row.get(2)?;
                Ok(RuleBacktestMetric {
                    rule_id: row.get(0)?,
                    year: row.get(1)?,
                    scheme: WeightingScheme::parse(&scheme)
                        .ok_or_else(|| conversion_err(2, &scheme))?,
                    mean_return: row.get(3)?,
                    median_return: row.get(4)?,
                    volatility: row.get(5)?,
                    sharpe: row.get(6)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<_, _>>().map_err(query_err)
    }
}

impl StorePort for SqliteAdapter {
    fn upsert_yearly_portfolio(&self, portfolio: &YearlyPortfolio) -> Result<(), RulefolioError> {
        self.write_with_repair(|| {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(query_err)?;
            upsert_portfolio_in(&tx, portfolio)?;
            tx.commit().map_err(query_err)
        })
    }

    fn insert_backtest_metrics(&self, rows: &[RuleBacktestMetric]) -> Result<(), RulefolioError> {
        self.write_with_repair(|| {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(query_err)?;
            insert_metrics_in(&tx, rows)?;
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
            let tx = conn.transaction().map_err(query_err)?;
            upsert_portfolio_in(&tx, portfolio)?;
            insert_metrics_in(&tx, rows)?;
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
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO rules (name, rule_json) VALUES (?1, ?2)",
                params![name, json],
            )
            .map_err(|e| write_err("rules", e))?;
            Ok(conn.last_insert_rowid())
        })
    }
}

fn select_facts(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<FinancialFact>, RulefolioError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let period_type: String = row.get(2)?;
            Ok(FinancialFact {
                company_id: row.get(0)?,
                metric_id: row.get(1)?,
                period_type: PeriodType::parse(&period_type)
                    .ok_or_else(|| conversion_err(2, &period_type))?,
                period_label: row.get(3)?,
                period_start: opt_date(row.get(4)?)?,
                period_end: opt_date(row.get(5)?)?,
                value: row.get(6)?,
            })
        })
        .map_err(query_err)?;
    rows.collect::<Result<_, _>>().map_err(query_err)
}

/// `?first, ?first+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(s.len(), rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_date(s: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    s.as_deref().map(parse_date).transpose()
}

fn conversion_err(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}

fn pool_err(e: r2d2::Error) -> RulefolioError {
    RulefolioError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> RulefolioError {
    RulefolioError::DatabaseQuery {
        reason: e.to_string(),
    }
}

/// Primary-key and unique violations become [`RulefolioError::KeyConflict`].
fn write_err(table: &str, e: rusqlite::Error) -> RulefolioError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            RulefolioError::KeyConflict {
                table: table.to_string(),
                reason: e.to_string(),
            }
        }
        _ => query_err(e),
    }
}
