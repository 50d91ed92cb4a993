//! Metric catalogue and period-stamped financial facts.
//!
//! Period labels encode the fiscal or calendar period a fact belongs to
//! (`FY2020`, `Q1FY2024`, `TTM2024`). The trailing four digits name the year
//! the fact describes; screening and weighting for formation year `Y` only
//! ever ask for labels ending in `Y - 1`.

use crate::domain::company::CompanyId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type MetricId = i64;

/// Name of the catalogue metric used as the size proxy.
pub const MARKET_CAP_METRIC: &str = "market_cap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFrequency {
    Yearly,
    Quarterly,
    Ttm,
}

impl MetricFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFrequency::Yearly => "yearly",
            MetricFrequency::Quarterly => "quarterly",
            MetricFrequency::Ttm => "ttm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "yearly" => Some(MetricFrequency::Yearly),
            "quarterly" => Some(MetricFrequency::Quarterly),
            "ttm" => Some(MetricFrequency::Ttm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    FiscalYear,
    FiscalQuarter,
    CalendarMonth,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::FiscalYear => "fiscal_year",
            PeriodType::FiscalQuarter => "fiscal_quarter",
            PeriodType::CalendarMonth => "calendar_month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fiscal_year" => Some(PeriodType::FiscalYear),
            "fiscal_quarter" => Some(PeriodType::FiscalQuarter),
            "calendar_month" => Some(PeriodType::CalendarMonth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
    pub unit: Option<String>,
    pub frequency: MetricFrequency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinancialFact {
    pub company_id: CompanyId,
    pub metric_id: MetricId,
    pub period_type: PeriodType,
    pub period_label: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub value: f64,
}

impl FinancialFact {
    /// The year this fact's period label denotes, if it ends in a year.
    pub fn label_year(&self) -> Option<i32> {
        period_label_year(&self.period_label)
    }
}

/// Parses the trailing four digits of a period label as a year.
pub fn period_label_year(label: &str) -> Option<i32> {
    let label = label.trim();
    if label.len() < 4 || !label.is_char_boundary(label.len() - 4) {
        return None;
    }
    let tail = &label[label.len() - 4..];
    if tail.bytes().all(|b| b.is_ascii_digit()) {
        tail.parse().ok()
    } else {
        None
    }
}

/// Label suffix selecting the latest fiscal year fully known before
/// `formation_year` begins.
pub fn lagged_period_suffix(formation_year: i32) -> String {
    (formation_year - 1).to_string()
}

/// Filter on the fact table: one metric, one label suffix and optionally a
/// restricted company set.
#[derive(Debug, Clone, PartialEq)]
pub struct FactQuery {
    pub metric_id: MetricId,
    pub period_suffix: String,
    pub company_ids: Option<Vec<CompanyId>>,
}

impl FactQuery {
    /// Facts for `metric_id` from the fiscal year before `formation_year`.
    pub fn lagged(metric_id: MetricId, formation_year: i32) -> Self {
        Self {
            metric_id,
            period_suffix: lagged_period_suffix(formation_year),
            company_ids: None,
        }
    }

    pub fn for_companies(mut self, company_ids: &[CompanyId]) -> Self {
        self.company_ids = Some(company_ids.to_vec());
        self
    }

    pub fn matches(&self, fact: &FinancialFact) -> bool {
        fact.metric_id == self.metric_id
            && fact.period_label.ends_with(&self.period_suffix)
            && self
                .company_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&fact.company_id))
    }
}

/// One value per company out of a lagged fact set. A fiscal-year fact wins
/// over interim periods, then the later `period_end`; non-finite values are
/// treated as missing.
pub fn latest_values_by_company(facts: &[FinancialFact]) -> HashMap<CompanyId, f64> {
    let mut best: HashMap<CompanyId, &FinancialFact> = HashMap::new();
    for fact in facts.iter().filter(|f| f.value.is_finite()) {
        let replace = best
            .get(&fact.company_id)
            .is_none_or(|current| supersedes(fact, current));
        if replace {
            best.insert(fact.company_id, fact);
        }
    }
    best.into_iter().map(|(id, f)| (id, f.value)).collect()
}

fn supersedes(candidate: &FinancialFact, current: &FinancialFact) -> bool {
    let rank = |f: &FinancialFact| (f.period_type == PeriodType::FiscalYear, f.period_end);
    rank(candidate) > rank(current)
}
