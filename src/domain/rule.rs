//! Screening rule definitions.
//!
//! A rule is persisted as a JSON document:
//! - `filters`: clauses `{name, sign, threshold, period, consisPeriod}`
//! - `sign_mcap` / `mcap_threshold`: optional portfolio-level size gate
//! - `bt_period_start` / `bt_period_end`: the years the rule is meant for
//!
//! Signs outside the closed [`Comparator`] set still deserialize, as
//! [`Sign::Unrecognized`], so that stored rules always load; what happens to
//! them is decided by [`UnknownSignPolicy`] when the rule is turned into a
//! [`ScreeningPlan`].

use crate::domain::error::RulefolioError;
use crate::domain::financials::MARKET_CAP_METRIC;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

pub type RuleId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
}

impl Comparator {
    pub const ALL: [Comparator; 4] = [
        Comparator::Gt,
        Comparator::Lt,
        Comparator::Ge,
        Comparator::Le,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            ">" => Some(Comparator::Gt),
            "<" => Some(Comparator::Lt),
            ">=" => Some(Comparator::Ge),
            "<=" => Some(Comparator::Le),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
        }
    }

    /// NaN values never satisfy a comparison.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Le => value <= threshold,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// The sign of a clause as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sign {
    Known(Comparator),
    Unrecognized(String),
}

impl From<String> for Sign {
    fn from(s: String) -> Self {
        match Comparator::parse(&s) {
            Some(c) => Sign::Known(c),
            None => Sign::Unrecognized(s),
        }
    }
}

impl From<Sign> for String {
    fn from(sign: Sign) -> Self {
        match sign {
            Sign::Known(c) => c.symbol().to_string(),
            Sign::Unrecognized(s) => s,
        }
    }
}

impl From<Comparator> for Sign {
    fn from(c: Comparator) -> Self {
        Sign::Known(c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookbackPeriod {
    #[serde(rename = "1Y")]
    OneYear,
    #[serde(rename = "3Y")]
    ThreeYears,
    #[serde(rename = "5Y")]
    FiveYears,
    #[serde(rename = "10Y")]
    TenYears,
}

impl LookbackPeriod {
    pub const ALL: [LookbackPeriod; 4] = [
        LookbackPeriod::OneYear,
        LookbackPeriod::ThreeYears,
        LookbackPeriod::FiveYears,
        LookbackPeriod::TenYears,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookbackPeriod::OneYear => "1Y",
            LookbackPeriod::ThreeYears => "3Y",
            LookbackPeriod::FiveYears => "5Y",
            LookbackPeriod::TenYears => "10Y",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    /// Catalogue id of the filter this clause was generated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub sign: Sign,
    pub threshold: f64,
    pub period: LookbackPeriod,
    #[serde(rename = "consisPeriod", default)]
    pub consistency_period: Option<f64>,
}

impl FilterClause {
    pub fn new(name: &str, comparator: Comparator, threshold: f64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            sign: Sign::Known(comparator),
            threshold,
            period: LookbackPeriod::OneYear,
            consistency_period: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bt_period_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bt_period_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_mcap: Option<Sign>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcap_threshold: Option<f64>,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
}

impl RuleDefinition {
    pub fn with_filters(filters: Vec<FilterClause>) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RulefolioError> {
        serde_json::from_str(json).map_err(|e| RulefolioError::RuleInvalid {
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, RulefolioError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Inclusive years declared by `bt_period_start` / `bt_period_end`.
    pub fn backtest_years(&self) -> Option<(i32, i32)> {
        let start = self.bt_period_start.as_deref()?.trim().parse().ok()?;
        let end = self.bt_period_end.as_deref()?.trim().parse().ok()?;
        Some((start, end))
    }

    /// Resolves the stored clauses into comparable screening clauses.
    pub fn screening_plan(
        &self,
        options: &ScreeningOptions,
    ) -> Result<ScreeningPlan, RulefolioError> {
        let mut clauses = Vec::with_capacity(self.filters.len() + 1);

        for filter in &self.filters {
            if let Some(comparator) = resolve_sign(&filter.sign, &filter.name, options)? {
                clauses.push(ScreeningClause {
                    metric_name: filter.name.clone(),
                    comparator,
                    threshold: filter.threshold,
                });
            }
        }

        if options.apply_mcap_threshold {
            if let (Some(sign), Some(threshold)) = (&self.sign_mcap, self.mcap_threshold) {
                if let Some(comparator) = resolve_sign(sign, MARKET_CAP_METRIC, options)? {
                    clauses.push(ScreeningClause {
                        metric_name: MARKET_CAP_METRIC.to_string(),
                        comparator,
                        threshold,
                    });
                }
            }
        }

        Ok(ScreeningPlan {
            declared_filters: self.filters.len(),
            clauses,
        })
    }
}

fn resolve_sign(
    sign: &Sign,
    name: &str,
    options: &ScreeningOptions,
) -> Result<Option<Comparator>, RulefolioError> {
    match sign {
        Sign::Known(c) => Ok(Some(*c)),
        Sign::Unrecognized(raw) => match options.unknown_sign {
            UnknownSignPolicy::Skip => {
                warn!(clause = name, sign = raw.as_str(), "skipping clause with unrecognized sign");
                Ok(None)
            }
            UnknownSignPolicy::Reject => Err(RulefolioError::RuleInvalid {
                reason: format!("clause '{}' has unrecognized sign '{}'", name, raw),
            }),
        },
    }
}

/// What to do with a clause whose sign is not one of `>`, `<`, `>=`, `<=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownSignPolicy {
    /// Treat the clause as always true.
    #[default]
    Skip,
    /// Fail rule validation.
    Reject,
}

impl UnknownSignPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Some(UnknownSignPolicy::Skip),
            "reject" => Some(UnknownSignPolicy::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreeningOptions {
    pub unknown_sign: UnknownSignPolicy,
    pub apply_mcap_threshold: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningClause {
    pub metric_name: String,
    pub comparator: Comparator,
    pub threshold: f64,
}

impl ScreeningClause {
    pub fn accepts(&self, value: f64) -> bool {
        self.comparator.holds(value, self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningPlan {
    /// Number of filter clauses in the stored rule, skipped ones included.
    pub declared_filters: usize,
    pub clauses: Vec<ScreeningClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub definition: RuleDefinition,
}

/// A rule row as stored, with its definition still in JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub id: RuleId,
    pub name: String,
    pub rule_json: String,
}

impl RuleRecord {
    pub fn from_rule(rule: &Rule) -> Result<Self, RulefolioError> {
        Ok(Self {
            id: rule.id,
            name: rule.name.clone(),
            rule_json: rule.definition.to_json()?,
        })
    }

    pub fn parse(&self) -> Result<Rule, RulefolioError> {
        let definition = RuleDefinition::from_json(&self.rule_json).map_err(|e| match e {
            RulefolioError::RuleInvalid { reason } => RulefolioError::RuleInvalid {
                reason: format!("rule {}: {reason}", self.id),
            },
            other => other,
        })?;
        Ok(Rule {
            id: self.id,
            name: self.name.clone(),
            definition,
        })
    }
}
