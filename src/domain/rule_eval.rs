//! Rule screening against lagged financial facts.
//!
//! # Evaluation Semantics
//!
//! - Every clause reads facts labelled with fiscal year `Y - 1` only
//! - A company passes a clause when one of its facts satisfies the comparator
//! - A company without a fact for a clause's metric fails that clause
//! - The eligible set is the intersection across clauses
//! - A rule without clauses selects nothing; a rule whose clauses were all
//!   skipped selects every company

use crate::domain::company::CompanyId;
use crate::domain::error::RulefolioError;
use crate::domain::financials::FactQuery;
use crate::domain::rule::{RuleDefinition, ScreeningClause, ScreeningOptions};
use crate::ports::data_port::DataPort;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub struct RuleEvaluator<'a> {
    data: &'a dyn DataPort,
    options: ScreeningOptions,
}

impl<'a> RuleEvaluator<'a> {
    pub fn new(data: &'a dyn DataPort, options: ScreeningOptions) -> Self {
        Self { data, options }
    }

    /// Companies satisfying every clause of `rule` for formation `year`,
    /// ascending by id.
    pub fn eligible_companies(
        &self,
        rule: &RuleDefinition,
        year: i32,
    ) -> Result<Vec<CompanyId>, RulefolioError> {
        let plan = rule.screening_plan(&self.options)?;
        if plan.declared_filters == 0 {
            debug!(year, "rule has no filter clauses");
            return Ok(Vec::new());
        }

        if plan.clauses.is_empty() {
            let all: BTreeSet<CompanyId> =
                self.data.list_companies()?.into_iter().map(|c| c.id).collect();
            return Ok(all.into_iter().collect());
        }

        let mut eligible: Option<BTreeSet<CompanyId>> = None;
        for clause in &plan.clauses {
            let passing = self.passing_companies(clause, year, eligible.as_ref())?;
            if passing.is_empty() {
                return Ok(Vec::new());
            }
            eligible = Some(passing);
        }

        Ok(eligible.unwrap_or_default().into_iter().collect())
    }

    fn passing_companies(
        &self,
        clause: &ScreeningClause,
        year: i32,
        candidates: Option<&BTreeSet<CompanyId>>,
    ) -> Result<BTreeSet<CompanyId>, RulefolioError> {
        let Some(metric) = self.data.find_metric(&clause.metric_name)? else {
            warn!(metric = clause.metric_name.as_str(), "metric not catalogued, clause matches nothing");
            return Ok(BTreeSet::new());
        };

        let mut query = FactQuery::lagged(metric.id, year);
        if let Some(ids) = candidates {
            let ids: Vec<CompanyId> = ids.iter().copied().collect();
            query = query.for_companies(&ids);
        }

        Ok(self
            .data
            .list_facts(&query)?
            .into_iter()
            .filter(|f| query.matches(f) && clause.accepts(f.value))
            .map(|f| f.company_id)
            .collect())
    }
}
