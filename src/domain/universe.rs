//! Investable universe: eligible companies ranked by lagged market cap and
//! truncated to a fixed capacity.

use crate::domain::company::CompanyId;
use crate::domain::error::RulefolioError;
use crate::domain::financials::{latest_values_by_company, FactQuery, MARKET_CAP_METRIC};
use crate::ports::data_port::DataPort;
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct Universe {
    pub year: i32,
    pub constituents: Vec<CompanyId>,
}

impl Universe {
    pub fn count(&self) -> usize {
        self.constituents.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniverseRanker {
    pub capacity: usize,
}

impl Default for UniverseRanker {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl UniverseRanker {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Top `capacity` companies of `eligible` by prior-year market cap.
    /// `None` when there is nothing to hold.
    pub fn rank(
        &self,
        data: &dyn DataPort,
        eligible: &[CompanyId],
        year: i32,
    ) -> Result<Option<Universe>, RulefolioError> {
        if eligible.is_empty() {
            return Ok(None);
        }

        let keys = ranking_keys(data, eligible, year)?;
        let constituents = rank_by_key(eligible, &keys, self.capacity);
        if constituents.is_empty() {
            return Ok(None);
        }
        Ok(Some(Universe { year, constituents }))
    }
}

fn ranking_keys(
    data: &dyn DataPort,
    ids: &[CompanyId],
    year: i32,
) -> Result<HashMap<CompanyId, f64>, RulefolioError> {
    let Some(metric) = data.find_metric(MARKET_CAP_METRIC)? else {
        debug!(year, "market_cap metric not catalogued, keeping input order");
        return Ok(HashMap::new());
    };
    let facts = data.list_facts(&FactQuery::lagged(metric.id, year).for_companies(ids))?;
    Ok(latest_values_by_company(&facts))
}

/// Stable descending sort on `keys` (missing keys rank as 0), then truncate.
pub fn rank_by_key(
    ids: &[CompanyId],
    keys: &HashMap<CompanyId, f64>,
    capacity: usize,
) -> Vec<CompanyId> {
    let key = |id: &CompanyId| {
        keys.get(id)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    };
    let mut ranked = ids.to_vec();
    ranked.sort_by(|a, b| key(b).total_cmp(&key(a)));
    ranked.truncate(capacity);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_adapter::InMemoryAdapter;
    use crate::domain::financials::{FinancialFact, Metric, MetricFrequency, PeriodType};

    fn cap(company_id: CompanyId, label: &str, value: f64) -> FinancialFact {
        FinancialFact {
            company_id,
            metric_id: 5,
            period_type: PeriodType::FiscalYear,
            period_label: label.into(),
            period_start: None,
            period_end: None,
            value,
        }
    }

    fn with_caps() -> InMemoryAdapter {
        InMemoryAdapter::new()
            .with_metric(Metric {
                id: 5,
                name: MARKET_CAP_METRIC.into(),
                unit: Some("USD m".into()),
                frequency: MetricFrequency::Yearly,
            })
            .with_fact(cap(1, "FY2020", 50.0))
            .with_fact(cap(2, "FY2020", 500.0))
            .with_fact(cap(3, "FY2020", 200.0))
            .with_fact(cap(1, "FY2021", 9_999.0))
    }

    #[test]
    fn ranks_by_prior_year_cap() {
        let data = with_caps();
        let u = UniverseRanker::default().rank(&data, &[1, 2, 3], 2021).unwrap().unwrap();
        assert_eq!(u.constituents, vec![2, 3, 1]);
        assert_eq!(u.year, 2021);
    }

    #[test]
    fn truncates_to_capacity() {
        let data = with_caps();
        let u = UniverseRanker::new(2).rank(&data, &[1, 2, 3], 2021).unwrap().unwrap();
        assert_eq!(u.constituents, vec![2, 3]);
        assert_eq!(u.count(), 2);
    }

    #[test]
    fn missing_cap_ranks_as_zero() {
        let data = with_caps();
        let u = UniverseRanker::default().rank(&data, &[4, 1, 5], 2021).unwrap().unwrap();
        assert_eq!(u.constituents, vec![1, 4, 5]);
    }

    #[test]
    fn no_metric_keeps_input_order() {
        let data = InMemoryAdapter::new();
        let u = UniverseRanker::default().rank(&data, &[9, 3, 7], 2021).unwrap().unwrap();
        assert_eq!(u.constituents, vec![9, 3, 7]);
    }

    #[test]
    fn empty_eligible_set_has_no_universe() {
        let data = with_caps();
        assert_eq!(UniverseRanker::default().rank(&data, &[], 2021).unwrap(), None);
        assert_eq!(UniverseRanker::new(0).rank(&data, &[1], 2021).unwrap(), None);
    }

    #[test]
    fn ties_preserve_input_order() {
        let keys = HashMap::from([(1, 10.0), (2, 10.0), (3, f64::NAN), (4, 20.0)]);
        assert_eq!(rank_by_key(&[3, 2, 1, 4], &keys, 10), vec![4, 2, 1, 3]);
    }
}
