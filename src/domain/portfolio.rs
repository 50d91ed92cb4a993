//! Yearly portfolio and backtest metric records.

use crate::domain::company::{parse_company_key, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::metrics::PerformanceMetrics;
use crate::domain::rule::RuleId;
use crate::domain::weighting::WeightingScheme;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Company id string → weight.
pub type WeightMap = BTreeMap<String, f64>;

/// Scheme → weight mapping, the persisted shape of a portfolio's weights.
pub type SchemeWeights = BTreeMap<WeightingScheme, WeightMap>;

#[derive(Debug, Clone, PartialEq)]
pub struct YearlyPortfolio {
    pub rule_id: RuleId,
    pub year: i32,
    pub weights: SchemeWeights,
}

impl YearlyPortfolio {
    pub fn new(rule_id: RuleId, year: i32, weights: SchemeWeights) -> Self {
        Self {
            rule_id,
            year,
            weights,
        }
    }

    /// Union of the companies named by any scheme, ascending.
    pub fn constituents(&self) -> Vec<CompanyId> {
        company_ids(self.weights.values().flat_map(|w| w.keys()))
    }

    pub fn weights_json(&self) -> Result<String, RulefolioError> {
        Ok(serde_json::to_string(&self.weights)?)
    }

    pub fn parse_weights(json: &str) -> Result<SchemeWeights, RulefolioError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn company_ids<'k>(keys: impl Iterator<Item = &'k String>) -> Vec<CompanyId> {
    let ids: BTreeSet<CompanyId> = keys.filter_map(|k| parse_company_key(k)).collect();
    ids.into_iter().collect()
}

/// A portfolio row as stored, weights still in JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioRecord {
    pub rule_id: RuleId,
    pub year: i32,
    pub weights_json: String,
}

/// Shapes the weights column may hold. Portfolios created by older tooling
/// carry a flat `company id → placeholder` map until they are first weighted.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredWeights {
    ByScheme(SchemeWeights),
    Flat(WeightMap),
}

impl PortfolioRecord {
    pub fn from_portfolio(portfolio: &YearlyPortfolio) -> Result<Self, RulefolioError> {
        Ok(Self {
            rule_id: portfolio.rule_id,
            year: portfolio.year,
            weights_json: portfolio.weights_json()?,
        })
    }

    /// The scheme-keyed portfolio. Flat placeholder weights are rejected.
    pub fn parse(&self) -> Result<YearlyPortfolio, RulefolioError> {
        let weights = YearlyPortfolio::parse_weights(&self.weights_json)
            .map_err(|e| self.invalid(e))?;
        Ok(YearlyPortfolio::new(self.rule_id, self.year, weights))
    }

    /// Companies held, read from either stored shape.
    pub fn constituents(&self) -> Result<Vec<CompanyId>, RulefolioError> {
        let stored: StoredWeights =
            serde_json::from_str(&self.weights_json).map_err(|e| self.invalid(e.into()))?;
        Ok(match stored {
            StoredWeights::ByScheme(weights) => company_ids(weights.values().flat_map(|w| w.keys())),
            StoredWeights::Flat(weights) => company_ids(weights.keys()),
        })
    }

    fn invalid(&self, err: RulefolioError) -> RulefolioError {
        let reason = match err {
            RulefolioError::Serialization { reason } => reason,
            other => other.to_string(),
        };
        RulefolioError::Serialization {
            reason: format!("portfolio (rule {}, year {}): {reason}", self.rule_id, self.year),
        }
    }
}

/// Sum of a weight mapping.
pub fn total_weight(weights: &WeightMap) -> f64 {
    weights.values().sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBacktestMetric {
    pub rule_id: RuleId,
    pub year: i32,
    pub scheme: WeightingScheme,
    pub mean_return: Option<f64>,
    pub median_return: Option<f64>,
    pub volatility: Option<f64>,
    pub sharpe: Option<f64>,
}

impl RuleBacktestMetric {
    pub fn from_metrics(
        rule_id: RuleId,
        year: i32,
        scheme: WeightingScheme,
        metrics: &PerformanceMetrics,
    ) -> Self {
        Self {
            rule_id,
            year,
            scheme,
            mean_return: metrics.mean_return,
            median_return: metrics.median_return,
            volatility: metrics.volatility,
            sharpe: metrics.sharpe,
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            mean_return: self.mean_return,
            median_return: self.median_return,
            volatility: self.volatility,
            sharpe: self.sharpe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_weights() -> SchemeWeights {
        let mut weights = SchemeWeights::new();
        weights.insert(
            WeightingScheme::Equal,
            WeightMap::from([("1".to_string(), 0.5), ("12".to_string(), 0.5)]),
        );
        weights.insert(
            WeightingScheme::MarketCap,
            WeightMap::from([("1".to_string(), 0.75), ("3".to_string(), 0.25)]),
        );
        weights
    }

    #[test]
    fn constituents_are_union_sorted_numerically() {
        let p = YearlyPortfolio::new(1, 2021, sample_weights());
        assert_eq!(p.constituents(), vec![1, 3, 12]);
    }

    #[test]
    fn weights_json_shape() {
        let p = YearlyPortfolio::new(1, 2021, sample_weights());
        let json = p.weights_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_abs_diff_eq!(value["market_cap"]["1"].as_f64().unwrap(), 0.75);
        assert_abs_diff_eq!(value["equal"]["12"].as_f64().unwrap(), 0.5);
    }

    #[test]
    fn weights_survive_serialization() {
        let p = YearlyPortfolio::new(1, 2021, sample_weights());
        let parsed = YearlyPortfolio::parse_weights(&p.weights_json().unwrap()).unwrap();
        assert_eq!(parsed.keys().collect::<Vec<_>>(), p.weights.keys().collect::<Vec<_>>());
        for (scheme, weights) in &p.weights {
            let other = &parsed[scheme];
            assert_eq!(other.len(), weights.len());
            for (k, w) in weights {
                assert_abs_diff_eq!(other[k], *w, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = YearlyPortfolio::parse_weights(r#"{"risk_parity": {"1": 1.0}}"#).unwrap_err();
        assert!(matches!(err, RulefolioError::Serialization { .. }));
    }

    #[test]
    fn record_reads_scheme_keyed_weights() {
        let p = YearlyPortfolio::new(4, 2021, sample_weights());
        let record = PortfolioRecord::from_portfolio(&p).unwrap();
        assert_eq!(record.constituents().unwrap(), vec![1, 3, 12]);
        assert_eq!(record.parse().unwrap(), p);
    }

    #[test]
    fn flat_placeholder_yields_constituents_but_no_portfolio() {
        let record = PortfolioRecord {
            rule_id: 2,
            year: 2021,
            weights_json: r#"{"7": 0.0, "2": 0.0}"#.into(),
        };
        assert_eq!(record.constituents().unwrap(), vec![2, 7]);
        match record.parse() {
            Err(RulefolioError::Serialization { reason }) => {
                assert!(reason.starts_with("portfolio (rule 2, year 2021)"))
            }
            other => panic!("expected serialization error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_weights_are_a_serialization_error() {
        let record = PortfolioRecord {
            rule_id: 1,
            year: 2020,
            weights_json: "[1, 2".into(),
        };
        assert!(matches!(
            record.constituents(),
            Err(RulefolioError::Serialization { .. })
        ));
    }

    #[test]
    fn metric_row_from_metrics() {
        let m = PerformanceMetrics {
            mean_return: Some(0.1),
            median_return: Some(0.05),
            volatility: Some(0.2),
            sharpe: Some(0.4),
        };
        let row = RuleBacktestMetric::from_metrics(3, 2022, WeightingScheme::Momentum, &m);
        assert_eq!(row.scheme, WeightingScheme::Momentum);
        assert_eq!(row.metrics(), m);
    }

    #[test]
    fn total_weight_sums_values() {
        let w = WeightMap::from([("1".to_string(), 0.25), ("2".to_string(), 0.75)]);
        assert_abs_diff_eq!(total_weight(&w), 1.0);
    }
}
