//! Portfolio weighting schemes.
//!
//! Every scheme only looks at data observable before the formation year
//! begins: market caps come from the prior fiscal year's facts, volatility
//! and momentum from price windows ending on December 31st of `year - 1`.
//! Whenever the input set is non-empty the returned weights are
//! non-negative and sum to one.

use crate::domain::company::{company_key, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::financials::{latest_values_by_company, FactQuery, MARKET_CAP_METRIC};
use crate::domain::portfolio::{SchemeWeights, WeightMap};
use crate::domain::price::{pct_changes, sorted_closes, DateWindow};
use crate::domain::metrics::{sample_std, TRADING_DAYS_PER_YEAR};
use crate::ports::data_port::DataPort;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingScheme {
    Equal,
    MarketCap,
    InverseVol,
    Momentum,
}

impl WeightingScheme {
    pub const ALL: [WeightingScheme; 4] = [
        WeightingScheme::Equal,
        WeightingScheme::MarketCap,
        WeightingScheme::InverseVol,
        WeightingScheme::Momentum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightingScheme::Equal => "equal",
            WeightingScheme::MarketCap => "market_cap",
            WeightingScheme::InverseVol => "inverse_vol",
            WeightingScheme::Momentum => "momentum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "equal" => Some(WeightingScheme::Equal),
            "market_cap" => Some(WeightingScheme::MarketCap),
            "inverse_vol" => Some(WeightingScheme::InverseVol),
            "momentum" => Some(WeightingScheme::Momentum),
            _ => None,
        }
    }
}

impl fmt::Display for WeightingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightingConfig {
    pub schemes: Vec<WeightingScheme>,
    /// Number of most recent closes used for realized volatility.
    pub vol_lookback: usize,
    /// Calendar days in the momentum window.
    pub momentum_period: i64,
    /// Annualized volatility assumed when a company has too few prices.
    pub default_volatility: f64,
    pub epsilon: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            schemes: WeightingScheme::ALL.to_vec(),
            vol_lookback: 252,
            momentum_period: 252,
            default_volatility: 0.20,
            epsilon: 1e-8,
        }
    }
}

impl WeightingConfig {
    /// Calendar span fetched for volatility: half again the lookback, so
    /// that weekends and holidays still leave `vol_lookback` sessions.
    pub fn vol_window_days(&self) -> i64 {
        (self.vol_lookback as f64 * 1.5) as i64
    }
}

pub struct WeightCalculator<'a> {
    data: &'a dyn DataPort,
    config: &'a WeightingConfig,
}

impl<'a> WeightCalculator<'a> {
    pub fn new(data: &'a dyn DataPort, config: &'a WeightingConfig) -> Self {
        Self { data, config }
    }

    pub fn compute(
        &self,
        company_ids: &[CompanyId],
        year: i32,
        scheme: WeightingScheme,
    ) -> Result<WeightMap, RulefolioError> {
        let ids = dedup_preserving_order(company_ids);
        if ids.is_empty() {
            return Ok(WeightMap::new());
        }

        match scheme {
            WeightingScheme::Equal => Ok(equal_weights(&ids)),
            WeightingScheme::MarketCap => {
                let caps = self.market_caps(&ids, year)?;
                Ok(normalize(&ids, &caps))
            }
            WeightingScheme::InverseVol => {
                let vols = self.volatilities(&ids, year)?;
                Ok(inverse_vol_weights(&ids, &vols, self.config.epsilon))
            }
            WeightingScheme::Momentum => {
                let scores = self.momentum_scores(&ids, year)?;
                Ok(momentum_weights(&ids, &scores))
            }
        }
    }

    /// Weights for every configured scheme over the same company set.
    pub fn compute_all(
        &self,
        company_ids: &[CompanyId],
        year: i32,
    ) -> Result<SchemeWeights, RulefolioError> {
        let mut all = SchemeWeights::new();
        for &scheme in &self.config.schemes {
            all.insert(scheme, self.compute(company_ids, year, scheme)?);
        }
        Ok(all)
    }

    /// Prior fiscal year market caps; missing facts default to 1.0.
    fn market_caps(&self, ids: &[CompanyId], year: i32) -> Result<Vec<f64>, RulefolioError> {
        let Some(metric) = self.data.find_metric(MARKET_CAP_METRIC)? else {
            debug!(year, "market_cap metric not catalogued, using unit caps");
            return Ok(vec![1.0; ids.len()]);
        };

        let facts = self
            .data
            .list_facts(&FactQuery::lagged(metric.id, year).for_companies(ids))?;
        let caps = latest_values_by_company(&facts);
        Ok(ids
            .iter()
            .map(|id| caps.get(id).copied().unwrap_or(1.0))
            .collect())
    }

    fn volatilities(&self, ids: &[CompanyId], year: i32) -> Result<Vec<f64>, RulefolioError> {
        let default = self.config.default_volatility;
        let Some(window) = DateWindow::trailing(year, self.config.vol_window_days()) else {
            return Ok(vec![default; ids.len()]);
        };

        let prices = self.data.list_prices(ids, window)?;
        Ok(ids
            .iter()
            .map(|&id| {
                let closes = sorted_closes(&prices, id);
                let start = closes.len().saturating_sub(self.config.vol_lookback);
                annualized_volatility(&closes[start..]).unwrap_or(default)
            })
            .collect())
    }

    fn momentum_scores(&self, ids: &[CompanyId], year: i32) -> Result<Vec<f64>, RulefolioError> {
        let Some(window) = DateWindow::trailing(year, self.config.momentum_period) else {
            return Ok(vec![0.0; ids.len()]);
        };

        let prices = self.data.list_prices(ids, window)?;
        Ok(ids
            .iter()
            .map(|&id| trailing_return(&sorted_closes(&prices, id)).unwrap_or(0.0))
            .collect())
    }
}

fn dedup_preserving_order(ids: &[CompanyId]) -> Vec<CompanyId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// `1/n` for each of `n` companies.
pub fn equal_weights(ids: &[CompanyId]) -> WeightMap {
    let n = ids.len() as f64;
    ids.iter().map(|&id| (company_key(id), 1.0 / n)).collect()
}

/// Scales `raw` (aligned with `ids`) to sum to one. Falls back to equal
/// weights when the raw values do not have a positive, finite sum.
pub fn normalize(ids: &[CompanyId], raw: &[f64]) -> WeightMap {
    let total: f64 = raw.iter().sum();
    if !(total.is_finite() && total > 0.0) || raw.iter().any(|v| *v < 0.0) {
        debug!(total, "degenerate raw weights, falling back to equal weights");
        return equal_weights(ids);
    }
    ids.iter()
        .zip(raw)
        .map(|(&id, &v)| (company_key(id), v / total))
        .collect()
}

/// Weight ∝ 1 / (vol + ε).
pub fn inverse_vol_weights(ids: &[CompanyId], vols: &[f64], epsilon: f64) -> WeightMap {
    let inverse: Vec<f64> = vols.iter().map(|v| 1.0 / (v + epsilon)).collect();
    normalize(ids, &inverse)
}

/// Weight ∝ max(score, 0); equal weights across `ids` when nothing is positive.
pub fn momentum_weights(ids: &[CompanyId], scores: &[f64]) -> WeightMap {
    let clamped: Vec<f64> = scores
        .iter()
        .map(|s| if s.is_finite() && *s > 0.0 { *s } else { 0.0 })
        .collect();
    if clamped.iter().sum::<f64>() > 0.0 {
        normalize(ids, &clamped)
    } else {
        equal_weights(ids)
    }
}

/// Annualized standard deviation of day-over-day returns.
pub fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let std = sample_std(&pct_changes(closes))?;
    Some(std * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Return from the first to the last observed close.
pub fn trailing_return(closes: &[f64]) -> Option<f64> {
    match (closes.first(), closes.last()) {
        (Some(&first), Some(&last)) if closes.len() >= 2 && first != 0.0 => {
            Some(last / first - 1.0)
        }
        _ => None,
    }
}
