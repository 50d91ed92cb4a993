//! Daily portfolio returns and annualized performance statistics.

use crate::domain::company::{parse_company_key, CompanyId};
use crate::domain::error::RulefolioError;
use crate::domain::portfolio::WeightMap;
use crate::domain::price::DateWindow;
use crate::domain::price_panel::ClosePanel;
use crate::ports::data_port::DataPort;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub mean_return: Option<f64>,
    pub median_return: Option<f64>,
    pub volatility: Option<f64>,
    pub sharpe: Option<f64>,
}

impl PerformanceMetrics {
    pub fn undefined() -> Self {
        Self::default()
    }

    pub fn is_undefined(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsComputer {
    pub risk_free_rate: f64,
}

impl Default for MetricsComputer {
    fn default() -> Self {
        Self {
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
        }
    }
}

impl MetricsComputer {
    pub fn new(risk_free_rate: f64) -> Self {
        Self { risk_free_rate }
    }

    /// Daily returns of a fixed-weight portfolio over calendar `year`.
    ///
    /// Companies without any price in the year are dropped and the
    /// remaining weights rescaled to sum to one. An empty series means
    /// there was nothing to evaluate.
    pub fn daily_portfolio_returns(
        &self,
        data: &dyn DataPort,
        weights: &WeightMap,
        year: i32,
    ) -> Result<Vec<f64>, RulefolioError> {
        let named: Vec<(CompanyId, f64)> = weights
            .iter()
            .filter_map(|(key, w)| parse_company_key(key).map(|id| (id, *w)))
            .collect();
        if named.is_empty() {
            return Ok(Vec::new());
        }
        let Some(window) = DateWindow::calendar_year(year) else {
            return Ok(Vec::new());
        };

        let ids: Vec<CompanyId> = named.iter().map(|(id, _)| *id).collect();
        let prices = data.list_prices(&ids, window)?;
        if prices.is_empty() {
            debug!(year, companies = ids.len(), "no prices in evaluation year");
            return Ok(Vec::new());
        }

        let returns = ClosePanel::from_prices(&prices).returns();
        let present: Vec<(CompanyId, f64)> = named
            .into_iter()
            .filter(|(id, _)| returns.has_company(*id))
            .collect();
        let total: f64 = present.iter().map(|(_, w)| w).sum();
        if !(total.is_finite() && total > 0.0) {
            debug!(year, total, "retained weights do not sum to a positive value");
            return Ok(Vec::new());
        }

        let renormalized: Vec<(CompanyId, f64)> =
            present.into_iter().map(|(id, w)| (id, w / total)).collect();
        Ok(returns.weighted_sum(&renormalized))
    }

    /// Annualized mean, median, volatility and Sharpe of a daily series.
    pub fn summarize(&self, daily: &[f64]) -> PerformanceMetrics {
        let Some(mean_daily) = mean(daily) else {
            return PerformanceMetrics::undefined();
        };

        let mean_return = mean_daily * TRADING_DAYS_PER_YEAR;
        let median_return = median(daily).map(|m| m * TRADING_DAYS_PER_YEAR);
        let volatility = sample_std(daily).map(|s| s * TRADING_DAYS_PER_YEAR.sqrt());
        let sharpe = volatility
            .filter(|v| *v > 0.0)
            .map(|v| (mean_return - self.risk_free_rate) / v);

        PerformanceMetrics {
            mean_return: Some(mean_return),
            median_return,
            volatility,
            sharpe,
        }
    }

    pub fn evaluate(
        &self,
        data: &dyn DataPort,
        weights: &WeightMap,
        year: i32,
    ) -> Result<PerformanceMetrics, RulefolioError> {
        let daily = self.daily_portfolio_returns(data, weights, year)?;
        Ok(self.summarize(&daily))
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}
