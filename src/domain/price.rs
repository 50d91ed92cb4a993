//! Daily price rows and the lagged look-back windows used for weighting.

use crate::domain::company::CompanyId;
use chrono::{Duration, NaiveDate};

#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub company_id: CompanyId,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<i64>,
    pub adj_close: Option<f64>,
}

impl PricePoint {
    pub fn close_only(company_id: CompanyId, date: NaiveDate, close: f64) -> Self {
        Self {
            company_id,
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
            adj_close: None,
        }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// The day before `year` begins; the last date a formation decision for
    /// `year` may observe.
    pub fn formation_cutoff(year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, 1, 1).and_then(|d| d.pred_opt())
    }

    /// `[year-01-01, year-12-31]`.
    pub fn calendar_year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    /// `days` calendar days ending at the formation cutoff of `year`.
    /// `None` when the start would fall outside the representable dates.
    pub fn trailing(year: i32, days: i64) -> Option<Self> {
        let end = Self::formation_cutoff(year)?;
        let start = end.checked_sub_signed(Duration::try_days(days)?)?;
        Some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Closes for one company in ascending date order.
pub fn sorted_closes(prices: &[PricePoint], company_id: CompanyId) -> Vec<f64> {
    let mut rows: Vec<&PricePoint> = prices
        .iter()
        .filter(|p| p.company_id == company_id)
        .collect();
    rows.sort_by_key(|p| p.date);
    rows.into_iter().map(|p| p.close).collect()
}

/// Day-over-day percentage changes; a change from a zero close is skipped.
pub fn pct_changes(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}
