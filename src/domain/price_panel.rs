//! Date-aligned close panel and the daily return panel derived from it.

use crate::domain::company::CompanyId;
use crate::domain::price::PricePoint;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Closes on a unified timeline. Each column is forward-filled from the
/// company's first observed date; cells before that stay empty.
#[derive(Debug, Clone)]
pub struct ClosePanel {
    pub companies: Vec<CompanyId>,
    pub dates: Vec<NaiveDate>,
    cells: Vec<Vec<Option<f64>>>,
    column_index: HashMap<CompanyId, usize>,
}

impl ClosePanel {
    pub fn from_prices(prices: &[PricePoint]) -> Self {
        let dates = build_unified_timeline(prices);
        let companies: Vec<CompanyId> = prices
            .iter()
            .map(|p| p.company_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let column_index: HashMap<CompanyId, usize> = companies
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let row_index: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, &d)| (d, i)).collect();

        let mut cells = vec![vec![None; companies.len()]; dates.len()];
        for p in prices {
            cells[row_index[&p.date]][column_index[&p.company_id]] = Some(p.close);
        }

        for col in 0..companies.len() {
            let mut last = None;
            for row in cells.iter_mut() {
                match row[col] {
                    Some(v) => last = Some(v),
                    None => row[col] = last,
                }
            }
        }

        Self {
            companies,
            dates,
            cells,
            column_index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn has_company(&self, id: CompanyId) -> bool {
        self.column_index.contains_key(&id)
    }

    pub fn close(&self, date: NaiveDate, id: CompanyId) -> Option<f64> {
        let row = self.dates.binary_search(&date).ok()?;
        let col = *self.column_index.get(&id)?;
        self.cells[row][col]
    }

    /// Day-over-day percentage returns. The first date never has one, and
    /// any later date where some column lacks a defined return is dropped.
    pub fn returns(&self) -> ReturnPanel {
        let mut rows = BTreeMap::new();
        for (i, pair) in self.cells.windows(2).enumerate() {
            let row: Option<Vec<f64>> = pair[0]
                .iter()
                .zip(&pair[1])
                .map(|(prev, curr)| match (prev, curr) {
                    (Some(p), Some(c)) if *p != 0.0 => Some(c / p - 1.0),
                    _ => None,
                })
                .collect();
            if let Some(row) = row {
                rows.insert(self.dates[i + 1], row);
            }
        }
        ReturnPanel {
            column_index: self.column_index.clone(),
            companies: self.companies.clone(),
            rows,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReturnPanel {
    pub companies: Vec<CompanyId>,
    column_index: HashMap<CompanyId, usize>,
    rows: BTreeMap<NaiveDate, Vec<f64>>,
}

impl ReturnPanel {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_company(&self, id: CompanyId) -> bool {
        self.column_index.contains_key(&id)
    }

    /// Weighted sum per date. `weights` pairs must name panel columns.
    pub fn weighted_sum(&self, weights: &[(CompanyId, f64)]) -> Vec<f64> {
        let resolved: Vec<(usize, f64)> = weights
            .iter()
            .filter_map(|(id, w)| self.column_index.get(id).map(|&col| (col, *w)))
            .collect();
        self.rows
            .values()
            .map(|row| resolved.iter().map(|(col, w)| row[*col] * w).sum())
            .collect()
    }
}

pub fn build_unified_timeline(prices: &[PricePoint]) -> Vec<NaiveDate> {
    let unique_dates: BTreeSet<NaiveDate> = prices.iter().map(|p| p.date).collect();
    unique_dates.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn p(id: CompanyId, date: &str, close: f64) -> PricePoint {
        PricePoint::close_only(id, d(date), close)
    }

    #[test]
    fn unified_timeline_merges_and_sorts() {
        let timeline = build_unified_timeline(&[
            p(1, "2024-01-02", 1.0),
            p(2, "2024-01-01", 1.0),
            p(1, "2024-01-05", 1.0),
            p(2, "2024-01-02", 1.0),
        ]);
        assert_eq!(
            timeline,
            vec![d("2024-01-01"), d("2024-01-02"), d("2024-01-05")]
        );
    }

    #[test]
    fn unified_timeline_empty() {
        assert!(build_unified_timeline(&[]).is_empty());
        assert!(ClosePanel::from_prices(&[]).is_empty());
    }

    #[test]
    fn forward_fill_covers_gaps_after_first_observation() {
        let panel = ClosePanel::from_prices(&[
            p(1, "2024-01-01", 10.0),
            p(1, "2024-01-03", 12.0),
            p(2, "2024-01-02", 50.0),
        ]);
        assert_eq!(panel.companies, vec![1, 2]);
        assert_eq!(panel.close(d("2024-01-02"), 1), Some(10.0));
        assert_eq!(panel.close(d("2024-01-01"), 2), None);
        assert_eq!(panel.close(d("2024-01-03"), 2), Some(50.0));
        assert_eq!(panel.close(d("2024-01-04"), 1), None);
    }

    #[test]
    fn returns_drop_first_row_and_incomplete_rows() {
        let panel = ClosePanel::from_prices(&[
            p(1, "2024-01-01", 100.0),
            p(1, "2024-01-02", 110.0),
            p(1, "2024-01-03", 121.0),
            p(2, "2024-01-02", 50.0),
            p(2, "2024-01-03", 55.0),
        ]);
        let returns = panel.returns();
        // 01-02 is dropped because company 2 has no prior close
        assert_eq!(returns.len(), 1);
        let port = returns.weighted_sum(&[(1, 0.5), (2, 0.5)]);
        assert_abs_diff_eq!(port[0], 0.10, epsilon = 1e-12);
    }

    #[test]
    fn weighted_sum_ignores_unknown_columns() {
        let panel = ClosePanel::from_prices(&[p(1, "2024-01-01", 100.0), p(1, "2024-01-02", 90.0)]);
        let returns = panel.returns();
        assert!(returns.has_company(1));
        assert!(!returns.has_company(7));
        let port = returns.weighted_sum(&[(1, 1.0), (7, 1.0)]);
        assert_abs_diff_eq!(port[0], -0.10, epsilon = 1e-12);
    }
}
