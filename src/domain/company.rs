//! Company identity and static attributes.

use chrono::NaiveDate;

pub type CompanyId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct Company {
    pub id: CompanyId,
    pub ticker: String,
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub country: Option<String>,
    pub listing_date: Option<NaiveDate>,
    pub delisted_date: Option<NaiveDate>,
}

impl Company {
    pub fn new(id: CompanyId, ticker: &str, name: &str) -> Self {
        Self {
            id,
            ticker: ticker.to_string(),
            name: name.to_string(),
            sector: None,
            industry: None,
            country: None,
            listing_date: None,
            delisted_date: None,
        }
    }
}

/// Weight maps key companies by the decimal string of their id.
pub fn company_key(id: CompanyId) -> String {
    id.to_string()
}

pub fn parse_company_key(key: &str) -> Option<CompanyId> {
    key.trim().parse().ok()
}
