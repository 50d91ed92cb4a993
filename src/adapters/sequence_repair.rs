//! Retry policy for identity-sequence drift.
//!
//! When rows are loaded with explicit ids the table's identity sequence can
//! fall behind `MAX(id)`, and the next generated id collides with an
//! existing row. The SQL adapters report such collisions as
//! [`RulefolioError::KeyConflict`]; this policy resynchronizes the sequence
//! and retries the whole write exactly once.

use crate::domain::error::RulefolioError;
use tracing::warn;

pub fn retry_once_after_resync<T>(
    mut write: impl FnMut() -> Result<T, RulefolioError>,
    resync: impl FnOnce(&str) -> Result<(), RulefolioError>,
) -> Result<T, RulefolioError> {
    match write() {
        Err(RulefolioError::KeyConflict { table, reason }) => {
            warn!(table = table.as_str(), reason = reason.as_str(), "key conflict, resyncing sequence");
            resync(&table)?;
            write()
        }
        other => other,
    }
}
