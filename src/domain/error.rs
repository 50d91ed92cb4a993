//! Domain error types.

/// Top-level error type for rulefolio.
#[derive(Debug, thiserror::Error)]
pub enum RulefolioError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    /// Duplicate-key violation that survived the resync-and-retry policy.
    #[error("key conflict on {table}: {reason}")]
    KeyConflict { table: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("invalid rule: {reason}")]
    RuleInvalid { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RulefolioError {
    fn from(err: serde_json::Error) -> Self {
        RulefolioError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<&RulefolioError> for std::process::ExitCode {
    fn from(err: &RulefolioError) -> Self {
        let code: u8 = match err {
            RulefolioError::Io(_) => 1,
            RulefolioError::ConfigParse { .. }
            | RulefolioError::ConfigMissing { .. }
            | RulefolioError::ConfigInvalid { .. } => 2,
            RulefolioError::Database { .. }
            | RulefolioError::DatabaseQuery { .. }
            | RulefolioError::KeyConflict { .. } => 3,
            RulefolioError::RuleInvalid { .. } => 4,
            RulefolioError::Serialization { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
