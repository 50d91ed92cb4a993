//! Configuration validation.
//!
//! Validates all config fields before any pass touches the data store.

use crate::domain::error::RulefolioError;
use crate::domain::rule::UnknownSignPolicy;
use crate::domain::weighting::WeightingScheme;
use crate::ports::config_port::ConfigPort;

pub fn validate_database_config(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    let backend = config
        .get_value("database", "backend")
        .unwrap_or_else(|| "sqlite".to_string());
    match backend.to_lowercase().as_str() {
        "sqlite" => {
            require_non_empty(config, "sqlite", "path")?;
            validate_pool_size(config, "sqlite")
        }
        "postgres" => {
            require_non_empty(config, "postgres", "connection_string")?;
            validate_pool_size(config, "postgres")
        }
        other => Err(invalid(
            "database",
            "backend",
            &format!("unknown backend '{}', expected sqlite or postgres", other),
        )),
    }
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    validate_years(config)?;
    validate_workers(config)?;
    validate_capacity(config)?;
    validate_screening(config)?;
    validate_weighting(config)?;
    validate_risk_free_rate(config)?;
    Ok(())
}

pub fn validate_evolution_config(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    if config.get_int("evolution", "seed", 42) < 0 {
        return Err(invalid("evolution", "seed", "seed must be non-negative"));
    }
    for key in ["max_tweaks", "max_filters"] {
        if config.get_int("evolution", key, 1) < 1 {
            return Err(invalid(
                "evolution",
                key,
                &format!("{} must be at least 1", key),
            ));
        }
    }
    Ok(())
}

/// Reads an optional year from `[backtest]`.
pub fn parse_year(config: &dyn ConfigPort, key: &str) -> Result<Option<i32>, RulefolioError> {
    match config.get_value("backtest", key) {
        None => Ok(None),
        Some(s) => s
            .parse::<i32>()
            .map(Some)
            .map_err(|_| invalid("backtest", key, &format!("invalid {}, expected a year", key))),
    }
}

/// Parses a comma-separated scheme list such as `equal, market_cap`.
pub fn parse_schemes(value: &str) -> Result<Vec<WeightingScheme>, RulefolioError> {
    let mut schemes = Vec::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid("weighting", "schemes", "empty token in scheme list"));
        }
        let scheme = WeightingScheme::parse(token).ok_or_else(|| {
            invalid("weighting", "schemes", &format!("unknown scheme '{}'", token))
        })?;
        if schemes.contains(&scheme) {
            return Err(invalid(
                "weighting",
                "schemes",
                &format!("duplicate scheme '{}'", token),
            ));
        }
        schemes.push(scheme);
    }
    Ok(schemes)
}

pub fn parse_unknown_sign(config: &dyn ConfigPort) -> Result<UnknownSignPolicy, RulefolioError> {
    match config.get_string("screening", "unknown_sign") {
        None => Ok(UnknownSignPolicy::default()),
        Some(s) => UnknownSignPolicy::parse(&s).ok_or_else(|| {
            invalid(
                "screening",
                "unknown_sign",
                "unknown_sign must be skip or reject",
            )
        }),
    }
}

fn validate_years(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    let start = parse_year(config, "start_year")?;
    let end = parse_year(config, "end_year")?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(invalid(
                "backtest",
                "start_year",
                "start_year must not be after end_year",
            ));
        }
    }
    Ok(())
}

fn validate_workers(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    if config.get_int("backtest", "workers", 1) < 1 {
        return Err(invalid("backtest", "workers", "workers must be at least 1"));
    }
    Ok(())
}

fn validate_capacity(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    if config.get_int("universe", "capacity", 20) < 1 {
        return Err(invalid("universe", "capacity", "capacity must be at least 1"));
    }
    Ok(())
}

fn validate_screening(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    parse_unknown_sign(config).map(|_| ())
}

fn validate_weighting(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    if let Some(list) = config.get_string("weighting", "schemes") {
        parse_schemes(&list)?;
    }
    if config.get_int("weighting", "vol_lookback", 252) < 2 {
        return Err(invalid(
            "weighting",
            "vol_lookback",
            "vol_lookback must be at least 2",
        ));
    }
    if config.get_int("weighting", "momentum_period", 252) < 1 {
        return Err(invalid(
            "weighting",
            "momentum_period",
            "momentum_period must be at least 1",
        ));
    }
    for (key, default) in [("default_volatility", 0.20), ("epsilon", 1e-8)] {
        let value = config.get_double("weighting", key, default);
        if !(value.is_finite() && value > 0.0) {
            return Err(invalid("weighting", key, &format!("{} must be positive", key)));
        }
    }
    Ok(())
}

fn validate_risk_free_rate(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    let value = config.get_double("metrics", "risk_free_rate", 0.02);
    if !(0.0..1.0).contains(&value) {
        return Err(invalid(
            "metrics",
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }
    Ok(())
}

fn validate_pool_size(config: &dyn ConfigPort, section: &str) -> Result<(), RulefolioError> {
    if config.get_int(section, "pool_size", 4) < 1 {
        return Err(invalid(section, "pool_size", "pool_size must be at least 1"));
    }
    Ok(())
}

fn require_non_empty(config: &dyn ConfigPort, section: &str, key: &str) -> Result<(), RulefolioError> {
    match config.get_value(section, key) {
        Some(_) => Ok(()),
        None => Err(RulefolioError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }),
    }
}

fn invalid(section: &str, key: &str, reason: &str) -> RulefolioError {
    RulefolioError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
