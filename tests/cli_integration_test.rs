//! CLI integration tests.
//!
//! Tests cover:
//! - Config resolution (build_backtest_config, build_mutation_config)
//! - `check` dry runs with real INI files on disk
//! - `validate-rule` with both unknown-sign policies
//! - `init-db`, `run`, `evaluate` and `evolve` against a SQLite file

mod common;

use clap::Parser;
use common::*;
use rulefolio::adapters::file_config_adapter::FileConfigAdapter;
use rulefolio::cli::{self, Cli};
use rulefolio::domain::error::RulefolioError;
use rulefolio::domain::rule::UnknownSignPolicy;
use rulefolio::domain::weighting::WeightingScheme;
use std::io::Write;
use std::process::ExitCode;

fn write_temp_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// ExitCode has no PartialEq on every supported toolchain; compare the debug form.
fn same_code(actual: ExitCode, expected: ExitCode) -> bool {
    format!("{actual:?}") == format!("{expected:?}")
}

fn run_args(args: &[&str]) -> ExitCode {
    let mut argv = vec!["rulefolio"];
    argv.extend_from_slice(args);
    cli::run(Cli::try_parse_from(argv).unwrap())
}

const FULL_INI: &str = r#"
[database]
backend = sqlite

[sqlite]
path = /tmp/rulefolio-test.db
pool_size = 2

[backtest]
start_year = 2015
end_year = 2024
workers = 3
respect_rule_period = true

[universe]
capacity = 25

[screening]
unknown_sign = reject
apply_mcap_threshold = yes

[weighting]
schemes = equal, market_cap
vol_lookback = 126
momentum_period = 180
default_volatility = 0.25
epsilon = 0.0001

[metrics]
risk_free_rate = 0.04

[evolution]
seed = 11
max_tweaks = 3
max_filters = 4
"#;

mod config_loading {
    use super::*;

    #[test]
    fn build_backtest_config_reads_every_section() {
        let adapter = FileConfigAdapter::from_string(FULL_INI).unwrap();
        let config = cli::build_backtest_config(&adapter, None, None).unwrap();

        assert_eq!((config.start_year, config.end_year), (2015, 2024));
        assert_eq!(config.workers, 3);
        assert!(config.respect_rule_period);
        assert_eq!(config.capacity, 25);
        assert_eq!(config.screening.unknown_sign, UnknownSignPolicy::Reject);
        assert!(config.screening.apply_mcap_threshold);
        assert_eq!(
            config.weighting.schemes,
            vec![WeightingScheme::Equal, WeightingScheme::MarketCap]
        );
        assert_eq!(config.weighting.vol_lookback, 126);
        assert_eq!(config.weighting.momentum_period, 180);
        assert!((config.weighting.default_volatility - 0.25).abs() < f64::EPSILON);
        assert!((config.weighting.epsilon - 0.0001).abs() < f64::EPSILON);
        assert!((config.risk_free_rate - 0.04).abs() < f64::EPSILON);
    }

    #[test]
    fn build_mutation_config_reads_evolution() {
        let adapter = FileConfigAdapter::from_string(FULL_INI).unwrap();
        let mutation = cli::build_mutation_config(&adapter);
        assert_eq!(mutation.seed, 11);
        assert_eq!(mutation.max_tweaks, 3);
        assert_eq!(mutation.max_filters, 4);
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let adapter = FileConfigAdapter::from_string(
            "[backtest]\nstart_year = 2020\nend_year = 2021\n[weighting]\nschemes = equal, hrp\n",
        )
        .unwrap();
        let err = cli::build_backtest_config(&adapter, None, None).unwrap_err();
        assert!(matches!(err, RulefolioError::ConfigInvalid { key, .. } if key == "schemes"));
    }
}

mod check {
    use super::*;

    #[test]
    fn valid_config_succeeds() {
        let file = write_temp_file(FULL_INI);
        let code = run_args(&["check", "--config", file.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let code = run_args(&["check", "--config", "/nonexistent/path/rulefolio.ini"]);
        assert!(same_code(code, ExitCode::from(2)));
    }

    #[test]
    fn years_can_come_from_flags() {
        let file = write_temp_file("[sqlite]\npath = /tmp/rulefolio-test.db\n");
        let path = file.path().to_str().unwrap();

        let code = run_args(&["check", "--config", path]);
        assert!(same_code(code, ExitCode::from(2)));

        let code = run_args(&["check", "--config", path, "--start", "2018", "--end", "2020"]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn invalid_capacity_fails() {
        let file = write_temp_file(
            "[sqlite]\npath = /tmp/x.db\n[backtest]\nstart_year = 2020\nend_year = 2021\n[universe]\ncapacity = 0\n",
        );
        let code = run_args(&["check", "--config", file.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(2)));
    }
}

mod validate_rule {
    use super::*;

    const RULE_WITH_UNKNOWN_SIGN: &str = r#"{
        "bt_period_start": "2010",
        "bt_period_end": "2020",
        "filters": [
            {"name": "ROE", "sign": ">", "threshold": 15.0, "period": "3Y", "consisPeriod": null},
            {"name": "PE", "sign": "=>", "threshold": 20.0, "period": "1Y"}
        ]
    }"#;

    #[test]
    fn unknown_sign_is_skipped_by_default() {
        let file = write_temp_file(RULE_WITH_UNKNOWN_SIGN);
        let code = run_args(&["validate-rule", "--rule", file.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn unknown_sign_can_be_rejected() {
        let file = write_temp_file(RULE_WITH_UNKNOWN_SIGN);
        let code = run_args(&[
            "validate-rule",
            "--rule",
            file.path().to_str().unwrap(),
            "--reject-unknown",
        ]);
        assert!(same_code(code, ExitCode::from(4)));
    }

    #[test]
    fn malformed_json_is_a_rule_error() {
        let file = write_temp_file("{\"filters\": [{\"name\": \"ROE\"}]}");
        let code = run_args(&["validate-rule", "--rule", file.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(4)));
    }

    #[test]
    fn missing_rule_file_is_an_io_error() {
        let code = run_args(&["validate-rule", "--rule", "/nonexistent/rule.json"]);
        assert!(same_code(code, ExitCode::from(1)));
    }
}

#[cfg(feature = "sqlite")]
mod sqlite_pipeline {
    use super::*;
    use rulefolio::adapters::sqlite_adapter::SqliteAdapter;
    use rulefolio::ports::data_port::DataPort;

    struct Workspace {
        _dir: tempfile::TempDir,
        config_path: String,
        config: FileConfigAdapter,
    }

    fn workspace() -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("rulefolio.db");
        let ini = format!(
            "[sqlite]\npath = {}\n[backtest]\nstart_year = 2020\nend_year = 2021\n[evolution]\nseed = 3\n",
            db_path.display()
        );
        let config_path = dir.path().join("rulefolio.ini");
        std::fs::write(&config_path, &ini).unwrap();
        Workspace {
            config_path: config_path.to_str().unwrap().to_string(),
            config: FileConfigAdapter::from_string(&ini).unwrap(),
            _dir: dir,
        }
    }

    #[test]
    fn init_run_and_evaluate() {
        let ws = workspace();
        assert!(same_code(
            run_args(&["init-db", "--config", &ws.config_path]),
            ExitCode::SUCCESS
        ));

        {
            let db = SqliteAdapter::from_config(&ws.config).unwrap();
            Dataset::scenario()
                .with_rule(roe_rule(1, 15.0))
                .load_sqlite(&db);
        }

        assert!(same_code(
            run_args(&["run", "--config", &ws.config_path]),
            ExitCode::SUCCESS
        ));

        let db = SqliteAdapter::from_config(&ws.config).unwrap();
        let stored = db.list_yearly_portfolios(2020, 2021).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].year, 2021);
        assert_eq!(stored[0].weights.len(), WeightingScheme::ALL.len());
        assert_eq!(db.list_backtest_metrics(Some(1)).unwrap().len(), 4);

        assert!(same_code(
            run_args(&["evaluate", "--config", &ws.config_path, "--start", "2021"]),
            ExitCode::SUCCESS
        ));
        assert_eq!(db.list_backtest_metrics(Some(1)).unwrap().len(), 8);
    }

    #[test]
    fn evolve_persists_new_rules() {
        let ws = workspace();
        assert!(same_code(
            run_args(&["init-db", "--config", &ws.config_path]),
            ExitCode::SUCCESS
        ));
        {
            let db = SqliteAdapter::from_config(&ws.config).unwrap();
            Dataset::scenario()
                .with_rule(roe_rule(1, 15.0))
                .load_sqlite(&db);
        }

        assert!(same_code(
            run_args(&["evolve", "--config", &ws.config_path, "--tweaks", "1", "--random", "2"]),
            ExitCode::SUCCESS
        ));

        let db = SqliteAdapter::from_config(&ws.config).unwrap();
        assert_eq!(db.list_rules().unwrap().len(), 4);
    }

    #[test]
    fn run_without_schema_is_a_database_error() {
        let ws = workspace();
        assert!(same_code(
            run_args(&["run", "--config", &ws.config_path]),
            ExitCode::from(3)
        ));
    }
}
