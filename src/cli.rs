//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestConfig, Backtester, GridReport, UnitStatus};
use crate::domain::config_validation::{
    parse_schemes, parse_unknown_sign, parse_year, validate_backtest_config,
    validate_database_config, validate_evolution_config,
};
use crate::domain::error::RulefolioError;
use crate::domain::evolution::{evolve, MutationConfig, RandomRuleMutator};
use crate::domain::rule::{RuleDefinition, ScreeningOptions, UnknownSignPolicy};
use crate::domain::weighting::{WeightingConfig, WeightingScheme};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::store_port::StorePort;

#[derive(Parser, Debug)]
#[command(name = "rulefolio", about = "Rule-based portfolio screening and backtesting")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Screen, rank, weight and evaluate every rule over the year range
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        start: Option<i32>,
        #[arg(long)]
        end: Option<i32>,
    },
    /// Recompute weights for stored portfolios
    Reweight {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        start: Option<i32>,
        #[arg(long)]
        end: Option<i32>,
    },
    /// Recompute performance metrics for stored portfolios
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        start: Option<i32>,
        #[arg(long)]
        end: Option<i32>,
    },
    /// Derive new rules from stored ones and from the filter catalogue
    Evolve {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 5)]
        tweaks: usize,
        #[arg(long, default_value_t = 5)]
        random: usize,
    },
    /// Validate a rule definition JSON file
    ValidateRule {
        #[arg(short, long)]
        rule: PathBuf,
        #[arg(long)]
        reject_unknown: bool,
    },
    /// Create the database schema
    InitDb {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate configuration and print the resolved settings
    Check {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        start: Option<i32>,
        #[arg(long)]
        end: Option<i32>,
    },
}

/// Which maintenance or grid pass to run against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Grid,
    Reweight,
    Evaluate,
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run { config, start, end } => run_pass(Pass::Grid, &config, start, end),
        Command::Reweight { config, start, end } => run_pass(Pass::Reweight, &config, start, end),
        Command::Evaluate { config, start, end } => run_pass(Pass::Evaluate, &config, start, end),
        Command::Evolve {
            config,
            tweaks,
            random,
        } => run_evolve(&config, tweaks, random),
        Command::ValidateRule {
            rule,
            reject_unknown,
        } => run_validate_rule(&rule, reject_unknown),
        Command::InitDb { config } => run_init_db(&config),
        Command::Check { config, start, end } => run_check(&config, start, end),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn fail(err: RulefolioError) -> ExitCode {
    eprintln!("error: {err}");
    (&err).into()
}

fn run_pass(pass: Pass, config_path: &Path, start: Option<i32>, end: Option<i32>) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let result = validate_database_config(&adapter)
        .and_then(|_| validate_backtest_config(&adapter))
        .and_then(|_| build_backtest_config(&adapter, start, end))
        .and_then(|bt_config| {
            eprintln!(
                "Running {} for {}..={} with {} worker(s)",
                pass_label(pass),
                bt_config.start_year,
                bt_config.end_year,
                bt_config.workers
            );
            with_backend(&adapter, |data, store| {
                execute_pass(pass, data, store, bt_config)
            })
        });

    match result {
        Ok(report) => {
            print_report(pass_label(pass), &report);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

/// Runs `pass` against the given ports.
pub fn execute_pass(
    pass: Pass,
    data: &dyn DataPort,
    store: &dyn StorePort,
    config: BacktestConfig,
) -> Result<GridReport, RulefolioError> {
    let (start, end) = (config.start_year, config.end_year);
    let backtester = Backtester::new(data, store, config);
    match pass {
        Pass::Grid => backtester.run_grid(),
        Pass::Reweight => backtester.refresh_weights(start, end),
        Pass::Evaluate => backtester.evaluate_portfolios(start, end),
    }
}

fn pass_label(pass: Pass) -> &'static str {
    match pass {
        Pass::Grid => "backtest grid",
        Pass::Reweight => "weight refresh",
        Pass::Evaluate => "portfolio evaluation",
    }
}

fn print_report(label: &str, report: &GridReport) {
    eprintln!("\n{} finished: {} unit(s)", label, report.units.len());
    eprintln!("  completed:             {}", report.completed());
    eprintln!("  no eligible companies: {}", report.no_eligible());
    eprintln!("  failed:                {}", report.failed());
    for unit in &report.units {
        if let UnitStatus::Failed { reason } = &unit.status {
            eprintln!("  rule {} year {}: {}", unit.rule_id, unit.year, reason);
        }
    }
}

fn run_evolve(config_path: &Path, tweaks: usize, random: usize) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let result = validate_database_config(&adapter)
        .and_then(|_| validate_evolution_config(&adapter))
        .and_then(|_| {
            let mut mutator = RandomRuleMutator::new(build_mutation_config(&adapter));
            with_backend(&adapter, |data, store| {
                evolve(data, store, &mut mutator, tweaks, random)
            })
        });

    match result {
        Ok(ids) => {
            eprintln!("Created {} rule(s)", ids.len());
            for id in ids {
                println!("{}", id);
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn run_validate_rule(rule_path: &Path, reject_unknown: bool) -> ExitCode {
    eprintln!("Validating rule: {}", rule_path.display());
    let json = match fs::read_to_string(rule_path) {
        Ok(s) => s,
        Err(e) => return fail(e.into()),
    };
    let definition = match RuleDefinition::from_json(&json) {
        Ok(d) => d,
        Err(e) => return fail(e),
    };

    let options = ScreeningOptions {
        unknown_sign: if reject_unknown {
            UnknownSignPolicy::Reject
        } else {
            UnknownSignPolicy::Skip
        },
        apply_mcap_threshold: true,
    };
    let plan = match definition.screening_plan(&options) {
        Ok(p) => p,
        Err(e) => return fail(e),
    };

    eprintln!("\nClauses ({} declared, {} applied):", plan.declared_filters, plan.clauses.len());
    for clause in &plan.clauses {
        eprintln!("  {} {} {}", clause.metric_name, clause.comparator, clause.threshold);
    }
    match definition.backtest_years() {
        Some((start, end)) => eprintln!("\nBacktest period: {}..={}", start, end),
        None => eprintln!("\nBacktest period: not declared"),
    }
    if plan.declared_filters == 0 {
        eprintln!("warning: rule has no filters and will never select a company");
    }

    eprintln!("\nRule definition is valid.");
    ExitCode::SUCCESS
}

fn run_init_db(config_path: &Path) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    match validate_database_config(&adapter).and_then(|_| initialize_schema(&adapter)) {
        Ok(()) => {
            eprintln!("Schema initialized for {} backend", backend_name(&adapter));
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn run_check(config_path: &Path, start: Option<i32>, end: Option<i32>) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let validated = validate_database_config(&adapter)
        .and_then(|_| validate_backtest_config(&adapter))
        .and_then(|_| validate_evolution_config(&adapter))
        .and_then(|_| build_backtest_config(&adapter, start, end));
    let bt_config = match validated {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    eprintln!("Config validated successfully");

    let schemes: Vec<&str> = bt_config.weighting.schemes.iter().map(|s| s.as_str()).collect();
    let mutation = build_mutation_config(&adapter);

    eprintln!("\nDatabase:");
    eprintln!("  backend: {}", backend_name(&adapter));
    eprintln!("\nBacktest:");
    eprintln!("  years:               {}..={}", bt_config.start_year, bt_config.end_year);
    eprintln!("  workers:             {}", bt_config.workers);
    eprintln!("  respect_rule_period: {}", bt_config.respect_rule_period);
    eprintln!("  capacity:            {}", bt_config.capacity);
    eprintln!("\nScreening:");
    eprintln!("  unknown_sign:         {:?}", bt_config.screening.unknown_sign);
    eprintln!("  apply_mcap_threshold: {}", bt_config.screening.apply_mcap_threshold);
    eprintln!("\nWeighting:");
    eprintln!("  schemes:            {}", schemes.join(", "));
    eprintln!("  vol_lookback:       {}", bt_config.weighting.vol_lookback);
    eprintln!("  momentum_period:    {}", bt_config.weighting.momentum_period);
    eprintln!("  default_volatility: {}", bt_config.weighting.default_volatility);
    eprintln!("  epsilon:            {:e}", bt_config.weighting.epsilon);
    eprintln!("\nMetrics:");
    eprintln!("  risk_free_rate: {}", bt_config.risk_free_rate);
    eprintln!("\nEvolution:");
    eprintln!("  seed:        {}", mutation.seed);
    eprintln!("  max_tweaks:  {}", mutation.max_tweaks);
    eprintln!("  max_filters: {}", mutation.max_filters);

    eprintln!("\nDry run complete: configuration is valid");
    ExitCode::SUCCESS
}

/// Resolves the orchestrator settings. CLI year overrides win over the file.
pub fn build_backtest_config(
    config: &dyn ConfigPort,
    start_override: Option<i32>,
    end_override: Option<i32>,
) -> Result<BacktestConfig, RulefolioError> {
    let start_year = match start_override {
        Some(y) => y,
        None => parse_year(config, "start_year")?.ok_or_else(|| RulefolioError::ConfigMissing {
            section: "backtest".into(),
            key: "start_year".into(),
        })?,
    };
    let end_year = match end_override {
        Some(y) => y,
        None => parse_year(config, "end_year")?.ok_or_else(|| RulefolioError::ConfigMissing {
            section: "backtest".into(),
            key: "end_year".into(),
        })?,
    };
    if start_year > end_year {
        return Err(RulefolioError::ConfigInvalid {
            section: "backtest".into(),
            key: "start_year".into(),
            reason: format!("start year {} is after end year {}", start_year, end_year),
        });
    }

    let defaults = WeightingConfig::default();
    let schemes = match config.get_string("weighting", "schemes") {
        Some(list) => parse_schemes(&list)?,
        None => WeightingScheme::ALL.to_vec(),
    };
    let weighting = WeightingConfig {
        schemes,
        vol_lookback: config
            .get_int("weighting", "vol_lookback", defaults.vol_lookback as i64)
            .max(2) as usize,
        momentum_period: config
            .get_int("weighting", "momentum_period", defaults.momentum_period)
            .max(1),
        default_volatility: config.get_double(
            "weighting",
            "default_volatility",
            defaults.default_volatility,
        ),
        epsilon: config.get_double("weighting", "epsilon", defaults.epsilon),
    };

    let mut bt_config = BacktestConfig::new(start_year, end_year);
    bt_config.capacity = config
        .get_int("universe", "capacity", bt_config.capacity as i64)
        .max(1) as usize;
    bt_config.screening = ScreeningOptions {
        unknown_sign: parse_unknown_sign(config)?,
        apply_mcap_threshold: config.get_bool("screening", "apply_mcap_threshold", false),
    };
    bt_config.weighting = weighting;
    bt_config.risk_free_rate =
        config.get_double("metrics", "risk_free_rate", bt_config.risk_free_rate);
    bt_config.workers = config.get_int("backtest", "workers", 1).max(1) as usize;
    bt_config.respect_rule_period = config.get_bool("backtest", "respect_rule_period", false);
    Ok(bt_config)
}

pub fn build_mutation_config(config: &dyn ConfigPort) -> MutationConfig {
    let defaults = MutationConfig::default();
    MutationConfig {
        seed: config.get_int("evolution", "seed", defaults.seed as i64).max(0) as u64,
        max_tweaks: config
            .get_int("evolution", "max_tweaks", defaults.max_tweaks as i64)
            .max(1) as usize,
        max_filters: config
            .get_int("evolution", "max_filters", defaults.max_filters as i64)
            .max(1) as usize,
    }
}

fn backend_name(config: &dyn ConfigPort) -> String {
    config
        .get_value("database", "backend")
        .map(|b| b.to_lowercase())
        .unwrap_or_else(|| "sqlite".to_string())
}

fn backend_unavailable(name: &str) -> RulefolioError {
    RulefolioError::ConfigInvalid {
        section: "database".into(),
        key: "backend".into(),
        reason: format!("backend '{}' is not compiled into this build", name),
    }
}

/// Opens the configured backend and hands it to `f` as both ports.
fn with_backend<T>(
    config: &dyn ConfigPort,
    f: impl FnOnce(&dyn DataPort, &dyn StorePort) -> Result<T, RulefolioError>,
) -> Result<T, RulefolioError> {
    let name = backend_name(config);
    match name.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let adapter = crate::adapters::sqlite_adapter::SqliteAdapter::from_config(config)?;
            f(&adapter, &adapter)
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let adapter = crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?;
            f(&adapter, &adapter)
        }
        other => {
            let _ = f;
            Err(backend_unavailable(other))
        }
    }
}

fn initialize_schema(config: &dyn ConfigPort) -> Result<(), RulefolioError> {
    let name = backend_name(config);
    match name.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => crate::adapters::sqlite_adapter::SqliteAdapter::from_config(config)?
            .initialize_schema(),
        #[cfg(feature = "postgres")]
        "postgres" => crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?
            .initialize_schema(),
        other => Err(backend_unavailable(other)),
    }
}
