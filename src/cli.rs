//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::adapters::csv_adapter::CsvPriceAdapter;
use crate::adapters::csv_report_adapter::CsvReportAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::BacktestResult;
use crate::domain::comparison::{ComparisonReport, MarkowitzFit, fit_markowitz, run_comparison};
use crate::domain::config_validation::validate_config;
use crate::domain::constraints::Weights;
use crate::domain::error::FiioptError;
use crate::domain::price_table::QuotaKind;
use crate::domain::settings::{ComparisonSettings, DataWindow};
use crate::domain::training::CancellationToken;
use crate::domain::universe::{
    AlignmentRules, UniverseValidationResult, align_universe, parse_tickers,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::PriceDataPort;
use crate::ports::report_port::ReportPort;

#[derive(Parser, Debug)]
#[command(
    name = "fiiopt",
    about = "Markowitz vs. reinforcement-learning allocation for FII portfolios"
)]
pub struct Cli {
    /// Verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit both allocators and backtest them on the holdout window
    Compare {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory for the CSV report
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override [drl] training_timesteps
        #[arg(long)]
        timesteps: Option<usize>,
        /// Override [drl] random_seed
        #[arg(long)]
        seed: Option<u64>,
        /// Comma-separated tickers, overriding [data] tickers
        #[arg(long)]
        tickers: Option<String>,
    },
    /// Markowitz allocation of the fit window only
    Markowitz {
        #[arg(short, long)]
        config: PathBuf,
        /// Number of efficient-frontier points to print
        #[arg(long, default_value_t = 0)]
        frontier: usize,
        #[arg(long)]
        tickers: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the date range and tickers of the price tables
    Info {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        // A subscriber may already be installed when embedded in tests.
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

pub fn run(cli: Cli) -> ExitCode {
    cli.init_logging();
    let result = match cli.command {
        Command::Compare {
            config,
            output,
            timesteps,
            seed,
            tickers,
        } => run_compare(&config, output.as_deref(), timesteps, seed, tickers.as_deref()),
        Command::Markowitz {
            config,
            frontier,
            tickers,
        } => run_markowitz(&config, frontier, tickers.as_deref()),
        Command::Validate { config } => run_validate(&config),
        Command::Info { config } => run_info(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, FiioptError> {
    info!("loading config from {}", path.display());
    FileConfigAdapter::from_file(path)
}

/// Price adapter for the `[data]` section.
pub fn build_price_adapter(config: &dyn ConfigPort) -> Result<CsvPriceAdapter, FiioptError> {
    let path = |key: &str| {
        config
            .get_string("data", key)
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(s.trim()))
            .ok_or_else(|| FiioptError::missing("data", key))
    };
    let adapter = CsvPriceAdapter::new(path("adjusted_path")?, path("market_path")?);
    match config.get_string("data", "delimiter").as_deref().map(str::trim) {
        None | Some("") | Some(",") => Ok(adapter),
        Some(";") => Ok(adapter.with_delimiter(b';')),
        Some(other) => Err(FiioptError::invalid(
            "data",
            "delimiter",
            format!("unsupported delimiter '{}', expected ',' or ';'", other),
        )),
    }
}

pub fn build_alignment_rules(config: &dyn ConfigPort) -> Result<AlignmentRules, FiioptError> {
    let defaults = AlignmentRules::default();
    Ok(AlignmentRules {
        min_coverage: config
            .get_optional_double("data", "min_coverage")?
            .unwrap_or(defaults.min_coverage),
        min_observations: config
            .get_optional_usize("data", "min_observations")?
            .unwrap_or(defaults.min_observations),
        forward_fill: config.get_bool("data", "forward_fill", defaults.forward_fill),
        coverage_before: None,
    })
}

pub fn build_settings(config: &dyn ConfigPort) -> Result<ComparisonSettings, FiioptError> {
    let window = DataWindow {
        start: config.get_date("data", "start_date")?,
        end: config.get_date("data", "end_date")?,
        holdout_start: config.get_date("data", "holdout_start")?,
    };
    let mut settings = ComparisonSettings::new(window);

    let opt = &mut settings.optimization;
    opt.asset_count = config
        .get_optional_usize("optimization", "asset_count")?
        .ok_or_else(|| FiioptError::missing("optimization", "asset_count"))?;
    opt.max_weight_per_asset = config
        .get_optional_double("optimization", "max_weight_per_asset")?
        .ok_or_else(|| FiioptError::missing("optimization", "max_weight_per_asset"))?;
    if let Some(rf) = config.get_optional_double("optimization", "risk_free_rate")? {
        opt.risk_free_rate = rf;
    }
    opt.target_return = config.get_optional_double("optimization", "target_return")?;
    if let Some(timesteps) = config.get_optional_usize("drl", "training_timesteps")? {
        opt.training_timesteps = timesteps;
    }
    opt.random_seed = match config.get_string("drl", "random_seed") {
        Some(s) if !s.trim().is_empty() => Some(s.trim().parse::<u64>().map_err(|_| {
            FiioptError::invalid("drl", "random_seed", "random_seed must be a non-negative integer")
        })?),
        _ => None,
    };

    let risk = &mut settings.risk;
    if let Some(s) = config.get_string("optimization", "covariance") {
        risk.covariance = s
            .parse()
            .map_err(|e| FiioptError::invalid("optimization", "covariance", e))?;
    }
    if let Some(s) = config.get_string("optimization", "expected_returns") {
        risk.expected_returns = s
            .parse()
            .map_err(|e| FiioptError::invalid("optimization", "expected_returns", e))?;
    }
    if let Some(ppy) = config.get_optional_double("optimization", "periods_per_year")? {
        risk.periods_per_year = ppy;
    }
    if let Some(min) = config.get_optional_usize("data", "min_observations")? {
        risk.min_observations = min;
    }

    let drl = &mut settings.drl;
    if let Some(lookback) = config.get_optional_usize("drl", "lookback")? {
        drl.lookback = lookback;
    }
    if let Some(penalty) = config.get_optional_double("drl", "risk_penalty")? {
        drl.risk_penalty = penalty;
    }
    if let Some(s) = config.get_string("drl", "penalty") {
        drl.penalty = s
            .parse()
            .map_err(|e| FiioptError::invalid("drl", "penalty", e))?;
    }
    drl.track_target = matches!(
        config.get_string("drl", "reward").as_deref().map(str::trim),
        Some("target_tracking")
    );
    if let Some(v) = config.get_optional_double("drl", "learning_rate")? {
        drl.learning_rate = v;
    }
    if let Some(v) = config.get_optional_double("drl", "exploration_std")? {
        drl.exploration_std = v;
    }
    if let Some(v) = config.get_optional_double("drl", "discount")? {
        drl.discount = v;
    }
    if let Some(v) = config.get_optional_usize("drl", "envs_per_phase")? {
        drl.envs_per_phase = v;
    }
    if let Some(v) = config.get_optional_double("drl", "max_grad_norm")? {
        drl.max_grad_norm = v;
    }

    if let Some(capital) = config.get_optional_double("backtest", "initial_capital")? {
        settings.initial_capital = capital;
    }
    if let Some(every) = config.get_optional_usize("backtest", "rebalance_every")? {
        settings.rebalance_every = every;
    }

    settings.validate()?;
    Ok(settings)
}

/// Tickers to consider: the override, else `[data] tickers`, else every
/// ticker in the tables.
pub fn resolve_tickers(
    ticker_override: Option<&str>,
    config: &dyn ConfigPort,
) -> Result<Option<Vec<String>>, FiioptError> {
    let raw = match ticker_override {
        Some(t) => Some(t.to_string()),
        None => config
            .get_string("data", "tickers")
            .filter(|s| !s.trim().is_empty()),
    };
    raw.map(|s| parse_tickers(&s).map_err(|e| FiioptError::invalid("data", "tickers", e.to_string())))
        .transpose()
}

/// Fetch both quota tables over the data window and align them.
pub fn load_universe(
    data_port: &dyn PriceDataPort,
    window: &DataWindow,
    rules: &AlignmentRules,
    tickers: Option<&[String]>,
) -> Result<UniverseValidationResult, FiioptError> {
    let adjusted = data_port.fetch_prices(QuotaKind::Adjusted, window.start, window.end)?;
    let market = data_port.fetch_prices(QuotaKind::Market, window.start, window.end)?;
    // Holdout prices must not decide which assets the fit window may use.
    let rules = AlignmentRules {
        coverage_before: Some(window.holdout_start),
        ..rules.clone()
    };
    let universe = align_universe(&adjusted, &market, &rules, tickers)?;
    info!(
        "universe: {} assets over {} dates, {} skipped",
        universe.panel.count(),
        universe.panel.dates.len(),
        universe.skipped.len()
    );
    Ok(universe)
}

/// Load, validate and fit everything the config describes, then write the
/// report.
pub fn run_compare_pipeline(
    config: &dyn ConfigPort,
    data_port: &dyn PriceDataPort,
    report_port: &dyn ReportPort,
    ticker_override: Option<&str>,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<ComparisonReport, FiioptError> {
    validate_config(config)?;
    let settings = build_settings(config)?;
    let rules = build_alignment_rules(config)?;
    let tickers = resolve_tickers(ticker_override, config)?;
    let universe = load_universe(data_port, &settings.window, &rules, tickers.as_deref())?;

    info!(
        "training for {} timesteps",
        settings.optimization.training_timesteps
    );
    let report = run_comparison(&universe, &settings, cancel)?;

    if let Some(dir) = output {
        let files = report_port.write(&report, dir)?;
        for f in &files {
            info!("wrote {}", f.display());
        }
    }
    Ok(report)
}

fn run_compare(
    config_path: &Path,
    output: Option<&Path>,
    timesteps: Option<usize>,
    seed: Option<u64>,
    tickers: Option<&str>,
) -> Result<(), FiioptError> {
    let mut config = load_config(config_path)?;
    if let Some(t) = timesteps {
        config.set("drl", "training_timesteps", &t.to_string());
    }
    if let Some(s) = seed {
        config.set("drl", "random_seed", &s.to_string());
    }
    let output = output
        .map(Path::to_path_buf)
        .or_else(|| config.get_string("report", "output_dir").map(PathBuf::from));

    let data_port = build_price_adapter(&config)?;
    let report = run_compare_pipeline(
        &config,
        &data_port,
        &CsvReportAdapter::new(),
        tickers,
        output.as_deref(),
        &CancellationToken::new(),
    )?;
    print_comparison(&report);
    if let Some(dir) = output {
        println!("\nReport written to: {}", dir.display());
    }
    Ok(())
}

fn run_markowitz(config_path: &Path, frontier: usize, tickers: Option<&str>) -> Result<(), FiioptError> {
    let config = load_config(config_path)?;
    validate_config(&config)?;
    let settings = build_settings(&config)?;
    let rules = build_alignment_rules(&config)?;
    let tickers = resolve_tickers(tickers, &config)?;
    let data_port = build_price_adapter(&config)?;
    let universe = load_universe(&data_port, &settings.window, &rules, tickers.as_deref())?;
    let fit = fit_markowitz(&universe, &settings, frontier)?;
    print_markowitz(&fit);
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<(), FiioptError> {
    let config = load_config(config_path)?;
    validate_config(&config)?;
    let settings = build_settings(&config)?;
    let tickers = resolve_tickers(None, &config)?;

    let w = &settings.window;
    println!("Fit window:     {} to {}", w.start, w.holdout_start);
    println!("Holdout window: {} to {}", w.holdout_start, w.end);
    let c = settings.constraints();
    println!(
        "Constraints:    {} assets, max weight {:.2}, risk-free {:.2}%",
        c.asset_count,
        c.max_weight,
        c.risk_free_rate * 100.0
    );
    match c.target_return {
        Some(t) => println!("Objective:      min variance, target return {:.2}%", t * 100.0),
        None => println!("Objective:      max Sharpe"),
    }
    println!(
        "Training:       {} timesteps, seed {}",
        settings.optimization.training_timesteps,
        settings
            .optimization
            .random_seed
            .map_or_else(|| "random".to_string(), |s| s.to_string())
    );
    match tickers {
        Some(t) => println!("Tickers:        {}", t.join(", ")),
        None => println!("Tickers:        all"),
    }
    println!("\nConfiguration is valid.");
    Ok(())
}

fn run_info(config_path: &Path) -> Result<(), FiioptError> {
    let config = load_config(config_path)?;
    let data_port = build_price_adapter(&config)?;
    for kind in [QuotaKind::Adjusted, QuotaKind::Market] {
        let tickers = data_port.list_tickers(kind)?;
        match data_port.get_data_range(kind)? {
            Some((first, last, rows)) => println!(
                "{}: {} tickers, {} dates, {} to {}",
                kind,
                tickers.len(),
                rows,
                first,
                last
            ),
            None => println!("{}: {} tickers, no data", kind, tickers.len()),
        }
    }
    Ok(())
}

fn print_weights(label: &str, weights: &Weights) {
    println!("\n=== {} ===", label);
    for (asset, w) in weights.nonzero(1e-6) {
        println!("  {:<10} {:>6.2}%", asset, w * 100.0);
    }
}

fn print_result(result: &BacktestResult) {
    let m = &result.metrics;
    println!(
        "  {:<13} {:>9.2}% {:>9.2}% {:>8.2}% {:>7.2} {:>7.2} {:>8.1}%",
        result.strategy,
        m.cumulative_return * 100.0,
        m.annualized_return * 100.0,
        m.annualized_volatility * 100.0,
        m.sharpe_ratio,
        m.sortino_ratio,
        m.max_drawdown * 100.0
    );
}

fn print_comparison(report: &ComparisonReport) {
    println!("Fingerprint: {}", report.fingerprint);
    println!(
        "Fit periods: {}, holdout periods: {}",
        report.fit_periods,
        report.markowitz_backtest.curve.len()
    );
    print_weights("Markowitz weights", &report.markowitz.weights);
    print_weights("RL weights (start of holdout)", &report.rl_weights);

    println!("\n=== Holdout results ===");
    println!(
        "  {:<13} {:>10} {:>10} {:>9} {:>7} {:>7} {:>9}",
        "strategy", "total", "annual", "vol", "sharpe", "sortino", "max dd"
    );
    for result in report.backtests() {
        print_result(result);
    }
    if let Some(reward) = report.training.final_mean_reward() {
        println!(
            "\nTraining: {} timesteps, seed {}, final mean reward {:.6}",
            report.training.timesteps, report.training.seed, reward
        );
    }
}

fn print_markowitz(fit: &MarkowitzFit) {
    let s = &fit.solution;
    println!("Fit periods: {}", fit.fit_periods);
    print_weights("Markowitz weights", &s.weights);
    println!(
        "\nExpected return {:.2}%, volatility {:.2}%, Sharpe {:.3}",
        s.expected_return * 100.0,
        s.volatility * 100.0,
        s.sharpe_ratio
    );
    if s.used_fallback {
        println!("(solved with fallback solver settings)");
    }
    if !fit.frontier.is_empty() {
        println!("\n=== Efficient frontier ===");
        println!("  {:>9} {:>9} {:>7}", "return", "vol", "sharpe");
        for p in &fit.frontier {
            println!(
                "  {:>8.2}% {:>8.2}% {:>7.3}",
                p.expected_return * 100.0,
                p.volatility * 100.0,
                p.sharpe_ratio
            );
        }
    }
}
