//! Multi-Strategy Rebalancer - Main Entry Point
//!
//! One invocation runs one rebalance cycle against the paper venue, prints a
//! summary and exits with the cycle's status code.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use multi_strategy_rebalancer::config::{Config, ExecutionMode};
use multi_strategy_rebalancer::cycle::{symbol_prices, CycleOptions, CycleReport, RebalanceCycle};
use multi_strategy_rebalancer::exchange::{DryRunExchange, Exchange, PaperExchange};
use multi_strategy_rebalancer::market::{CsvCandleLoader, MarketDataSource, Universe};
use multi_strategy_rebalancer::persistence::{PersistenceManager, RunLock};
use multi_strategy_rebalancer::strategy::{RebalanceScheduler, StrategyRegistry};
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Multi-Strategy Rebalancer CLI
#[derive(Parser)]
#[command(name = "multi-strategy-rebalancer")]
#[command(version, about = "Allocate capital across strategies and rebalance toward the combined target")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, global = true, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one rebalance cycle (default)
    Run(RunArgs),

    /// Show persisted schedule state and the paper account
    Status {
        /// Path to SQLite database (default: from configuration)
        #[arg(long)]
        db: Option<String>,

        /// Show weights, rebalance history and recent trades
        #[arg(short, long)]
        verbose: bool,
    },

    /// Make strategies due on the next run
    Force {
        /// Strategy names
        #[arg(required = true)]
        strategies: Vec<String>,

        /// Path to SQLite database (default: from configuration)
        #[arg(long)]
        db: Option<String>,

        /// Date the strategies become due (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Simulate orders; leave venue and schedule untouched
    #[arg(long)]
    dry_run: bool,

    /// Recompute every strategy regardless of schedule
    #[arg(long)]
    force: bool,

    /// Recompute this strategy regardless of schedule (repeatable)
    #[arg(long = "force-strategy", value_name = "NAME")]
    force_strategy: Vec<String>,

    /// Override the configured execution mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Path to candle CSV (default: from configuration)
    #[arg(long)]
    data: Option<String>,

    /// Path to SQLite database (default: from configuration)
    #[arg(long)]
    db: Option<String>,

    /// Run as of this date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Simple,
    Aggressive,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Simple => ExecutionMode::Simple,
            ModeArg::Aggressive => ExecutionMode::Aggressive,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let code = match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_cycle(&cli.config, args).await?,
        Commands::Status { db, verbose } => {
            show_status(&cli.config, db, verbose)?;
            0
        }
        Commands::Force { strategies, db, date } => {
            force_strategies(&cli.config, &strategies, db, date)?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_cycle(config_path: &str, args: RunArgs) -> Result<i32> {
    let mut config = Config::load_from(config_path)?;
    if let Some(mode) = args.mode {
        config.execution.mode = mode.into();
    }
    if let Some(data) = args.data {
        config.data.candles_path = data;
    }
    if let Some(db) = args.db {
        config.persistence.db_path = db;
    }
    config.execution.dry_run |= args.dry_run;
    let dry_run = config.execution.dry_run;

    config.validate()?;
    let registry = StrategyRegistry::with_builtins();
    config.validate_adapters(&registry.names())?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Multi-Strategy Rebalancer v{}                      ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    if dry_run {
        info!("🧪 DRY RUN - orders are logged, not placed");
    }
    log_config(&config);

    let db_path = PathBuf::from(&config.persistence.db_path);
    let _lock = RunLock::acquire(&db_path)?;
    let persistence = PersistenceManager::new(&db_path)?;

    let mut options = match args.date {
        Some(date) => CycleOptions::for_date(parse_date(&date)?),
        None => CycleOptions::now(),
    };
    options.dry_run = dry_run;
    options.force_all = args.force;
    options.forced = args.force_strategy.into_iter().collect();

    let data = CsvCandleLoader::new(&config.data.candles_path).load()?;
    let universe = Universe::from_config(&config);

    let paper = Arc::new(PaperExchange::new(&config.paper));
    if let Some(snapshot) = persistence.load_paper_state()? {
        paper.restore_state(snapshot).await;
    }
    paper
        .set_prices(symbol_prices(&data.as_of(options.today), &universe))
        .await;

    let exchange: Arc<dyn Exchange> = if dry_run {
        Arc::new(DryRunExchange::new(Arc::clone(&paper)))
    } else {
        paper.clone()
    };

    let report = RebalanceCycle::new(&config, &registry, &universe, exchange, &persistence, options)
        .run(&data)
        .await?;

    if !dry_run {
        persistence.record_trades(report.date, &report.trades)?;
        persistence.save_paper_state(&paper.export_state().await)?;
    }

    print_summary(&report, dry_run);
    Ok(report.exit_code())
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", raw))
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "rebalancer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("multi_strategy_rebalancer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Rebalance Threshold: {:.2}% of equity",
        config.portfolio.rebalance_threshold * dec!(100)
    );
    info!(
        "   Max Strategy Share: {:.0}%",
        config.portfolio.max_strategy_share * dec!(100)
    );
    info!("   Max Gross Leverage: {}x", config.portfolio.max_gross_leverage);
    info!("   Execution Mode: {:?}", config.execution.mode);
    info!("   Universe: {} instruments", config.universe.len());
    for strategy in &config.strategies {
        info!(
            "   Strategy {}: adapter={} weight={:.0}% cadence={}d flexible={}",
            strategy.name,
            strategy.adapter_name(),
            strategy.weight * dec!(100),
            strategy.cadence_days,
            strategy.flexible
        );
    }
}

fn print_summary(report: &CycleReport, dry_run: bool) {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!(
        "║  REBALANCE CYCLE {}{}                          ║",
        report.date,
        if dry_run { " (dry run)" } else { "          " }
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    if report.halted {
        println!("\n🛑 Cycle halted: no usable market data. No orders were placed.");
        for alert in &report.alerts {
            println!("   • [{}] {}", alert.severity.as_str(), alert.message);
        }
        return;
    }

    println!("\n💰 Equity: ${:.2}", report.equity);

    println!("\n📊 Strategies");
    for run in &report.strategies {
        let allocation = report.allocations.iter().find(|a| a.strategy == run.strategy);
        let state = if run.failed {
            "FAILED"
        } else if run.due {
            "recomputed"
        } else {
            "cached"
        };
        match allocation {
            Some(a) => println!(
                "   ├─ {:<16} {:<10} {:>3} instr  nominal ${:.2}  realized ${:.2}  (+${:.2} / -${:.2})",
                run.strategy, state, run.instruments, a.nominal, a.realized, a.reallocated_in, a.clamped_out
            ),
            None => println!("   ├─ {:<16} {:<10} {:>3} instr", run.strategy, state, run.instruments),
        }
    }
    println!("   └─ Idle capital: ${:.2}", report.idle_capital);

    println!("\n🎯 Target ({} instruments, gross ${:.2})", report.target.len(), report.target.gross());
    for position in report.target.positions() {
        println!(
            "   ├─ {:<10} {:<4} ${:.2}",
            position.instrument, position.side.to_string(), position.notional
        );
    }

    if report.outcomes.is_empty() {
        println!("\n✅ Nothing to trade");
    } else {
        println!("\n⚡ Execution");
        for outcome in &report.outcomes {
            let price = outcome
                .average_price
                .map(|p| format!("{:.4}", p))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "   ├─ {:<10} {:<4} {:?} {}/{} @ {}  [{}]",
                outcome.intent.instrument,
                outcome.intent.side.to_string(),
                outcome.final_state,
                outcome.filled_quantity,
                outcome.requested_quantity,
                price,
                outcome.phases.join(" → ")
            );
            if let Some(reason) = &outcome.reason {
                println!("   │    reason: {}", reason);
            }
        }
    }

    if !report.recorded.is_empty() {
        println!("\n🗓️  Rebalance recorded for: {}", report.recorded.join(", "));
    }

    if !report.alerts.is_empty() {
        println!("\n⚠️  Alerts");
        for alert in &report.alerts {
            println!("   • [{}] {}", alert.severity.as_str(), alert.message);
        }
    }
}

/// Show persisted state without running a cycle.
fn show_status(config_path: &str, db: Option<String>, verbose: bool) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let db_path = db.unwrap_or(config.persistence.db_path);

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REBALANCER STATUS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(&db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No cycle has run yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(&db_path)?;
    let today = Utc::now().date_naive();
    let scheduler = RebalanceScheduler::new(&persistence, today, config.persistence.history_capacity);

    let states = scheduler.states()?;
    println!("\n🗓️  Strategies");
    if states.is_empty() {
        println!("   (no rebalance recorded yet)");
    }
    for state in &states {
        let due = if today >= state.next_rebalance_date { "DUE" } else { "" };
        println!(
            "   ├─ {:<16} every {}d  last {}  next {} {}",
            state.strategy_name,
            state.cadence_days,
            state
                .last_rebalance_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "never".to_string()),
            state.next_rebalance_date,
            due
        );
        if verbose {
            for (instrument, weight) in &state.current_weights {
                println!("   │    {:<10} {:+.4}", instrument, weight);
            }
            for entry in state.history.iter().rev() {
                println!("   │    {} {} instruments", entry.date, entry.instruments);
            }
        }
    }

    match persistence.load_paper_state()? {
        Some(paper) => {
            println!("\n💼 Paper Account");
            println!("   ├─ Balance:      ${:.2}", paper.balance);
            println!("   ├─ Fees Paid:    ${:.4}", paper.total_fees);
            println!("   ├─ Orders:       {}", paper.order_count);
            println!("   └─ Positions:    {}", paper.positions.len());
            for position in &paper.positions {
                println!(
                    "        {:<12} {:+} @ {:.4}",
                    position.symbol, position.quantity, position.avg_entry_price
                );
            }
        }
        None => println!("\n💼 Paper Account: not initialised"),
    }

    if verbose {
        let trades = persistence.recent_trades(20)?;
        println!("\n📜 Recent Trades");
        for trade in &trades {
            println!(
                "   ├─ {} {:<10} {:<4} {:<6} {} @ {}",
                trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
                trade.exchange_symbol,
                trade.side.to_string(),
                trade.order_type.to_string(),
                trade.quantity,
                trade.price
            );
        }
    }

    Ok(())
}

/// Persist `force_rebalance_now` for each named strategy.
fn force_strategies(config_path: &str, strategies: &[String], db: Option<String>, date: Option<String>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let db_path = PathBuf::from(db.unwrap_or_else(|| config.persistence.db_path.clone()));
    let today = match date {
        Some(date) => parse_date(&date)?,
        None => Utc::now().date_naive(),
    };

    let _lock = RunLock::acquire(&db_path)?;
    let persistence = PersistenceManager::new(&db_path)?;
    let scheduler = RebalanceScheduler::new(&persistence, today, config.persistence.history_capacity);

    for name in strategies {
        if !config.strategies.iter().any(|s| &s.name == name) {
            warn!(strategy = %name, "Strategy is not in the configuration");
        }
        match scheduler.force_rebalance_now(name)? {
            Some(state) => println!("✅ {} due on {}", name, state.next_rebalance_date),
            None => println!("ℹ️  {} has no state yet; it rebalances on the next run", name),
        }
    }
    Ok(())
}
