//! feedgate: polls feeds, gates items through keyword + metadata scoring, and
//! dispatches survivors to the downstream pipeline once each, under a daily cap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use feedgate::budget::{today_utc, BudgetGuard};
use feedgate::config::{resolve_config_path, ConfigBundle};
use feedgate::ledger::{DispatchStatus, Ledger};
use feedgate::lock::{process_alive, read_holder, InstanceLock};
use feedgate::metrics::Metrics;
use feedgate::scheduler::{run_loop, CycleReport, Scheduler};

#[derive(Parser)]
#[command(
    name = "feedgate",
    version,
    about = "Feed triage daemon with a two-stage relevance gate and a daily spend cap."
)]
struct Cli {
    /// Main config file (default: $FEEDGATE_CONFIG, then config/feedgate.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single cycle and exit.
    Run {
        /// Discover and score only: no budget, no ledger, no dispatch.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run cycles continuously at the configured interval.
    Daemon {
        #[arg(long)]
        dry_run: bool,
        /// Serve Prometheus metrics at ADDR (e.g. 127.0.0.1:9184).
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
    /// Print today's budget, ledger size and lock holder.
    Status,
}

fn init_tracing(cli: &Cli) {
    let default = match cli.verbose {
        0 => "feedgate=info,cycle=info",
        1 => "feedgate=debug,cycle=debug",
        _ => "feedgate=trace,cycle=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "feedgate failed");
            eprintln!("feedgate: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config.as_deref())?;
    // unreadable config is fatal before any state is touched
    let bundle = ConfigBundle::load(&config_path)?;

    match cli.command {
        Command::Status => status(&bundle),
        Command::Run { dry_run } => {
            let _lock = InstanceLock::acquire(bundle.app.state.lock_path())?;
            let (tx, rx) = watch::channel(false);
            spawn_signal_listener(tx);

            let scheduler = Scheduler::from_config(&bundle)?;
            let report = scheduler.run_cycle(dry_run, &rx).await?;
            print_report(&report);
            Ok(())
        }
        Command::Daemon { dry_run, metrics_addr } => {
            let _lock = InstanceLock::acquire(bundle.app.state.lock_path())?;
            let (tx, rx) = watch::channel(false);
            spawn_signal_listener(tx);

            if let Some(addr) = metrics_addr {
                let metrics = Metrics::init()?;
                let rx = rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = metrics.serve(addr, rx).await {
                        tracing::error!(error = ?e, "metrics endpoint stopped");
                    }
                });
            }

            let fallback = Duration::from_secs(bundle.app.polling.interval_secs);
            let mut first = Some(bundle);
            run_loop(
                move || match first.take() {
                    Some(b) => Scheduler::from_config(&b),
                    None => {
                        let b = ConfigBundle::load(&config_path)?;
                        Scheduler::from_config(&b)
                    }
                },
                dry_run,
                fallback,
                rx,
            )
            .await
        }
    }
}

fn spawn_signal_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!(target: "cycle", "stop requested; letting the in-flight dispatch finish");
        let _ = tx.send(true);
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_report(r: &CycleReport) {
    println!(
        "fetched={} new={} stage1={} stage2={} dispatched={} completed={} failed={} \
         budget_skipped={}",
        r.fetched,
        r.new,
        r.stage1_passed,
        r.stage2_passed,
        r.dispatched,
        r.completed,
        r.failed,
        r.budget_skipped
    );
    if r.dry_run {
        println!("dry run: {} item(s) would be dispatched", r.would_dispatch.len());
        for p in &r.would_dispatch {
            println!("  [{:.1}] {} {} ({})", p.score, p.id, p.title, p.url);
        }
    }
}

fn status(bundle: &ConfigBundle) -> Result<()> {
    let state = &bundle.app.state;
    let budget = BudgetGuard::open(state.budget_path(), bundle.app.budget.daily_limit_usd)
        .context("opening budget record")?;
    let ledger = Ledger::open(state.ledger_path()).context("opening ledger")?;
    let records = ledger.records()?;
    let failed = records
        .iter()
        .filter(|r| r.status == DispatchStatus::Failed)
        .count();

    println!("{}", budget.summary(today_utc())?);
    println!(
        "Ledger: {} record(s), {} completed, {} failed",
        records.len(),
        records.len() - failed,
        failed
    );
    match read_holder(&state.lock_path()) {
        Some(h) if process_alive(h.pid) => {
            println!("Lock: held by pid {} since {}", h.pid, h.started_at)
        }
        Some(h) => println!("Lock: stale (pid {} not running)", h.pid),
        None => println!("Lock: free"),
    }
    Ok(())
}
