//! Operator CLI for the delivery engine.
//!
//! # Responsibility
//! - Run migrations, single dispatch ticks and a polling worker.
//! - Expose ledger maintenance (grant, balance, reconcile).
//!
//! Providers wired here are dry-run adapters; real channel integrations are
//! registered by the embedding service.

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use timecapsule_core::db::migrations::current_user_version;
use timecapsule_core::{
    core_version, init_logging_from_config, open_db, Connection, CreditType, DispatchScheduler,
    DryRunProvider, EngineConfig, LedgerService, ProviderRegistry, SystemClock,
};

#[derive(Debug, Parser)]
#[command(name = "timecapsule", about = "Future-letter delivery engine", version)]
struct Cli {
    /// JSON engine configuration; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database file.
    #[arg(long, global = true, default_value = "timecapsule.db")]
    db: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the engine version.
    Version,
    /// Apply pending schema migrations.
    Migrate,
    /// Run one dispatch pass.
    Tick,
    /// Poll for due deliveries until interrupted.
    Worker {
        /// Stop after this many ticks.
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Record purchased credits.
    Grant {
        #[arg(long)]
        user: String,
        #[arg(long, value_enum)]
        credit_type: CreditArg,
        #[arg(long)]
        amount: i64,
        /// Payment reference used as the idempotency key.
        #[arg(long)]
        key: String,
    },
    /// Show a user's credit balances.
    Balance {
        #[arg(long)]
        user: String,
    },
    /// Compare the balance cache with the ledger.
    Reconcile {
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CreditArg {
    Email,
    Mail,
}

impl From<CreditArg> for CreditType {
    fn from(value: CreditArg) -> Self {
        match value {
            CreditArg::Email => CreditType::Email,
            CreditArg::Mail => CreditType::Mail,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_exit module=cli status=error error={message}");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path).map_err(|err| err.to_string())?,
        None => EngineConfig::default(),
    };
    init_logging_from_config(&config.logging).map_err(|err| err.to_string())?;

    if let Command::Version = cli.command {
        println!("timecapsule_core version={}", core_version());
        return Ok(());
    }

    let conn = open_db(&cli.db).map_err(|err| err.to_string())?;
    match cli.command {
        Command::Version => {}
        Command::Migrate => {
            let version = current_user_version(&conn).map_err(|err| err.to_string())?;
            println!("schema version={version}");
        }
        Command::Tick => {
            let report = scheduler(&conn, &config)?
                .run_tick()
                .map_err(|err| err.to_string())?;
            println!("{report:?}");
        }
        Command::Worker { max_ticks } => {
            let scheduler = scheduler(&conn, &config)?;
            let interval = config.dispatch.poll_interval();
            let mut ticks = 0_u64;
            info!(
                "event=worker_start module=cli status=ok poll_interval_secs={}",
                interval.as_secs()
            );
            loop {
                if let Err(err) = scheduler.run_tick() {
                    error!("event=worker_tick module=cli status=error error={err}");
                }
                ticks += 1;
                if max_ticks.is_some_and(|max| ticks >= max) {
                    break;
                }
                std::thread::sleep(interval);
            }
        }
        Command::Grant {
            user,
            credit_type,
            amount,
            key,
        } => {
            let entry = LedgerService::new(&conn, SystemClock)
                .grant(&user, credit_type.into(), amount, &key)
                .map_err(|err| err.to_string())?;
            println!("granted entry={} delta={}", entry.id, entry.delta);
        }
        Command::Balance { user } => {
            let balances = LedgerService::new(&conn, SystemClock)
                .balances(&user)
                .map_err(|err| err.to_string())?;
            println!("email={} mail={}", balances.email, balances.mail);
        }
        Command::Reconcile { repair } => {
            let report = LedgerService::new(&conn, SystemClock)
                .reconcile_balances(repair)
                .map_err(|err| err.to_string())?;
            println!(
                "checked={} drifted={} repaired={}",
                report.checked,
                report.drifted.len(),
                report.repaired
            );
        }
    }
    Ok(())
}

fn scheduler<'conn>(
    conn: &'conn Connection,
    config: &EngineConfig,
) -> Result<DispatchScheduler<'conn, SystemClock>, String> {
    let mut providers = ProviderRegistry::new();
    for kind in CreditType::ALL {
        providers
            .register(Arc::new(DryRunProvider::new(kind)))
            .map_err(|err| err.to_string())?;
    }
    Ok(DispatchScheduler::new(
        conn,
        SystemClock,
        providers,
        config.retry.clone(),
        config.dispatch.clone(),
    ))
}
