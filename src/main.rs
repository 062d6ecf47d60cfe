use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use mktplace_ledger::core::{Clock, FixedClock, Ledger, SystemClock};
use mktplace_ledger::{Config, Engine, FileLedger, LedgerIdentity, genesis};

#[derive(Parser)]
#[command(name = "mktplace-ledger", about = "Run one marketplace invocation against a ledger file")]
struct Cli {
    /// TOML config; mktplace.toml or built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger state file
    #[arg(long, default_value = "ledger.json")]
    state: PathBuf,

    /// Party ID the invocation runs as
    #[arg(long, env = "MKTPLACE_CALLER")]
    caller: Option<String>,

    /// Pin "today" (YYYY-MM-DD) for settlement checks
    #[arg(long)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Seed parties and counters
    Genesis,
    /// Run a read-write function
    Invoke { function: String, args: Vec<String> },
    /// Run a read-only function
    Query { function: String, args: Vec<String> },
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mktplace_ledger=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_default(),
    };

    let ledger = Arc::new(
        FileLedger::open(&cli.state).with_context(|| format!("opening {}", cli.state.display()))?,
    );

    match cli.command {
        Action::Genesis => {
            if genesis::seed(ledger.as_ref(), &config)? {
                ledger.flush()?;
                tracing::info!("Seeded {}", cli.state.display());
            }
        }
        Action::Invoke { function, args } => {
            let clock: Arc<dyn Clock> = match cli.today {
                Some(day) => Arc::new(FixedClock::on(day)),
                None => Arc::new(SystemClock),
            };
            let store: Arc<dyn Ledger> = ledger.clone();
            let engine = Engine::new(store, Arc::new(LedgerIdentity::new(cli.caller)), config.engine)
                .with_clock(clock);

            let outcome = engine.invoke(&function, &args);
            // failure records and kept partial writes are persisted either way
            ledger.flush()?;
            match outcome? {
                Some(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                None => tracing::warn!("{} recorded a failure; check the transaction status", function),
            }
        }
        Action::Query { function, args } => {
            let store: Arc<dyn Ledger> = ledger.clone();
            let engine = Engine::new(store, Arc::new(LedgerIdentity::new(cli.caller)), config.engine);
            let payload = engine.query(&function, &args)?;
            println!("{}", String::from_utf8_lossy(&payload));
        }
    }

    Ok(())
}
