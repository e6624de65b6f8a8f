//! fxsync: sample flows against the paper venue.
//!
//! Usage:
//!   fxsync [OPTIONS] <COMMAND>
//!
//! Commands:
//!   print-table    List accounts and the orders or trades of one account
//!   create-oto     Place a sell-stop-triggers-buy-stop OTO and wait for it
//!   watch-offers   Stream offer prices with direction markers
//!   dump           Write one table as JSON lines

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use fxsync::core::TableKind;
use fxsync::paper::PaperVenue;
use fxsync::samples::{self, Client};
use fxsync::Config;

/// CLI arguments for fxsync.
#[derive(Parser, Debug)]
#[command(name = "fxsync")]
#[command(about = "Session, table and request synchronization samples")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    login: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Venue URL; "/Hosts.jsp" is appended when missing
    #[arg(long)]
    url: Option<String>,

    /// Connection name, e.g. Demo or Real
    #[arg(long)]
    connection: Option<String>,

    /// Trading session id, if the venue asks for one
    #[arg(long)]
    session_id: Option<String>,

    #[arg(long)]
    pin: Option<String>,

    /// Account to use; first eligible account when omitted
    #[arg(long)]
    account: Option<String>,

    /// Instrument, e.g. EUR/USD
    #[arg(long)]
    instrument: Option<String>,

    #[arg(long)]
    lots: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    PrintTable {
        /// "orders" or "trades"
        #[arg(long)]
        table: Option<String>,
    },
    CreateOto,
    WatchOffers {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Paper price tick interval
        #[arg(long, default_value_t = 500)]
        tick_ms: u64,
    },
    Dump {
        /// accounts, offers, orders or trades
        #[arg(long, default_value = "offers")]
        table: TableKind,
    },
}

impl Args {
    fn apply(&self, config: &mut Config) {
        let overrides = [
            (&self.login, &mut config.login.login),
            (&self.password, &mut config.login.password),
            (&self.url, &mut config.login.url),
            (&self.connection, &mut config.login.connection),
            (&self.instrument, &mut config.sample.instrument),
        ];
        for (arg, slot) in overrides {
            if let Some(value) = arg {
                *slot = value.clone();
            }
        }
        if self.session_id.is_some() {
            config.login.session_id = self.session_id.clone();
        }
        if self.pin.is_some() {
            config.login.pin = self.pin.clone();
        }
        if self.account.is_some() {
            config.sample.account_id = self.account.clone();
        }
        if let Some(lots) = self.lots {
            config.sample.lots = lots;
        }
        if let Command::PrintTable { table: Some(table) } = &self.command {
            config.sample.table = table.clone();
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_sources(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("fxsync starting: {:?}", args.command);

    let venue = Arc::new(PaperVenue::new(config.paper.clone())?);
    let client = Client::new(venue.clone(), config.timeouts.clone())?;

    let result = run_sample(&client, &venue, &args.command, &config);
    let shutdown = client.shutdown();
    venue.shutdown();

    result?;
    shutdown.context("Logout failed")?;
    Ok(())
}

fn run_sample(client: &Client, venue: &Arc<PaperVenue>, command: &Command, config: &Config) -> Result<()> {
    client
        .login(config.login.to_credentials())
        .context("Login failed")?;

    let mut out = std::io::stdout().lock();
    match command {
        Command::PrintTable { .. } => samples::print_table(client, &config.sample, &mut out)?,
        Command::CreateOto => samples::create_oto(client, &config.sample, &mut out)?.into_result()?,
        Command::WatchOffers { seconds, tick_ms } => {
            let running = Arc::new(AtomicBool::new(true));
            let ticker = {
                let venue = venue.clone();
                let running = running.clone();
                let interval = Duration::from_millis(*tick_ms);
                std::thread::Builder::new()
                    .name("paper-ticker".into())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            std::thread::sleep(interval);
                            venue.tick();
                        }
                    })?
            };

            let watched = samples::watch_offers(client, Duration::from_secs(*seconds), &mut out);
            running.store(false, Ordering::Relaxed);
            let _ = ticker.join();
            info!("{} offer updates", watched?);
        }
        Command::Dump { table } => {
            samples::dump_table(client, *table, &mut out)?;
        }
    }
    Ok(())
}
