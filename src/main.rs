//! # SalesRelay: daily sales summary over a durable queue
//!
//! Usage:
//!   salesrelay init                          # Write default config to ~/.salesrelay/config.toml
//!   salesrelay scheduler                     # Fire the summary daily at schedule.fire_at
//!   salesrelay consumer                      # Consume summaries and pass them to the handler
//!   salesrelay fire                          # Run one firing now
//!   salesrelay record add --counterparty "Acme" --reference INV-1 --amount 120.50 --item ITEM01:3
//!   salesrelay record list
//!   salesrelay record get INV-1

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use salesrelay_broker::{
    AmqpDeliverySource, AmqpSettings, AmqpTransport, Consumer, ConsumerSettings, Publisher,
    PublisherSettings,
};
use salesrelay_core::config::expand_path;
use salesrelay_core::{EventLog, LineItem, RecordStore, SalesRelayConfig, TransactionRecord};
use salesrelay_scheduler::{DailyScheduler, SummaryJob};
use salesrelay_store::{Aggregator, SqliteRecordStore};

#[derive(Parser)]
#[command(
    name = "salesrelay",
    version,
    about = "📊 SalesRelay: daily sales summaries with durable AMQP handoff"
)]
struct Cli {
    /// Config file (default: ~/.salesrelay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the daily scheduler until Ctrl+C
    Scheduler,
    /// Run the queue consumer until Ctrl+C
    Consumer,
    /// Aggregate and publish one summary now
    Fire,
    /// Manage transaction records
    #[command(subcommand)]
    Record(RecordCommand),
}

#[derive(Subcommand)]
enum RecordCommand {
    /// Store a new transaction record
    Add(AddRecordArgs),
    /// Print all records as JSON
    List,
    /// Print one record as JSON
    Get {
        /// Record id
        id: String,
    },
}

#[derive(Args)]
struct AddRecordArgs {
    /// Record id (default: random UUID)
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    counterparty: String,
    #[arg(long)]
    reference: String,
    /// Decimal amount, e.g. 120.50
    #[arg(long)]
    amount: String,
    /// RFC 3339 timestamp (default: now)
    #[arg(long)]
    at: Option<String>,
    /// Line item as KEY:QTY, repeatable
    #[arg(long = "item")]
    items: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "salesrelay=debug,salesrelay_core=debug,salesrelay_store=debug,salesrelay_broker=debug,salesrelay_scheduler=debug,salesrelay_channels=debug"
    } else {
        "info,lapin=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SalesRelayConfig::default_path);

    if let Command::Init { force } = cli.command {
        return init(&config_path, force);
    }

    let config = match &cli.config {
        Some(path) => SalesRelayConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SalesRelayConfig::load()?,
    };

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Scheduler => run_scheduler(&config).await,
        Command::Consumer => run_consumer(&config).await,
        Command::Fire => fire(&config).await,
        Command::Record(RecordCommand::Add(args)) => add_record(&config, args).await,
        Command::Record(RecordCommand::List) => list_records(&config).await,
        Command::Record(RecordCommand::Get { id }) => {
            let store = open_store(&config)?;
            println!("{}", show_record(store.as_ref(), &id).await?);
            Ok(())
        }
    }
}

fn init(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SalesRelayConfig::default().save_to(path)?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

fn open_store(config: &SalesRelayConfig) -> Result<Arc<SqliteRecordStore>> {
    let path = expand_path(&config.store.path);
    let store = SqliteRecordStore::open(&path)
        .with_context(|| format!("opening record store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn summary_job(config: &SalesRelayConfig, events: Arc<EventLog>) -> Result<Arc<SummaryJob>> {
    let aggregator = Aggregator::new(open_store(config)?, config.store.query_timeout());
    let transport = Arc::new(AmqpTransport::new(AmqpSettings::from_config(&config.broker)));
    let publisher = Publisher::new(
        transport,
        PublisherSettings::from_config(&config.broker),
        events.clone(),
    );
    Ok(Arc::new(SummaryJob::new(
        aggregator,
        publisher,
        config.schedule.window(),
        events,
    )))
}

async fn run_scheduler(config: &SalesRelayConfig) -> Result<()> {
    let events = Arc::new(EventLog::new());
    let job = summary_job(config, events.clone())?;
    let scheduler = DailyScheduler::from_config(&config.schedule, job.clone(), events)?;

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    scheduler.run(token).await?;
    job.close().await?;
    Ok(())
}

async fn fire(config: &SalesRelayConfig) -> Result<()> {
    let events = Arc::new(EventLog::new());
    let job = summary_job(config, events.clone())?;
    let scheduler = DailyScheduler::from_config(&config.schedule, job.clone(), events)?;

    let outcome = scheduler.fire_once().await;
    job.close().await.ok();
    outcome?;
    println!("✅ Summary published to '{}'", config.broker.queue);
    Ok(())
}

async fn run_consumer(config: &SalesRelayConfig) -> Result<()> {
    let events = Arc::new(EventLog::new());
    let handler = salesrelay_channels::create_handler(config)?;
    let source = Arc::new(AmqpDeliverySource::new(
        AmqpSettings::from_config(&config.broker),
        &config.consumer.consumer_tag,
    ));
    let consumer = Arc::new(Consumer::new(
        source,
        handler,
        ConsumerSettings::from_config(&config.consumer, &config.broker),
        events.clone(),
    ));

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    consumer.run(token).await?;
    tracing::info!(
        "📊 Consumer totals: acknowledged={}, requeued={}, dead-lettered={}",
        events.count("delivery_acknowledged"),
        events.count("delivery_requeued"),
        events.count("delivery_dead_lettered")
    );
    Ok(())
}

async fn add_record(config: &SalesRelayConfig, args: AddRecordArgs) -> Result<()> {
    let amount = Decimal::from_str(args.amount.trim())
        .with_context(|| format!("invalid amount '{}'", args.amount))?;
    let occurred_at = match &args.at {
        Some(at) => DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid timestamp '{at}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let line_items = args
        .items
        .iter()
        .map(|item| parse_line_item(item))
        .collect::<Result<Vec<_>>>()?;

    let record = TransactionRecord {
        id: args.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        counterparty_name: args.counterparty,
        amount,
        reference_code: args.reference,
        occurred_at,
        line_items,
    };
    let id = record.id.clone();
    open_store(config)?.insert(record).await?;
    println!("✅ Record {id} stored");
    Ok(())
}

async fn list_records(config: &SalesRelayConfig) -> Result<()> {
    let records = open_store(config)?.list().await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn show_record(store: &dyn RecordStore, id: &str) -> Result<String> {
    match store.get(id).await? {
        Some(record) => Ok(serde_json::to_string_pretty(&record)?),
        None => bail!("record '{id}' not found"),
    }
}

fn parse_line_item(spec: &str) -> Result<LineItem> {
    let Some((key, qty)) = spec.rsplit_once(':') else {
        bail!("invalid item '{spec}' (expected KEY:QTY)");
    };
    let quantity: u32 = qty
        .trim()
        .parse()
        .with_context(|| format!("invalid quantity in '{spec}'"))?;
    Ok(LineItem::new(key.trim(), quantity))
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("🛑 Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("🛑 SIGTERM received, shutting down"),
    }
    token.cancel();
}
