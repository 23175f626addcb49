use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use hospital_stock::{
    config::{self, AppConfig},
    db,
    events::{self, EventSender},
    services::{DecrementStock, IncrementStock, StockService, TransferOutcome, TransferStock},
    PrincipalStock, QuantityRecord, SeaOrmQuantityStore, ServiceError, StockKey, WarehouseType,
};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(
    name = "stock-ledger",
    about = "Hospital stock ledger: move lots between warehouses",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add units of a lot to a warehouse
    Increment(IncrementArgs),
    /// Remove units of a lot from a warehouse
    Decrement(DecrementArgs),
    /// Move units of a lot between two warehouses
    Transfer(TransferArgs),
    /// Show stock for a lot
    Show(ShowArgs),
    /// Apply pending database migrations
    Migrate,
}

#[derive(Args)]
struct IncrementArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long = "type", value_parser = parse_warehouse_type)]
    warehouse_type: WarehouseType,
    #[arg(long = "warehouse")]
    warehouse_id: i64,
    #[arg(long, allow_hyphen_values = true)]
    amount: i64,
    #[arg(long)]
    hospital: i64,
    #[arg(long)]
    site: Option<i64>,
}

#[derive(Args)]
struct DecrementArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long = "type", value_parser = parse_warehouse_type)]
    warehouse_type: WarehouseType,
    #[arg(long = "warehouse")]
    warehouse_id: i64,
    #[arg(long, allow_hyphen_values = true)]
    amount: i64,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long = "from-type", value_parser = parse_warehouse_type)]
    source_type: WarehouseType,
    #[arg(long = "from")]
    source_id: i64,
    #[arg(long = "to-type", value_parser = parse_warehouse_type)]
    destination_type: WarehouseType,
    #[arg(long = "to")]
    destination_id: i64,
    #[arg(long, allow_hyphen_values = true)]
    amount: i64,
    #[arg(long, help = "Hospital owning the destination warehouse")]
    hospital: i64,
    #[arg(long, help = "Site of the destination warehouse")]
    site: Option<i64>,
}

#[derive(Args)]
struct ShowArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long = "type", value_parser = parse_warehouse_type, requires = "warehouse_id")]
    warehouse_type: Option<WarehouseType>,
    #[arg(long = "warehouse", requires = "warehouse_type")]
    warehouse_id: Option<i64>,
    #[arg(long, help = "Show the principal-warehouse total for this site")]
    site: Option<i64>,
    #[arg(long, requires = "site")]
    hospital: Option<i64>,
}

fn parse_warehouse_type(raw: &str) -> Result<WarehouseType, String> {
    WarehouseType::parse(raw).map_err(|e| e.response_message())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, json);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let context = CliContext::initialize().await?;

    let result = match cli.command {
        Commands::Increment(args) => handle_increment(&context, args, cli.json).await,
        Commands::Decrement(args) => handle_decrement(&context, args, cli.json).await,
        Commands::Transfer(args) => handle_transfer(&context, args, cli.json).await,
        Commands::Show(args) => handle_show(&context, args, cli.json).await,
        Commands::Migrate => handle_migrate(&context, cli.json).await,
    };

    context.shutdown().await;
    result
}

struct CliContext {
    config: AppConfig,
    service: StockService<SeaOrmQuantityStore>,
    events: JoinHandle<()>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        db::check_connection(&db_pool)
            .await
            .context("database did not answer a ping")?;
        if config.auto_migrate {
            db::run_migrations(&db_pool)
                .await
                .context("failed to apply migrations")?;
        }

        let store = SeaOrmQuantityStore::new(Arc::new(db_pool), config.lock_timeout());
        let (event_sender, event_rx): (EventSender, _) =
            events::channel(config.event_channel_capacity);
        let events = tokio::spawn(events::process_events(event_rx));
        let service = StockService::new(Arc::new(store)).with_events(event_sender);

        Ok(Self {
            config,
            service,
            events,
        })
    }

    /// Closes the event channel and waits for queued events to be logged.
    async fn shutdown(self) {
        let CliContext {
            config: _,
            service,
            events,
        } = self;
        drop(service);
        events::join_processor(events).await;
    }
}

async fn handle_increment(context: &CliContext, args: IncrementArgs, json: bool) -> Result<()> {
    let record = context
        .service
        .increment(IncrementStock {
            lot_id: args.lot,
            warehouse_type: args.warehouse_type,
            warehouse_id: args.warehouse_id,
            amount: args.amount,
            hospital_id: args.hospital,
            site_id: args.site,
        })
        .await?;

    if json {
        print_json(&record)?;
    } else {
        render_record(&record);
    }
    Ok(())
}

async fn handle_decrement(context: &CliContext, args: DecrementArgs, json: bool) -> Result<()> {
    let record = context
        .service
        .decrement(DecrementStock {
            lot_id: args.lot,
            warehouse_type: args.warehouse_type,
            warehouse_id: args.warehouse_id,
            amount: args.amount,
        })
        .await?;

    if json {
        print_json(&record)?;
    } else {
        render_record(&record);
    }
    Ok(())
}

async fn handle_transfer(context: &CliContext, args: TransferArgs, json: bool) -> Result<()> {
    let outcome = context
        .service
        .transfer(TransferStock {
            lot_id: args.lot,
            source_type: args.source_type,
            source_id: args.source_id,
            destination_type: args.destination_type,
            destination_id: args.destination_id,
            amount: args.amount,
            destination_hospital_id: args.hospital,
            destination_site_id: args.site,
        })
        .await?;

    if json {
        print_json(&outcome)?;
    } else {
        render_transfer(&outcome);
    }
    Ok(())
}

async fn handle_show(context: &CliContext, args: ShowArgs, json: bool) -> Result<()> {
    let records = match (args.warehouse_type, args.warehouse_id) {
        (Some(kind), Some(id)) => context
            .service
            .get_stock(&StockKey::new(args.lot, kind, id))
            .await?
            .into_iter()
            .collect(),
        _ => context.service.list_lot(args.lot).await?,
    };

    let principal = match (args.site, args.hospital) {
        (Some(site), Some(hospital)) => {
            context
                .service
                .principal_stock(site, args.lot, hospital)
                .await?
        }
        _ => None,
    };

    if json {
        print_json(&json!({ "records": records, "principal": principal }))?;
        return Ok(());
    }

    if records.is_empty() {
        println!("No stock recorded for lot {}", args.lot);
    }
    for record in &records {
        render_record(record);
    }
    if let Some(row) = &principal {
        render_principal(row);
    }
    Ok(())
}

async fn handle_migrate(context: &CliContext, json: bool) -> Result<()> {
    let store = context.service.store();
    db::run_migrations(store.connection())
        .await
        .context("failed to apply migrations")?;

    if json {
        print_json(&json!({ "migrated": true, "environment": context.config.environment }))?;
    } else {
        println!("Migrations applied ({})", context.config.environment);
    }
    Ok(())
}

fn report_error(err: &anyhow::Error, json: bool) {
    match err.downcast_ref::<ServiceError>() {
        Some(service_err) => {
            if json {
                let body = json!({
                    "error": service_err.code(),
                    "message": service_err.response_message(),
                    "status": service_err.status_code().as_u16(),
                    "retryable": service_err.is_retryable(),
                });
                eprintln!("{}", body);
            } else {
                eprintln!(
                    "error [{}]: {}",
                    service_err.code(),
                    service_err.response_message()
                );
            }
        }
        None => eprintln!("error: {:#}", err),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_record(record: &QuantityRecord) {
    println!(
        "- {} • quantity {} • hospital {} • updated {}",
        record.key(),
        record.quantity,
        record.hospital_id,
        record.last_updated.to_rfc3339()
    );
}

fn render_transfer(outcome: &TransferOutcome) {
    println!("Transferred:");
    render_record(&outcome.source);
    render_record(&outcome.destination);
    if let Some(row) = &outcome.principal {
        render_principal(row);
    }
}

fn render_principal(row: &PrincipalStock) {
    println!(
        "- principal stock • site {} • hospital {} • quantity {}",
        row.site_id, row.hospital_id, row.quantity
    );
}
