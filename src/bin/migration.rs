use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hospital_stock::{config, db, migrator::Migrator};
use sea_orm_migration::MigratorTrait;
use tracing::info;

#[derive(Parser)]
#[command(name = "migration", about = "Manage the stock ledger schema", version)]
struct Cli {
    /// Database URL; falls back to DATABASE_URL, then the loaded config
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Option<MigrationCommand>,
}

#[derive(Subcommand)]
enum MigrationCommand {
    /// Apply all pending migrations (default)
    Up,
    /// Roll back the most recent migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// List applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let database_url = match cli.database_url.or_else(|| std::env::var("DATABASE_URL").ok()) {
        Some(url) => {
            config::init_tracing("info", false);
            url
        }
        None => {
            let cfg = config::load_config().context("failed to load application config")?;
            config::init_tracing(cfg.log_level(), cfg.log_json);
            cfg.database_url
        }
    };

    info!("Starting database migration");
    let pool = db::establish_connection(&database_url)
        .await
        .context("failed to connect to database")?;

    match cli.command.unwrap_or(MigrationCommand::Up) {
        MigrationCommand::Up => {
            db::run_migrations(&pool).await?;
            info!("Migration completed successfully");
        }
        MigrationCommand::Down { steps } => {
            Migrator::down(&pool, Some(steps))
                .await
                .context("failed to roll back migrations")?;
            info!(steps, "Rolled back migrations");
        }
        MigrationCommand::Status => {
            Migrator::status(&pool)
                .await
                .context("failed to read migration status")?;
        }
    }

    db::close_pool(pool).await?;
    Ok(())
}
