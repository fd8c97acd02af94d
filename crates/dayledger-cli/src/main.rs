use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dayledger_core::{business_today, SyncWindow};
use dayledger_storage::{MemoryStore, MetricsStore, PgStore, ProductCostStore, SyncJobStore};
use dayledger_sync::{
    build_scheduler, export_daily_metrics, production_pipeline, MerchantRegistry, SyncConfig, SyncService, SyncStores,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dayledger")]
#[command(about = "Daily merchant ledger: reconcile orders, ad spend and shipments into daily metrics")]
struct Cli {
    /// Keep everything in memory instead of Postgres.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync an inclusive date range for one merchant.
    Sync {
        #[arg(long)]
        user: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Backfill a newly onboarded merchant.
    Onboard {
        #[arg(long)]
        user: String,
    },
    /// Run the periodic sync until interrupted.
    Schedule {
        /// Run one cycle now and exit.
        #[arg(long)]
        once: bool,
    },
    /// Serve the JSON query surface (and the scheduler when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    Migrate,
    /// Record a user-supplied unit cost for a product.
    SetCost {
        #[arg(long)]
        user: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        cost: f64,
        #[arg(long)]
        name: Option<String>,
    },
    /// Write stored daily metrics to Parquet with a checksum manifest.
    Export {
        #[arg(long)]
        user: String,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long, default_value = "./exports")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn stores_over<S>(store: Arc<S>) -> SyncStores
where
    S: MetricsStore + ProductCostStore + SyncJobStore + 'static,
{
    SyncStores {
        metrics: store.clone(),
        costs: store.clone(),
        jobs: store,
    }
}

async fn open_stores(config: &SyncConfig, dry_run: bool) -> Result<SyncStores> {
    if dry_run {
        info!("dry run: using in-memory stores");
        return Ok(stores_over(Arc::new(MemoryStore::new())));
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    Ok(stores_over(Arc::new(store)))
}

async fn sync_service(config: &SyncConfig, dry_run: bool) -> Result<Arc<SyncService>> {
    let registry = MerchantRegistry::load(&config.merchants_file).await?;
    let stores = open_stores(config, dry_run).await?;
    let pipeline = production_pipeline(config, stores)?;
    Ok(Arc::new(SyncService::new(
        pipeline,
        registry,
        config.trailing_days,
        config.onboarding_months,
    )))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { user, start, end } => {
            let window = SyncWindow::new(start, end)?;
            let service = sync_service(&config, cli.dry_run).await?;
            let outcome = service.sync_range(&user, window).await?;
            print_json(&outcome)?;
        }
        Commands::Onboard { user } => {
            let service = sync_service(&config, cli.dry_run).await?;
            let outcome = service.onboard(&user, Utc::now()).await?;
            print_json(&outcome)?;
        }
        Commands::Schedule { once } => {
            let service = sync_service(&config, cli.dry_run).await?;
            if once {
                let report = service.run_scheduled_cycle(Utc::now()).await;
                println!(
                    "cycle complete: synced={} skipped={} failed={}",
                    report.synced.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
                return Ok(());
            }
            let mut sched = build_scheduler(service, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve { port } => {
            let service = sync_service(&config, cli.dry_run).await?;
            let _sched = if config.scheduler_enabled {
                let sched = build_scheduler(service.clone(), &config.sync_cron).await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };
            let port = port.unwrap_or_else(dayledger_web::port_from_env);
            dayledger_web::serve(dayledger_web::AppState::new(service), port).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::SetCost {
            user,
            product,
            cost,
            name,
        } => {
            anyhow::ensure!(cost.is_finite() && cost >= 0.0, "cost must be a non-negative number");
            let stores = open_stores(&config, cli.dry_run).await?;
            let saved = stores.costs.set_override(&user, &product, cost, name).await?;
            print_json(&saved)?;
        }
        Commands::Export { user, start, end, out } => {
            let end = end.unwrap_or_else(|| business_today(Utc::now()));
            let start = start.unwrap_or_else(|| SyncWindow::trailing(end, config.trailing_days).start);
            let window = SyncWindow::new(start, end)?;
            let stores = open_stores(&config, cli.dry_run).await?;
            let records = stores.metrics.range(&user, window.start, window.end).await?;
            let manifest = export_daily_metrics(&records, &out)?;
            println!("exported {} rows: {}", records.len(), manifest.display());
        }
    }

    Ok(())
}
