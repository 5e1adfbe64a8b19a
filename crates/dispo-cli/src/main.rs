use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispo_adapters::load_payload_file;
use dispo_storage::{CentralDb, HttpConnector, LocalStore, RemoteConnector};
use dispo_sync::{build_scheduler, CentralConfig, ClientConfig, ImportService, SyncCycle, SyncGate};
use dispo_web::LocalState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispo-cli")]
#[command(about = "Dispo offline sync: central API, technician client and batch import")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one connectivity check, pull and push against the configured server.
    Sync,
    /// Apply database migrations.
    Migrate {
        /// Migrate the technician's local cache instead of the central database.
        #[arg(long)]
        local: bool,
    },
    /// Serve the central dispatch API.
    ServeCentral,
    /// Serve the technician's local API and run the periodic sync.
    ServeLocal,
    /// Import a dispatch payload file into the central database.
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = ClientConfig::from_env();
            let cycle = client_cycle(&config, open_local(&config).await?)?
                .context("DISPO_BASE_URL and DISPO_TECHNICIAN_ID are required for sync")?;
            let report = cycle.run_entered().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate { local: true } => {
            let config = ClientConfig::from_env();
            open_local(&config).await?;
            println!("local cache migrated: {}", config.local_db.display());
        }
        Commands::Migrate { local: false } => {
            open_central(&CentralConfig::from_env()).await?;
            println!("central database migrated");
        }
        Commands::ServeCentral => {
            dispo_web::serve_central(&CentralConfig::from_env()).await?;
        }
        Commands::ServeLocal => {
            let config = ClientConfig::from_env();
            let store = open_local(&config).await?;
            let gate = SyncGate::new();
            let state = LocalState::new(store.clone(), config.clone()).with_gate(gate.clone());

            let _scheduler = match client_cycle(&config, store)? {
                Some(cycle) => {
                    let sched =
                        build_scheduler(Arc::new(cycle.with_gate(gate)), config.sync_interval)
                            .await?;
                    sched.start().await.context("starting sync scheduler")?;
                    info!(interval_secs = config.sync_interval.as_secs(), "periodic sync enabled");
                    Some(sched)
                }
                None => {
                    warn!("DISPO_BASE_URL or DISPO_TECHNICIAN_ID missing; periodic sync disabled");
                    None
                }
            };
            dispo_web::serve_local(state).await?;
        }
        Commands::Import { path } => {
            let payload = load_payload_file(&path)?;
            let db = open_central(&CentralConfig::from_env()).await?;
            let outcome = ImportService::new(&db)
                .import_value(&payload)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            println!(
                "import complete: batch_id={} jobs={} absences={} assignments={} idempotent={}",
                outcome.batch_id,
                outcome.processed_jobs,
                outcome.processed_absences,
                outcome.processed_assignments,
                outcome.idempotent
            );
        }
    }

    Ok(())
}

async fn open_local(config: &ClientConfig) -> Result<LocalStore> {
    LocalStore::open(&config.local_db)
        .await
        .with_context(|| format!("opening local cache {}", config.local_db.display()))
}

async fn open_central(config: &CentralConfig) -> Result<CentralDb> {
    let db = CentralDb::connect(&config.database_url)
        .await
        .context("connecting central database")?;
    db.migrate().await.context("migrating central database")?;
    Ok(db)
}

/// The configured sync cycle, or `None` when no server or technician is set.
fn client_cycle(config: &ClientConfig, store: LocalStore) -> Result<Option<SyncCycle>> {
    let (Some(target), Some(technician_id)) = (config.remote_target(), config.technician_id) else {
        return Ok(None);
    };
    let remote = HttpConnector { config: config.http() }.connect(&target)?;
    Ok(Some(
        SyncCycle::new(store, remote, technician_id)
            .with_window(config.days_back, config.days_ahead),
    ))
}
