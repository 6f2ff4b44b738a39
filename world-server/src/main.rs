use anyhow::{bail, Context};
use tracing::{error, info, warn};
use world_core::logging::init_tracing;
use world_core::{MigrationStatus, StoreConfig};
use world_server::maintenance::{self, Command};
use world_server::storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base = match std::env::var("WORLD_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path))?;
            StoreConfig::from_json(&json).with_context(|| format!("parsing config {}", path))?
        }
        Err(_) => StoreConfig::default(),
    };
    let config = storage::config_from_env(base);
    init_tracing(&config.tracing);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(msg) => bail!("{}\n{}", msg, Command::USAGE),
    };

    match command {
        Command::Config => {
            println!("{}", config.to_json());
            Ok(())
        }
        command => run(command, &config).await,
    }
}

async fn run(command: Command, config: &StoreConfig) -> anyhow::Result<()> {
    let storage = storage::init_storage(config).context("opening world storage")?;

    match command {
        Command::Stats => {
            let stats = maintenance::collect_stats(&storage)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Check => {
            let findings = maintenance::run_check(&storage.world)?;
            for finding in &findings {
                println!("{} {}: {}", finding.collection, finding.owner, finding.fault);
            }
            if !findings.is_empty() {
                bail!("{} index fault(s) found", findings.len());
            }
            info!("All indices consistent");
        }
        Command::Migrate { entity } => {
            let control = storage.world.registry.control();
            let world = storage.world.clone();
            let task_entity = entity.clone();
            let mut task = tokio::task::spawn_blocking(move || {
                maintenance::run_migration(&world, &task_entity)
            });

            // Ctrl-C pauses between batches; the checkpoint is already persisted
            let report = tokio::select! {
                joined = &mut task => joined?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(entity = %entity, "Interrupt received, pausing migration");
                    control.pause();
                    task.await?
                }
            };
            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    error!(entity = %entity, error = %e, "Migration failed");
                    return Err(e.into());
                }
            };
            println!("{}", report.to_json());
            if report.status == MigrationStatus::Paused {
                info!(entity = %entity, "Migration paused; rerun to resume");
            }
        }
        Command::Config => println!("{}", config.to_json()),
    }

    storage.kv.sync()?;
    Ok(())
}
