use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cronrunner::config::{Config, CONFIG_ENV};
use cronrunner::db::MongoStore;
use cronrunner::notify::LogNotifier;
use cronrunner::shutdown::install_shutdown_handler;
use cronrunner::{logging, EventHub, MemoryStore, Runner, Scheduler, Store};

// Loads the config, seeds jobs declared in it, then ticks until SIGINT/SIGTERM.
// In-flight runs get `shutdown_grace_secs` to finish before the process exits.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_file = Config::path_from_env();
    let config = if std::env::var(CONFIG_ENV).is_ok() || Path::new(&config_file).exists() {
        Config::from(&config_file)
            .with_context(|| format!("Error while trying to read configuration file {config_file}"))?
    } else {
        tracing::warn!(file = %config_file, "No configuration file, using defaults");
        Config::default()
    };

    let store: Arc<dyn Store> = match &config.database {
        Some(database) => Arc::new(
            MongoStore::connect(database)
                .await
                .context("Could not connect to the database")?,
        ),
        None => {
            tracing::warn!("No [database] section, runs will only be kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    for definition in &config.jobs {
        let job = store.save_job(definition.to_job()?).await?;
        tracing::info!(job_id = %job.id, job = %job.name, schedule = %job.schedule, "Job loaded from config");
    }

    let hub = EventHub::new(config.events.capacity);
    let runner = Arc::new(
        Runner::new(Arc::clone(&store), hub, config.executor.clone())
            .with_notifier(Arc::new(LogNotifier)),
    );

    if config.scheduler.recover_orphaned_runs {
        let recovered = runner.recover_orphaned_runs().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Marked interrupted runs as failed");
        }
    }

    let shutdown = install_shutdown_handler();
    let mut scheduler = Scheduler::new(store, runner.clone())
        .with_tick_interval(config.scheduler.tick_interval());
    scheduler.run(shutdown).await;

    let grace = config.scheduler.shutdown_grace();
    tracing::info!(grace_secs = grace.as_secs(), "Waiting for in-flight runs");
    let (scheduled, manual) = tokio::join!(scheduler.drain(grace), runner.drain(grace));
    if !(scheduled && manual) {
        tracing::warn!("Runs still active after the grace period, exiting anyway");
    }

    Ok(())
}
