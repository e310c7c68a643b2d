use anyhow::{Context, Result};
use config::{BusKind, Config};
use dbus_interface::{FaceRegistryService, BUS_NAME, OBJECT_PATH};
use facematch_store::{open_object_store, SqliteJobQueue, SqliteRegistry};
use jobs::{JobOrchestrator, OrchestratorSettings, REGISTER_QUEUE, SEARCH_QUEUE};
use notify::Notifier;
use service::{FaceService, ServiceSettings};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod error;
mod jobs;
mod notify;
mod service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facematchd starting");

    let config = Config::load().context("loading configuration")?;

    let registry = Arc::new(
        SqliteRegistry::open(&config.db_path)
            .with_context(|| format!("opening registry at {}", config.db_path.display()))?,
    );
    let queue = Arc::new(
        SqliteJobQueue::open(&config.db_path)
            .with_context(|| format!("opening job queue at {}", config.db_path.display()))?,
    );
    let objects = open_object_store(&config.object_store).context("configuring object store")?;

    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();
    let engine = engine::start_onnx_engine(&scrfd, &arcface).context("loading face models")?;

    let notifier = Notifier::new(config.notify_url.clone(), config.notify_timeout)
        .context("building notification client")?;

    let service = Arc::new(FaceService::new(engine, registry, objects, ServiceSettings::from(&config)));
    let jobs = Arc::new(JobOrchestrator::new(
        queue,
        service.clone(),
        notifier,
        OrchestratorSettings::from(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for (queue_name, count) in [
        (REGISTER_QUEUE, config.register_workers),
        (SEARCH_QUEUE, config.search_workers),
    ] {
        for n in 0..count {
            let worker = format!("{}-{queue_name}-{n}", std::process::id());
            tasks.push(tokio::spawn(jobs.clone().run_worker(queue_name, worker, shutdown_rx.clone())));
        }
    }
    tasks.push(tokio::spawn(jobs.clone().run_sweeper(shutdown_rx)));

    let iface = FaceRegistryService::new(service, jobs, vec![scrfd, arcface]);
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, path = OBJECT_PATH, "facematchd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task panicked");
        }
    }

    Ok(())
}
