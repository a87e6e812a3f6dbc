// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container Service - standalone server
//!
//! Runs the staging and finalizing consumers, the status reconciler and the
//! concurrency controller against PostgreSQL and the configured backend.

use std::sync::Arc;
use tracing::{info, warn};

use container_service::backend::{Backend, BackendKind, DockerBackend, KubernetesBackend};
use container_service::collaborators::{
    LogNotifier, PostgresSettingsStore, PostgresWorkflowTracker, StoredCommandResolver,
};
use container_service::config::Config;
use container_service::migrations;
use container_service::queue::{DESTINATIONS, PostgresQueue};
use container_service::reconciler::ReconcilerConfig;
use container_service::runtime::ServiceRuntime;
use container_service::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "container_service=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        backend = ?config.backend,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        min_consumers = config.default_concurrency.min,
        max_consumers = config.default_concurrency.max,
        "Starting Container Service"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Docker => Arc::new(DockerBackend::connect()?),
        BackendKind::Kubernetes => Arc::new(KubernetesBackend::new(config.kubernetes_config())?),
    };
    info!(backend = backend.backend_type(), "Backend initialized");

    let runtime = ServiceRuntime::builder()
        .store(Arc::new(PostgresStore::new(pool.clone())))
        .transport(Arc::new(PostgresQueue::new(pool.clone(), &DESTINATIONS)))
        .backend(backend)
        .resolver(Arc::new(StoredCommandResolver::new(pool.clone())))
        .tracker(Arc::new(PostgresWorkflowTracker::new(pool.clone())))
        .notifier(Arc::new(LogNotifier))
        .settings(Arc::new(PostgresSettingsStore::new(pool)))
        .default_concurrency(config.default_concurrency)
        .concurrency_refresh_interval(config.concurrency_refresh_interval)
        .reconciler_config(ReconcilerConfig {
            poll_interval: config.reconcile_interval,
            stale_after: config.stale_after,
            ..Default::default()
        })
        .auto_cleanup(config.auto_cleanup)
        .build()?
        .start()
        .await?;

    info!("Container Service ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Container Service shut down");

    Ok(())
}
