// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for container-service.
//!
//! [`ServiceRuntime`] wires the stores, queue, backend and collaborators into
//! the staging and finalizing consumer pools plus the two background workers
//! (status reconciler, concurrency controller), and hands back a
//! [`ContainerService`] for submitting work.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use container_service::backend::DockerBackend;
//! use container_service::collaborators::{PostgresWorkflowTracker, StoredCommandResolver};
//! use container_service::queue::{DESTINATIONS, PostgresQueue};
//! use container_service::runtime::ServiceRuntime;
//! use container_service::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = ServiceRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool.clone())))
//!         .transport(Arc::new(PostgresQueue::new(pool.clone(), &DESTINATIONS)))
//!         .backend(Arc::new(DockerBackend::connect()?))
//!         .resolver(Arc::new(StoredCommandResolver::new(pool.clone())))
//!         .tracker(Arc::new(PostgresWorkflowTracker::new(pool)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // runtime.service().submit_launch(...).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::Backend;
use crate::collaborators::{
    CommandResolver, LogNotifier, Notifier, SettingsStore, StaticSettings, WorkflowTracker,
};
use crate::concurrency::{ConcurrencyController, ConcurrencyControllerConfig};
use crate::finalizing::FinalizingConsumer;
use crate::orchestration::OrchestrationEngine;
use crate::queue::{
    ConcurrencySettings, ConsumerPool, ConsumerPoolConfig, FINALIZING, Publisher, STAGING,
    Transport,
};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::service::ContainerService;
use crate::staging::StagingConsumer;
use crate::store::{ContainerStore, OrchestrationStore};

/// Builder for creating a [`ServiceRuntime`].
pub struct ServiceRuntimeBuilder {
    containers: Option<Arc<dyn ContainerStore>>,
    orchestrations: Option<Arc<dyn OrchestrationStore>>,
    transport: Option<Arc<dyn Transport>>,
    backend: Option<Arc<dyn Backend>>,
    resolver: Option<Arc<dyn CommandResolver>>,
    tracker: Option<Arc<dyn WorkflowTracker>>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn SettingsStore>,
    default_concurrency: ConcurrencySettings,
    pool_config: ConsumerPoolConfig,
    reconciler_config: ReconcilerConfig,
    concurrency_refresh_interval: Duration,
    auto_cleanup: bool,
    drain_timeout: Duration,
}

impl Default for ServiceRuntimeBuilder {
    fn default() -> Self {
        Self {
            containers: None,
            orchestrations: None,
            transport: None,
            backend: None,
            resolver: None,
            tracker: None,
            notifier: Arc::new(LogNotifier),
            settings: Arc::new(StaticSettings::new()),
            default_concurrency: ConcurrencySettings::default(),
            pool_config: ConsumerPoolConfig::default(),
            reconciler_config: ReconcilerConfig::default(),
            concurrency_refresh_interval: Duration::from_secs(10),
            auto_cleanup: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one store for container records and orchestration definitions.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ContainerStore + OrchestrationStore + 'static,
    {
        self.containers = Some(store.clone() as Arc<dyn ContainerStore>);
        self.orchestrations = Some(store as Arc<dyn OrchestrationStore>);
        self
    }

    /// Set the container record store (required unless `store` is used).
    pub fn containers(mut self, containers: Arc<dyn ContainerStore>) -> Self {
        self.containers = Some(containers);
        self
    }

    /// Set the orchestration definition store (required unless `store` is used).
    pub fn orchestrations(mut self, orchestrations: Arc<dyn OrchestrationStore>) -> Self {
        self.orchestrations = Some(orchestrations);
        self
    }

    /// Set the queue transport (required).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the container backend (required).
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the command resolver (required).
    pub fn resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the workflow tracker (required).
    pub fn tracker(mut self, tracker: Arc<dyn WorkflowTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Set the failure notifier (default: log only).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the shared settings store (default: empty static settings).
    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }

    /// Consumer bounds used until the settings store provides some (default: 1-10).
    pub fn default_concurrency(mut self, settings: ConcurrencySettings) -> Self {
        self.default_concurrency = settings;
        self
    }

    /// Set consumer pool tuning.
    pub fn pool_config(mut self, config: ConsumerPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = config;
        self
    }

    /// Set the concurrency refresh interval (default: 10 seconds).
    pub fn concurrency_refresh_interval(mut self, interval: Duration) -> Self {
        self.concurrency_refresh_interval = interval;
        self
    }

    /// Remove backend jobs after finalization (default: true).
    pub fn auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    /// How long shutdown waits for in-flight messages (default: 30 seconds).
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<ServiceRuntimeConfig> {
        let containers = self
            .containers
            .ok_or_else(|| anyhow::anyhow!("container store is required"))?;
        let orchestrations = self
            .orchestrations
            .ok_or_else(|| anyhow::anyhow!("orchestration store is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("transport is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("resolver is required"))?;
        let tracker = self
            .tracker
            .ok_or_else(|| anyhow::anyhow!("tracker is required"))?;

        Ok(ServiceRuntimeConfig {
            containers,
            orchestrations,
            transport,
            backend,
            resolver,
            tracker,
            notifier: self.notifier,
            settings: self.settings,
            default_concurrency: self.default_concurrency,
            pool_config: self.pool_config,
            reconciler_config: self.reconciler_config,
            concurrency_refresh_interval: self.concurrency_refresh_interval,
            auto_cleanup: self.auto_cleanup,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Validated runtime configuration, ready to start.
pub struct ServiceRuntimeConfig {
    containers: Arc<dyn ContainerStore>,
    orchestrations: Arc<dyn OrchestrationStore>,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    resolver: Arc<dyn CommandResolver>,
    tracker: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn SettingsStore>,
    default_concurrency: ConcurrencySettings,
    pool_config: ConsumerPoolConfig,
    reconciler_config: ReconcilerConfig,
    concurrency_refresh_interval: Duration,
    auto_cleanup: bool,
    drain_timeout: Duration,
}

impl ServiceRuntimeConfig {
    /// Start consumers and background workers.
    pub async fn start(self) -> Result<ServiceRuntime> {
        let publisher = Publisher::new(self.transport.clone());

        let engine = Arc::new(OrchestrationEngine::new(
            self.orchestrations.clone(),
            self.containers.clone(),
            self.resolver.clone(),
            self.tracker.clone(),
            self.notifier.clone(),
            publisher.clone(),
        ));

        let staging = Arc::new(StagingConsumer::new(
            self.backend.clone(),
            self.containers.clone(),
            engine.clone(),
            self.resolver.clone(),
            self.tracker.clone(),
            self.notifier.clone(),
        ));

        let finalizing = Arc::new(FinalizingConsumer::new(
            self.containers.clone(),
            self.backend.clone(),
            engine.clone(),
            self.tracker.clone(),
            self.notifier.clone(),
            self.auto_cleanup,
        ));

        let staging_pool = Arc::new(ConsumerPool::new(
            STAGING,
            self.transport.clone(),
            staging,
            self.default_concurrency,
            self.pool_config.clone(),
        ));
        let finalizing_pool = Arc::new(ConsumerPool::new(
            FINALIZING,
            self.transport.clone(),
            finalizing,
            self.default_concurrency,
            self.pool_config.clone(),
        ));

        // Apply shared settings before the first worker starts.
        let controller = ConcurrencyController::new(
            self.settings.clone(),
            vec![staging_pool.clone(), finalizing_pool.clone()],
            ConcurrencyControllerConfig {
                refresh_interval: self.concurrency_refresh_interval,
            },
        );
        controller.refresh().await;

        staging_pool.start();
        finalizing_pool.start();

        let controller_shutdown = controller.shutdown_handle();
        let controller_handle = tokio::spawn(async move {
            controller.run().await;
        });

        let reconciler = Arc::new(Reconciler::new(
            self.containers.clone(),
            self.backend.clone(),
            publisher.clone(),
            self.reconciler_config.clone(),
        ));
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_task = reconciler.clone();
        let reconciler_handle = tokio::spawn(async move {
            reconciler_task.run().await;
        });

        let service = ContainerService::new(
            publisher,
            self.containers.clone(),
            self.backend.clone(),
            engine.clone(),
            self.tracker.clone(),
            self.notifier.clone(),
        );

        info!(
            backend = self.backend.backend_type(),
            reconcile_interval_secs = self.reconciler_config.poll_interval.as_secs(),
            "ServiceRuntime started"
        );

        Ok(ServiceRuntime {
            service,
            engine,
            reconciler,
            staging_pool,
            finalizing_pool,
            reconciler_handle,
            controller_handle,
            reconciler_shutdown,
            controller_shutdown,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Running service.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServiceRuntime {
    service: ContainerService,
    engine: Arc<OrchestrationEngine>,
    reconciler: Arc<Reconciler>,
    staging_pool: Arc<ConsumerPool>,
    finalizing_pool: Arc<ConsumerPool>,
    reconciler_handle: JoinHandle<()>,
    controller_handle: JoinHandle<()>,
    reconciler_shutdown: Arc<Notify>,
    controller_shutdown: Arc<Notify>,
    drain_timeout: Duration,
}

impl ServiceRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ServiceRuntimeBuilder {
        ServiceRuntimeBuilder::new()
    }

    /// The exposed service operations.
    pub fn service(&self) -> &ContainerService {
        &self.service
    }

    /// The orchestration engine.
    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    /// The reconciler, for on-demand cycles.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Pool consuming the staging destination.
    pub fn staging_pool(&self) -> &Arc<ConsumerPool> {
        &self.staging_pool
    }

    /// Pool consuming the finalizing destination.
    pub fn finalizing_pool(&self) -> &Arc<ConsumerPool> {
        &self.finalizing_pool
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the background workers, then lets both consumer pools finish
    /// their in-flight messages.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServiceRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        self.controller_shutdown.notify_one();

        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
        }
        if let Err(e) = self.controller_handle.await {
            error!("Concurrency controller task panicked: {}", e);
        }

        let (staging_drained, finalizing_drained) = tokio::join!(
            self.staging_pool.shutdown(self.drain_timeout),
            self.finalizing_pool.shutdown(self.drain_timeout),
        );

        if staging_drained && finalizing_drained {
            info!("ServiceRuntime shutdown complete");
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "consumer pools did not drain within {}s",
                self.drain_timeout.as_secs()
            ))
        }
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished() && !self.controller_handle.is_finished()
    }
}
