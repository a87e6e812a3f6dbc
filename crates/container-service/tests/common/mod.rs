// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for container-service integration tests.
//!
//! Provides [`Harness`], which wires the consumers, engine and reconciler over
//! in-memory components and lets tests drive the queues by hand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use container_service::backend::MockBackend;
use container_service::collaborators::{
    CommandResolver, Notifier, WorkflowTracker, substitute_inputs,
};
use container_service::error::{Error, Result};
use container_service::finalizing::{FinalizeOutcome, FinalizingConsumer};
use container_service::models::{
    ContainerRecord, FinalizeRequest, LaunchRequest, OrchestrationDefinition, ResolvedCommand,
    WrapperSummary,
};
use container_service::orchestration::OrchestrationEngine;
use container_service::queue::{
    DESTINATIONS, FINALIZING, MemoryQueue, Publisher, STAGING, Transport,
};
use container_service::reconciler::{Reconciler, ReconcilerConfig};
use container_service::service::ContainerService;
use container_service::staging::{StagingConsumer, StagingOutcome};
use container_service::store::{ContainerStore, MemoryStore};

/// One status update seen by [`RecordingTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub workflow_id: String,
    pub status: String,
    pub detail: Option<String>,
}

/// Workflow tracker that keeps every update.
#[derive(Default)]
pub struct RecordingTracker {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingTracker {
    /// Statuses set for a workflow, in order.
    pub fn history(&self, workflow_id: &str) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.workflow_id == workflow_id)
            .map(|u| u.status.clone())
            .collect()
    }

    /// Last status set for a workflow.
    pub fn latest(&self, workflow_id: &str) -> Option<String> {
        self.history(workflow_id).pop()
    }

    /// Every update.
    pub fn all(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowTracker for RecordingTracker {
    async fn set_status(
        &self,
        workflow_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        self.updates.lock().unwrap().push(StatusUpdate {
            workflow_id: workflow_id.to_string(),
            status: status.to_string(),
            detail: detail.map(str::to_string),
        });
        Ok(())
    }
}

/// One notification seen by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub user: String,
    pub subject: String,
    pub body: String,
}

/// Notifier that keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_failure(&self, user: &str, subject: &str, body: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Notice {
            user: user.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Wrapper {
    command_id: i64,
    name: String,
    image: String,
    command: Vec<String>,
}

/// Resolver over an in-memory wrapper table.
#[derive(Default)]
pub struct StaticResolver {
    wrappers: Mutex<HashMap<i64, Wrapper>>,
}

impl StaticResolver {
    /// Add (or replace) a wrapper whose image is `registry/<name>:1`.
    pub fn add_wrapper(&self, wrapper_id: i64, name: &str, command: &[&str]) {
        self.add_wrapper_with_image(wrapper_id, name, &format!("registry/{}:1", name), command);
    }

    pub fn add_wrapper_with_image(&self, wrapper_id: i64, name: &str, image: &str, command: &[&str]) {
        self.wrappers.lock().unwrap().insert(
            wrapper_id,
            Wrapper {
                command_id: wrapper_id * 100,
                name: name.to_string(),
                image: image.to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn remove_wrapper(&self, wrapper_id: i64) {
        self.wrappers.lock().unwrap().remove(&wrapper_id);
    }
}

#[async_trait]
impl CommandResolver for StaticResolver {
    async fn resolve(
        &self,
        wrapper_id: i64,
        input_values: &HashMap<String, String>,
    ) -> Result<ResolvedCommand> {
        let wrapper = self
            .wrappers
            .lock()
            .unwrap()
            .get(&wrapper_id)
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("wrapper {} not found", wrapper_id)))?;

        let command = wrapper
            .command
            .iter()
            .map(|arg| substitute_inputs(arg, input_values))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Resolution)?;

        Ok(ResolvedCommand {
            wrapper_id,
            image: wrapper.image,
            command,
            env: HashMap::new(),
        })
    }

    async fn describe(&self, wrapper_id: i64) -> Result<Option<WrapperSummary>> {
        Ok(self
            .wrappers
            .lock()
            .unwrap()
            .get(&wrapper_id)
            .map(|w| WrapperSummary {
                wrapper_id,
                command_id: w.command_id,
                wrapper_name: w.name.clone(),
            }))
    }
}

/// In-memory service wiring with manually driven queues.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MockBackend>,
    pub resolver: Arc<StaticResolver>,
    pub tracker: Arc<RecordingTracker>,
    pub notifier: Arc<RecordingNotifier>,
    pub publisher: Publisher,
    pub engine: Arc<OrchestrationEngine>,
    pub staging: StagingConsumer,
    pub finalizing: FinalizingConsumer,
    pub reconciler: Reconciler,
    pub service: ContainerService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reconciler_config(ReconcilerConfig {
            poll_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(60),
        })
    }

    pub fn with_reconciler_config(config: ReconcilerConfig) -> Self {
        let queue = Arc::new(MemoryQueue::new(&DESTINATIONS));
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let resolver = Arc::new(StaticResolver::default());
        let tracker = Arc::new(RecordingTracker::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let publisher = Publisher::new(queue.clone());

        let engine = Arc::new(OrchestrationEngine::new(
            store.clone(),
            store.clone(),
            resolver.clone(),
            tracker.clone(),
            notifier.clone(),
            publisher.clone(),
        ));

        let staging = StagingConsumer::new(
            backend.clone(),
            store.clone(),
            engine.clone(),
            resolver.clone(),
            tracker.clone(),
            notifier.clone(),
        );

        let finalizing = FinalizingConsumer::new(
            store.clone(),
            backend.clone(),
            engine.clone(),
            tracker.clone(),
            notifier.clone(),
            true,
        );

        let reconciler = Reconciler::new(store.clone(), backend.clone(), publisher.clone(), config);

        let service = ContainerService::new(
            publisher.clone(),
            store.clone(),
            backend.clone(),
            engine.clone(),
            tracker.clone(),
            notifier.clone(),
        );

        Self {
            queue,
            store,
            backend,
            resolver,
            tracker,
            notifier,
            publisher,
            engine,
            staging,
            finalizing,
            reconciler,
            service,
        }
    }

    /// A fresh launch request with no inputs.
    pub fn launch_request(&self, project: &str, wrapper_id: i64, workflow_id: &str) -> LaunchRequest {
        LaunchRequest {
            project: project.to_string(),
            wrapper_id,
            command_id: wrapper_id * 100,
            wrapper_name: format!("wrapper-{}", wrapper_id),
            input_values: HashMap::new(),
            acting_user: "alice".to_string(),
            workflow_id: workflow_id.to_string(),
            orchestration: None,
        }
    }

    /// Store a chain of wrappers and select it for `project`. Every wrapper
    /// is registered with the resolver as `step-<id>`.
    pub async fn add_chain(
        &self,
        orchestration_id: i64,
        project: &str,
        wrapper_ids: &[i64],
        halt_on_command_failure: bool,
    ) {
        for id in wrapper_ids {
            self.resolver.add_wrapper(*id, &format!("step-{}", id), &["run"]);
        }
        self.store
            .put_orchestration(OrchestrationDefinition {
                id: orchestration_id,
                name: format!("chain-{}", orchestration_id),
                enabled: true,
                halt_on_command_failure,
                wrapper_ids: wrapper_ids.to_vec(),
            })
            .await;
        self.store
            .select_orchestration(project, orchestration_id)
            .await;
    }

    /// Consume every launch request currently on the staging destination.
    pub async fn drain_staging(&self) -> Vec<StagingOutcome> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self
            .queue
            .receive(STAGING, Duration::ZERO)
            .await
            .unwrap()
        {
            let request: LaunchRequest = serde_json::from_slice(&delivery.payload).unwrap();
            outcomes.push(self.staging.on_staging_request(request).await);
            self.queue.ack(&delivery).await.unwrap();
        }
        outcomes
    }

    /// Consume every finalize request currently on the finalizing destination.
    pub async fn drain_finalizing(&self) -> Vec<FinalizeOutcome> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self
            .queue
            .receive(FINALIZING, Duration::ZERO)
            .await
            .unwrap()
        {
            let request: FinalizeRequest = serde_json::from_slice(&delivery.payload).unwrap();
            outcomes.push(self.finalizing.on_finalize_request(request).await);
            self.queue.ack(&delivery).await.unwrap();
        }
        outcomes
    }

    /// Container id of a `Launched` outcome.
    pub fn launched_id(outcome: &StagingOutcome) -> String {
        match outcome {
            StagingOutcome::Launched { container_id } => container_id.clone(),
            other => panic!("expected a launch, got {:?}", other),
        }
    }

    pub async fn record(&self, container_id: &str) -> ContainerRecord {
        self.store.find_by_id(container_id).await.unwrap().unwrap()
    }

    /// Finish a container's backend job with an exit code, without any callback.
    pub async fn exit(&self, container_id: &str, exit_code: i64) {
        let record = self.record(container_id).await;
        self.backend.complete(&record.job_id, exit_code).await;
    }

    /// Finish a container's job and deliver the backend callback.
    pub async fn exit_and_notify(&self, container_id: &str, exit_code: i64) {
        self.exit(container_id, exit_code).await;
        let record = self.record(container_id).await;
        self.service
            .notify_completion(
                container_id,
                Some(exit_code.to_string()),
                exit_code == 0,
                &record.username,
            )
            .await
            .unwrap();
    }

    /// Finish a container, deliver the callback and consume it.
    pub async fn finish(&self, container_id: &str, exit_code: i64) -> FinalizeOutcome {
        self.exit_and_notify(container_id, exit_code).await;
        let mut outcomes = self.drain_finalizing().await;
        assert_eq!(outcomes.len(), 1, "expected exactly one finalize request");
        outcomes.remove(0)
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Async variant of [`wait_until`].
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}
