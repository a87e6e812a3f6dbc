// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker engine backend.
//!
//! Creates one container per job through the Docker Engine API. The engine
//! address comes from `DOCKER_HOST` (local socket when unset).

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::phase::{DOCKER_PHASES, PhaseVocabulary};

/// Backend running jobs as plain Docker containers.
#[derive(Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::NoBackendAvailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Error for a container that was created but did not start. A failed
/// removal of the leftover container is logged, the start error is returned.
fn start_failure(
    container_id: &str,
    start_err: DockerError,
    cleanup: std::result::Result<(), DockerError>,
) -> BackendError {
    if let Err(e) = cleanup {
        warn!(
            container_id = %container_id,
            error = %e,
            "Failed to remove container that did not start"
        );
    }
    BackendError::Rejected(format!("failed to start container: {}", start_err))
}

/// Map a Docker error for an existing job.
fn job_error(job_id: &str, err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => BackendError::JobNotFound(job_id.to_string()),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => {
            BackendError::Unreachable(format!("docker returned {}: {}", status_code, message))
        }
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::Other(format!("docker returned {}: {}", status_code, message)),
        other => BackendError::Unreachable(other.to_string()),
    }
}

/// Native phase for a container state, in Docker task-state words.
fn native_phase(status: Option<ContainerStateStatusEnum>, exit_code: Option<i64>) -> &'static str {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => "created",
        Some(ContainerStateStatusEnum::RUNNING) => "running",
        Some(ContainerStateStatusEnum::PAUSED) => "paused",
        Some(ContainerStateStatusEnum::RESTARTING) => "restarting",
        Some(ContainerStateStatusEnum::REMOVING) => "removing",
        Some(ContainerStateStatusEnum::EXITED) if exit_code == Some(0) => "complete",
        Some(ContainerStateStatusEnum::EXITED) => "failed",
        Some(ContainerStateStatusEnum::DEAD) => "dead",
        _ => "unknown",
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn backend_type(&self) -> &'static str {
        "docker"
    }

    fn vocabulary(&self) -> &'static PhaseVocabulary {
        &DOCKER_PHASES
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code,
                    message,
                } => BackendError::Rejected(format!("{} ({})", message, status_code)),
                other => BackendError::NoBackendAvailable(other.to_string()),
            })?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        if let Err(e) = self
            .docker
            .start_container::<String>(&response.id, None)
            .await
        {
            // Leave nothing behind for a job that never started.
            let cleanup = self
                .docker
                .remove_container(
                    &response.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(start_failure(&response.id, e, cleanup));
        }

        info!(
            container_id = %response.id,
            name = %spec.name,
            image = %spec.image,
            "Docker container started"
        );

        Ok(JobHandle::new(response.id))
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<NativeStatus> {
        let inspect = self
            .docker
            .inspect_container(&handle.job_id, None)
            .await
            .map_err(|e| job_error(&handle.job_id, e))?;

        let state = inspect.state.unwrap_or_default();
        let phase = native_phase(state.status, state.exit_code);

        let message = if state.oom_killed == Some(true) {
            Some("OOMKilled".to_string())
        } else {
            state.error.filter(|e| !e.is_empty())
        };

        let terminated = matches!(
            state.status,
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD)
        );

        Ok(NativeStatus {
            phase: phase.to_string(),
            exit_code: if terminated { state.exit_code } else { None },
            message,
        })
    }

    async fn kill(&self, handle: &JobHandle) -> Result<()> {
        match self
            .docker
            .kill_container::<String>(&handle.job_id, None)
            .await
        {
            Ok(()) => Ok(()),
            // 409: container is not running
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container_id = %handle.job_id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(job_error(&handle.job_id, e)),
        }
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        match self
            .docker
            .remove_container(
                &handle.job_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(job_error(&handle.job_id, e)),
        }
    }

    async fn fetch_logs(&self, handle: &JobHandle) -> Result<LogStream> {
        // Fail fast on unknown containers instead of yielding an error mid-stream.
        self.docker
            .inspect_container(&handle.job_id, None)
            .await
            .map_err(|e| job_error(&handle.job_id, e))?;

        let job_id = handle.job_id.clone();
        let stream = self
            .docker
            .logs(
                &handle.job_id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(move |chunk| {
                chunk
                    .map(|output| output.into_bytes())
                    .map_err(|e| job_error(&job_id, e))
            });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    #[test]
    fn test_exited_container_maps_by_exit_code() {
        let ok = native_phase(Some(ContainerStateStatusEnum::EXITED), Some(0));
        let bad = native_phase(Some(ContainerStateStatusEnum::EXITED), Some(2));
        assert_eq!(DOCKER_PHASES.map(ok), Phase::Succeeded);
        assert_eq!(DOCKER_PHASES.map(bad), Phase::Failed);
    }

    #[test]
    fn test_live_container_states() {
        let created = native_phase(Some(ContainerStateStatusEnum::CREATED), None);
        let running = native_phase(Some(ContainerStateStatusEnum::RUNNING), None);
        let removing = native_phase(Some(ContainerStateStatusEnum::REMOVING), None);
        assert_eq!(DOCKER_PHASES.map(created), Phase::Pending);
        assert_eq!(DOCKER_PHASES.map(running), Phase::Running);
        assert_eq!(DOCKER_PHASES.map(removing), Phase::Unknown);
        assert_eq!(native_phase(None, None), "unknown");
    }

    #[test]
    fn test_start_failure_keeps_start_error_when_cleanup_fails() {
        let err = start_failure(
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 500,
                message: "no such image entrypoint".into(),
            },
            Err(DockerError::DockerResponseServerError {
                status_code: 409,
                message: "removal already in progress".into(),
            }),
        );
        match err {
            BackendError::Rejected(message) => {
                assert!(message.contains("no such image entrypoint"));
                assert!(!message.contains("removal already in progress"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let clean = start_failure(
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            },
            Ok(()),
        );
        assert!(matches!(clean, BackendError::Rejected(_)));
    }

    #[test]
    fn test_job_error_classification() {
        let not_found = job_error(
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".into(),
            },
        );
        assert!(matches!(not_found, BackendError::JobNotFound(_)));

        let server = job_error(
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 503,
                message: "busy".into(),
            },
        );
        assert!(server.is_transient());
    }
}
