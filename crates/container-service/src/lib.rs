// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container Service - Container Launch, Reconciliation and Orchestration
//!
//! This crate launches resolved commands as containers on Docker or
//! Kubernetes, tracks them until they finish, and chains command wrappers
//! into ordered, fail-fast orchestrations.
//!
//! # Architecture
//!
//! ```text
//!   submit_launch                                   notify_completion
//!        │                                                  │
//!        ▼                                                  ▼
//! ┌──────────────┐   ┌─────────────────┐           ┌──────────────────┐
//! │   staging    │──►│ StagingConsumer │           │    finalizing    │
//! │   (queue)    │   │ resolve, create │           │     (queue)      │
//! └──────────────┘   └────────┬────────┘           └────────┬─────────┘
//!        ▲                    │ ContainerRecord             │
//!        │                    ▼                             ▼
//!        │           ┌─────────────────┐  terminal ┌──────────────────┐
//!        │           │   Reconciler    │──────────►│FinalizingConsumer│
//!        │           │ (every 10s)     │  phase    │ status, cleanup  │
//!        │           └────────┬────────┘           └────────┬─────────┘
//!        │                    │ get_status                  │
//!        │                    ▼                             ▼
//!        │           ┌─────────────────┐           ┌──────────────────┐
//!        │           │     Backend     │           │   Orchestration  │
//!        │           │ Docker / K8s    │           │      Engine      │
//!        │           └─────────────────┘           └────────┬─────────┘
//!        │                                                  │ next step
//!        └──────────────────────────────────────────────────┘
//! ```
//!
//! Both destinations are consumed by [`queue::ConsumerPool`]s whose
//! `[min, max]` concurrency is refreshed at runtime by the
//! [`concurrency::ConcurrencyController`].
//!
//! # Container Phase State Machine
//!
//! ```text
//!  ┌─────────┐      ┌─────────┐
//!  │ PENDING │─────►│ RUNNING │──────┬──────────┐
//!  └────┬────┘      └─────────┘      │          │
//!       │                            ▼          ▼
//!       │                     ┌───────────┐ ┌────────┐
//!       └────────────────────►│ SUCCEEDED │ │ FAILED │
//!                             └───────────┘ └────────┘
//! ```
//!
//! `UNKNOWN` is an active phase: the backend reported something the phase
//! vocabulary does not know. Only the finalizing consumer writes terminal
//! phases, through a single conditional update per record.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONTAINER_SERVICE_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `CONTAINER_SERVICE_BACKEND` | No | `docker` | `docker` or `kubernetes` |
//! | `DOCKER_HOST` | No | local socket | Docker engine address |
//! | `CONTAINER_SERVICE_K8S_API` | No | in-cluster | Kubernetes API server |
//! | `CONTAINER_SERVICE_K8S_NAMESPACE` | No | service account | Pod namespace |
//! | `CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS` | No | `10` | Reconciliation period |
//! | `CONTAINER_SERVICE_CONCURRENCY_REFRESH_SECS` | No | `10` | Settings refresh period |
//! | `CONTAINER_SERVICE_DEFAULT_CONCURRENCY` | No | `1-10` | Initial consumer bounds |
//! | `CONTAINER_SERVICE_AUTO_CLEANUP` | No | `true` | Remove finished backend jobs |
//! | `CONTAINER_SERVICE_STALE_AFTER_SECS` | No | `3600` | Staleness warning threshold |
//!
//! # Modules
//!
//! - [`backend`]: Docker and Kubernetes adapters
//! - [`phase`]: Lifecycle phases and native phase vocabularies
//! - [`queue`]: Transports, publishing and consumer pools
//! - [`store`]: Container record and orchestration persistence
//! - [`staging`] / [`finalizing`]: Queue consumers
//! - [`orchestration`]: Chain engine
//! - [`reconciler`]: Status reconciliation loop
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Database migrations for container-service.
pub mod migrations;

/// Service configuration loaded from environment variables.
pub mod config;

/// Error types for service operations.
pub mod error;

/// Container lifecycle phases.
pub mod phase;

/// Queue messages and persisted records.
pub mod models;

/// Container execution backends (Docker, Kubernetes, mock).
pub mod backend;

/// Queue transports and consumer pools.
pub mod queue;

/// Persistence for container records and orchestration definitions.
pub mod store;

/// External collaborators and default adapters.
pub mod collaborators;

/// Staging consumer.
pub mod staging;

/// Finalizing consumer.
pub mod finalizing;

/// Orchestration chain engine.
pub mod orchestration;

/// Background worker reconciling records with backend state.
pub mod reconciler;

/// Background worker applying shared concurrency settings.
pub mod concurrency;

/// Operations exposed to the surrounding platform.
pub mod service;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, Result};
pub use service::ContainerService;
