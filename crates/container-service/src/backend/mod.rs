// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend module - container execution engines.

pub mod docker;
pub mod kubernetes;
pub mod mock;
mod traits;

pub use docker::DockerBackend;
pub use kubernetes::{KubernetesBackend, KubernetesConfig};
pub use mock::MockBackend;
pub use traits::*;
