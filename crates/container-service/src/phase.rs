// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container lifecycle phases and backend-native phase vocabularies.
//!
//! Every backend reports status in its own words (Kubernetes pod phases, Docker
//! task states). A [`PhaseVocabulary`] maps those words onto the closed
//! [`Phase`] set. Unrecognized words map to [`Phase::Unknown`], never to an
//! error, since backends add transient phase names over time.
//!
//! ```text
//!   ┌─────────┐      ┌─────────┐      ┌───────────┐
//!   │ PENDING │ ───► │ RUNNING │ ───► │ SUCCEEDED │
//!   └─────────┘      └────┬────┘      └───────────┘
//!                         │
//!                         └─────────► ┌────────┐
//!                                     │ FAILED │
//!                                     └────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Normalized container lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Job accepted by the backend but not running yet.
    Pending,
    /// Job is running.
    Running,
    /// Job finished successfully.
    Succeeded,
    /// Job finished unsuccessfully, was killed, or disappeared.
    Failed,
    /// Backend reported a phase we do not recognize.
    Unknown,
}

impl Phase {
    /// Phases that the reconciliation loop still watches.
    pub const ACTIVE: [Phase; 3] = [Phase::Pending, Phase::Running, Phase::Unknown];

    /// True exactly for [`Phase::Succeeded`] and [`Phase::Failed`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    /// True exactly for [`Phase::Succeeded`].
    pub fn is_successful(self) -> bool {
        matches!(self, Phase::Succeeded)
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
            Phase::Unknown => "unknown",
        }
    }

    /// Terminal phase for a completion report.
    pub fn from_outcome(successful: bool) -> Self {
        if successful {
            Phase::Succeeded
        } else {
            Phase::Failed
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored phase string is not one of ours.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stored phase: {0}")]
pub struct InvalidPhase(pub String);

impl FromStr for Phase {
    type Err = InvalidPhase;

    /// Parse the storage representation written by [`Phase::as_str`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Phase::Pending),
            "running" => Ok(Phase::Running),
            "succeeded" => Ok(Phase::Succeeded),
            "failed" => Ok(Phase::Failed),
            "unknown" => Ok(Phase::Unknown),
            other => Err(InvalidPhase(other.to_string())),
        }
    }
}

/// A backend's native phase names and the phase each one means.
#[derive(Debug)]
pub struct PhaseVocabulary {
    name: &'static str,
    entries: &'static [(&'static str, Phase)],
}

impl PhaseVocabulary {
    /// Build a vocabulary from `(native name, phase)` pairs.
    pub const fn new(name: &'static str, entries: &'static [(&'static str, Phase)]) -> Self {
        Self { name, entries }
    }

    /// Vocabulary name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Case-insensitive exact lookup of a native phase name.
    pub fn map(&self, native: &str) -> Phase {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(native))
            .map(|(_, phase)| *phase)
            .unwrap_or(Phase::Unknown)
    }
}

/// Kubernetes pod phases.
pub static KUBERNETES_PHASES: PhaseVocabulary = PhaseVocabulary::new(
    "kubernetes",
    &[
        ("Pending", Phase::Pending),
        ("Running", Phase::Running),
        ("Succeeded", Phase::Succeeded),
        ("Failed", Phase::Failed),
        ("Unknown", Phase::Unknown),
    ],
);

/// Docker task states.
///
/// Plain containers only expose `created/running/exited/...`; the Docker
/// backend reports `complete` or `failed` for exited containers based on the
/// exit code so the same vocabulary covers both.
pub static DOCKER_PHASES: PhaseVocabulary = PhaseVocabulary::new(
    "docker",
    &[
        ("new", Phase::Pending),
        ("allocated", Phase::Pending),
        ("pending", Phase::Pending),
        ("assigned", Phase::Pending),
        ("accepted", Phase::Pending),
        ("preparing", Phase::Pending),
        ("ready", Phase::Pending),
        ("starting", Phase::Pending),
        ("created", Phase::Pending),
        ("running", Phase::Running),
        ("paused", Phase::Running),
        ("restarting", Phase::Running),
        ("complete", Phase::Succeeded),
        ("failed", Phase::Failed),
        ("shutdown", Phase::Failed),
        ("rejected", Phase::Failed),
        ("orphaned", Phase::Failed),
        ("dead", Phase::Failed),
    ],
);
