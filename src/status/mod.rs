// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Point-in-time status of every instance in a cluster, and the cluster state derived from it.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Local},
    serde::{Deserialize, Serialize},
};

use crate::cluster::{ComponentSpec, Role};

mod collector;
mod gate;
mod probe;

pub use collector::StatusCollector;
pub use gate::HealthGate;
pub use probe::{HealthProbe, HealthReport, HealthState, HttpHealthProbe, DEFAULT_PROBE_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
    /// The probe itself failed, so nothing is known about the process.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub rss_kb: u64,
    pub uptime_secs: u64,
}

/// The observed state of one instance. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub id: String,
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub process: ProcessState,
    pub health: HealthState,
    pub metrics: Option<ResourceMetrics>,
    pub message: Option<String>,
    pub checked_at: DateTime<Local>,
}

impl ComponentStatus {
    pub fn new(spec: &ComponentSpec, process: ProcessState, health: HealthState) -> Self {
        ComponentStatus {
            id: spec.id(),
            role: spec.role,
            host: spec.host.clone(),
            port: spec.port,
            pid: None,
            process,
            health,
            metrics: None,
            message: None,
            checked_at: Local::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.process == ProcessState::Running
    }

    /// Running and not failing its health check. An instance that was not health checked counts
    /// as healthy as long as its process is up.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.health != HealthState::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Running,
    Degraded,
    Stopped,
    /// Nothing is running and at least one instance could not be probed. This is reported
    /// instead of Stopped on purpose: an unreachable host does not prove its instances are down.
    Error,
    Unknown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ClusterState::Running => "running",
                ClusterState::Degraded => "degraded",
                ClusterState::Stopped => "stopped",
                ClusterState::Error => "error",
                ClusterState::Unknown => "unknown",
            }
        )
    }
}

impl ClusterState {
    /// Derive the state of a cluster from the statuses of its instances.
    ///
    /// Everything healthy is Running, nothing running is Stopped (or Error, if some instances
    /// could not be probed at all), and anything in between is Degraded. A cluster with no
    /// instances is Unknown.
    pub fn derive(components: &[ComponentStatus]) -> Self {
        if components.is_empty() {
            return ClusterState::Unknown;
        }
        let running = components.iter().filter(|c| c.is_running()).count();
        let healthy = components.iter().filter(|c| c.is_healthy()).count();
        let errored = components
            .iter()
            .filter(|c| c.process == ProcessState::Error)
            .count();

        if healthy == components.len() {
            ClusterState::Running
        } else if running == 0 && errored == 0 {
            ClusterState::Stopped
        } else if running > 0 {
            ClusterState::Degraded
        } else {
            ClusterState::Error
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleSummary {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub stopped: usize,
    pub errors: usize,
    pub by_role: BTreeMap<String, RoleSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub state: ClusterState,
    pub components: Vec<ComponentStatus>,
    pub checked_at: DateTime<Local>,
}

impl ClusterStatus {
    pub fn new(components: Vec<ComponentStatus>) -> Self {
        ClusterStatus {
            state: ClusterState::derive(&components),
            components,
            checked_at: Local::now(),
        }
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary {
            total: self.components.len(),
            ..Default::default()
        };
        for c in self.components.iter() {
            let role = summary.by_role.entry(c.role.to_string()).or_default();
            role.total += 1;
            if c.is_running() {
                summary.running += 1;
                role.running += 1;
            }
            if c.is_healthy() {
                summary.healthy += 1;
                role.healthy += 1;
            }
            match c.process {
                ProcessState::Stopped => summary.stopped += 1,
                ProcessState::Error => summary.errors += 1,
                ProcessState::Running => {}
            }
        }
        summary
    }

    pub fn get(&self, id: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.id == id)
    }
}
