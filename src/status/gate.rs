// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {async_trait::async_trait, log::info};

use crate::cluster::Topology;
use crate::task::{Task, TaskContext, TaskError};

use super::{ClusterState, StatusCollector};

/// A task that passes only if the whole cluster is running and healthy. Placed ahead of
/// operations, like a rolling upgrade, that must not start against a degraded cluster.
pub struct HealthGate {
    topology: Arc<Topology>,
    collector: StatusCollector,
}

impl HealthGate {
    pub fn new(topology: Arc<Topology>, collector: StatusCollector) -> Self {
        HealthGate {
            topology,
            collector,
        }
    }
}

#[async_trait]
impl Task for HealthGate {
    fn id(&self) -> String {
        "health-gate".to_string()
    }

    fn description(&self) -> String {
        format!(
            "check that all {} instances are healthy",
            self.topology.num_components()
        )
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        let status = self.collector.collect(&self.topology).await;
        if status.state != ClusterState::Running {
            let unhealthy: Vec<String> = status
                .components
                .iter()
                .filter(|c| !c.is_healthy())
                .map(|c| c.id.clone())
                .collect();
            return Err(TaskError::Precondition(format!(
                "cluster is {}, not healthy: {}",
                status.state,
                unhealthy.join(", ")
            )));
        }
        info!("all {} instances healthy", status.components.len());
        Ok(())
    }

    async fn rollback(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}
