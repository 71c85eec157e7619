// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {
    async_trait::async_trait,
    log::{info, warn},
};

use crate::cluster::ComponentSpec;
use crate::task::{Task, TaskContext, TaskError};

use super::{service, DeployEnv, DeployTask};

/// Add brand-new instances to a running cluster, deploying them one at a time.
///
/// If one of the new instances fails, the ones this task already brought up are removed again
/// before the error is returned.
pub struct ScaleOutTask {
    name: String,
    deployments: Vec<DeployTask>,
    env: Arc<DeployEnv>,
}

impl ScaleOutTask {
    pub fn new(name: &str, specs: Vec<Arc<ComponentSpec>>, env: Arc<DeployEnv>) -> Self {
        let provision = env.provisioner.is_some();
        let deployments = specs
            .into_iter()
            .map(|spec| DeployTask::new(spec, Arc::clone(&env)).with_disk_provisioning(provision))
            .collect();
        ScaleOutTask {
            name: name.to_string(),
            deployments,
            env,
        }
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<ComponentSpec>> {
        self.deployments.iter().map(|d| d.spec())
    }

    /// Refuse to deploy onto a port that something else on the host is already listening on.
    /// An instance whose own service is already active (from an earlier attempt) is not a
    /// conflict.
    async fn check_ports(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        for spec in self.specs() {
            let layout = self.env.layout(spec);
            if ctx
                .probe(&spec.host, &service::is_active(&layout.service))
                .await?
            {
                continue;
            }
            for port in [spec.port, spec.grpc_port] {
                let command = format!("ss -Hltn 'sport = :{port}'");
                let listening = ctx.run(&spec.host, &command).await?;
                if !listening.trim().is_empty() {
                    return Err(TaskError::Precondition(format!(
                        "port {port} on {} is already in use",
                        spec.host
                    )));
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal of the first `count` deployments, newest first.
    async fn remove(&self, ctx: &TaskContext, count: usize) -> Result<(), TaskError> {
        let mut first_error = None;
        for deployment in self.deployments[..count].iter().rev() {
            info!("removing {}", deployment.spec());
            if let Err(e) = deployment.rollback(ctx).await {
                warn!("could not remove {}: {e}", deployment.spec());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Task for ScaleOutTask {
    fn id(&self) -> String {
        format!("scale-out-{}", self.name)
    }

    fn description(&self) -> String {
        format!(
            "scale out {}: {}",
            self.name,
            self.specs()
                .map(|s| s.address())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.check_ports(ctx).await?;

        for (i, deployment) in self.deployments.iter().enumerate() {
            if let Err(e) = deployment.execute(ctx).await {
                warn!("scale-out {} failed at {}: {e}", self.name, deployment.spec());
                if let Err(cleanup) = self.remove(ctx, i).await {
                    warn!("scale-out {}: cleanup was incomplete: {cleanup}", self.name);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.remove(ctx, self.deployments.len()).await
    }
}
