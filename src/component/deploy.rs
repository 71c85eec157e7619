// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {
    async_trait::async_trait,
    log::{info, warn},
};

use crate::cluster::{ComponentSpec, Role};
use crate::task::{Task, TaskContext, TaskError};

use super::{service, wait_for_active, DeployEnv, InstanceLayout, RenderInput};

/// Install and start one instance.
///
/// Rolling back stops the instance and removes its service unit. The binary and configuration
/// are left on the host so that a failed deployment can be examined.
pub struct DeployTask {
    spec: Arc<ComponentSpec>,
    env: Arc<DeployEnv>,
    version: String,

    /// Run a disk provisioning pass before rendering the configuration. Only one volume
    /// instance per host does this.
    provision_disks: bool,
}

impl DeployTask {
    pub fn new(spec: Arc<ComponentSpec>, env: Arc<DeployEnv>) -> Self {
        let version = env.global.version.clone();
        DeployTask {
            spec,
            env,
            version,
            provision_disks: false,
        }
    }

    pub fn with_disk_provisioning(mut self, provision_disks: bool) -> Self {
        self.provision_disks = provision_disks;
        self
    }

    pub fn spec(&self) -> &Arc<ComponentSpec> {
        &self.spec
    }

    fn layout(&self) -> InstanceLayout {
        self.env.layout(&self.spec)
    }

    async fn provision(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        if !self.provision_disks || self.spec.role != Role::Volume {
            return Ok(());
        }
        let Some(provisioner) = &self.env.provisioner else {
            return Ok(());
        };
        let folders = provisioner.provision(ctx, &self.spec).await?;
        if !folders.is_empty() {
            info!("{}: {} new folder(s) provisioned", self.spec, folders.len());
        }
        Ok(())
    }

    async fn create_directories(
        &self,
        ctx: &TaskContext,
        layout: &InstanceLayout,
    ) -> Result<(), TaskError> {
        let mut dirs = vec![
            layout.install_dir.clone(),
            layout.config_dir.clone(),
            layout.data_dir.clone(),
        ];
        dirs.extend(self.spec.folders().into_iter().map(|f| f.path));
        ctx.run(&self.spec.host, &format!("mkdir -p {}", dirs.join(" ")))
            .await?;
        Ok(())
    }

    async fn install_binary(
        &self,
        ctx: &TaskContext,
        layout: &InstanceLayout,
    ) -> Result<(), TaskError> {
        install_binary(ctx, &self.env, &self.spec, &self.version, layout).await
    }

    async fn write_configuration(
        &self,
        ctx: &TaskContext,
        layout: &InstanceLayout,
    ) -> Result<(), TaskError> {
        let input = RenderInput {
            spec: &self.spec,
            layout,
            masters: &self.env.masters,
            filers: &self.env.filers,
            volume_size_limit_mb: self.env.global.volume_size_limit_mb,
        };
        let renderer = &self.env.renderer;
        let config = renderer
            .render_config(&input)
            .map_err(|e| TaskError::Precondition(e.to_string()))?;
        let unit = renderer
            .render_unit(&input)
            .map_err(|e| TaskError::Precondition(e.to_string()))?;

        let host = &self.spec.host;
        ctx.write_file(host, &layout.config_file, &config).await?;
        ctx.write_file(host, &layout.unit_file, &unit).await?;
        Ok(())
    }

    async fn start(&self, ctx: &TaskContext, layout: &InstanceLayout) -> Result<(), TaskError> {
        let host = &self.spec.host;
        ctx.run(host, &service::daemon_reload()).await?;
        ctx.run(host, &service::enable(&layout.service)).await?;
        ctx.run(host, &service::start(&layout.service)).await?;
        wait_for_active(ctx, host, &layout.service, self.env.poll).await
    }
}

/// Copy the binary for `version` into the instance's install directory and check that it is
/// executable there.
pub(super) async fn install_binary(
    ctx: &TaskContext,
    env: &DeployEnv,
    spec: &ComponentSpec,
    version: &str,
    layout: &InstanceLayout,
) -> Result<(), TaskError> {
    let local = env
        .repository
        .binary_path(spec.role.component_name(), version)
        .map_err(|e| TaskError::Precondition(e.to_string()))?;

    ctx.put_file(&spec.host, &local, &layout.binary).await?;
    ctx.run(
        &spec.host,
        &format!("chmod 0755 {0} && test -x {0}", layout.binary),
    )
    .await?;
    Ok(())
}

#[async_trait]
impl Task for DeployTask {
    fn id(&self) -> String {
        format!("deploy-{}", self.spec.id())
    }

    fn description(&self) -> String {
        format!("deploy {} {}", self.spec, self.version)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let layout = self.layout();

        self.provision(ctx).await?;
        self.create_directories(ctx, &layout).await?;
        self.install_binary(ctx, &layout).await?;
        self.write_configuration(ctx, &layout).await?;

        match self.start(ctx, &layout).await {
            Err(e @ TaskError::Verification(_)) => {
                warn!("{} did not come up, removing its service", self.spec);
                if let Err(rollback) = self.rollback(ctx).await {
                    warn!("{}: rollback after failed start also failed: {rollback}", self.spec);
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn rollback(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        service::remove(ctx, &self.spec.host, &self.layout()).await
    }
}
