// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::Local,
    log::{error, info},
};

use crate::cluster::ComponentSpec;
use crate::status::HealthState;
use crate::task::{Task, TaskContext, TaskError};

use super::{deploy::install_binary, service, wait_for_healthy, DeployEnv, InstanceLayout};

/// Replace the binary of a running, healthy instance with `version`.
///
/// The configuration directory and current binary are backed up first. If anything fails after
/// the service has been stopped, the task restores the backups before returning the error, so a
/// retry starts again from a healthy instance.
pub struct UpgradeTask {
    spec: Arc<ComponentSpec>,
    env: Arc<DeployEnv>,
    version: String,
}

impl UpgradeTask {
    pub fn new(spec: Arc<ComponentSpec>, env: Arc<DeployEnv>, version: &str) -> Self {
        UpgradeTask {
            spec,
            env,
            version: version.to_string(),
        }
    }

    fn layout(&self) -> InstanceLayout {
        self.env.layout(&self.spec)
    }

    async fn check_healthy(&self) -> Result<(), TaskError> {
        let report = self.env.probe.check(&self.spec).await;
        if report.state != HealthState::Healthy {
            return Err(TaskError::Precondition(format!(
                "{} is not healthy ({}), refusing to upgrade",
                self.spec, report.detail
            )));
        }
        Ok(())
    }

    async fn backup(&self, ctx: &TaskContext, layout: &InstanceLayout) -> Result<(), TaskError> {
        let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let command = format!(
            "cp -a {dir} {prefix}{stamp}",
            dir = layout.config_dir,
            prefix = layout.config_backup_prefix(),
        );
        ctx.run(&self.spec.host, &command).await?;
        Ok(())
    }

    /// The steps from stopping the service through verifying the new version.
    async fn replace(&self, ctx: &TaskContext, layout: &InstanceLayout) -> Result<(), TaskError> {
        let host = &self.spec.host;

        ctx.run(host, &service::stop(&layout.service)).await?;
        ctx.run(
            host,
            &format!("cp -p {} {}", layout.binary, layout.binary_backup),
        )
        .await?;
        install_binary(ctx, &self.env, &self.spec, &self.version, layout).await?;
        ctx.run(host, &service::start(&layout.service)).await?;

        wait_for_healthy(ctx, self.env.probe.as_ref(), &self.spec, self.env.poll).await?;
        self.verify_version(ctx, layout).await
    }

    async fn verify_version(
        &self,
        ctx: &TaskContext,
        layout: &InstanceLayout,
    ) -> Result<(), TaskError> {
        let output = ctx
            .run(&self.spec.host, &format!("{} version", layout.binary))
            .await?;
        if !reports_version(&output, &self.version) {
            return Err(TaskError::Verification(format!(
                "{} reports version '{}', expected {}",
                self.spec,
                output.trim(),
                self.version
            )));
        }
        Ok(())
    }
}

/// Whether `output` names `version` as a whole word, optionally prefixed with `v`. `3.1` does not
/// match `3.10`.
fn reports_version(output: &str, version: &str) -> bool {
    output
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|word| word.strip_prefix('v').unwrap_or(word))
        .any(|word| word == version)
}

#[async_trait]
impl Task for UpgradeTask {
    fn id(&self) -> String {
        format!("upgrade-{}", self.spec.id())
    }

    fn description(&self) -> String {
        format!("upgrade {} to {}", self.spec, self.version)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let layout = self.layout();

        self.check_healthy().await?;
        self.backup(ctx, &layout).await?;

        if let Err(e) = self.replace(ctx, &layout).await {
            error!("upgrade of {} failed, restoring previous version: {e}", self.spec);
            if let Err(rollback) = self.rollback(ctx).await {
                error!("{}: restore failed: {rollback}", self.spec);
            }
            return Err(e);
        }

        info!("{} upgraded to {}", self.spec, self.version);
        Ok(())
    }

    /// Put the previous binary and the most recent configuration backup back, restart, and wait
    /// for the instance to be healthy again.
    async fn rollback(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let layout = self.layout();
        let host = &self.spec.host;

        ctx.run(host, &service::stop(&layout.service)).await?;
        ctx.run(
            host,
            &format!(
                "if [ -f {backup} ]; then cp -p {backup} {binary}; fi",
                backup = layout.binary_backup,
                binary = layout.binary,
            ),
        )
        .await?;
        ctx.run(
            host,
            &format!(
                "latest=$(ls -1d {prefix}* 2>/dev/null | sort | tail -n 1); \
                 if [ -n \"$latest\" ]; then rm -rf {dir} && cp -a \"$latest\" {dir}; fi",
                prefix = layout.config_backup_prefix(),
                dir = layout.config_dir,
            ),
        )
        .await?;
        ctx.run(host, &service::start(&layout.service)).await?;

        wait_for_healthy(ctx, self.env.probe.as_ref(), &self.spec, self.env.poll).await
    }
}
