// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Tasks that install, upgrade and scale out role instances, along with the pieces they share:
//! where an instance's files live on its host, how its service is supervised, and how to wait
//! for it to come up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::cluster::{ComponentSpec, Role, Topology};
use crate::config::GlobalOptions;
use crate::provision::{DiskProvisioner, ProvisionOptions};
use crate::status::{HealthProbe, HealthState};
use crate::task::{TaskContext, TaskError};

mod deploy;
pub mod render;
mod scale;
mod upgrade;

pub use deploy::DeployTask;
pub use render::{ConfigRenderer, DefaultRenderer, RenderError, RenderInput};
pub use scale::ScaleOutTask;
pub use upgrade::UpgradeTask;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("{component} {version} is not installed (expected executable at {path})")]
    NotInstalled {
        component: String,
        version: String,
        path: String,
    },
}

/// Resolves a component version to an installed binary on the local machine.
pub trait BinaryRepository: Send + Sync + std::fmt::Debug {
    fn binary_path(&self, component: &str, version: &str) -> Result<PathBuf, RepositoryError>;
}

/// A repository laid out on disk as `<root>/<component>/<version>/<component>`.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalRepository { root: root.into() }
    }
}

impl BinaryRepository for LocalRepository {
    fn binary_path(&self, component: &str, version: &str) -> Result<PathBuf, RepositoryError> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.root.join(component).join(version).join(component);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => Ok(path),
            _ => Err(RepositoryError::NotInstalled {
                component: component.to_string(),
                version: version.to_string(),
                path: path.display().to_string(),
            }),
        }
    }
}

/// Bounded polling: check every `interval` until `timeout` has passed.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Everything the component tasks of one orchestration run share.
#[derive(Debug)]
pub struct DeployEnv {
    pub global: GlobalOptions,
    pub masters: Vec<String>,
    pub filers: Vec<String>,
    pub repository: Arc<dyn BinaryRepository>,
    pub renderer: Arc<dyn ConfigRenderer>,
    pub probe: Arc<dyn HealthProbe>,
    /// Present when disks on volume hosts should be provisioned automatically.
    pub provisioner: Option<DiskProvisioner>,
    pub poll: PollOptions,
}

impl DeployEnv {
    pub fn new(
        topology: &Topology,
        repository: Arc<dyn BinaryRepository>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let global = topology.global.clone();
        let provisioner = global
            .auto_provision_disks
            .then(|| DiskProvisioner::new(ProvisionOptions::from(&global)));
        DeployEnv {
            masters: topology.master_addresses(),
            filers: topology.filers().iter().map(|f| f.address()).collect(),
            repository,
            renderer: Arc::new(DefaultRenderer),
            probe,
            provisioner,
            poll: PollOptions {
                interval: Duration::from_secs(2),
                timeout: Duration::from_secs(global.health_timeout_secs),
            },
            global,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Option<DiskProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_poll(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn layout(&self, spec: &ComponentSpec) -> InstanceLayout {
        InstanceLayout::new(&self.global, spec)
    }
}

/// Where an instance's files live on its host. Each instance gets its own binary so that
/// instances sharing a host can be upgraded independently.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceLayout {
    pub install_dir: String,
    pub binary: String,
    /// Previous binary kept by an upgrade.
    pub binary_backup: String,
    pub config_dir: String,
    pub config_file: String,
    pub data_dir: String,
    pub service: String,
    pub unit_file: String,
}

impl InstanceLayout {
    pub fn new(global: &GlobalOptions, spec: &ComponentSpec) -> Self {
        let id = spec.id();
        let install_dir = format!("{}/{id}", global.install_dir);
        let binary = format!("{install_dir}/{}", spec.role.component_name());
        let config_dir = format!("{}/{id}", global.config_dir);
        let config_file = match spec.role {
            Role::Envoy => format!("{config_dir}/envoy.yaml"),
            role => format!("{config_dir}/{role}.options"),
        };
        let service = format!("seaforge-{id}");
        InstanceLayout {
            binary_backup: format!("{binary}.prev"),
            binary,
            install_dir,
            config_file,
            config_dir,
            data_dir: spec.data_dir.clone(),
            unit_file: format!("/etc/systemd/system/{service}.service"),
            service,
        }
    }

    /// Prefix shared by every configuration backup of this instance. The suffix is a timestamp,
    /// so the lexicographically greatest backup is the most recent.
    pub fn config_backup_prefix(&self) -> String {
        format!("{}.bak.", self.config_dir)
    }
}

/// Lifecycle commands for a systemd-supervised service.
pub mod service {
    use super::*;

    pub fn daemon_reload() -> String {
        "systemctl daemon-reload".to_string()
    }

    pub fn enable(service: &str) -> String {
        format!("systemctl enable {service}")
    }

    pub fn disable(service: &str) -> String {
        format!("systemctl disable {service}")
    }

    pub fn start(service: &str) -> String {
        format!("systemctl start {service}")
    }

    pub fn stop(service: &str) -> String {
        format!("systemctl stop {service}")
    }

    pub fn is_active(service: &str) -> String {
        format!("systemctl is-active --quiet {service}")
    }

    /// Stop, disable and remove the unit of a service. Each step is attempted even if an earlier
    /// one fails; the first error is returned.
    pub async fn remove(
        ctx: &TaskContext,
        host: &str,
        layout: &InstanceLayout,
    ) -> Result<(), TaskError> {
        let commands = [
            stop(&layout.service),
            disable(&layout.service),
            format!("rm -f {}", layout.unit_file),
            daemon_reload(),
        ];
        let mut first_error = None;
        for command in commands.iter() {
            if let Err(e) = ctx.run(host, command).await {
                debug!("{host}: `{command}` failed: {e}");
                first_error.get_or_insert(TaskError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Poll until the supervisor reports the instance's service active.
pub async fn wait_for_active(
    ctx: &TaskContext,
    host: &str,
    service: &str,
    poll: PollOptions,
) -> Result<(), TaskError> {
    let deadline = Instant::now() + poll.timeout;
    loop {
        if ctx.probe(host, &service::is_active(service)).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TaskError::Verification(format!(
                "{service} on {host} did not become active within {:?}",
                poll.timeout
            )));
        }
        ctx.sleep(poll.interval).await?;
    }
}

/// Poll the instance's health probe until it reports healthy.
pub async fn wait_for_healthy(
    ctx: &TaskContext,
    probe: &dyn HealthProbe,
    spec: &ComponentSpec,
    poll: PollOptions,
) -> Result<(), TaskError> {
    let deadline = Instant::now() + poll.timeout;
    loop {
        let report = probe.check(spec).await;
        if report.state == HealthState::Healthy {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TaskError::Verification(format!(
                "{spec} did not become healthy within {:?}: {}",
                poll.timeout, report.detail
            )));
        }
        ctx.sleep(poll.interval).await?;
    }
}
