// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The individual mutations that turn a raw disk into a mounted folder.
//!
//! Each step first checks whether its effect is already in place and skips itself if so. A pass
//! that was interrupted part way through therefore resumes where it stopped when it is retried.

use {async_trait::async_trait, log::debug};

use crate::task::TaskContext;

use super::ProvisionError;

#[async_trait]
pub trait ProvisionStep: Send + Sync {
    fn name(&self) -> String;

    async fn is_done(&self, ctx: &TaskContext) -> Result<bool, ProvisionError>;

    async fn apply(&self, ctx: &TaskContext) -> Result<(), ProvisionError>;
}

/// Apply `step` unless it has already been applied.
pub async fn run_step(step: &dyn ProvisionStep, ctx: &TaskContext) -> Result<(), ProvisionError> {
    if step.is_done(ctx).await? {
        debug!("{}: already done", step.name());
        return Ok(());
    }
    debug!("{}: applying", step.name());
    step.apply(ctx).await
}

pub struct FormatDisk<'a> {
    pub host: &'a str,
    pub device: &'a str,
    pub fstype: &'a str,
    pub label: &'a str,
}

#[async_trait]
impl<'a> ProvisionStep for FormatDisk<'a> {
    fn name(&self) -> String {
        format!("format {} on {}", self.device, self.host)
    }

    async fn is_done(&self, ctx: &TaskContext) -> Result<bool, ProvisionError> {
        let command = format!("blkid -o export {}", self.device);
        match ctx.run(self.host, &command).await {
            Ok(output) => {
                let has = |key: &str, value: &str| {
                    output.lines().any(|l| l.trim() == format!("{key}={value}"))
                };
                Ok(has("TYPE", self.fstype) && has("LABEL", self.label))
            }
            // blkid exits non-zero when the device carries no filesystem at all.
            Err(e) if !e.is_transport() => Ok(false),
            Err(e) => Err(ProvisionError::Format {
                device: self.device.to_string(),
                source: e,
            }),
        }
    }

    async fn apply(&self, ctx: &TaskContext) -> Result<(), ProvisionError> {
        let command = format!("mkfs.{} -F -L {} {}", self.fstype, self.label, self.device);
        ctx.run(self.host, &command)
            .await
            .map(|_| ())
            .map_err(|source| ProvisionError::Format {
                device: self.device.to_string(),
                source,
            })
    }
}

pub struct AddFstabEntry<'a> {
    pub host: &'a str,
    pub device: &'a str,
    pub uuid: &'a str,
    pub mount_path: &'a str,
    pub fstype: &'a str,
}

impl AddFstabEntry<'_> {
    pub fn entry(&self) -> String {
        format!(
            "UUID={} {} {} defaults,noatime,nofail 0 2",
            self.uuid, self.mount_path, self.fstype
        )
    }
}

#[async_trait]
impl<'a> ProvisionStep for AddFstabEntry<'a> {
    fn name(&self) -> String {
        format!("fstab entry for {} on {}", self.mount_path, self.host)
    }

    async fn is_done(&self, ctx: &TaskContext) -> Result<bool, ProvisionError> {
        let command = format!("grep -q '^UUID={}[[:space:]]' /etc/fstab", self.uuid);
        ctx.probe(self.host, &command)
            .await
            .map_err(|source| ProvisionError::Fstab {
                device: self.device.to_string(),
                source,
            })
    }

    async fn apply(&self, ctx: &TaskContext) -> Result<(), ProvisionError> {
        let command = format!("echo '{}' >> /etc/fstab", self.entry());
        ctx.run(self.host, &command)
            .await
            .map(|_| ())
            .map_err(|source| ProvisionError::Fstab {
                device: self.device.to_string(),
                source,
            })
    }
}

pub struct MountDisk<'a> {
    pub host: &'a str,
    pub device: &'a str,
    pub uuid: &'a str,
    pub mount_path: &'a str,
    pub fstype: &'a str,
}

#[async_trait]
impl<'a> ProvisionStep for MountDisk<'a> {
    fn name(&self) -> String {
        format!("mount {} at {} on {}", self.device, self.mount_path, self.host)
    }

    async fn is_done(&self, ctx: &TaskContext) -> Result<bool, ProvisionError> {
        let command = format!("mountpoint -q {}", self.mount_path);
        ctx.probe(self.host, &command)
            .await
            .map_err(|source| ProvisionError::Mount {
                device: self.device.to_string(),
                source,
            })
    }

    async fn apply(&self, ctx: &TaskContext) -> Result<(), ProvisionError> {
        let command = format!(
            "mkdir -p {path} && mount -t {fstype} UUID={uuid} {path}",
            path = self.mount_path,
            fstype = self.fstype,
            uuid = self.uuid,
        );
        ctx.run(self.host, &command)
            .await
            .map(|_| ())
            .map_err(|source| ProvisionError::Mount {
                device: self.device.to_string(),
                source,
            })
    }
}

/// The mount path fstab already gives the filesystem `uuid`, if it has an entry.
pub async fn fstab_mount_path(
    ctx: &TaskContext,
    host: &str,
    device: &str,
    uuid: &str,
) -> Result<Option<String>, ProvisionError> {
    let command = format!("awk '$1 == \"UUID={uuid}\" {{print $2}}' /etc/fstab");
    let output = ctx
        .run(host, &command)
        .await
        .map_err(|source| ProvisionError::Fstab {
            device: device.to_string(),
            source,
        })?;
    Ok(output.lines().map(str::trim).find(|p| !p.is_empty()).map(String::from))
}

/// Every mount path listed in fstab, whether or not it is currently mounted.
pub async fn fstab_mount_paths(
    ctx: &TaskContext,
    host: &str,
) -> Result<Vec<String>, ProvisionError> {
    let command = "awk '!/^[[:space:]]*#/ && NF >= 2 {print $2}' /etc/fstab";
    let output = ctx
        .run(host, command)
        .await
        .map_err(|source| ProvisionError::Fstab {
            device: "/etc/fstab".to_string(),
            source,
        })?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect())
}

/// Read the filesystem UUID of a freshly formatted device. An empty UUID is an error: a disk that
/// cannot be identified must not be put in fstab.
pub async fn read_uuid(
    ctx: &TaskContext,
    host: &str,
    device: &str,
) -> Result<String, ProvisionError> {
    let command = format!("blkid -s UUID -o value {device}");
    let output = ctx
        .run(host, &command)
        .await
        .map_err(|source| ProvisionError::Uuid {
            device: device.to_string(),
            source,
        })?;

    let uuid = output.trim();
    if uuid.is_empty() {
        return Err(ProvisionError::MissingUuid {
            device: device.to_string(),
        });
    }
    Ok(uuid.to_string())
}
