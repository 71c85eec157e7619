// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Disk provisioning for volume hosts.
//!
//! A provisioning pass enumerates the block devices of a host, picks out the raw disks that
//! nothing has claimed yet, and turns each one into a mounted, fstab-registered storage folder
//! with a volume budget. Running a pass against a host whose disks are all provisioned finds no
//! candidates and changes nothing.
//!
//! Disks provisioned before a failure in the same pass are left in place; the next pass picks up
//! from wherever the host was left.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cluster::{ComponentSpec, FolderSpec};
use crate::config::GlobalOptions;
use crate::executor::ExecError;
use crate::task::TaskContext;

pub mod device;
pub mod steps;

pub use device::{BlockDevice, Candidate, DeviceKind};

use steps::{run_step, AddFstabEntry, FormatDisk, MountDisk};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Disks up to this size reserve a percentage of their capacity; larger ones reserve a fixed
/// amount.
pub const SMALL_DISK_THRESHOLD: u64 = 200 * GIB;

/// Percentage of a small disk kept free.
pub const RESERVED_PERCENT: u64 = 5;

/// MiB kept free on a large disk (10 GiB).
pub const RESERVED_MIB_LARGE: u64 = 10 * 1024;

pub const FILESYSTEM: &str = "ext4";

/// Filesystem label written at format time. It marks a disk as ours, so that a disk formatted by
/// an interrupted pass can be resumed instead of being treated as foreign.
pub const FILESYSTEM_LABEL: &str = "seaforge";

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("could not list block devices: {0}")]
    Discovery(#[source] ExecError),

    #[error("could not parse block device list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not format {device}: {source}")]
    Format { device: String, source: ExecError },

    #[error("could not read filesystem UUID of {device}: {source}")]
    Uuid { device: String, source: ExecError },

    #[error("{device} has no filesystem UUID after formatting")]
    MissingUuid { device: String },

    #[error("could not register {device} in fstab: {source}")]
    Fstab { device: String, source: ExecError },

    #[error("could not mount {device}: {source}")]
    Mount { device: String, source: ExecError },
}

/// Compute the number of volumes a disk of `size_bytes` can hold, given the per-volume size limit
/// in MiB.
///
/// Disks of up to 200 GiB keep 5% free; larger disks keep 10 GiB free.
pub fn max_volumes(size_bytes: u64, volume_size_limit_mb: u64) -> u64 {
    if volume_size_limit_mb == 0 {
        return 0;
    }
    let size_mb = size_bytes / (1024 * 1024);
    let usable_mb = if size_bytes <= SMALL_DISK_THRESHOLD {
        size_mb * (100 - RESERVED_PERCENT) / 100
    } else {
        size_mb.saturating_sub(RESERVED_MIB_LARGE)
    };
    usable_mb / volume_size_limit_mb
}

/// Return the lowest-numbered `/dataN` path that is not in `used`.
pub fn next_mount_path(used: &HashSet<String>) -> String {
    (1..)
        .map(|n| format!("/data{n}"))
        .find(|path| !used.contains(path))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub device_prefixes: Vec<String>,
    pub volume_size_limit_mb: u64,
    pub disk_type: String,
    /// How long to let the kernel settle after formatting before reading the UUID back.
    pub settle_delay: Duration,
}

impl From<&GlobalOptions> for ProvisionOptions {
    fn from(global: &GlobalOptions) -> Self {
        ProvisionOptions {
            device_prefixes: global.device_prefixes.clone(),
            volume_size_limit_mb: global.volume_size_limit_mb,
            disk_type: "hdd".to_string(),
            settle_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskProvisioner {
    options: ProvisionOptions,
}

impl DiskProvisioner {
    pub fn new(options: ProvisionOptions) -> Self {
        DiskProvisioner { options }
    }

    pub fn options(&self) -> &ProvisionOptions {
        &self.options
    }

    /// Run one provisioning pass for the volume instance `spec`.
    ///
    /// New folders are appended to the instance's folder list (which flags its configuration as
    /// changed) and also returned. If a disk fails part way through, the folders completed before
    /// it are still recorded and the error is returned.
    pub async fn provision(
        &self,
        ctx: &TaskContext,
        spec: &ComponentSpec,
    ) -> Result<Vec<FolderSpec>, ProvisionError> {
        let host = spec.host.as_str();
        let devices = device::discover(ctx, host, &self.options.device_prefixes).await?;

        let existing = spec.folders();
        let claimed: Vec<String> = existing.iter().filter_map(|f| f.device.clone()).collect();
        let candidates =
            device::select_candidates(&devices, FILESYSTEM, FILESYSTEM_LABEL, &claimed);

        if candidates.is_empty() {
            info!("{host}: no unclaimed disks found");
            return Ok(Vec::new());
        }
        info!(
            "{host}: provisioning {} disk(s): {}",
            candidates.len(),
            candidates
                .iter()
                .map(|c| c.device.path.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Paths registered in fstab stay reserved even while unmounted, since they come back
        // at the next boot.
        let mut used: HashSet<String> = devices
            .iter()
            .filter_map(|d| d.mountpoint.clone())
            .chain(existing.iter().map(|f| f.path.clone()))
            .chain(steps::fstab_mount_paths(ctx, host).await?)
            .collect();

        let mut provisioned = Vec::new();
        for candidate in candidates.iter() {
            match self.provision_disk(ctx, host, candidate, &used).await {
                Ok(folder) => {
                    used.insert(folder.path.clone());
                    provisioned.push(folder);
                }
                Err(e) => {
                    warn!("{host}: provisioning stopped at {}: {e}", candidate.device.path);
                    spec.add_folders(provisioned);
                    return Err(e);
                }
            }
        }

        spec.add_folders(provisioned.clone());
        Ok(provisioned)
    }

    async fn provision_disk(
        &self,
        ctx: &TaskContext,
        host: &str,
        candidate: &Candidate,
        used: &HashSet<String>,
    ) -> Result<FolderSpec, ProvisionError> {
        let disk = &candidate.device;

        if !candidate.resume {
            run_step(
                &FormatDisk {
                    host,
                    device: &disk.path,
                    fstype: FILESYSTEM,
                    label: FILESYSTEM_LABEL,
                },
                ctx,
            )
            .await?;

            // Give udev a moment to pick up the new filesystem before asking for its UUID.
            if let Err(e) = ctx.run(host, "udevadm settle").await {
                debug!("{host}: udevadm settle failed, relying on the settle delay: {e}");
            }
            if ctx.sleep(self.options.settle_delay).await.is_err() {
                return Err(ProvisionError::Uuid {
                    device: disk.path.clone(),
                    source: ExecError::Cancelled {
                        host: host.to_string(),
                    },
                });
            }
        } else {
            info!("{host}: resuming {} left formatted by an earlier pass", disk.path);
        }

        let uuid = steps::read_uuid(ctx, host, &disk.path).await?;

        // A disk that is already in fstab keeps the path it will be mounted at after a reboot.
        let mount_path = match steps::fstab_mount_path(ctx, host, &disk.path, &uuid).await? {
            Some(path) => {
                info!("{host}: {} is registered in fstab at {path}", disk.path);
                path
            }
            None => next_mount_path(used),
        };
        let mount_path = mount_path.as_str();

        run_step(
            &AddFstabEntry {
                host,
                device: &disk.path,
                uuid: &uuid,
                mount_path,
                fstype: FILESYSTEM,
            },
            ctx,
        )
        .await?;

        run_step(
            &MountDisk {
                host,
                device: &disk.path,
                uuid: &uuid,
                mount_path,
                fstype: FILESYSTEM,
            },
            ctx,
        )
        .await?;

        let folder = FolderSpec {
            path: mount_path.to_string(),
            disk_type: self.options.disk_type.clone(),
            device: Some(disk.path.clone()),
            uuid: Some(uuid),
            max_volumes: max_volumes(disk.size, self.options.volume_size_limit_mb),
        };
        info!(
            "{host}: {} mounted at {} ({} volumes)",
            disk.path, folder.path, folder.max_volumes
        );
        Ok(folder)
    }
}
