// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Block device discovery and classification.

use serde::{Deserialize, Deserializer};

use crate::task::TaskContext;

use super::ProvisionError;

/// Columns requested from `lsblk`. Sizes are in bytes, and `-l` flattens the device tree so that
/// partitions are listed next to their parent disk (linked by `pkname`).
pub const LSBLK_COMMAND: &str =
    "lsblk -b -J -l -o NAME,PATH,SIZE,TYPE,FSTYPE,UUID,LABEL,MOUNTPOINT,PKNAME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Part,
    Other(String),
}

impl From<&str> for DeviceKind {
    fn from(s: &str) -> Self {
        match s {
            "disk" => DeviceKind::Disk,
            "part" => DeviceKind::Part,
            other => DeviceKind::Other(other.to_string()),
        }
    }
}

/// A block device as seen at discovery time. These are never cached: the physical state of a host
/// can change between deployments.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub kind: DeviceKind,
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,
    /// Kernel name of the parent device, for partitions.
    pub parent: Option<String>,
}

impl BlockDevice {
    pub fn is_mounted(&self) -> bool {
        self.mountpoint.as_deref().is_some_and(|m| !m.is_empty())
    }

    pub fn has_filesystem(&self) -> bool {
        self.fstype.as_deref().is_some_and(|f| !f.is_empty())
    }

    fn is_child_of(&self, disk: &BlockDevice) -> bool {
        match &self.parent {
            Some(parent) => *parent == disk.name,
            None => self.path != disk.path && self.path.starts_with(&disk.path),
        }
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    #[serde(default, deserialize_with = "size_from_number_or_string")]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
    fstype: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    pkname: Option<String>,
}

/// Older versions of lsblk print sizes as JSON strings even with `-b`.
fn size_from_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
        Missing(Option<()>),
    }

    match Size::deserialize(d)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Size::Missing(_) => Ok(0),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse `lsblk` JSON output, keeping only the devices whose path starts with one of `prefixes`.
pub fn parse_lsblk(output: &str, prefixes: &[String]) -> Result<Vec<BlockDevice>, ProvisionError> {
    let parsed: LsblkOutput = serde_json::from_str(output)?;

    Ok(parsed
        .blockdevices
        .into_iter()
        .map(|dev| BlockDevice {
            path: dev.path.unwrap_or(format!("/dev/{}", dev.name)),
            name: dev.name,
            size: dev.size,
            kind: DeviceKind::from(dev.kind.as_str()),
            fstype: non_empty(dev.fstype),
            uuid: non_empty(dev.uuid),
            label: non_empty(dev.label),
            mountpoint: non_empty(dev.mountpoint),
            parent: non_empty(dev.pkname),
        })
        .filter(|dev| prefixes.iter().any(|p| dev.path.starts_with(p.as_str())))
        .collect())
}

/// Enumerate the block devices on `host`.
pub async fn discover(
    ctx: &TaskContext,
    host: &str,
    prefixes: &[String],
) -> Result<Vec<BlockDevice>, ProvisionError> {
    let output = ctx
        .run(host, LSBLK_COMMAND)
        .await
        .map_err(ProvisionError::Discovery)?;
    parse_lsblk(&output, prefixes)
}

/// A disk chosen for provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub device: BlockDevice,

    /// The disk already carries our own filesystem from an earlier pass that did not finish, so
    /// formatting is skipped.
    pub resume: bool,
}

/// Pick the disks that can be claimed.
///
/// A disk is claimable when it has no partitions, is not mounted, and has no filesystem. The one
/// exception to the last rule is a disk formatted with `own_label` by an interrupted pass, which
/// is resumed. Devices listed in `claimed` (already backing a folder) are never returned.
pub fn select_candidates(
    devices: &[BlockDevice],
    own_fstype: &str,
    own_label: &str,
    claimed: &[String],
) -> Vec<Candidate> {
    devices
        .iter()
        .filter(|dev| dev.kind == DeviceKind::Disk)
        .filter(|disk| {
            !devices
                .iter()
                .any(|child| child.kind == DeviceKind::Part && child.is_child_of(disk))
        })
        .filter(|disk| !disk.is_mounted())
        .filter(|disk| !claimed.iter().any(|c| *c == disk.path))
        .filter_map(|disk| {
            if !disk.has_filesystem() {
                return Some(Candidate {
                    device: disk.clone(),
                    resume: false,
                });
            }
            let ours = disk.fstype.as_deref() == Some(own_fstype)
                && disk.label.as_deref() == Some(own_label);
            ours.then(|| Candidate {
                device: disk.clone(),
                resume: true,
            })
        })
        .collect()
}
