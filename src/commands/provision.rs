// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use {clap::Args, serde::Serialize};

use crate::cluster::FolderSpec;
use crate::commands::{Handle, HandledResult, Session};
use crate::provision::{DiskProvisioner, ProvisionOptions};

#[derive(Args, Debug, Clone)]
pub struct ProvisionArgs {
    /// Volume host whose disks should be provisioned.
    #[arg(long)]
    host: String,
}

#[derive(Serialize)]
struct Folders<'a> {
    folders: &'a [FolderSpec],
}

/// Provision the unclaimed disks of one volume host and print the folders that were added, in
/// the same shape as a volume's `folders` list in the topology file.
///
/// This runs whether or not `auto_provision_disks` is set.
pub async fn provision(session: &Session, args: &ProvisionArgs) -> HandledResult<()> {
    let Some(spec) = session
        .topology
        .volumes()
        .iter()
        .find(|v| v.host == args.host)
    else {
        eprintln!("{} is not a volume host in this topology", args.host);
        return crate::commands::handled_error();
    };

    let provisioner = DiskProvisioner::new(ProvisionOptions::from(&session.topology.global));
    let folders = provisioner
        .provision(&session.ctx, spec)
        .await
        .handle_err(|e| eprintln!("Provisioning {} failed: {e}", args.host))?;

    if folders.is_empty() {
        println!("# {}: nothing to provision", args.host);
        return Ok(());
    }
    let toml = toml::to_string_pretty(&Folders { folders: &folders })
        .handle_err(|e| eprintln!("Could not serialize folders: {e}"))?;
    println!("{toml}");
    Ok(())
}
