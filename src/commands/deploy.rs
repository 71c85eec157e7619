// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use clap::Args;

use crate::cluster::Topology;
use crate::commands::{print_plan, print_results, Handle, HandledResult, Session};
use crate::config::Config;
use crate::plan;
use crate::task::TaskOrchestrator;

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Print the phases that would run, and exit.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    /// Version to upgrade to.
    #[arg(long)]
    version: String,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScaleOutArgs {
    /// Topology file listing only the instances to add.
    #[arg(long)]
    file: String,

    #[arg(long)]
    dry_run: bool,
}

async fn run(
    session: &Session,
    mut orchestrator: TaskOrchestrator,
    dry_run: bool,
) -> HandledResult<()> {
    if dry_run {
        print_plan(&orchestrator);
        return Ok(());
    }
    let result = orchestrator.execute(&session.ctx).await;
    print_results(&orchestrator);
    result.handle_err(|e| eprintln!("{e}"))
}

/// Volume instances whose folder lists grew during the run, so that the topology file can be
/// updated to match.
fn report_provisioned(topology: &Topology) {
    for spec in topology.volumes().iter().filter(|s| s.config_changed()) {
        println!("{spec}: folders now");
        for folder in spec.folders() {
            println!(
                "    {} ({}, max {} volumes{})",
                folder.path,
                folder.disk_type,
                folder.max_volumes,
                folder
                    .device
                    .map(|d| format!(", {d}"))
                    .unwrap_or_default()
            );
        }
    }
}

pub async fn deploy(session: &Session, args: &DeployArgs) -> HandledResult<()> {
    let env = Arc::new(session.deploy_env(&session.topology));
    let orchestrator = plan::deploy(&session.topology, &env);
    let result = run(session, orchestrator, args.dry_run).await;
    report_provisioned(&session.topology);
    result
}

pub async fn upgrade(session: &Session, args: &UpgradeArgs) -> HandledResult<()> {
    let env = Arc::new(session.deploy_env(&session.topology));
    let orchestrator = plan::upgrade(
        &session.topology,
        &env,
        session.collector(),
        &args.version,
    );
    run(session, orchestrator, args.dry_run).await
}

pub async fn scale_out(session: &Session, args: &ScaleOutArgs) -> HandledResult<()> {
    let additions = Config::from_file(&args.file)
        .handle_err(|e| eprintln!("Could not load {}: {e}", args.file))?;
    let (merged, added) = session
        .topology
        .extend(&additions)
        .handle_err(|e| eprintln!("Cannot add instances from {}: {e}", args.file))?;

    if added.is_empty() {
        println!("{} lists no instances to add", args.file);
        return Ok(());
    }

    // The new instances are rendered against the merged topology, so new volumes and filers
    // learn about new masters too.
    let env = Arc::new(session.deploy_env(&merged));
    let orchestrator = plan::scale_out(&merged.global, &added, &env);
    let result = run(session, orchestrator, args.dry_run).await;
    report_provisioned(&merged);
    result
}
