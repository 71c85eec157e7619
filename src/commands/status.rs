// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{handled_error, Handle, HandledResult, Session};
use crate::status::{ClusterState, ClusterStatus};

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Print the status as JSON.
    #[arg(long)]
    json: bool,

    /// Include cpu, memory and uptime of each running instance.
    #[arg(short, long)]
    metrics: bool,

    /// Exit non-zero unless the whole cluster is running and healthy.
    #[arg(long)]
    check: bool,
}

pub async fn status(session: &Session, args: &StatusArgs) -> HandledResult<()> {
    let status = session
        .collector()
        .with_metrics(args.metrics)
        .collect(&session.topology)
        .await;

    if args.json {
        let json = serde_json::to_string_pretty(&status)
            .handle_err(|e| eprintln!("Could not serialize status: {e}"))?;
        println!("{json}");
    } else {
        print_status(&status);
    }

    if args.check && status.state != ClusterState::Running {
        return handled_error();
    }
    Ok(())
}

fn print_status(status: &ClusterStatus) {
    for c in status.components.iter() {
        let pid = c.pid.map(|p| p.to_string()).unwrap_or("-".to_string());
        print!(
            "{:<8} {:<32} {:<8} {:<10} pid={pid}",
            c.role.to_string(),
            format!("{}:{}", c.host, c.port),
            format!("{:?}", c.process).to_lowercase(),
            format!("{:?}", c.health).to_lowercase(),
        );
        if let Some(m) = &c.metrics {
            print!(
                " cpu={:.1}% mem={:.1}% rss={}KiB up={}s",
                m.cpu_percent, m.mem_percent, m.rss_kb, m.uptime_secs
            );
        }
        match &c.message {
            Some(message) => println!(" ({message})"),
            None => println!(),
        }
    }

    let summary = status.summary();
    println!(
        "cluster {}: {} instances, {} running, {} healthy, {} stopped, {} unreachable",
        status.state,
        summary.total,
        summary.running,
        summary.healthy,
        summary.stopped,
        summary.errors
    );
    for (role, counts) in summary.by_role.iter() {
        println!(
            "    {role}: {}/{} healthy, {} running",
            counts.healthy, counts.total, counts.running
        );
    }
}
