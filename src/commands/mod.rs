// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod deploy;
pub mod provision;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use {
    clap::{Parser, Subcommand},
    log::warn,
    tokio_util::sync::CancellationToken,
};

use {
    deploy::{DeployArgs, ScaleOutArgs, UpgradeArgs},
    provision::ProvisionArgs,
    status::StatusArgs,
};

use crate::cluster::Topology;
use crate::component::{DeployEnv, LocalRepository};
use crate::executor::{Executor, LocalExecutor, SshExecutor, SshOptions};
use crate::status::{HealthProbe, HttpHealthProbe, StatusCollector, DEFAULT_PROBE_TIMEOUT};
use crate::task::{TaskContext, TaskOrchestrator};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code normally reports the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Cluster topology file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run every command through the local shell instead of over ssh.
    #[arg(long, global = true)]
    pub local: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install and start every instance in the topology.
    Deploy(DeployArgs),
    /// Move every instance to a new version.
    Upgrade(UpgradeArgs),
    /// Add the instances listed in a file to the running cluster.
    ScaleOut(ScaleOutArgs),
    Status(StatusArgs),
    /// Provision the raw disks of one volume host.
    Provision(ProvisionArgs),
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        let session = Session::new(cli)?;
        let result = match &cli.command {
            Commands::Deploy(args) => deploy::deploy(&session, args).await,
            Commands::Upgrade(args) => deploy::upgrade(&session, args).await,
            Commands::ScaleOut(args) => deploy::scale_out(&session, args).await,
            Commands::Status(args) => status::status(&session, args).await,
            Commands::Provision(args) => provision::provision(&session, args).await,
        };
        session.close().await;
        result
    })
}

/// What every subcommand works with: the loaded topology and a context for reaching its hosts.
/// Interrupting the process cancels the context, which aborts in-flight commands.
pub struct Session {
    pub topology: Arc<Topology>,
    pub ctx: TaskContext,
    pub probe: Arc<dyn HealthProbe>,
}

impl Session {
    fn new(cli: &Cli) -> HandledResult<Self> {
        let topology = Topology::from_file(cli.config.clone())
            .handle_err(|e| eprintln!("Could not load cluster topology: {e}"))?;

        let executor: Arc<dyn Executor> = if cli.local {
            let timeout = Duration::from_secs(topology.global.command_timeout_secs);
            Arc::new(LocalExecutor::new().with_timeout(timeout))
        } else {
            Arc::new(
                SshExecutor::new(SshOptions::from(&topology.global))
                    .handle_err(|e| eprintln!("Could not set up ssh: {e}"))?,
            )
        };

        let probe = HttpHealthProbe::new(DEFAULT_PROBE_TIMEOUT)
            .handle_err(|e| eprintln!("Could not create http client: {e}"))?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                on_interrupt.cancel();
            }
        });

        Ok(Session {
            topology: Arc::new(topology),
            ctx: TaskContext::new(executor).with_cancel(cancel),
            probe: Arc::new(probe),
        })
    }

    pub fn deploy_env(&self, topology: &Topology) -> DeployEnv {
        let repository = Arc::new(LocalRepository::new(crate::default_repository()));
        DeployEnv::new(topology, repository, Arc::clone(&self.probe))
    }

    pub fn collector(&self) -> StatusCollector {
        StatusCollector::new(self.ctx.clone(), &self.topology.global)
            .with_probe(Arc::clone(&self.probe))
    }

    async fn close(&self) {
        self.ctx.executor.close().await;
    }
}

/// Print one line per recorded task result.
pub fn print_results(orchestrator: &TaskOrchestrator) {
    for result in orchestrator.results() {
        let outcome = if result.success { "OK" } else { "FAILED" };
        let attempts = match result.attempts {
            1 => "1 attempt".to_string(),
            n => format!("{n} attempts"),
        };
        print!(
            "{outcome}: {} ({attempts}, {:.1}s)",
            result.description,
            result.duration.as_secs_f64()
        );
        match &result.error {
            Some(e) => println!(": {e}"),
            None => println!(),
        }
    }
}

/// Print the phases of a plan without running it.
pub fn print_plan(orchestrator: &TaskOrchestrator) {
    for (i, group) in orchestrator.groups().iter().enumerate() {
        println!(
            "phase {}: {} ({}, {} task(s))",
            i + 1,
            group.name(),
            if group.is_parallel() { "parallel" } else { "sequential" },
            group.len()
        );
        for description in group.descriptions() {
            println!("    {description}");
        }
    }
}
