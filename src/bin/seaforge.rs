// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use seaforge_lib::commands::{self, Cli};

/// The seaforge binary deploys, upgrades, scales out and reports on a storage cluster.
fn main() {
    let args = Cli::parse();

    let default_filter = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("SEAFORGE_LOG", default_filter),
    )
    .init();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
