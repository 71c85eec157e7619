// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod component;
pub mod config;
pub mod executor;
pub mod plan;
pub mod provision;
pub mod status;
pub mod task;
pub mod test_env;

pub fn default_config_path() -> String {
    match std::env::var("SEAFORGE_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/seaforge/cluster.toml".to_string(),
    }
}

/// Gets the local directory under which versioned component binaries are installed, laid out as
/// `<repo>/<component>/<version>/<component>`.
pub fn default_repository() -> String {
    match std::env::var("SEAFORGE_REPO") {
        Ok(repo) => repo,
        Err(_) => "/var/lib/seaforge/repository".to_string(),
    }
}

pub fn default_install_dir() -> String {
    "/opt/seaforge".to_string()
}

pub fn default_config_dir() -> String {
    "/etc/seaforge".to_string()
}

pub fn default_data_dir() -> String {
    "/var/lib/seaforge/data".to_string()
}
