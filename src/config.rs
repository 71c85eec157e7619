// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use serde::{Deserialize, Serialize};

use crate::task::RollbackScope;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file \"{path}\": {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("topology must contain at least one master")]
    NoMasters,

    #[error("{role} instance {host}:{port} is declared more than once")]
    Duplicate {
        role: String,
        host: String,
        port: u16,
    },

    #[error("port {port} on host {host} is used by more than one instance")]
    PortConflict { host: String, port: u16 },

    #[error("port {port} on host {host} leaves no room for a default grpc port; set grpc_port")]
    PortOutOfRange { host: String, port: u16 },
}

/// Config, along with its children GlobalOptions, ServerConfig and FolderConfig, is the model for
/// a storage cluster as it is written in the topology file. The file is deserialized into a
/// Config object.
///
/// As with the cluster state kept in memory, the file model is intentionally decoupled from the
/// typed topology in `cluster`, which has every default resolved.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalOptions,
    #[serde(default)]
    pub masters: Vec<ServerConfig>,
    #[serde(default)]
    pub volumes: Vec<ServerConfig>,
    #[serde(default)]
    pub filers: Vec<ServerConfig>,
    #[serde(default)]
    pub envoys: Vec<ServerConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalOptions {
    /// Component version to deploy.
    pub version: String,
    pub install_dir: String,
    pub config_dir: String,
    pub data_dir: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub identity_file: Option<String>,
    pub volume_size_limit_mb: u64,
    pub auto_provision_disks: bool,
    pub device_prefixes: Vec<String>,
    pub max_parallelism: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub command_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub rollback_scope: RollbackScope,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        GlobalOptions {
            version: "latest".to_string(),
            install_dir: crate::default_install_dir(),
            config_dir: crate::default_config_dir(),
            data_dir: crate::default_data_dir(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            identity_file: None,
            volume_size_limit_mb: 5000,
            auto_provision_disks: false,
            device_prefixes: vec!["/dev/sd".to_string(), "/dev/nvme".to_string()],
            max_parallelism: 16,
            max_retries: 2,
            retry_delay_ms: 2000,
            command_timeout_secs: 300,
            health_timeout_secs: 60,
            rollback_scope: RollbackScope::Phase,
        }
    }
}

/// One server instance entry. Anything left out is filled in from the role defaults and
/// `GlobalOptions` when the typed topology is built.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    pub host: String,
    pub port: Option<u16>,
    pub grpc_port: Option<u16>,
    pub data_dir: Option<String>,
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FolderConfig {
    pub path: String,
    #[serde(default = "default_disk_type")]
    pub disk_type: String,
    #[serde(default)]
    pub max_volumes: u64,
}

fn default_disk_type() -> String {
    "hdd".to_string()
}
