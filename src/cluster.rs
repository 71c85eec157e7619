// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::*;

/// The distinct server responsibilities in the storage cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Volume,
    Filer,
    /// Edge proxy in front of the filers.
    Envoy,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Volume => "volume",
            Role::Filer => "filer",
            Role::Envoy => "envoy",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Role::Master => 9333,
            Role::Volume => 8080,
            Role::Filer => 8888,
            Role::Envoy => 8000,
        }
    }

    /// The name of the component in the binary repository.
    pub fn component_name(&self) -> &'static str {
        match self {
            Role::Envoy => "envoy",
            _ => "weed",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A storage folder on a volume host, either declared in the topology or provisioned from a raw
/// block device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderSpec {
    pub path: String,
    pub disk_type: String,
    /// Backing block device, when the folder was provisioned by this tool.
    pub device: Option<String>,
    pub uuid: Option<String>,
    pub max_volumes: u64,
}

impl From<&FolderConfig> for FolderSpec {
    fn from(conf: &FolderConfig) -> Self {
        FolderSpec {
            path: conf.path.clone(),
            disk_type: conf.disk_type.clone(),
            device: None,
            uuid: None,
            max_volumes: conf.max_volumes,
        }
    }
}

/// One instance of a role on a host/port. Identity is (role, host, port) and none of the identity
/// fields change once an operation has begun. The only mutable piece is the folder list of a volume
/// instance, which disk provisioning appends to.
#[derive(Debug)]
pub struct ComponentSpec {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub grpc_port: u16,
    pub data_dir: String,
    folders: Mutex<Vec<FolderSpec>>,

    /// Set when provisioning changed the folder list so the caller knows the configuration
    /// needs to be re-rendered and persisted.
    config_changed: Mutex<bool>,
}

/// The gRPC port of an instance sits this far above its listen port unless given explicitly.
pub const GRPC_PORT_OFFSET: u16 = 10000;

impl ComponentSpec {
    /// Ports above 55535 have no default gRPC port; set one with `with_grpc_port`.
    pub fn new(role: Role, host: &str, port: u16) -> Self {
        ComponentSpec {
            role,
            host: host.to_string(),
            port,
            grpc_port: port.saturating_add(GRPC_PORT_OFFSET),
            data_dir: format!("{}/{}-{}", crate::default_data_dir(), role, port),
            folders: Mutex::new(Vec::new()),
            config_changed: Mutex::new(false),
        }
    }

    pub fn with_data_dir(mut self, data_dir: &str) -> Self {
        self.data_dir = data_dir.to_string();
        self
    }

    pub fn with_grpc_port(mut self, grpc_port: u16) -> Self {
        self.grpc_port = grpc_port;
        self
    }

    pub fn with_folders(self, folders: Vec<FolderSpec>) -> Self {
        *self.folders.lock().unwrap() = folders;
        self
    }

    fn from_config(
        role: Role,
        conf: &ServerConfig,
        global: &GlobalOptions,
    ) -> Result<Self, ConfigError> {
        let port = conf.port.unwrap_or(role.default_port());
        let grpc_port = match conf.grpc_port {
            Some(grpc_port) => grpc_port,
            None => port
                .checked_add(GRPC_PORT_OFFSET)
                .ok_or_else(|| ConfigError::PortOutOfRange {
                    host: conf.host.clone(),
                    port,
                })?,
        };
        let data_dir = conf
            .data_dir
            .clone()
            .unwrap_or(format!("{}/{}-{}", global.data_dir, role, port));
        let mut spec = ComponentSpec::new(role, &conf.host, port)
            .with_grpc_port(grpc_port)
            .with_data_dir(&data_dir);
        if role == Role::Volume {
            spec = spec.with_folders(conf.folders.iter().map(FolderSpec::from).collect());
        }
        Ok(spec)
    }

    /// A stable identifier of the form `<role>-<host>-<port>`, also used as the service name.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.role, self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn folders(&self) -> Vec<FolderSpec> {
        self.folders.lock().unwrap().clone()
    }

    pub fn add_folders(&self, new_folders: Vec<FolderSpec>) {
        if new_folders.is_empty() {
            return;
        }
        self.folders.lock().unwrap().extend(new_folders);
        *self.config_changed.lock().unwrap() = true;
    }

    pub fn config_changed(&self) -> bool {
        *self.config_changed.lock().unwrap()
    }
}

impl fmt::Display for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.role, self.host, self.port)
    }
}

/// Topology is the typed, fully-resolved model of the cluster that the orchestration engine works
/// from.
#[derive(Debug)]
pub struct Topology {
    pub global: GlobalOptions,
    masters: Vec<Arc<ComponentSpec>>,
    volumes: Vec<Arc<ComponentSpec>>,
    filers: Vec<Arc<ComponentSpec>>,
    envoys: Vec<Arc<ComponentSpec>>,
}

impl Topology {
    pub fn new(global: GlobalOptions) -> Self {
        Topology {
            global,
            masters: Vec::new(),
            volumes: Vec::new(),
            filers: Vec::new(),
            envoys: Vec::new(),
        }
    }

    /// Load the topology file at `path` (or the default path) and resolve it.
    pub fn from_file(path: Option<String>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or(crate::default_config_path());
        Self::from_config(&Config::from_file(&path)?)
    }

    pub fn from_config(conf: &Config) -> Result<Self, ConfigError> {
        let mut topology = Topology::new(conf.global.clone());
        let roles = [
            (Role::Master, &conf.masters),
            (Role::Volume, &conf.volumes),
            (Role::Filer, &conf.filers),
            (Role::Envoy, &conf.envoys),
        ];
        for (role, servers) in roles {
            for server in servers.iter() {
                topology.add(ComponentSpec::from_config(role, server, &conf.global)?);
            }
        }
        topology.validate()?;
        Ok(topology)
    }

    /// Build the topology that results from adding the instances declared in `additions` to this
    /// one. The global options of `additions` are ignored. Returns the merged topology together
    /// with the new instances only, or an error if a new instance collides with an existing one.
    pub fn extend(
        &self,
        additions: &Config,
    ) -> Result<(Topology, Vec<Arc<ComponentSpec>>), ConfigError> {
        let mut merged = Topology {
            global: self.global.clone(),
            masters: self.masters.clone(),
            volumes: self.volumes.clone(),
            filers: self.filers.clone(),
            envoys: self.envoys.clone(),
        };
        let roles = [
            (Role::Master, &additions.masters),
            (Role::Volume, &additions.volumes),
            (Role::Filer, &additions.filers),
            (Role::Envoy, &additions.envoys),
        ];
        let mut added = Vec::new();
        for (role, servers) in roles {
            for server in servers.iter() {
                added.push(merged.add(ComponentSpec::from_config(role, server, &self.global)?));
            }
        }
        merged.validate()?;
        Ok((merged, added))
    }

    pub fn add(&mut self, spec: ComponentSpec) -> Arc<ComponentSpec> {
        let spec = Arc::new(spec);
        let list = match spec.role {
            Role::Master => &mut self.masters,
            Role::Volume => &mut self.volumes,
            Role::Filer => &mut self.filers,
            Role::Envoy => &mut self.envoys,
        };
        list.push(Arc::clone(&spec));
        spec
    }

    /// Check the structural invariants the orchestration engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.masters.is_empty() {
            return Err(ConfigError::NoMasters);
        }
        let mut identities = HashSet::new();
        let mut ports = HashSet::new();
        for spec in self.components() {
            if !identities.insert((spec.role, spec.host.clone(), spec.port)) {
                return Err(ConfigError::Duplicate {
                    role: spec.role.to_string(),
                    host: spec.host.clone(),
                    port: spec.port,
                });
            }
            for port in [spec.port, spec.grpc_port] {
                if !ports.insert((spec.host.clone(), port)) {
                    return Err(ConfigError::PortConflict {
                        host: spec.host.clone(),
                        port,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn masters(&self) -> &[Arc<ComponentSpec>] {
        &self.masters
    }

    pub fn volumes(&self) -> &[Arc<ComponentSpec>] {
        &self.volumes
    }

    pub fn filers(&self) -> &[Arc<ComponentSpec>] {
        &self.filers
    }

    pub fn envoys(&self) -> &[Arc<ComponentSpec>] {
        &self.envoys
    }

    /// All instances, in deployment order of their roles.
    pub fn components(&self) -> impl Iterator<Item = &Arc<ComponentSpec>> {
        self.masters
            .iter()
            .chain(self.volumes.iter())
            .chain(self.filers.iter())
            .chain(self.envoys.iter())
    }

    pub fn by_role(&self, role: Role) -> &[Arc<ComponentSpec>] {
        match role {
            Role::Master => &self.masters,
            Role::Volume => &self.volumes,
            Role::Filer => &self.filers,
            Role::Envoy => &self.envoys,
        }
    }

    pub fn master_addresses(&self) -> Vec<String> {
        self.masters.iter().map(|m| m.address()).collect()
    }

    pub fn find(&self, role: Role, host: &str, port: u16) -> Option<&Arc<ComponentSpec>> {
        self.by_role(role)
            .iter()
            .find(|spec| spec.host == host && spec.port == port)
    }

    pub fn num_components(&self) -> usize {
        self.components().count()
    }
}
