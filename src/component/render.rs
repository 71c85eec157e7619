// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Rendering of the on-disk files of an instance: its role configuration and its service unit.

use crate::cluster::{ComponentSpec, FolderSpec, Role};

use super::InstanceLayout;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RenderError {
    #[error("{0} needs at least one master address")]
    NoMasters(String),

    #[error("{0} needs at least one filer to proxy to")]
    NoFilers(String),
}

pub struct RenderInput<'a> {
    pub spec: &'a ComponentSpec,
    pub layout: &'a InstanceLayout,
    pub masters: &'a [String],
    pub filers: &'a [String],
    pub volume_size_limit_mb: u64,
}

/// Produces the text of the files an instance needs. Implementations are pure: the same input
/// always renders the same text.
pub trait ConfigRenderer: Send + Sync + std::fmt::Debug {
    fn render_config(&self, input: &RenderInput) -> Result<String, RenderError>;

    fn render_unit(&self, input: &RenderInput) -> Result<String, RenderError>;
}

/// Renders `-options` files (one `flag=value` per line) for the storage roles, a static bootstrap
/// for the edge proxy, and a plain systemd unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRenderer;

impl DefaultRenderer {
    fn storage_options(input: &RenderInput) -> Result<Vec<(String, String)>, RenderError> {
        let spec = input.spec;
        let mut options = vec![
            ("ip".to_string(), spec.host.clone()),
            ("port".to_string(), spec.port.to_string()),
            ("port.grpc".to_string(), spec.grpc_port.to_string()),
        ];

        if input.masters.is_empty() {
            return Err(RenderError::NoMasters(spec.to_string()));
        }
        let masters = input.masters.join(",");

        match spec.role {
            Role::Master => {
                options.push(("mdir".to_string(), input.layout.data_dir.clone()));
                options.push(("peers".to_string(), masters));
                options.push((
                    "volumeSizeLimitMB".to_string(),
                    input.volume_size_limit_mb.to_string(),
                ));
            }
            Role::Volume => {
                let folders = spec.folders();
                options.push(("mserver".to_string(), masters));
                if folders.is_empty() {
                    options.push(("dir".to_string(), input.layout.data_dir.clone()));
                    options.push(("max".to_string(), "0".to_string()));
                } else {
                    let join = |f: fn(&FolderSpec) -> String| {
                        folders.iter().map(f).collect::<Vec<_>>().join(",")
                    };
                    options.push(("dir".to_string(), join(|f| f.path.clone())));
                    options.push(("max".to_string(), join(|f| f.max_volumes.to_string())));
                    options.push(("disk".to_string(), join(|f| f.disk_type.clone())));
                }
            }
            Role::Filer => {
                options.push(("master".to_string(), masters));
                options.push(("defaultStoreDir".to_string(), input.layout.data_dir.clone()));
            }
            Role::Envoy => unreachable!("envoy has no storage options"),
        }
        Ok(options)
    }

    fn envoy_bootstrap(input: &RenderInput) -> Result<String, RenderError> {
        let spec = input.spec;
        if input.filers.is_empty() {
            return Err(RenderError::NoFilers(spec.to_string()));
        }

        let mut endpoints = String::new();
        for filer in input.filers.iter() {
            let (address, port) = filer.rsplit_once(':').unwrap_or((filer.as_str(), "8888"));
            endpoints.push_str(&format!(
                "        - endpoint:\n            address:\n              socket_address: {{ address: {address}, port_value: {port} }}\n"
            ));
        }

        Ok(format!(
            "admin:
  address:
    socket_address: {{ address: 0.0.0.0, port_value: {admin} }}
static_resources:
  listeners:
  - name: filer
    address:
      socket_address: {{ address: 0.0.0.0, port_value: {port} }}
    filter_chains:
    - filters:
      - name: envoy.filters.network.tcp_proxy
        typed_config:
          \"@type\": type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy
          stat_prefix: filer
          cluster: filers
  clusters:
  - name: filers
    connect_timeout: 5s
    type: STRICT_DNS
    lb_policy: ROUND_ROBIN
    load_assignment:
      cluster_name: filers
      endpoints:
      - lb_endpoints:
{endpoints}",
            admin = spec.grpc_port,
            port = spec.port,
        ))
    }
}

impl ConfigRenderer for DefaultRenderer {
    fn render_config(&self, input: &RenderInput) -> Result<String, RenderError> {
        if input.spec.role == Role::Envoy {
            return Self::envoy_bootstrap(input);
        }
        let mut text = String::new();
        for (key, value) in Self::storage_options(input)? {
            text.push_str(&format!("{key}={value}\n"));
        }
        Ok(text)
    }

    fn render_unit(&self, input: &RenderInput) -> Result<String, RenderError> {
        let layout = input.layout;
        let exec_start = match input.spec.role {
            Role::Envoy => format!("{} -c {}", layout.binary, layout.config_file),
            role => format!("{} {role} -options={}", layout.binary, layout.config_file),
        };
        Ok(format!(
            "[Unit]
Description=seaforge {spec}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={exec_start}
WorkingDirectory={data_dir}
Restart=on-failure
RestartSec=5
LimitNOFILE=1048576

[Install]
WantedBy=multi-user.target
",
            spec = input.spec,
            data_dir = layout.data_dir,
        ))
    }
}
