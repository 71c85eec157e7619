// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::StatusCode,
    serde::{Deserialize, Serialize},
};

use crate::cluster::{ComponentSpec, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// No health check was performed.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub state: HealthState,
    pub detail: String,
}

impl HealthReport {
    pub fn healthy(detail: &str) -> Self {
        HealthReport {
            state: HealthState::Healthy,
            detail: detail.to_string(),
        }
    }

    pub fn unhealthy(detail: &str) -> Self {
        HealthReport {
            state: HealthState::Unhealthy,
            detail: detail.to_string(),
        }
    }
}

/// A role-specific readiness check against a running instance.
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    async fn check(&self, spec: &ComponentSpec) -> HealthReport;
}

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks instances over HTTP:
///
/// - master: `/cluster/status`
/// - volume: `/status`
/// - filer: `/`, where 403 counts as healthy too since the filer may require authentication
/// - envoy: `/ready` on the admin port
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpHealthProbe { client })
    }

    pub fn url(spec: &ComponentSpec) -> String {
        match spec.role {
            Role::Master => format!("http://{}:{}/cluster/status", spec.host, spec.port),
            Role::Volume => format!("http://{}:{}/status", spec.host, spec.port),
            Role::Filer => format!("http://{}:{}/", spec.host, spec.port),
            Role::Envoy => format!("http://{}:{}/ready", spec.host, spec.grpc_port),
        }
    }

    fn is_healthy(role: Role, status: StatusCode) -> bool {
        match role {
            Role::Filer => status == StatusCode::OK || status == StatusCode::FORBIDDEN,
            _ => status == StatusCode::OK,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, spec: &ComponentSpec) -> HealthReport {
        let url = Self::url(spec);
        match self.client.get(&url).send().await {
            Ok(response) if Self::is_healthy(spec.role, response.status()) => {
                HealthReport::healthy(&format!("{url}: {}", response.status()))
            }
            Ok(response) => HealthReport::unhealthy(&format!("{url}: {}", response.status())),
            Err(e) => HealthReport::unhealthy(&format!("{url}: {e}")),
        }
    }
}
