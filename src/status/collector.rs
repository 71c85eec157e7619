// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use {
    log::{debug, warn},
    tokio::sync::{mpsc, Semaphore},
};

use crate::cluster::{ComponentSpec, Topology};
use crate::component::InstanceLayout;
use crate::config::GlobalOptions;
use crate::executor::ExecError;
use crate::task::{TaskContext, DEFAULT_MAX_PARALLELISM};

use super::{ClusterStatus, ComponentStatus, HealthProbe, HealthState, ProcessState, ResourceMetrics};

/// Checks every instance of a topology concurrently and assembles a [`ClusterStatus`].
///
/// For each instance the collector looks up the process on its host, and if it is running,
/// optionally samples its resource usage and asks the health probe about it. A failure to reach
/// a host shows up as a [`ProcessState::Error`] entry for the instances on it; it never fails the
/// collection as a whole.
#[derive(Debug, Clone)]
pub struct StatusCollector {
    ctx: TaskContext,
    global: GlobalOptions,
    probe: Option<Arc<dyn HealthProbe>>,
    collect_metrics: bool,
    max_parallelism: usize,
}

impl StatusCollector {
    pub fn new(ctx: TaskContext, global: &GlobalOptions) -> Self {
        StatusCollector {
            ctx,
            max_parallelism: if global.max_parallelism == 0 {
                DEFAULT_MAX_PARALLELISM
            } else {
                global.max_parallelism
            },
            global: global.clone(),
            probe: None,
            collect_metrics: false,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_metrics(mut self, collect_metrics: bool) -> Self {
        self.collect_metrics = collect_metrics;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    pub async fn collect(&self, topology: &Topology) -> ClusterStatus {
        let specs: Vec<Arc<ComponentSpec>> = topology.components().cloned().collect();
        let expected = specs.len();

        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let (status_tx, mut status_rx) = mpsc::channel::<(usize, ComponentStatus)>(expected.max(1));
        let (error_tx, mut error_rx) = mpsc::channel::<(usize, String)>(expected.max(1));

        for (index, spec) in specs.iter().enumerate() {
            let this = self.clone();
            let spec = Arc::clone(spec);
            let semaphore = Arc::clone(&semaphore);
            let status_tx = status_tx.clone();
            let error_tx = error_tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                match this.check(&spec).await {
                    Ok(status) => {
                        let _ = status_tx.send((index, status)).await;
                    }
                    Err(e) => {
                        let _ = error_tx.send((index, e.to_string())).await;
                    }
                }
            });
        }
        drop(status_tx);
        drop(error_tx);

        let mut slots: Vec<Option<ComponentStatus>> = vec![None; expected];
        let mut received = 0;
        while received < expected {
            tokio::select! {
                Some((index, status)) = status_rx.recv() => {
                    slots[index] = Some(status);
                    received += 1;
                }
                Some((index, message)) = error_rx.recv() => {
                    warn!("could not check {}: {message}", specs[index]);
                    let mut status =
                        ComponentStatus::new(&specs[index], ProcessState::Error, HealthState::Unknown);
                    status.message = Some(message);
                    slots[index] = Some(status);
                    received += 1;
                }
                else => break,
            }
        }

        // A worker that went away without reporting (it panicked) leaves its slot empty.
        let components = slots
            .into_iter()
            .zip(specs.iter())
            .map(|(slot, spec)| {
                slot.unwrap_or_else(|| {
                    let mut status =
                        ComponentStatus::new(spec, ProcessState::Error, HealthState::Unknown);
                    status.message = Some("status check did not complete".to_string());
                    status
                })
            })
            .collect();

        ClusterStatus::new(components)
    }

    async fn check(&self, spec: &ComponentSpec) -> Result<ComponentStatus, ExecError> {
        let layout = InstanceLayout::new(&self.global, spec);
        let Some(pid) = self.find_pid(spec, &layout).await? else {
            return Ok(ComponentStatus::new(
                spec,
                ProcessState::Stopped,
                HealthState::Unhealthy,
            ));
        };

        let mut status = ComponentStatus::new(spec, ProcessState::Running, HealthState::Unknown);
        status.pid = Some(pid);

        if self.collect_metrics {
            match self.metrics(&spec.host, pid).await {
                Ok(metrics) => status.metrics = metrics,
                Err(e) => debug!("{spec}: no metrics: {e}"),
            }
        }

        if let Some(probe) = &self.probe {
            let report = probe.check(spec).await;
            status.health = report.state;
            if report.state != HealthState::Healthy {
                status.message = Some(report.detail);
            }
        }
        Ok(status)
    }

    /// The main pid of the instance's service, or None when the supervisor has no process for it.
    async fn find_pid(
        &self,
        spec: &ComponentSpec,
        layout: &InstanceLayout,
    ) -> Result<Option<u32>, ExecError> {
        let command = format!("systemctl show -p MainPID --value {}", layout.service);
        let output = self.ctx.run(&spec.host, &command).await?;
        Ok(output.trim().parse::<u32>().ok().filter(|pid| *pid != 0))
    }

    async fn metrics(&self, host: &str, pid: u32) -> Result<Option<ResourceMetrics>, ExecError> {
        let output = self
            .ctx
            .run(host, &format!("ps -o %cpu=,%mem=,rss=,etimes= -p {pid}"))
            .await?;
        Ok(parse_ps(&output))
    }
}

/// Parse one line of `ps -o %cpu=,%mem=,rss=,etimes=`.
fn parse_ps(output: &str) -> Option<ResourceMetrics> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    Some(ResourceMetrics {
        cpu_percent: fields[0].parse().ok()?,
        mem_percent: fields[1].parse().ok()?,
        rss_kb: fields[2].parse().ok()?,
        uptime_secs: fields[3].parse().ok()?,
    })
}
