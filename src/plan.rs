// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Builders that turn a topology into the phases of a deploy, upgrade or scale-out.
//!
//! Phase order is fixed by role: volumes and filers need a reachable master when they start, and
//! the edge proxies need filers to forward to. Masters always go one at a time; the other roles
//! are independent of their peers and run as parallel groups.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ComponentSpec, Role, Topology};
use crate::component::{DeployEnv, DeployTask, ScaleOutTask, UpgradeTask};
use crate::config::GlobalOptions;
use crate::status::{HealthGate, StatusCollector};
use crate::task::{TaskGroup, TaskOrchestrator};

const ROLES: [Role; 4] = [Role::Master, Role::Volume, Role::Filer, Role::Envoy];

fn group(name: &str, role: Role, global: &GlobalOptions) -> TaskGroup {
    let group = match role {
        Role::Master => TaskGroup::sequential(name),
        _ => TaskGroup::parallel(name).with_max_parallelism(global.max_parallelism),
    };
    group.with_retries(
        global.max_retries,
        Duration::from_millis(global.retry_delay_ms),
    )
}

fn orchestrator(global: &GlobalOptions) -> TaskOrchestrator {
    TaskOrchestrator::new().with_rollback_scope(global.rollback_scope)
}

/// Deploy every instance of the topology. When the environment carries a disk provisioner, the
/// first volume instance on each host provisions that host's disks, so that no two passes run
/// against the same host at once.
pub fn deploy(topology: &Topology, env: &Arc<DeployEnv>) -> TaskOrchestrator {
    let global = &topology.global;
    let mut orchestrator = orchestrator(global);
    let mut provisioned_hosts = HashSet::new();

    for role in ROLES {
        let mut phase = group(&format!("deploy-{role}"), role, global);
        for spec in topology.by_role(role) {
            let provision = role == Role::Volume
                && env.provisioner.is_some()
                && provisioned_hosts.insert(spec.host.clone());
            let task = DeployTask::new(Arc::clone(spec), Arc::clone(env))
                .with_disk_provisioning(provision);
            phase.add_task(Arc::new(task));
        }
        orchestrator.add_group(phase);
    }
    orchestrator
}

/// Upgrade every instance to `version`, role by role, after a gate phase that requires the whole
/// cluster to be healthy.
pub fn upgrade(
    topology: &Arc<Topology>,
    env: &Arc<DeployEnv>,
    collector: StatusCollector,
    version: &str,
) -> TaskOrchestrator {
    let global = &topology.global;
    let mut orchestrator = orchestrator(global);

    let mut gate = TaskGroup::sequential("health-gate");
    gate.add_task(Arc::new(HealthGate::new(Arc::clone(topology), collector)));
    orchestrator.add_group(gate);

    for role in ROLES {
        let mut phase = group(&format!("upgrade-{role}"), role, global);
        for spec in topology.by_role(role) {
            let task = UpgradeTask::new(Arc::clone(spec), Arc::clone(env), version);
            phase.add_task(Arc::new(task));
        }
        orchestrator.add_group(phase);
    }
    orchestrator
}

/// Deploy `added` into a running cluster, one scale-out phase per role. `added` is the list
/// returned by [`Topology::extend`], which has already checked it against the existing instances.
pub fn scale_out(
    global: &GlobalOptions,
    added: &[Arc<ComponentSpec>],
    env: &Arc<DeployEnv>,
) -> TaskOrchestrator {
    let mut orchestrator = orchestrator(global);

    for role in ROLES {
        let specs: Vec<Arc<ComponentSpec>> = added
            .iter()
            .filter(|spec| spec.role == role)
            .cloned()
            .collect();
        if specs.is_empty() {
            continue;
        }
        let mut phase = TaskGroup::sequential(&format!("scale-out-{role}")).with_retries(
            global.max_retries,
            Duration::from_millis(global.retry_delay_ms),
        );
        phase.add_task(Arc::new(ScaleOutTask::new(
            role.as_str(),
            specs,
            Arc::clone(env),
        )));
        orchestrator.add_group(phase);
    }
    orchestrator
}
