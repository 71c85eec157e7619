// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::runtime::Runtime;

    use seaforge_lib::{
        cluster::{Role, Topology},
        component::{
            ConfigRenderer, DefaultRenderer, DeployEnv, PollOptions, RenderError, RenderInput,
            UpgradeTask,
        },
        config::{Config, ConfigError},
        plan,
        provision::{device::LSBLK_COMMAND, DiskProvisioner, ProvisionOptions, GIB},
        status::StatusCollector,
        task::{GroupError, OrchestratorError, Task, TaskContext, TaskError},
        test_env::*,
    };

    const CLUSTER: &str = r#"
[global]
version = "3.79"
max_retries = 1
retry_delay_ms = 0

[[masters]]
host = "m1"

[[volumes]]
host = "v1"

[[volumes]]
host = "v2"

[[filers]]
host = "f1"
"#;

    fn topology(toml: &str) -> Topology {
        Topology::from_config(&Config::from_toml(toml).unwrap()).unwrap()
    }

    fn fast_poll() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        }
    }

    fn env(topology: &Topology, probe: &Arc<MockProbe>) -> Arc<DeployEnv> {
        Arc::new(
            DeployEnv::new(topology, Arc::new(StaticRepository::new()), probe.clone())
                .with_poll(fast_poll()),
        )
    }

    /// The position of the first and last commands that ran on `host`.
    fn span(executor: &MockExecutor, host: &str) -> (usize, usize) {
        let positions: Vec<usize> = executor
            .journal()
            .iter()
            .enumerate()
            .filter(|(_, (h, _))| h == host)
            .map(|(i, _)| i)
            .collect();
        (positions[0], *positions.last().unwrap())
    }

    #[test]
    fn topology_defaults() {
        let topology = topology(CLUSTER);

        assert_eq!(topology.num_components(), 4);
        let master = &topology.masters()[0];
        assert_eq!(master.port, 9333);
        assert_eq!(master.grpc_port, 19333);
        assert_eq!(master.data_dir, "/var/lib/seaforge/data/master-9333");
        assert_eq!(master.id(), "master-m1-9333");
        assert_eq!(topology.volumes()[1].address(), "v2:8080");
        assert_eq!(topology.filers()[0].port, 8888);
        assert_eq!(topology.master_addresses(), vec!["m1:9333"]);
        assert!(topology.find(Role::Volume, "v2", 8080).is_some());
        assert_eq!(topology.global.max_retries, 1);
        assert_eq!(topology.global.volume_size_limit_mb, 5000);
    }

    #[test]
    fn topology_validation() {
        let no_masters = Config::from_toml("[[volumes]]\nhost = \"v1\"\n").unwrap();
        assert!(matches!(
            Topology::from_config(&no_masters),
            Err(ConfigError::NoMasters)
        ));

        let duplicate = Config::from_toml(
            "[[masters]]\nhost = \"m1\"\n[[masters]]\nhost = \"m1\"\nport = 9333\n",
        )
        .unwrap();
        assert!(matches!(
            Topology::from_config(&duplicate),
            Err(ConfigError::Duplicate { .. })
        ));

        // The volume listens on the master's grpc port.
        let conflict = Config::from_toml(
            "[[masters]]\nhost = \"m1\"\n[[volumes]]\nhost = \"m1\"\nport = 19333\n",
        )
        .unwrap();
        assert!(matches!(
            Topology::from_config(&conflict),
            Err(ConfigError::PortConflict { port: 19333, .. })
        ));

        // No default grpc port fits above 55535.
        let high = Config::from_toml("[[masters]]\nhost = \"m1\"\nport = 60000\n").unwrap();
        assert!(matches!(
            Topology::from_config(&high),
            Err(ConfigError::PortOutOfRange { port: 60000, .. })
        ));
        let explicit = Config::from_toml(
            "[[masters]]\nhost = \"m1\"\nport = 60000\ngrpc_port = 61000\n",
        )
        .unwrap();
        let topology = Topology::from_config(&explicit).unwrap();
        assert_eq!(topology.masters()[0].grpc_port, 61000);

        assert!(matches!(
            Config::from_toml("[[masters]]\nport = \"x\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn deploy_cluster() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        let ctx = TaskContext::new(executor.clone());

        let mut orchestrator = plan::deploy(&topology, &env(&topology, &probe));

        let names: Vec<&str> = orchestrator.groups().iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["deploy-master", "deploy-volume", "deploy-filer"]);
        assert!(!orchestrator.groups()[0].is_parallel());
        assert!(orchestrator.groups()[1].is_parallel());
        assert!(orchestrator.groups()[2].is_parallel());

        let rt = Runtime::new().unwrap();
        rt.block_on(orchestrator.execute(&ctx)).unwrap();

        let results: Vec<_> = orchestrator.results().collect();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.success));
        assert!(results.iter().all(|r| r.task_id.starts_with("deploy-")));

        // Masters are fully up before any volume is touched.
        let (_, master_last) = span(&executor, "m1");
        for host in ["v1", "v2", "f1"] {
            assert!(span(&executor, host).0 > master_last);
        }

        let options = executor
            .file("m1", "/etc/seaforge/master-m1-9333/master.options")
            .unwrap();
        assert!(options.contains("port=9333\n"));
        assert!(options.contains("peers=m1:9333\n"));
        assert!(options.contains("volumeSizeLimitMB=5000\n"));

        let options = executor
            .file("v2", "/etc/seaforge/volume-v2-8080/volume.options")
            .unwrap();
        assert!(options.contains("mserver=m1:9333\n"));
        assert!(options.contains("dir=/var/lib/seaforge/data/volume-8080\n"));

        let unit = executor
            .file("f1", "/etc/systemd/system/seaforge-filer-f1-8888.service")
            .unwrap();
        assert!(unit.contains(
            "ExecStart=/opt/seaforge/filer-f1-8888/weed filer \
             -options=/etc/seaforge/filer-f1-8888/filer.options"
        ));

        assert!(executor.ran("put_file /repo/weed/3.79/weed /opt/seaforge/volume-v1-8080/weed"));
        assert!(executor.ran("systemctl enable seaforge-volume-v1-8080"));
        assert!(executor.ran("systemctl start seaforge-filer-f1-8888"));
    }

    #[test]
    fn deploy_with_envoy_phase() {
        let topology = topology(&format!("{CLUSTER}\n[[envoys]]\nhost = \"e1\"\n"));
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());

        let mut orchestrator = plan::deploy(&topology, &env(&topology, &probe));
        assert_eq!(orchestrator.groups().len(), 4);

        let rt = Runtime::new().unwrap();
        rt.block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap();

        let bootstrap = executor
            .file("e1", "/etc/seaforge/envoy-e1-8000/envoy.yaml")
            .unwrap();
        assert!(bootstrap.contains("socket_address: { address: f1, port_value: 8888 }"));
        assert!(executor.ran("put_file /repo/envoy/3.79/envoy"));
        assert!(span(&executor, "e1").0 > span(&executor, "f1").1);
    }

    #[test]
    fn deploy_provisions_each_host_once() {
        let topology = topology(
            r#"
[global]
retry_delay_ms = 0
auto_provision_disks = true

[[masters]]
host = "m1"

[[volumes]]
host = "v1"
port = 8080

[[volumes]]
host = "v1"
port = 8081
"#,
        );
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor
            .on(
                LSBLK_COMMAND,
                Reply::ok(&format!(
                    r#"{{"blockdevices":[{{"name":"sdb","path":"/dev/sdb","size":{},"type":"disk"}}]}}"#,
                    100 * GIB
                )),
            )
            .on("blkid -o export", Reply::fail(2))
            .on("blkid -s UUID", Reply::ok("uuid-sdb"))
            .on("grep -q '^UUID=", Reply::fail(1))
            .on("mountpoint -q", Reply::fail(1));

        let mut options = ProvisionOptions::from(&topology.global);
        options.settle_delay = Duration::ZERO;
        let env = DeployEnv::new(&topology, Arc::new(StaticRepository::new()), probe.clone())
            .with_poll(fast_poll())
            .with_provisioner(Some(DiskProvisioner::new(options)));
        let mut orchestrator = plan::deploy(&topology, &Arc::new(env));

        let rt = Runtime::new().unwrap();
        rt.block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap();

        assert_eq!(executor.count(LSBLK_COMMAND), 1);
        let first = topology.find(Role::Volume, "v1", 8080).unwrap();
        assert!(first.config_changed());
        let options = executor
            .file("v1", "/etc/seaforge/volume-v1-8080/volume.options")
            .unwrap();
        assert!(options.contains("dir=/data1\n"));
        assert!(options.contains("max=19\n"));
        assert!(options.contains("disk=hdd\n"));
    }

    /// Adds a site-specific flag to every storage configuration.
    #[derive(Debug)]
    struct RackAwareRenderer;

    impl ConfigRenderer for RackAwareRenderer {
        fn render_config(&self, input: &RenderInput) -> Result<String, RenderError> {
            let text = DefaultRenderer.render_config(input)?;
            Ok(format!("{text}rack=r1\n"))
        }

        fn render_unit(&self, input: &RenderInput) -> Result<String, RenderError> {
            DefaultRenderer.render_unit(input)
        }
    }

    #[test]
    fn deploy_uses_configured_renderer() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        let env = DeployEnv::new(&topology, Arc::new(StaticRepository::new()), probe.clone())
            .with_poll(fast_poll())
            .with_renderer(Arc::new(RackAwareRenderer));

        let mut orchestrator = plan::deploy(&topology, &Arc::new(env));
        let rt = Runtime::new().unwrap();
        rt.block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap();

        let options = executor
            .file("v1", "/etc/seaforge/volume-v1-8080/volume.options")
            .unwrap();
        assert!(options.contains("mserver=m1:9333\n"));
        assert!(options.ends_with("rack=r1\n"));
        assert!(executor
            .file("m1", "/etc/systemd/system/seaforge-master-m1-9333.service")
            .unwrap()
            .contains("ExecStart=/opt/seaforge/master-m1-9333/weed master"));
    }

    #[test]
    fn master_that_never_starts_stops_the_deploy() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor.on("systemctl is-active", Reply::fail(3));

        let mut orchestrator = plan::deploy(&topology, &env(&topology, &probe));
        let rt = Runtime::new().unwrap();
        let err = rt
            .block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap_err();

        assert_eq!(err.phase(), "deploy-master");
        assert!(matches!(
            err.cause(),
            GroupError::Task { source, .. } if matches!(**source, TaskError::Verification(_))
        ));
        // Verification failures are not retried.
        assert_eq!(orchestrator.groups()[0].results()[0].attempts, 1);
        // The failed instance removed its own service.
        assert!(executor.ran("systemctl disable seaforge-master-m1-9333"));
        assert!(executor.ran("rm -f /etc/systemd/system/seaforge-master-m1-9333.service"));
        assert!(executor.commands_on("v1").is_empty());
    }

    #[test]
    fn missing_binary_is_a_precondition_failure() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        let env = DeployEnv::new(
            &topology,
            Arc::new(StaticRepository::new().without_version("3.79")),
            probe.clone(),
        );

        let mut orchestrator = plan::deploy(&topology, &Arc::new(env));
        let rt = Runtime::new().unwrap();
        let err = rt
            .block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Phase { .. }));
        assert!(matches!(
            err.cause(),
            GroupError::Task { source, .. } if matches!(**source, TaskError::Precondition(_))
        ));
        assert!(!executor.ran("put_file"));
    }

    #[test]
    fn unhealthy_instance_is_not_upgraded() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        probe.set("volume-v1-8080", false);
        let executor = Arc::new(MockExecutor::new());
        let ctx = TaskContext::new(executor.clone());

        let spec = topology.find(Role::Volume, "v1", 8080).unwrap().clone();
        let task = UpgradeTask::new(spec, env(&topology, &probe), "3.80");

        let rt = Runtime::new().unwrap();
        let result = rt.block_on(task.execute(&ctx));

        assert!(matches!(result, Err(TaskError::Precondition(_))));
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn upgrade_replaces_binary_and_verifies_version() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor.on("weed version", Reply::ok("version 30GB 3.80 linux amd64\n"));
        let ctx = TaskContext::new(executor.clone());

        let spec = topology.find(Role::Volume, "v1", 8080).unwrap().clone();
        let task = UpgradeTask::new(spec, env(&topology, &probe), "3.80");

        let rt = Runtime::new().unwrap();
        rt.block_on(task.execute(&ctx)).unwrap();

        let commands = executor.commands_on("v1");
        let position = |pattern: &str| {
            commands
                .iter()
                .position(|c| c.contains(pattern))
                .unwrap_or_else(|| panic!("`{pattern}` was not run"))
        };
        let backup = position("cp -a /etc/seaforge/volume-v1-8080 /etc/seaforge/volume-v1-8080.bak.");
        let stop = position("systemctl stop seaforge-volume-v1-8080");
        let keep = position("cp -p /opt/seaforge/volume-v1-8080/weed /opt/seaforge/volume-v1-8080/weed.prev");
        let upload = position("put_file /repo/weed/3.80/weed");
        let start = position("systemctl start seaforge-volume-v1-8080");
        let verify = position("weed version");
        assert!(backup < stop && stop < keep && keep < upload && upload < start && start < verify);
    }

    #[test]
    fn wrong_version_is_rolled_back() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor.on("weed version", Reply::ok("version 30GB 3.79 linux amd64\n"));
        let ctx = TaskContext::new(executor.clone());

        let spec = topology.find(Role::Volume, "v1", 8080).unwrap().clone();
        let task = UpgradeTask::new(spec, env(&topology, &probe), "3.80");

        let rt = Runtime::new().unwrap();
        let result = rt.block_on(task.execute(&ctx));

        assert!(matches!(result, Err(TaskError::Verification(_))));
        assert!(executor.ran(
            "if [ -f /opt/seaforge/volume-v1-8080/weed.prev ]; \
             then cp -p /opt/seaforge/volume-v1-8080/weed.prev /opt/seaforge/volume-v1-8080/weed; fi"
        ));
        assert!(executor.ran("ls -1d /etc/seaforge/volume-v1-8080.bak.*"));
        assert_eq!(executor.count("systemctl start seaforge-volume-v1-8080"), 2);
    }

    #[test]
    fn version_must_match_exactly() {
        let topology = topology(CLUSTER);
        let probe = Arc::new(MockProbe::new());
        let spec = topology.find(Role::Volume, "v1", 8080).unwrap().clone();
        let rt = Runtime::new().unwrap();

        // 3.8 is a prefix of the reported 3.80 but not the same version.
        let executor = Arc::new(MockExecutor::new());
        executor.on("weed version", Reply::ok("version 30GB 3.80 linux amd64\n"));
        let task = UpgradeTask::new(spec.clone(), env(&topology, &probe), "3.8");
        let result = rt.block_on(task.execute(&TaskContext::new(executor.clone())));
        assert!(matches!(result, Err(TaskError::Verification(_))));

        let executor = Arc::new(MockExecutor::new());
        executor.on("weed version", Reply::ok("version 30GB v3.8 linux amd64\n"));
        let task = UpgradeTask::new(spec, env(&topology, &probe), "3.8");
        rt.block_on(task.execute(&TaskContext::new(executor.clone())))
            .unwrap();
    }

    #[test]
    fn upgrade_is_gated_on_cluster_health() {
        let topology = Arc::new(topology(CLUSTER));
        let probe = Arc::new(MockProbe::new());
        probe.set("filer-f1-8888", false);
        let executor = Arc::new(MockExecutor::new());
        executor.on("systemctl show -p MainPID", Reply::ok("100"));
        let ctx = TaskContext::new(executor.clone());

        let collector = StatusCollector::new(ctx.clone(), &topology.global).with_probe(probe.clone());
        let mut orchestrator =
            plan::upgrade(&topology, &env(&topology, &probe), collector, "3.80");

        let names: Vec<&str> = orchestrator.groups().iter().map(|g| g.name()).collect();
        assert_eq!(
            names,
            vec!["health-gate", "upgrade-master", "upgrade-volume", "upgrade-filer"]
        );

        let rt = Runtime::new().unwrap();
        let err = rt.block_on(orchestrator.execute(&ctx)).unwrap_err();

        assert_eq!(err.phase(), "health-gate");
        assert!(!executor.ran("systemctl stop"));
    }

    #[test]
    fn scale_out_adds_new_instances() {
        let topology = topology(CLUSTER);
        let additions = Config::from_toml("[[volumes]]\nhost = \"v3\"\n").unwrap();
        let (merged, added) = topology.extend(&additions).unwrap();
        assert_eq!(merged.num_components(), 5);
        assert_eq!(added.len(), 1);

        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        // Not running before the deploy, active after it.
        executor.on_sequence(
            "systemctl is-active",
            vec![Reply::fail(3), Reply::ok("")],
        );
        let mut orchestrator = plan::scale_out(&merged.global, &added, &env(&merged, &probe));

        let rt = Runtime::new().unwrap();
        rt.block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap();

        assert_eq!(orchestrator.groups().len(), 1);
        assert_eq!(orchestrator.groups()[0].name(), "scale-out-volume");
        assert!(executor.ran("ss -Hltn 'sport = :8080'"));
        assert!(executor.ran("systemctl start seaforge-volume-v3-8080"));
        // Existing instances are left alone.
        assert!(executor.commands_on("v1").is_empty());
    }

    #[test]
    fn scale_out_rejects_existing_instances() {
        let topology = topology(CLUSTER);
        let additions = Config::from_toml("[[volumes]]\nhost = \"v1\"\n").unwrap();
        assert!(matches!(
            topology.extend(&additions),
            Err(ConfigError::Duplicate { .. })
        ));
    }

    #[test]
    fn scale_out_refuses_busy_port() {
        let topology = topology(CLUSTER);
        let additions = Config::from_toml("[[filers]]\nhost = \"f2\"\n").unwrap();
        let (merged, added) = topology.extend(&additions).unwrap();

        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor
            .on("systemctl is-active", Reply::fail(3))
            .on("ss -Hltn 'sport = :8888'", Reply::ok("LISTEN 0 4096 *:8888 *:*\n"));
        let mut orchestrator = plan::scale_out(&merged.global, &added, &env(&merged, &probe));

        let rt = Runtime::new().unwrap();
        let err = rt
            .block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .unwrap_err();

        assert!(matches!(
            err.cause(),
            GroupError::Task { source, .. } if matches!(**source, TaskError::Precondition(_))
        ));
        assert!(!executor.ran("put_file"));
    }

    #[test]
    fn failed_scale_out_removes_what_it_added() {
        let topology = topology(CLUSTER);
        let additions =
            Config::from_toml("[[volumes]]\nhost = \"v3\"\n[[volumes]]\nhost = \"v4\"\n").unwrap();
        let (merged, added) = topology.extend(&additions).unwrap();

        let probe = Arc::new(MockProbe::new());
        let executor = Arc::new(MockExecutor::new());
        executor.on_host("v4", "put_file", Reply::Fail(1, "disk full".to_string()));
        let mut orchestrator = plan::scale_out(&merged.global, &added, &env(&merged, &probe));

        let rt = Runtime::new().unwrap();
        assert!(rt
            .block_on(orchestrator.execute(&TaskContext::new(executor.clone())))
            .is_err());

        assert!(executor.ran("systemctl disable seaforge-volume-v3-8080"));
        assert!(executor.ran("rm -f /etc/systemd/system/seaforge-volume-v3-8080.service"));
        // max_retries = 1, so v4 was tried twice.
        assert_eq!(executor.count("put_file /repo/weed/3.79/weed /opt/seaforge/volume-v4-8080/weed"), 2);
    }
}
