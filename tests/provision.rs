// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::runtime::Runtime;

    use seaforge_lib::{
        cluster::{ComponentSpec, FolderSpec, Role},
        provision::{
            device::{parse_lsblk, select_candidates, LSBLK_COMMAND},
            max_volumes, next_mount_path, DeviceKind, DiskProvisioner, ProvisionError,
            ProvisionOptions, FILESYSTEM, FILESYSTEM_LABEL, GIB,
        },
        task::TaskContext,
        test_env::*,
    };

    const HOST: &str = "vol1";

    fn device(name: &str, size: u64, kind: &str, extra: &str) -> String {
        format!(
            r#"{{"name":"{name}","path":"/dev/{name}","size":{size},"type":"{kind}"{extra}}}"#
        )
    }

    fn lsblk(devices: &[String]) -> String {
        format!(r#"{{"blockdevices":[{}]}}"#, devices.join(","))
    }

    /// A host with a partitioned system disk, two raw disks, a mounted disk, a disk carrying a
    /// foreign filesystem and a loop device.
    fn mixed_host() -> String {
        lsblk(&[
            device("sda", 100 * GIB, "disk", r#","pkname":null"#),
            device(
                "sda1",
                100 * GIB,
                "part",
                r#","fstype":"xfs","uuid":"sys","mountpoint":"/","pkname":"sda""#,
            ),
            device("sdb", 100 * GIB, "disk", ""),
            device("sdc", 500 * GIB, "disk", ""),
            device(
                "sdd",
                100 * GIB,
                "disk",
                r#","fstype":"ext4","uuid":"mnt","mountpoint":"/mnt/scratch""#,
            ),
            device("sde", 100 * GIB, "disk", r#","fstype":"xfs","uuid":"foreign""#),
            device("loop0", GIB, "loop", ""),
        ])
    }

    fn options() -> ProvisionOptions {
        ProvisionOptions {
            device_prefixes: vec!["/dev/sd".to_string(), "/dev/nvme".to_string()],
            volume_size_limit_mb: 5000,
            disk_type: "hdd".to_string(),
            settle_delay: Duration::ZERO,
        }
    }

    /// An executor for a host on which nothing is formatted, registered or mounted yet.
    fn fresh_host(lsblk_output: &str) -> Arc<MockExecutor> {
        let executor = Arc::new(MockExecutor::new());
        executor
            .on(LSBLK_COMMAND, Reply::ok(lsblk_output))
            .on("blkid -o export", Reply::fail(2))
            .on("blkid -s UUID -o value /dev/sdb", Reply::ok("uuid-sdb\n"))
            .on("blkid -s UUID -o value /dev/sdc", Reply::ok("uuid-sdc\n"))
            .on("grep -q '^UUID=", Reply::fail(1))
            .on("mountpoint -q", Reply::fail(1));
        executor
    }

    fn volume() -> ComponentSpec {
        ComponentSpec::new(Role::Volume, HOST, 8080)
    }

    #[test]
    fn capacity_budget() {
        // 102400 MiB less 5%, in 5000 MiB volumes.
        assert_eq!(max_volumes(100 * GIB, 5000), 19);
        // 512000 MiB less 10 GiB, in 5000 MiB volumes.
        assert_eq!(max_volumes(500 * GIB, 5000), 100);
        // The threshold itself is still a small disk.
        assert_eq!(max_volumes(200 * GIB, 5000), 38);
        assert_eq!(max_volumes(100 * GIB, 0), 0);
    }

    #[test]
    fn mount_paths_fill_the_lowest_gap() {
        let mut used = HashSet::new();
        assert_eq!(next_mount_path(&used), "/data1");
        used.insert("/data1".to_string());
        used.insert("/data3".to_string());
        assert_eq!(next_mount_path(&used), "/data2");
        used.insert("/data2".to_string());
        assert_eq!(next_mount_path(&used), "/data4");
    }

    #[test]
    fn lsblk_parsing() {
        let prefixes = options().device_prefixes;
        let devices = parse_lsblk(&mixed_host(), &prefixes).unwrap();

        // loop0 does not match any prefix.
        assert_eq!(devices.len(), 6);
        assert_eq!(devices[1].kind, DeviceKind::Part);
        assert_eq!(devices[1].parent.as_deref(), Some("sda"));
        assert!(devices[1].is_mounted());
        assert_eq!(devices[2].size, 100 * GIB);
        assert!(!devices[2].has_filesystem());

        // Some lsblk versions print sizes as strings and leave out the path column.
        let old = r#"{"blockdevices":[{"name":"sdb","size":"1024","type":"disk","fstype":"","mountpoint":null}]}"#;
        let devices = parse_lsblk(old, &prefixes).unwrap();
        assert_eq!(devices[0].path, "/dev/sdb");
        assert_eq!(devices[0].size, 1024);
        assert_eq!(devices[0].fstype, None);

        assert!(matches!(
            parse_lsblk("not json", &prefixes),
            Err(ProvisionError::Parse(_))
        ));
    }

    #[test]
    fn only_raw_unclaimed_disks_are_candidates() {
        let devices = parse_lsblk(&mixed_host(), &options().device_prefixes).unwrap();

        let candidates = select_candidates(&devices, FILESYSTEM, FILESYSTEM_LABEL, &[]);
        let paths: Vec<&str> = candidates.iter().map(|c| c.device.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/sdb", "/dev/sdc"]);
        assert!(candidates.iter().all(|c| !c.resume));

        let claimed = vec!["/dev/sdb".to_string()];
        let candidates = select_candidates(&devices, FILESYSTEM, FILESYSTEM_LABEL, &claimed);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device.path, "/dev/sdc");
    }

    #[test]
    fn partition_without_parent_name_is_matched_by_path() {
        let output = lsblk(&[
            device("nvme0n1", 100 * GIB, "disk", ""),
            device("nvme0n1p1", 50 * GIB, "part", ""),
        ]);
        let devices = parse_lsblk(&output, &options().device_prefixes).unwrap();
        assert!(select_candidates(&devices, FILESYSTEM, FILESYSTEM_LABEL, &[]).is_empty());
    }

    #[test]
    fn provisions_raw_disks() {
        let executor = fresh_host(&mixed_host());
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();
        let provisioner = DiskProvisioner::new(options());

        let rt = Runtime::new().unwrap();
        let folders = rt.block_on(provisioner.provision(&ctx, &spec)).unwrap();

        assert_eq!(
            folders,
            vec![
                FolderSpec {
                    path: "/data1".to_string(),
                    disk_type: "hdd".to_string(),
                    device: Some("/dev/sdb".to_string()),
                    uuid: Some("uuid-sdb".to_string()),
                    max_volumes: 19,
                },
                FolderSpec {
                    path: "/data2".to_string(),
                    disk_type: "hdd".to_string(),
                    device: Some("/dev/sdc".to_string()),
                    uuid: Some("uuid-sdc".to_string()),
                    max_volumes: 100,
                },
            ]
        );
        assert_eq!(spec.folders(), folders);
        assert!(spec.config_changed());

        assert!(executor.ran("mkfs.ext4 -F -L seaforge /dev/sdb"));
        assert!(executor.ran("mkfs.ext4 -F -L seaforge /dev/sdc"));
        assert!(!executor.ran("/dev/sda"));
        assert!(!executor.ran("/dev/sdd"));
        assert!(!executor.ran("/dev/sde"));
        assert!(executor.ran(
            "echo 'UUID=uuid-sdb /data1 ext4 defaults,noatime,nofail 0 2' >> /etc/fstab"
        ));
        assert!(executor.ran("mount -t ext4 UUID=uuid-sdc /data2"));
    }

    #[test]
    fn second_pass_claims_nothing() {
        let executor = fresh_host(&mixed_host());
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();
        let provisioner = DiskProvisioner::new(options());

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let first = provisioner.provision(&ctx, &spec).await.unwrap();
            assert_eq!(first.len(), 2);
            let commands = executor.commands().len();

            let second = provisioner.provision(&ctx, &spec).await.unwrap();
            assert!(second.is_empty());
            // Only the discovery command ran.
            assert_eq!(executor.commands().len(), commands + 1);
        });
        assert_eq!(spec.folders().len(), 2);
        assert_eq!(executor.count("mkfs"), 2);
    }

    #[test]
    fn mounted_host_claims_nothing() {
        let output = lsblk(&[
            device(
                "sdb",
                100 * GIB,
                "disk",
                r#","fstype":"ext4","label":"seaforge","uuid":"b","mountpoint":"/data1""#,
            ),
            device(
                "sdc",
                100 * GIB,
                "disk",
                r#","fstype":"ext4","label":"seaforge","uuid":"c","mountpoint":"/data2""#,
            ),
        ]);
        let executor = fresh_host(&output);
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let folders = rt
            .block_on(DiskProvisioner::new(options()).provision(&ctx, &spec))
            .unwrap();

        assert!(folders.is_empty());
        assert!(!spec.config_changed());
        assert_eq!(executor.commands(), vec![LSBLK_COMMAND.to_string()]);
    }

    #[test]
    fn declared_folders_keep_their_mount_paths() {
        let executor = fresh_host(&lsblk(&[device("sdb", 100 * GIB, "disk", "")]));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume().with_folders(vec![FolderSpec {
            path: "/data1".to_string(),
            disk_type: "ssd".to_string(),
            device: None,
            uuid: None,
            max_volumes: 10,
        }]);

        let rt = Runtime::new().unwrap();
        let folders = rt
            .block_on(DiskProvisioner::new(options()).provision(&ctx, &spec))
            .unwrap();

        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].path, "/data2");
        assert_eq!(spec.folders().len(), 2);
    }

    #[test]
    fn missing_uuid_is_fatal() {
        let executor = fresh_host(&lsblk(&[device("sdb", 100 * GIB, "disk", "")]));
        executor.on("blkid -s UUID -o value /dev/sdb", Reply::ok("\n"));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let result = rt.block_on(DiskProvisioner::new(options()).provision(&ctx, &spec));

        assert!(matches!(result, Err(ProvisionError::MissingUuid { ref device }) if device == "/dev/sdb"));
        assert!(!executor.ran(">> /etc/fstab"));
        assert!(!executor.ran("mount -t"));
        assert!(spec.folders().is_empty());
    }

    #[test]
    fn failure_keeps_disks_done_earlier_in_the_pass() {
        let executor = fresh_host(&mixed_host());
        executor.on("mkfs.ext4 -F -L seaforge /dev/sdc", Reply::Fail(1, "device busy".to_string()));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let result = rt.block_on(DiskProvisioner::new(options()).provision(&ctx, &spec));

        assert!(matches!(result, Err(ProvisionError::Format { ref device, .. }) if device == "/dev/sdc"));
        let folders = spec.folders();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].device.as_deref(), Some("/dev/sdb"));
        assert!(spec.config_changed());
    }

    #[test]
    fn interrupted_pass_is_resumed() {
        // sdb was formatted by an earlier pass that stopped before mounting it.
        let output = lsblk(&[device(
            "sdb",
            100 * GIB,
            "disk",
            r#","fstype":"ext4","label":"seaforge","uuid":"uuid-sdb""#,
        )]);
        let executor = fresh_host(&output);
        // ...and the fstab entry had already been written.
        executor.on("grep -q '^UUID=uuid-sdb", Reply::ok(""));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let folders = rt
            .block_on(DiskProvisioner::new(options()).provision(&ctx, &spec))
            .unwrap();

        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].uuid.as_deref(), Some("uuid-sdb"));
        assert!(!executor.ran("mkfs"));
        assert!(!executor.ran(">> /etc/fstab"));
        assert!(executor.ran("mount -t ext4 UUID=uuid-sdb /data1"));
    }

    #[test]
    fn resumed_disk_keeps_its_fstab_path() {
        let output = lsblk(&[
            device(
                "sdb",
                100 * GIB,
                "disk",
                r#","fstype":"ext4","label":"seaforge","uuid":"uuid-sdb""#,
            ),
            device("sdc", 100 * GIB, "disk", ""),
        ]);
        let executor = fresh_host(&output);
        executor
            .on("grep -q '^UUID=uuid-sdb", Reply::ok(""))
            .on("awk '!/^", Reply::ok("/\n/boot\n/data3\n"))
            .on("awk '$1 == \"UUID=uuid-sdb\"", Reply::ok("/data3\n"));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let folders = rt
            .block_on(DiskProvisioner::new(options()).provision(&ctx, &spec))
            .unwrap();

        let paths: Vec<&str> = folders.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/data3", "/data1"]);
        assert!(executor.ran("mount -t ext4 UUID=uuid-sdb /data3"));
        assert!(!executor.ran("UUID=uuid-sdb /data1"));
        // The fresh disk gets a path that fstab does not already hand out.
        assert!(executor.ran(
            "echo 'UUID=uuid-sdc /data1 ext4 defaults,noatime,nofail 0 2' >> /etc/fstab"
        ));
    }

    #[test]
    fn fstab_paths_are_not_reused() {
        let executor = fresh_host(&lsblk(&[device("sdb", 100 * GIB, "disk", "")]));
        executor.on("awk '!/^", Reply::ok("/\n/data1\n"));
        let ctx = TaskContext::new(executor.clone());
        let spec = volume();

        let rt = Runtime::new().unwrap();
        let folders = rt
            .block_on(DiskProvisioner::new(options()).provision(&ctx, &spec))
            .unwrap();

        assert_eq!(folders[0].path, "/data2");
        assert!(executor.ran("mount -t ext4 UUID=uuid-sdb /data2"));
    }

    #[test]
    fn discovery_failure_is_reported() {
        let executor = Arc::new(MockExecutor::new());
        executor.on(LSBLK_COMMAND, Reply::Disconnect);
        let ctx = TaskContext::new(executor.clone());

        let rt = Runtime::new().unwrap();
        let result = rt.block_on(DiskProvisioner::new(options()).provision(&ctx, &volume()));

        assert!(matches!(result, Err(ProvisionError::Discovery(_))));
    }
}
