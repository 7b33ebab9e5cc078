//! Disk I/O: fio alternating a 4k random read/write mix with 128k
//! sequential writes against the data volume mounted at `/mnt/data`
//!
//! The data volume is the third virtio disk. cloud-init formats it only if
//! it carries no filesystem yet, and mounts it before `runcmd` runs.

use serde_yaml::{Mapping, Value};

use super::CloudConfig;

const DATA_DEVICE: &str = "/dev/vdc";
const MOUNT_POINT: &str = "/mnt/data";

const MIXED_RW_PROFILE: &str = "[global]
ioengine=libaio
direct=1
directory=/mnt/data
size=1G

[mixed-rw]
rw=randrw
rwmixread=70
bs=4k
numjobs=4
runtime=300
time_based
group_reporting
";

const SEQ_WRITE_PROFILE: &str = "[global]
ioengine=libaio
direct=1
directory=/mnt/data
size=1G

[seq-write]
rw=write
bs=128k
numjobs=2
runtime=300
time_based
group_reporting
";

const UNIT: &str = "[Unit]
Description=Virtwork disk I/O workload
After=network.target local-fs.target

[Service]
Type=simple
ExecStart=/bin/bash -c 'while true; do fio /etc/fio/mixed-rw.fio; sleep 10; fio /etc/fio/seq-write.fio; sleep 10; done'
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
";

fn fs_setup() -> Value {
    let mut entry = Mapping::new();
    entry.insert("label".into(), "virtwork-data".into());
    entry.insert("filesystem".into(), "xfs".into());
    entry.insert("device".into(), DATA_DEVICE.into());
    Value::Sequence(vec![Value::Mapping(entry)])
}

fn mounts() -> Value {
    let entry = [DATA_DEVICE, MOUNT_POINT, "xfs", "defaults,nofail", "0", "2"];
    Value::Sequence(vec![Value::Sequence(
        entry.iter().map(|field| Value::from(*field)).collect(),
    )])
}

pub(super) fn cloud_config() -> CloudConfig {
    CloudConfig::new()
        .extra("fs_setup", fs_setup())
        .extra("mounts", mounts())
        .package("fio")
        .write_file("/etc/fio/mixed-rw.fio", MIXED_RW_PROFILE, "0644")
        .write_file("/etc/fio/seq-write.fio", SEQ_WRITE_PROFILE, "0644")
        .write_file("/etc/systemd/system/virtwork-disk.service", UNIT, "0644")
        .run(&["mkdir", "-p", MOUNT_POINT])
        .run(&["systemctl", "daemon-reload"])
        .run(&["systemctl", "enable", "--now", "virtwork-disk.service"])
}
