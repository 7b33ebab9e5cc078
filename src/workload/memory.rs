//! Memory stress: one stress-ng VM worker touching 80% of guest memory

use super::CloudConfig;

const UNIT: &str = "[Unit]
Description=Virtwork memory stress workload
After=network.target

[Service]
Type=simple
ExecStart=/usr/bin/stress-ng --vm 1 --vm-bytes 80% --vm-method all --timeout 0
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub(super) fn cloud_config() -> CloudConfig {
    CloudConfig::new()
        .package("stress-ng")
        .write_file("/etc/systemd/system/virtwork-memory.service", UNIT, "0644")
        .run(&["systemctl", "daemon-reload"])
        .run(&["systemctl", "enable", "--now", "virtwork-memory.service"])
}
