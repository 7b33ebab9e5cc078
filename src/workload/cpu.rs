//! CPU stress: stress-ng on every online core, all CPU methods

use super::CloudConfig;

const UNIT_PATH: &str = "/etc/systemd/system/virtwork-cpu.service";

const UNIT: &str = "[Unit]
Description=Virtwork CPU stress workload
After=network.target

[Service]
Type=simple
ExecStart=/usr/bin/stress-ng --cpu 0 --cpu-method all --timeout 0
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub(super) fn cloud_config() -> CloudConfig {
    CloudConfig::new()
        .package("stress-ng")
        .write_file(UNIT_PATH, UNIT, "0644")
        .run(&["systemctl", "daemon-reload"])
        .run(&["systemctl", "enable", "--now", "virtwork-cpu.service"])
}
