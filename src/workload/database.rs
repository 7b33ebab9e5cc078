//! Database: PostgreSQL on the data volume, initialised once with a
//! scale-50 pgbench dataset, then benchmarked in a loop

use super::CloudConfig;

const SETUP_SCRIPT_PATH: &str = "/usr/local/bin/virtwork-db-setup.sh";

const SETUP_SCRIPT: &str = r#"#!/bin/bash
set -euo pipefail

DATA_DIR="/var/lib/pgsql/data"
MARKER="${DATA_DIR}/.virtwork-initialized"

if [ -f "${MARKER}" ]; then
    echo "Database already initialized, skipping setup"
    exit 0
fi

if ! mountpoint -q "${DATA_DIR}"; then
    mkfs.xfs /dev/vdc
    mount /dev/vdc "${DATA_DIR}"
    echo '/dev/vdc /var/lib/pgsql/data xfs defaults 0 0' >> /etc/fstab
fi

chown -R postgres:postgres "${DATA_DIR}"
postgresql-setup --initdb

systemctl start postgresql
sudo -u postgres createdb pgbench
sudo -u postgres pgbench -i -s 50 pgbench
systemctl stop postgresql

touch "${MARKER}"
chown postgres:postgres "${MARKER}"
"#;

const UNIT: &str = "[Unit]
Description=Virtwork database benchmark workload
After=network.target local-fs.target postgresql.service
Requires=postgresql.service

[Service]
Type=simple
User=postgres
ExecStartPre=/usr/local/bin/virtwork-db-setup.sh
ExecStart=/bin/bash -c 'while true; do pgbench -c 10 -j 2 -T 300 pgbench; sleep 10; done'
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub(super) fn cloud_config() -> CloudConfig {
    CloudConfig::new()
        .package("postgresql-server")
        .write_file(SETUP_SCRIPT_PATH, SETUP_SCRIPT, "0755")
        .write_file("/etc/systemd/system/virtwork-database.service", UNIT, "0644")
        .run(&["systemctl", "daemon-reload"])
        .run(&["systemctl", "enable", "postgresql"])
        .run(&["systemctl", "enable", "--now", "virtwork-database.service"])
}
