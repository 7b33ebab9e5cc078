//! Network: iperf3 servers behind a ClusterIP Service, clients looping
//! bidirectional parallel transfers against the Service DNS name

use std::collections::BTreeMap;

use super::{CloudConfig, Role, ServicePlan, WorkloadKind};
use crate::labels::{LabelSet, LABEL_COMPONENT, LABEL_ROLE};

/// Service fronting the iperf3 server VMs
pub const IPERF3_SERVICE_NAME: &str = "virtwork-iperf3-server";
/// iperf3 listening port
pub const IPERF3_PORT: i32 = 5201;

const UNIT_PATH: &str = "/etc/systemd/system/virtwork-network.service";

const SERVER_UNIT: &str = "[Unit]
Description=Virtwork iperf3 server
After=network.target

[Service]
Type=simple
ExecStart=/usr/bin/iperf3 -s
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
";

/// Cluster DNS name clients use to reach the servers
pub(super) fn server_dns_name(namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", IPERF3_SERVICE_NAME, namespace)
}

fn client_unit(server: &str) -> String {
    format!(
        "[Unit]
Description=Virtwork iperf3 client
After=network.target

[Service]
Type=simple
ExecStart=/bin/bash -c 'while true; do iperf3 -c {} -t 60 -P 4 --bidir; sleep 10; done'
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
",
        server
    )
}

fn with_unit(unit: String) -> CloudConfig {
    CloudConfig::new()
        .package("iperf3")
        .write_file(UNIT_PATH, unit, "0644")
        .run(&["systemctl", "daemon-reload"])
        .run(&["systemctl", "enable", "--now", "virtwork-network.service"])
}

pub(super) fn server_cloud_config() -> CloudConfig {
    with_unit(SERVER_UNIT.to_string())
}

pub(super) fn client_cloud_config(namespace: &str) -> CloudConfig {
    with_unit(client_unit(&server_dns_name(namespace)))
}

/// Service selecting the server-role VMs of the network workload
pub(super) fn service_plan(namespace: &str, labels: LabelSet) -> ServicePlan {
    let mut selector = BTreeMap::new();
    selector.insert(
        LABEL_COMPONENT.to_string(),
        WorkloadKind::Network.as_str().to_string(),
    );
    selector.insert(LABEL_ROLE.to_string(), Role::Server.as_str().to_string());

    ServicePlan {
        name: IPERF3_SERVICE_NAME.to_string(),
        namespace: namespace.to_string(),
        labels,
        selector,
        port_name: "iperf3".to_string(),
        port: IPERF3_PORT,
    }
}
