//! Readiness Poller
//!
//! A VM is ready once its VirtualMachineInstance reports the `Running` phase.
//! The VMI is created by KubeVirt some time after the VM, so "not found" is an
//! expected answer early on and is polled through. Any other read failure is
//! final for that VM.
//!
//! [`wait_ready_all`] polls every VM concurrently with the same timeout and
//! interval. Each task owns exactly one entry of the result map and one VM's
//! failure never cancels or delays its siblings.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::gateway::ResourceGateway;
use crate::vm::VMI_PHASE_RUNNING;
use crate::{Error, Result};

/// Shortest pause between two phase reads of the same VM
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-VM readiness outcome, keyed by VM name
pub type ReadinessResults = BTreeMap<String, Result<()>>;

/// Poll one VM until it is running, the deadline passes, or `cancel` fires.
///
/// Sleeps are clamped to the deadline, so the call never outlives `timeout`
/// by more than one phase read. `poll_interval` is raised to
/// [`MIN_POLL_INTERVAL`] if shorter.
pub async fn wait_ready(
    gateway: &ResourceGateway,
    name: &str,
    namespace: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let waiting = format!("waiting for VM {}/{}", namespace, name);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(waiting));
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                name: name.to_string(),
                namespace: namespace.to_string(),
                timeout,
            });
        }

        match gateway.get_vmi_phase(namespace, name).await {
            Ok(phase) if phase == VMI_PHASE_RUNNING => {
                info!(vm = %name, namespace = %namespace, "VM is running");
                return Ok(());
            }
            Ok(phase) => {
                debug!(vm = %name, phase = %phase, "VM not running yet");
            }
            Err(e) if e.is_not_found() => {
                trace!(vm = %name, "VMI not created yet");
            }
            Err(e) => return Err(e),
        }

        let wake = (Instant::now() + poll_interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(waiting)),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// Poll every VM concurrently and collect one result per name.
///
/// Returns only after every VM has produced a result.
pub async fn wait_ready_all(
    gateway: &ResourceGateway,
    names: &[String],
    namespace: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> ReadinessResults {
    let tasks = names.iter().map(|name| async move {
        let result = wait_ready(gateway, name, namespace, timeout, poll_interval, cancel).await;
        if let Err(e) = &result {
            warn!(vm = %name, namespace = %namespace, error = %e, "VM failed readiness check");
        }
        (name.clone(), result)
    });

    join_all(tasks).await.into_iter().collect()
}
