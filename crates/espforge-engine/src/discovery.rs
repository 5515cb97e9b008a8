//! Discovery coordinator
//!
//! Probes every candidate port in parallel, one probe per port, with the
//! number of probes doing device I/O at once bounded by a semaphore. Each
//! probe connects, identifies the chip and closes its session before it
//! reports anything. A port that cannot be reached produces one warning and
//! never affects the other probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use espforge_core::{chip_matches, DetectedDevice, Event, Port, SessionFactory};

use crate::baud::{connect_with_fallback, BaudPolicy};
use crate::channel::StatusSender;
use crate::lease::{CancelFlag, Leases};

/// What to look for
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    /// Only report chips whose model contains this (case-insensitive)
    pub chip_filter: Option<String>,
    /// Probe exactly these ports; `None` enumerates ports behind known
    /// USB bridges
    pub ports: Option<Vec<Port>>,
    /// Only try the primary baud rate
    pub no_baud_fallback: bool,
}

/// Result of one discovery cycle
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Devices found, in the order their probes finished
    pub devices: Vec<DetectedDevice>,
    /// Number of ports considered
    pub probed: usize,
    /// Whether a probe stopped early because the cycle was cancelled
    pub cancelled: bool,
}

#[derive(Debug)]
enum ProbeOutcome {
    Found(DetectedDevice),
    Mismatch,
    Failed,
    Skipped,
    Cancelled,
}

/// Probe `ports` and collect the devices that answer
///
/// Returns once every probe has finished and closed its session.
pub(crate) async fn discover<F: SessionFactory>(
    factory: Arc<F>,
    leases: Arc<Leases>,
    status: StatusSender,
    cancel: CancelFlag,
    ports: Vec<Port>,
    request: &DiscoveryRequest,
    max_probes: usize,
) -> DiscoveryReport {
    let policy = BaudPolicy::discovery(request.no_baud_fallback);
    let semaphore = Arc::new(Semaphore::new(max_probes.max(1)));
    let mut report = DiscoveryReport {
        probed: ports.len(),
        ..DiscoveryReport::default()
    };

    log::info!(
        "Probing {} port(s) with up to {} at once",
        ports.len(),
        max_probes.max(1)
    );

    let mut probes = JoinSet::new();
    for port in ports {
        let factory = factory.clone();
        let leases = leases.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let policy = policy.clone();
        let filter = request.chip_filter.clone();

        probes.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return ProbeOutcome::Cancelled;
            };
            if cancel.load(Ordering::SeqCst) {
                return ProbeOutcome::Cancelled;
            }

            let lease = match leases.acquire_probe(&port.name) {
                Ok(lease) => lease,
                Err(e) => {
                    status.warning(e.to_string());
                    return ProbeOutcome::Skipped;
                }
            };

            let name = port.name.clone();
            let worker_status = status.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                probe_port(
                    &*factory,
                    port,
                    &policy,
                    filter.as_deref(),
                    &cancel,
                    &worker_status,
                )
            })
            .await;
            drop(lease);

            outcome.unwrap_or_else(|e| {
                status.error(format!("Probe of {} failed: {}", name, e));
                ProbeOutcome::Failed
            })
        });
    }

    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(ProbeOutcome::Found(dev)) => report.devices.push(dev),
            Ok(ProbeOutcome::Cancelled) => report.cancelled = true,
            Ok(ProbeOutcome::Mismatch | ProbeOutcome::Failed | ProbeOutcome::Skipped) => {}
            Err(e) => status.error(format!("Probe task failed: {}", e)),
        }
    }

    report
}

fn probe_port<F: SessionFactory>(
    factory: &F,
    port: Port,
    policy: &BaudPolicy,
    filter: Option<&str>,
    cancel: &AtomicBool,
    status: &StatusSender,
) -> ProbeOutcome {
    let conn = match connect_with_fallback(factory, &port.name, policy, cancel) {
        Ok(conn) => conn,
        Err(espforge_core::Error::Cancelled) => return ProbeOutcome::Cancelled,
        Err(e) => {
            status.warning(e.to_string());
            return ProbeOutcome::Failed;
        }
    };

    if let Err(e) = conn.session.finish() {
        log::debug!("{}: close after identify failed: {}", port.name, e);
    }

    let identity = conn.identity;
    if !chip_matches(&identity.chip_name, filter) {
        status.info(format!(
            "{}: {} does not match chip filter '{}'",
            port.name,
            identity.chip_name,
            filter.unwrap_or_default()
        ));
        return ProbeOutcome::Mismatch;
    }

    let device = DetectedDevice {
        port,
        chip: identity.chip_name,
        mac: identity.mac,
        baud: conn.baud,
    };
    status.send(Event::DeviceFound(device.clone()));
    ProbeOutcome::Found(device)
}
