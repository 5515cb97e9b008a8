//! Engine command surface
//!
//! [`Engine`] is what a presentation layer drives. Each `start_*` call either
//! rejects the request immediately with [`Error::Busy`] or spawns the
//! operation on the Tokio runtime and returns its join handle. Progress is
//! reported on the single [`StatusReceiver`] handed out by [`Engine::new`].
//!
//! Every operation ends with exactly one terminal [`OperationState`], sent
//! after the operation's lease is released, so the consumer can start the
//! next operation as soon as it sees it.

use std::sync::Arc;

use tokio::task::JoinHandle;

use espforge_core::{
    ChipProfiles, Error, Event, OperationState, Port, Result, SessionFactory, VendorFilter,
};

use crate::channel::{status_channel, StatusReceiver, StatusSender};
use crate::discovery::{self, DiscoveryReport, DiscoveryRequest};
use crate::enumerate;
use crate::lease::Leases;
use crate::pipeline::{self, EraseReport, EraseRequest, FlashReport, FlashRequest};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on probes doing device I/O at once
    pub max_concurrent_probes: usize,
    /// Vendors whose ports are probed when no port list is given
    pub vendor_filter: VendorFilter,
    /// Chip defaults for parameters left at `Keep`
    pub profiles: ChipProfiles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 8,
            vendor_filter: VendorFilter::known(),
            profiles: ChipProfiles::builtin(),
        }
    }
}

struct Inner<F> {
    factory: Arc<F>,
    config: EngineConfig,
    leases: Arc<Leases>,
    status: StatusSender,
}

/// Discovery and flash orchestration over one session backend
pub struct Engine<F: SessionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: SessionFactory> Clone for Engine<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: SessionFactory> Engine<F> {
    /// Create an engine and the receiver for its status stream
    pub fn new(factory: F, config: EngineConfig) -> (Self, StatusReceiver) {
        let (status, receiver) = status_channel();
        let inner = Inner {
            factory: Arc::new(factory),
            config,
            leases: Leases::new(),
            status,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Ports that discovery would probe by default
    pub fn candidate_ports(&self) -> Vec<Port> {
        enumerate::list_candidate_ports_with(&self.inner.config.vendor_filter)
    }

    /// Whether any operation is running
    pub fn is_busy(&self) -> bool {
        self.inner.leases.pipeline_active() || self.inner.leases.discovery_active()
    }

    /// Ask the running discovery cycle to stop
    ///
    /// Flash and erase pipelines always run to completion. Returns whether a
    /// discovery cycle was running.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.leases.cancel_discovery();
        if cancelled {
            log::info!("Cancelling discovery");
        } else if self.inner.leases.pipeline_active() {
            log::warn!("Flash operations cannot be cancelled once started");
        }
        cancelled
    }

    /// Start a discovery cycle
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_discovery(
        &self,
        request: DiscoveryRequest,
    ) -> Result<JoinHandle<DiscoveryReport>> {
        let lease = self.inner.leases.acquire_discovery()?;
        self.inner.status.state(OperationState::Detecting);

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let cancel = lease.cancel_flag();
            let ports = match request.ports.clone() {
                Some(ports) => ports,
                None => {
                    let filter = inner.config.vendor_filter.clone();
                    tokio::task::spawn_blocking(move || {
                        enumerate::list_candidate_ports_with(&filter)
                    })
                    .await
                    .unwrap_or_default()
                }
            };
            if ports.is_empty() {
                inner.status.warning("No candidate serial ports found");
            }

            let report = discovery::discover(
                inner.factory.clone(),
                inner.leases.clone(),
                inner.status.clone(),
                cancel,
                ports,
                &request,
                inner.config.max_concurrent_probes,
            )
            .await;
            drop(lease);

            let status = &inner.status;
            let found = report.devices.len();
            if report.cancelled {
                status.warning(format!("Discovery cancelled after finding {} device(s)", found));
            } else if found == 0 {
                status.warning("No matching devices found");
            } else {
                status.success(format!("Found {} device(s)", found));
            }
            status.state(if report.cancelled {
                OperationState::Cancelled
            } else {
                OperationState::Success
            });
            status.send(Event::DiscoveryFinished { found });
            report
        }))
    }

    /// Start flashing a plan
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_flash(&self, request: FlashRequest) -> Result<JoinHandle<Result<FlashReport>>> {
        let lease = self.inner.leases.acquire_pipeline(&request.port)?;
        log::info!(
            "Flashing {} task(s) to {} via {}",
            request.plan.len(),
            request.port,
            self.inner.factory.name()
        );

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let worker = inner.clone();
            let result = tokio::task::spawn_blocking(move || {
                pipeline::run_flash(
                    &*worker.factory,
                    &worker.config.profiles,
                    &request,
                    &worker.status,
                )
            })
            .await
            .unwrap_or_else(|e| Err(Error::Worker(e.to_string())));
            drop(lease);

            report_outcome(&inner.status, &result, |r| {
                format!(
                    "Flashed {} task(s), {} bytes to {}",
                    r.tasks, r.bytes, r.chip.chip_name
                )
            });
            result
        }))
    }

    /// Start a full-chip erase
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_erase(&self, request: EraseRequest) -> Result<JoinHandle<Result<EraseReport>>> {
        let lease = self.inner.leases.acquire_pipeline(&request.port)?;
        log::info!("Erasing {} via {}", request.port, self.inner.factory.name());

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let worker = inner.clone();
            let result = tokio::task::spawn_blocking(move || {
                pipeline::run_erase(
                    &*worker.factory,
                    &worker.config.profiles,
                    &request,
                    &worker.status,
                )
            })
            .await
            .unwrap_or_else(|e| Err(Error::Worker(e.to_string())));
            drop(lease);

            report_outcome(&inner.status, &result, |r| {
                format!("Erased flash of {}", r.chip.chip_name)
            });
            result
        }))
    }
}

/// Send the closing message and terminal state of a pipeline
fn report_outcome<T>(
    status: &StatusSender,
    result: &Result<T>,
    success: impl FnOnce(&T) -> String,
) {
    match result {
        Ok(report) => {
            status.success(success(report));
            status.state(OperationState::Success);
        }
        Err(Error::Cancelled) => {
            status.warning("Operation cancelled");
            status.state(OperationState::Cancelled);
        }
        Err(e) => {
            status.error(e.to_string());
            status.state(OperationState::Error);
        }
    }
}
