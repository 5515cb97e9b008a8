//! Session lifecycle manager
//!
//! Tracks which operations hold which ports so that:
//! - at most one flash or erase pipeline runs at a time
//! - at most one discovery cycle runs at a time
//! - a port is never probed twice at once, and never probed while a pipeline
//!   holds it
//!
//! Conflicting starts are rejected, never queued. Every lease is an RAII
//! guard; dropping it (including during unwinding) releases the entry.
//!
//! Only discovery carries a cancel flag. A pipeline, once started, runs to
//! completion or failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use espforge_core::Error;

/// Cooperative cancellation flag shared with a running operation
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Default)]
struct LeaseState {
    pipeline: Option<String>,
    discovery: Option<CancelFlag>,
    probing: HashSet<String>,
}

/// Lease table shared by the engine and its running operations
#[derive(Debug, Default)]
pub struct Leases {
    state: Mutex<LeaseState>,
}

impl Leases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the pipeline slot for `port`
    pub fn acquire_pipeline(self: &Arc<Self>, port: &str) -> Result<PipelineLease, Error> {
        let mut state = self.state.lock();
        if let Some(active) = &state.pipeline {
            return Err(Error::Busy(format!(
                "a flash or erase operation is already running on {}",
                active
            )));
        }
        if state.probing.contains(port) {
            return Err(Error::Busy(format!("{} is being probed by discovery", port)));
        }

        state.pipeline = Some(port.to_string());
        log::debug!("Pipeline lease acquired for {}", port);

        Ok(PipelineLease {
            leases: self.clone(),
        })
    }

    /// Claim the discovery slot
    pub fn acquire_discovery(self: &Arc<Self>) -> Result<DiscoveryLease, Error> {
        let mut state = self.state.lock();
        if state.discovery.is_some() {
            return Err(Error::Busy("discovery is already running".to_string()));
        }

        let cancel = CancelFlag::default();
        state.discovery = Some(cancel.clone());
        log::debug!("Discovery lease acquired");

        Ok(DiscoveryLease {
            leases: self.clone(),
            cancel,
        })
    }

    /// Claim one port for a discovery probe
    pub fn acquire_probe(self: &Arc<Self>, port: &str) -> Result<ProbeLease, Error> {
        let mut state = self.state.lock();
        if state.pipeline.as_deref() == Some(port) {
            return Err(Error::PortUnavailable {
                port: port.to_string(),
                reason: "in use by a flash or erase operation".to_string(),
            });
        }
        if !state.probing.insert(port.to_string()) {
            return Err(Error::PortUnavailable {
                port: port.to_string(),
                reason: "already being probed".to_string(),
            });
        }

        Ok(ProbeLease {
            leases: self.clone(),
            port: port.to_string(),
        })
    }

    /// Raise the cancel flag of the running discovery cycle
    ///
    /// Returns whether a cycle was running.
    pub fn cancel_discovery(&self) -> bool {
        match &self.state.lock().discovery {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Whether a pipeline holds the slot
    pub fn pipeline_active(&self) -> bool {
        self.state.lock().pipeline.is_some()
    }

    /// Whether a discovery cycle holds the slot
    pub fn discovery_active(&self) -> bool {
        self.state.lock().discovery.is_some()
    }
}

/// Held for the lifetime of a flash or erase pipeline
#[derive(Debug)]
pub struct PipelineLease {
    leases: Arc<Leases>,
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        let mut state = self.leases.state.lock();
        if let Some(port) = state.pipeline.take() {
            log::debug!("Pipeline lease released for {}", port);
        }
    }
}

/// Held for the lifetime of a discovery cycle
#[derive(Debug)]
pub struct DiscoveryLease {
    leases: Arc<Leases>,
    cancel: CancelFlag,
}

impl DiscoveryLease {
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

impl Drop for DiscoveryLease {
    fn drop(&mut self) {
        self.leases.state.lock().discovery = None;
        log::debug!("Discovery lease released");
    }
}

/// Held while one port is being probed
#[derive(Debug)]
pub struct ProbeLease {
    leases: Arc<Leases>,
    port: String,
}

impl Drop for ProbeLease {
    fn drop(&mut self) {
        self.leases.state.lock().probing.remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pipeline() {
        let leases = Leases::new();
        let lease = leases.acquire_pipeline("COM3").unwrap();
        assert!(matches!(
            leases.acquire_pipeline("COM4"),
            Err(Error::Busy(_))
        ));
        drop(lease);
        assert!(!leases.pipeline_active());
        assert!(leases.acquire_pipeline("COM4").is_ok());
    }

    #[test]
    fn test_single_discovery() {
        let leases = Leases::new();
        let lease = leases.acquire_discovery().unwrap();
        assert!(matches!(leases.acquire_discovery(), Err(Error::Busy(_))));
        drop(lease);
        assert!(leases.acquire_discovery().is_ok());
    }

    #[test]
    fn test_probe_excludes_pipeline_port() {
        let leases = Leases::new();
        let _pipeline = leases.acquire_pipeline("COM3").unwrap();
        assert!(matches!(
            leases.acquire_probe("COM3"),
            Err(Error::PortUnavailable { .. })
        ));
        let probe = leases.acquire_probe("COM4").unwrap();
        assert!(matches!(
            leases.acquire_probe("COM4"),
            Err(Error::PortUnavailable { .. })
        ));
        drop(probe);
        assert!(leases.acquire_probe("COM4").is_ok());
    }

    #[test]
    fn test_pipeline_rejected_on_probed_port() {
        let leases = Leases::new();
        let _probe = leases.acquire_probe("COM3").unwrap();
        assert!(matches!(
            leases.acquire_pipeline("COM3"),
            Err(Error::Busy(_))
        ));
        assert!(leases.acquire_pipeline("COM5").is_ok());
    }

    #[test]
    fn test_cancel_discovery() {
        let leases = Leases::new();
        let _pipeline = leases.acquire_pipeline("COM3").unwrap();
        assert!(!leases.cancel_discovery());
        let discovery = leases.acquire_discovery().unwrap();
        let flag = discovery.cancel_flag();
        assert!(leases.cancel_discovery());
        assert!(flag.load(Ordering::SeqCst));
    }
}
