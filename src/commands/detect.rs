//! Detect command implementation

use espforge_core::{DetectedDevice, Port};
use espforge_engine::{DiscoveryRequest, Engine, StatusReceiver};

use super::progress::follow;
use crate::backends::Backend;

/// Probe ports for devices and print what answered
///
/// An empty `ports` list probes the backend's candidate ports; explicit
/// ports are probed whatever their USB vendor.
pub async fn run_detect<F: Backend>(
    engine: &Engine<F>,
    status: &mut StatusReceiver,
    chip: Option<String>,
    ports: &[String],
    no_baud_fallback: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let ports: Vec<Port> = if ports.is_empty() {
        engine
            .factory()
            .candidate_ports(&engine.config().vendor_filter)
    } else {
        ports.iter().map(|name| engine.factory().lookup(name)).collect()
    };

    let request = DiscoveryRequest {
        chip_filter: chip,
        ports: Some(ports),
        no_baud_fallback,
    };
    let handle = engine.start_discovery(request)?;
    let report = follow(engine, status, handle).await?;

    print_devices(&report.devices);
    if report.cancelled {
        println!("Discovery cancelled after {} port(s)", report.probed);
    }
    Ok(())
}

fn print_devices(devices: &[DetectedDevice]) {
    if devices.is_empty() {
        println!("No devices found");
        return;
    }

    for device in devices {
        println!("{}  ({} baud)", device, device.baud);
    }
}
