//! Ports command implementation

use espforge_core::Port;

/// Print a port table
pub fn run_ports(ports: &[Port], all: bool) {
    if ports.is_empty() {
        if all {
            println!("No serial ports found");
        } else {
            println!("No candidate serial ports found (use --all to list every port)");
        }
        return;
    }

    println!("{:<24} {:>9}  {}", "Port", "VID:PID", "Description");
    println!("{}", "-".repeat(60));
    for port in ports {
        println!(
            "{:<24} {:>9}  {}{}",
            port.name,
            usb_id(port),
            describe(port),
            if port.is_native_usb() { " (native USB)" } else { "" }
        );
    }
}

fn usb_id(port: &Port) -> String {
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!("{:04X}:{:04X}", vid, pid),
        _ => "-".to_string(),
    }
}

fn describe(port: &Port) -> &str {
    port.vendor_label()
        .or(port.description.as_deref())
        .unwrap_or("")
}
