//! Port enumerator

use serialport::{SerialPortInfo, SerialPortType};

use espforge_core::{Port, VendorFilter};

/// Every serial port the OS reports
///
/// A failed OS query is logged and yields no ports.
pub fn list_all_ports() -> Vec<Port> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(to_port).collect(),
        Err(e) => {
            log::warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Ports behind the known ESP USB bridges, in enumeration order
pub fn list_candidate_ports() -> Vec<Port> {
    list_candidate_ports_with(&VendorFilter::known())
}

/// Ports that pass `filter`, in enumeration order
pub fn list_candidate_ports_with(filter: &VendorFilter) -> Vec<Port> {
    let ports = filter.filter(list_all_ports());
    log::debug!("{} candidate port(s)", ports.len());
    ports
}

fn to_port(info: SerialPortInfo) -> Port {
    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            let port = Port::usb(info.port_name, usb.vid, usb.pid);
            match usb.product.or(usb.manufacturer) {
                Some(desc) => port.with_description(desc),
                None => port,
            }
        }
        SerialPortType::BluetoothPort => Port::named(info.port_name).with_description("Bluetooth"),
        SerialPortType::PciPort => Port::named(info.port_name).with_description("PCI"),
        SerialPortType::Unknown => Port::named(info.port_name),
    }
}
