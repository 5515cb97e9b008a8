//! Serial port candidates and the USB vendor filter

use std::fmt;

/// USB vendor IDs of the bridges ESP boards ship with
pub const KNOWN_VENDORS: &[(u16, &str)] = &[
    (0x10C4, "Silicon Labs CP210x"),
    (0x303A, "Espressif USB JTAG/serial debug"),
    (0x1A86, "QinHeng Electronics CH34x"),
    (0x0403, "FTDI"),
];

/// Espressif's own vendor ID, used by chips with a native USB peripheral
pub const ESPRESSIF_VID: u16 = 0x303A;

/// A serial port that may have an ESP device behind it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    /// OS identifier (`COM3`, `/dev/ttyUSB0`)
    pub name: String,
    /// USB vendor ID, if the port is a USB device
    pub vid: Option<u16>,
    /// USB product ID, if the port is a USB device
    pub pid: Option<u16>,
    /// Product or vendor description reported by the OS
    pub description: Option<String>,
}

impl Port {
    /// A port named by the user, with no USB metadata
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            description: None,
        }
    }

    /// A USB serial port
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            name: name.into(),
            vid: Some(vid),
            pid: Some(pid),
            description: None,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this is an Espressif chip's own USB serial/JTAG port
    pub fn is_native_usb(&self) -> bool {
        self.vid == Some(ESPRESSIF_VID)
    }

    /// Label of the port's USB bridge, if it is a known one
    pub fn vendor_label(&self) -> Option<&'static str> {
        self.vid.and_then(|vid| {
            KNOWN_VENDORS
                .iter()
                .find(|(v, _)| *v == vid)
                .map(|(_, label)| *label)
        })
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{:04X}:{:04X}]", vid, pid)?;
        }
        if let Some(label) = self.vendor_label() {
            write!(f, " {}", label)?;
        } else if let Some(desc) = &self.description {
            write!(f, " {}", desc)?;
        }
        Ok(())
    }
}

/// Set of USB vendor IDs that discovery will probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorFilter {
    vids: Vec<u16>,
}

impl Default for VendorFilter {
    fn default() -> Self {
        Self::known()
    }
}

impl VendorFilter {
    /// The known ESP bridge vendors
    pub fn known() -> Self {
        Self {
            vids: KNOWN_VENDORS.iter().map(|(vid, _)| *vid).collect(),
        }
    }

    /// Add another vendor ID
    pub fn with_vendor(mut self, vid: u16) -> Self {
        if !self.vids.contains(&vid) {
            self.vids.push(vid);
        }
        self
    }

    /// Whether a port passes the filter; ports without USB metadata never do
    pub fn accepts(&self, port: &Port) -> bool {
        port.vid.is_some_and(|vid| self.vids.contains(&vid))
    }

    /// Keep the ports that pass the filter, preserving their order
    pub fn filter(&self, ports: impl IntoIterator<Item = Port>) -> Vec<Port> {
        ports.into_iter().filter(|p| self.accepts(p)).collect()
    }
}
