//! Identified devices

use std::fmt;
use std::str::FromStr;

use crate::port::Port;

/// 48-bit factory MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    /// Accepts six hex octets separated by `:` or `-`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address '{}' is too short", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC octet '{}' in '{}'", part, s))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address '{}' is too long", s));
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// What a session's `identify()` returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    pub chip_name: String,
    pub mac: MacAddress,
}

/// A device that answered a discovery probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    pub port: Port,
    pub chip: String,
    pub mac: MacAddress,
    /// Baud rate the probe succeeded at
    pub baud: u32,
}

impl fmt::Display for DetectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} - {}", self.port.name, self.chip, self.mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_format() {
        let mac = MacAddress([0x24, 0x0a, 0xc4, 0x12, 0x34, 0xab]);
        assert_eq!(mac.to_string(), "24:0A:C4:12:34:AB");
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddress = "24:0a:c4:12:34:ab".parse().unwrap();
        assert_eq!(mac.0, [0x24, 0x0a, 0xc4, 0x12, 0x34, 0xab]);
        assert!("24:0a:c4:12:34".parse::<MacAddress>().is_err());
        assert!("24:0a:c4:12:34:ab:cd".parse::<MacAddress>().is_err());
        assert!("zz:0a:c4:12:34:ab".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_display_string() {
        let dev = DetectedDevice {
            port: Port::usb("COM3", 0x10C4, 0xEA60),
            chip: "ESP32-S3".into(),
            mac: MacAddress([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            baud: 115_200,
        };
        assert_eq!(dev.to_string(), "COM3 - ESP32-S3 - DE:AD:BE:EF:00:01");
    }
}
