//! espforge-espflash - ROM bootloader sessions over a serial port
//!
//! This crate implements the espforge session traits on top of the
//! `espflash` crate. Each session owns one serial port and an `espflash`
//! [`Flasher`] with the flasher stub loaded.
//!
//! Verification asks the flasher stub for the MD5 of a flash region and
//! compares it with the digest of the image.

use std::borrow::Cow;
use std::io;
use std::time::Duration;

use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::image_format::Segment;
use espflash::target::ProgressCallbacks;
use md5::{Digest, Md5};
use serialport::{SerialPortType, UsbPortInfo};

use espforge_core::{
    ChipIdentity, DeviceSession, FlashConfig, MacAddress, SessionError, SessionFactory,
};

/// Serial read timeout for bootloader commands
const SERIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens `espflash` sessions on local serial ports
#[derive(Debug, Clone, Default)]
pub struct EspflashFactory;

impl EspflashFactory {
    pub fn new() -> Self {
        Self
    }
}

/// USB identifiers of `port`, used by `espflash` to pick a reset strategy
fn usb_info(port: &str) -> UsbPortInfo {
    let unknown = UsbPortInfo {
        vid: 0,
        pid: 0,
        serial_number: None,
        manufacturer: None,
        product: None,
    };

    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.port_name == port)
        .and_then(|p| match p.port_type {
            SerialPortType::UsbPort(info) => Some(info),
            _ => None,
        })
        .unwrap_or(unknown)
}

/// MD5 of `data` in the byte order the flasher stub reports
fn image_digest(data: &[u8]) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&Md5::digest(data));
    u128::from_be_bytes(bytes)
}

fn protocol(e: espflash::Error) -> SessionError {
    SessionError::Protocol(e.to_string())
}

/// `esp32c3` -> `ESP32-C3`
fn display_name(chip: &str) -> String {
    let upper = chip.to_uppercase();
    match upper.strip_prefix("ESP32") {
        Some(rest) if !rest.is_empty() && !rest.starts_with('-') => format!("ESP32-{}", rest),
        _ => upper,
    }
}

impl SessionFactory for EspflashFactory {
    type Session = EspflashSession;

    fn connect(&self, port: &str, baud: u32) -> Result<EspflashSession, SessionError> {
        let serial = serialport::new(port, baud)
            .timeout(SERIAL_TIMEOUT)
            .open_native()
            .map_err(io::Error::from)?;

        let connection = Connection::new(
            serial,
            usb_info(port),
            ResetAfterOperation::HardReset,
            ResetBeforeOperation::DefaultReset,
            baud,
        );

        // Stub loaded; verification and skipping of unchanged regions are
        // left to the session
        let flasher = Flasher::connect(connection, true, false, false, None, None).map_err(|e| {
            log::debug!("{}: espflash connect failed: {}", port, e);
            SessionError::NoResponse
        })?;

        Ok(EspflashSession {
            port: port.to_string(),
            flasher: Some(flasher),
        })
    }

    fn name(&self) -> &'static str {
        "espflash"
    }
}

/// Session on a device reached through `espflash`
pub struct EspflashSession {
    port: String,
    flasher: Option<Flasher>,
}

impl EspflashSession {
    fn flasher(&mut self) -> Result<&mut Flasher, SessionError> {
        self.flasher.as_mut().ok_or(SessionError::Closed)
    }
}

/// Forwards `espflash` write progress to the debug log
struct LogProgress {
    addr: u32,
    total: usize,
    last_decile: usize,
}

impl ProgressCallbacks for LogProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.addr = addr;
        self.total = total;
        self.last_decile = 0;
        log::debug!("Writing {} blocks at 0x{:08X}", total, addr);
    }

    fn update(&mut self, current: usize) {
        if self.total == 0 {
            return;
        }
        let decile = current * 10 / self.total;
        if decile > self.last_decile {
            self.last_decile = decile;
            log::debug!("0x{:08X}: {}%", self.addr, decile * 10);
        }
    }

    fn verifying(&mut self) {
        log::debug!("Verifying 0x{:08X}", self.addr);
    }

    fn finish(&mut self, skipped: bool) {
        if skipped {
            log::debug!("0x{:08X} already up to date", self.addr);
        }
    }
}

impl DeviceSession for EspflashSession {
    fn identify(&mut self) -> Result<ChipIdentity, SessionError> {
        let flasher = self.flasher()?;
        let chip_name = display_name(&flasher.chip().to_string());
        let info = flasher.device_info().map_err(protocol)?;
        let mac: MacAddress = info
            .mac_address
            .ok_or_else(|| SessionError::Protocol("device did not report a MAC address".into()))?
            .parse()
            .map_err(SessionError::Protocol)?;

        Ok(ChipIdentity { chip_name, mac })
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), SessionError> {
        self.flasher()?.erase_region(addr, len).map_err(protocol)
    }

    fn erase_all(&mut self) -> Result<(), SessionError> {
        self.flasher()?.erase_flash().map_err(protocol)
    }

    fn write(&mut self, addr: u32, data: &[u8], config: &FlashConfig) -> Result<(), SessionError> {
        // Raw images are written as-is; the settings only matter to images
        // espflash builds itself
        log::debug!("{}: writing {} bytes at 0x{:08X} ({})", self.port, data.len(), addr, config);

        let segment = Segment {
            addr,
            data: Cow::Borrowed(data),
        };
        let mut progress = LogProgress {
            addr,
            total: 0,
            last_decile: 0,
        };
        self.flasher()?
            .write_bins_to_flash(&[segment], &mut progress)
            .map_err(protocol)
    }

    fn verify(&mut self, addr: u32, data: &[u8]) -> Result<bool, SessionError> {
        let len = u32::try_from(data.len())
            .map_err(|_| SessionError::Protocol("image exceeds the flash address space".into()))?;
        let flash = self.flasher()?.checksum_md5(addr, len).map_err(protocol)?;
        let expected = image_digest(data);
        if flash != expected {
            log::debug!(
                "{}: 0x{:08X} MD5 mismatch: flash {:032x}, image {:032x}",
                self.port,
                addr,
                flash,
                expected
            );
        }
        Ok(flash == expected)
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        self.flasher()?.connection().reset().map_err(protocol)
    }

    fn close(&mut self) -> Result<(), SessionError> {
        match self.flasher.take() {
            Some(_) => {
                log::debug!("{}: port released", self.port);
                Ok(())
            }
            None => Err(SessionError::Closed),
        }
    }
}
