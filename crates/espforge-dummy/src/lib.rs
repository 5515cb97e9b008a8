//! espforge-dummy - In-memory ESP device emulator for testing
//!
//! This crate provides a session factory whose "ports" are emulated ESP
//! devices with flash held in memory. Every session call is recorded so tests
//! can check exactly what an operation did, and faults can be injected per
//! port to exercise error paths without real hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use espforge_core::{
    ChipIdentity, DeviceSession, FlashConfig, MacAddress, Port, SessionError, SessionFactory,
};

/// Configuration for one emulated device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Chip model reported by `identify`
    pub chip: String,
    /// Factory MAC
    pub mac: MacAddress,
    /// Flash size in bytes
    pub flash_size: usize,
    /// Baud rates the bootloader answers at; empty answers at none
    pub bauds: Vec<u32>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            chip: "ESP32".to_string(),
            mac: MacAddress([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]),
            flash_size: 4 * 1024 * 1024,
            bauds: vec![115_200, 460_800, 921_600],
        }
    }
}

impl DummyConfig {
    /// A device of the given model, answering at every supported baud
    pub fn chip(chip: &str, mac: [u8; 6]) -> Self {
        Self {
            chip: chip.to_string(),
            mac: MacAddress(mac),
            ..Self::default()
        }
    }

    /// Only answer at these baud rates
    pub fn bauds(mut self, bauds: &[u32]) -> Self {
        self.bauds = bauds.to_vec();
        self
    }

    /// A port whose bootloader never answers
    pub fn silent() -> Self {
        Self::default().bauds(&[])
    }
}

/// Faults injected into a port's sessions
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `identify` fails
    pub identify: bool,
    /// `erase_region` at this address fails
    pub erase_at: Option<u32>,
    /// `erase_all` fails
    pub erase_all: bool,
    /// `write` at this address fails
    pub write_at: Option<u32>,
    /// `write` at this address silently stores wrong data, so verify fails
    pub corrupt_at: Option<u32>,
    /// `reset` fails
    pub reset: bool,
    /// `write` at this address panics, as a backend bug would
    pub panic_at: Option<u32>,
}

/// A recorded session call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { port: String, baud: u32 },
    Identify { port: String },
    EraseRegion { port: String, addr: u32, len: u32 },
    EraseAll { port: String },
    Write { port: String, addr: u32, len: usize, config: FlashConfig },
    Verify { port: String, addr: u32, len: usize },
    Reset { port: String },
    Close { port: String },
}

impl Call {
    /// Port the call was made on
    pub fn port(&self) -> &str {
        match self {
            Self::Connect { port, .. }
            | Self::Identify { port }
            | Self::EraseRegion { port, .. }
            | Self::EraseAll { port }
            | Self::Write { port, .. }
            | Self::Verify { port, .. }
            | Self::Reset { port }
            | Self::Close { port } => port,
        }
    }
}

/// Blocks `connect` until opened
///
/// Lets a test hold an operation inside its connect step while it checks
/// what else the engine allows.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    /// A gate that blocks until [`Gate::open`] is called
    pub fn closed() -> Self {
        Self::default()
    }

    /// Release every waiter and let later callers through
    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().open = true;
        cvar.notify_all();
    }

    fn pass(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.waiting += 1;
        cvar.notify_all();
        while !state.open {
            cvar.wait(&mut state);
        }
        state.waiting -= 1;
    }

    /// Wait until `n` callers are blocked; false on timeout
    pub fn wait_for_waiters(&self, n: usize, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        while state.waiting < n {
            if cvar.wait_for(&mut state, timeout).timed_out() {
                return state.waiting >= n;
            }
        }
        true
    }
}

struct Device {
    config: DummyConfig,
    memory: Vec<u8>,
    faults: Faults,
}

#[derive(Default)]
struct Shared {
    devices: Mutex<HashMap<String, Arc<Mutex<Device>>>>,
    calls: Mutex<Vec<Call>>,
    gate: Mutex<Option<Gate>>,
    open_sessions: AtomicUsize,
}

impl Shared {
    fn record(&self, call: Call) {
        log::trace!("dummy: {:?}", call);
        self.calls.lock().push(call);
    }
}

/// Session factory backed by emulated devices
#[derive(Clone, Default)]
pub struct DummyFactory {
    shared: Arc<Shared>,
}

impl DummyFactory {
    /// A factory with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device on `port`
    pub fn with_device(self, port: &str, config: DummyConfig) -> Self {
        self.add_device(port, config);
        self
    }

    /// Add or replace the device on `port`
    pub fn add_device(&self, port: &str, config: DummyConfig) {
        let device = Device {
            memory: vec![0xFF; config.flash_size],
            config,
            faults: Faults::default(),
        };
        self.shared
            .devices
            .lock()
            .insert(port.to_string(), Arc::new(Mutex::new(device)));
    }

    /// Set the faults injected on `port`
    pub fn set_faults(&self, port: &str, faults: Faults) {
        if let Some(dev) = self.shared.devices.lock().get(port) {
            dev.lock().faults = faults;
        }
    }

    /// Block every subsequent `connect` on `gate`
    pub fn set_gate(&self, gate: Gate) {
        *self.shared.gate.lock() = Some(gate);
    }

    /// All calls recorded so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().clone()
    }

    /// Recorded calls made on one port
    pub fn calls_on(&self, port: &str) -> Vec<Call> {
        self.shared
            .calls
            .lock()
            .iter()
            .filter(|c| c.port() == port)
            .cloned()
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.shared.calls.lock().clear();
    }

    /// Sessions connected and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Copy of a device's flash contents
    pub fn memory(&self, port: &str) -> Option<Vec<u8>> {
        self.shared
            .devices
            .lock()
            .get(port)
            .map(|d| d.lock().memory.clone())
    }

    /// Ports for the emulated devices, as a CP210x bridge would enumerate
    pub fn ports(&self) -> Vec<Port> {
        let mut names: Vec<String> = self.shared.devices.lock().keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| Port::usb(name, 0x10C4, 0xEA60).with_description("Emulated ESP device"))
            .collect()
    }
}

impl SessionFactory for DummyFactory {
    type Session = DummySession;

    fn connect(&self, port: &str, baud: u32) -> Result<DummySession, SessionError> {
        self.shared.record(Call::Connect {
            port: port.to_string(),
            baud,
        });

        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }

        let device = self.shared.devices.lock().get(port).cloned().ok_or_else(|| {
            SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such port {}", port),
            ))
        })?;

        if !device.lock().config.bauds.contains(&baud) {
            return Err(SessionError::NoResponse);
        }

        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(DummySession {
            port: port.to_string(),
            device,
            shared: self.shared.clone(),
            closed: false,
        })
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

/// Session on an emulated device
pub struct DummySession {
    port: String,
    device: Arc<Mutex<Device>>,
    shared: Arc<Shared>,
    closed: bool,
}

impl DummySession {
    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn range(dev: &Device, addr: u32, len: usize) -> Result<std::ops::Range<usize>, SessionError> {
        let start = addr as usize;
        let end = start + len;
        if end > dev.memory.len() {
            return Err(SessionError::Protocol(format!(
                "region 0x{:08X}..0x{:08X} outside {}-byte flash",
                start,
                end,
                dev.memory.len()
            )));
        }
        Ok(start..end)
    }
}

impl DeviceSession for DummySession {
    fn identify(&mut self) -> Result<ChipIdentity, SessionError> {
        self.check_open()?;
        self.shared.record(Call::Identify {
            port: self.port.clone(),
        });
        let dev = self.device.lock();
        if dev.faults.identify {
            return Err(SessionError::Timeout);
        }
        Ok(ChipIdentity {
            chip_name: dev.config.chip.clone(),
            mac: dev.config.mac,
        })
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), SessionError> {
        self.check_open()?;
        self.shared.record(Call::EraseRegion {
            port: self.port.clone(),
            addr,
            len,
        });
        let mut dev = self.device.lock();
        if dev.faults.erase_at == Some(addr) {
            return Err(SessionError::Timeout);
        }
        let range = Self::range(&dev, addr, len as usize)?;
        dev.memory[range].fill(0xFF);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), SessionError> {
        self.check_open()?;
        self.shared.record(Call::EraseAll {
            port: self.port.clone(),
        });
        let mut dev = self.device.lock();
        if dev.faults.erase_all {
            return Err(SessionError::Timeout);
        }
        dev.memory.fill(0xFF);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8], config: &FlashConfig) -> Result<(), SessionError> {
        self.check_open()?;
        self.shared.record(Call::Write {
            port: self.port.clone(),
            addr,
            len: data.len(),
            config: *config,
        });
        if self.device.lock().faults.panic_at == Some(addr) {
            panic!("dummy: write at 0x{:08X} panicked", addr);
        }
        let mut dev = self.device.lock();
        if dev.faults.write_at == Some(addr) {
            return Err(SessionError::Protocol("write rejected".to_string()));
        }
        let corrupt = dev.faults.corrupt_at == Some(addr);
        let range = Self::range(&dev, addr, data.len())?;

        // Programming can only change 1 -> 0
        for (cell, &byte) in dev.memory[range].iter_mut().zip(data) {
            *cell &= byte;
        }
        if corrupt {
            dev.memory[addr as usize] ^= 0x01;
        }
        Ok(())
    }

    fn verify(&mut self, addr: u32, data: &[u8]) -> Result<bool, SessionError> {
        self.check_open()?;
        self.shared.record(Call::Verify {
            port: self.port.clone(),
            addr,
            len: data.len(),
        });
        let dev = self.device.lock();
        let range = Self::range(&dev, addr, data.len())?;
        Ok(&dev.memory[range] == data)
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        self.check_open()?;
        self.shared.record(Call::Reset {
            port: self.port.clone(),
        });
        if self.device.lock().faults.reset {
            return Err(SessionError::NoResponse);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.check_open()?;
        self.closed = true;
        self.shared.record(Call::Close {
            port: self.port.clone(),
        });
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S3_MAC: [u8; 6] = [0x7C, 0xDF, 0xA1, 0x00, 0x11, 0x22];

    fn factory() -> DummyFactory {
        DummyFactory::new().with_device("COM3", DummyConfig::chip("ESP32-S3", S3_MAC))
    }

    #[test]
    fn test_identify() {
        let f = factory();
        let mut s = f.connect("COM3", 115_200).unwrap();
        let id = s.identify().unwrap();
        assert_eq!(id.chip_name, "ESP32-S3");
        assert_eq!(id.mac, MacAddress(S3_MAC));
        s.close().unwrap();
        assert_eq!(f.open_sessions(), 0);
    }

    #[test]
    fn test_connect_respects_bauds() {
        let f = DummyFactory::new().with_device("COM5", DummyConfig::default().bauds(&[921_600]));
        assert!(matches!(
            f.connect("COM5", 115_200),
            Err(SessionError::NoResponse)
        ));
        assert!(f.connect("COM5", 921_600).is_ok());
        assert!(matches!(f.connect("COM9", 115_200), Err(SessionError::Io(_))));
    }

    #[test]
    fn test_write_verify_erase() {
        let f = factory();
        let mut s = f.connect("COM3", 115_200).unwrap();
        let data = [0x12, 0x34, 0x56, 0x78];

        s.erase_region(0x1000, 4).unwrap();
        s.write(0x1000, &data, &FlashConfig::default()).unwrap();
        assert!(s.verify(0x1000, &data).unwrap());

        s.erase_all().unwrap();
        assert!(!s.verify(0x1000, &data).unwrap());
        assert_eq!(f.memory("COM3").unwrap()[0x1000], 0xFF);
    }

    #[test]
    fn test_corrupt_write_fails_verify() {
        let f = factory();
        f.set_faults(
            "COM3",
            Faults {
                corrupt_at: Some(0x10000),
                ..Faults::default()
            },
        );
        let mut s = f.connect("COM3", 115_200).unwrap();
        let data = [0xAAu8; 16];
        s.write(0x10000, &data, &FlashConfig::default()).unwrap();
        assert!(!s.verify(0x10000, &data).unwrap());
    }

    #[test]
    #[should_panic(expected = "write at 0x00010000 panicked")]
    fn test_panic_fault() {
        let f = factory();
        f.set_faults(
            "COM3",
            Faults {
                panic_at: Some(0x10000),
                ..Faults::default()
            },
        );
        let mut s = f.connect("COM3", 115_200).unwrap();
        s.write(0x1000, &[0x00; 4], &FlashConfig::default()).unwrap();
        let _ = s.write(0x10000, &[0x00; 4], &FlashConfig::default());
    }

    #[test]
    fn test_out_of_range() {
        let f = factory();
        let mut s = f.connect("COM3", 115_200).unwrap();
        assert!(matches!(
            s.erase_region(0x3F_FFF0, 0x20),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_closed_session_rejects_calls() {
        let f = factory();
        let mut s = f.connect("COM3", 115_200).unwrap();
        s.close().unwrap();
        assert!(matches!(s.identify(), Err(SessionError::Closed)));
        assert!(matches!(s.close(), Err(SessionError::Closed)));
        assert_eq!(
            f.calls_on("COM3"),
            vec![
                Call::Connect {
                    port: "COM3".into(),
                    baud: 115_200
                },
                Call::Close {
                    port: "COM3".into()
                },
            ]
        );
    }

    #[test]
    fn test_gate_blocks_connect() {
        let f = factory();
        let gate = Gate::closed();
        f.set_gate(gate.clone());

        let f2 = f.clone();
        let handle = std::thread::spawn(move || f2.connect("COM3", 115_200).is_ok());

        assert!(gate.wait_for_waiters(1, Duration::from_secs(5)));
        assert_eq!(f.open_sessions(), 0);
        gate.open();
        assert!(handle.join().unwrap());
        assert_eq!(f.open_sessions(), 1);
    }
}
