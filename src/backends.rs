//! Session backend registration
//!
//! Backends are feature-gated. `--dummy` selects the emulator; otherwise the
//! serial backend is used when it was compiled in.

use espforge_core::{Port, SessionFactory, VendorFilter};

/// Information about a backend
pub struct BackendInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Backends enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        description: "Emulated devices held in memory (--dummy)",
    });

    #[cfg(feature = "espflash")]
    backends.push(BackendInfo {
        name: "espflash",
        description: "ROM bootloader over local serial ports",
    });

    backends
}

/// Error returned when no usable backend was compiled in
#[allow(dead_code)]
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("espforge was built without the '{0}' backend")]
    NotBuilt(&'static str),
}

/// A session factory together with the ports it can reach
pub trait Backend: SessionFactory {
    /// Ports discovery probes by default
    fn candidate_ports(&self, filter: &VendorFilter) -> Vec<Port>;

    /// Every port the backend can see, candidates or not
    fn all_ports(&self) -> Vec<Port>;

    /// Port details for a name given on the command line
    fn lookup(&self, name: &str) -> Port {
        self.all_ports()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| Port::named(name))
    }
}

#[cfg(feature = "dummy")]
mod dummy {
    use super::*;
    use espforge_dummy::{DummyConfig, DummyFactory};

    /// Two devices on emulated CP210x bridges, plus one port with no device
    pub fn factory() -> DummyFactory {
        DummyFactory::new()
            .with_device(
                "/dev/ttyDUMMY0",
                DummyConfig::chip("ESP32-C3", [0x34, 0x85, 0x18, 0x01, 0x02, 0x03]),
            )
            .with_device(
                "/dev/ttyDUMMY1",
                DummyConfig::chip("ESP32", [0x24, 0x0A, 0xC4, 0x11, 0x22, 0x33])
                    .bauds(&[115_200]),
            )
            .with_device("/dev/ttyDUMMY2", DummyConfig::silent())
    }

    impl Backend for DummyFactory {
        fn candidate_ports(&self, filter: &VendorFilter) -> Vec<Port> {
            filter.filter(self.ports())
        }

        fn all_ports(&self) -> Vec<Port> {
            self.ports()
        }
    }
}

#[cfg(feature = "dummy")]
pub use dummy::factory as dummy_factory;

#[cfg(feature = "espflash")]
impl Backend for espforge_espflash::EspflashFactory {
    fn candidate_ports(&self, filter: &VendorFilter) -> Vec<Port> {
        espforge_engine::list_candidate_ports_with(filter)
    }

    fn all_ports(&self) -> Vec<Port> {
        espforge_engine::list_all_ports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_listed() {
        let names: Vec<_> = available_backends().iter().map(|b| b.name).collect();
        #[cfg(feature = "dummy")]
        assert!(names.contains(&"dummy"));
        #[cfg(feature = "espflash")]
        assert!(names.contains(&"espflash"));
        let _ = names;
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_dummy_ports() {
        let factory = dummy_factory();
        assert_eq!(factory.all_ports().len(), 3);
        assert_eq!(factory.candidate_ports(&VendorFilter::known()).len(), 3);
        assert_eq!(factory.lookup("/dev/ttyDUMMY0").vid, Some(0x10C4));
        assert_eq!(factory.lookup("COM9").vid, None);
    }
}
