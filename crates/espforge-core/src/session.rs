//! Device session capability
//!
//! A [`DeviceSession`] is an open connection to one device's bootloader. It is
//! owned by exactly one operation at a time and is not safe to use from more
//! than one thread at once, so the traits only require `Send`.
//!
//! Backends implement [`SessionFactory`] to open sessions; the engine wraps
//! every session it opens in a [`SessionGuard`] so it is closed exactly once.

use std::ops::{Deref, DerefMut};

use crate::chip::FlashConfig;
use crate::device::ChipIdentity;
use crate::error::SessionError;

/// An open connection to a device bootloader
pub trait DeviceSession: Send {
    /// Read the chip model and factory MAC
    fn identify(&mut self) -> Result<ChipIdentity, SessionError>;

    /// Erase `len` bytes starting at `addr`
    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), SessionError>;

    /// Erase the whole flash chip
    fn erase_all(&mut self) -> Result<(), SessionError>;

    /// Write `data` at `addr` with the given flash settings
    fn write(&mut self, addr: u32, data: &[u8], config: &FlashConfig) -> Result<(), SessionError>;

    /// Check that flash at `addr` holds `data`
    fn verify(&mut self, addr: u32, data: &[u8]) -> Result<bool, SessionError>;

    /// Hard-reset the device into its application
    fn reset(&mut self) -> Result<(), SessionError>;

    /// Release the port
    ///
    /// Called exactly once per session by [`SessionGuard`].
    fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens device sessions
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type this factory produces
    type Session: DeviceSession + 'static;

    /// Connect to the bootloader on `port` at `baud`
    fn connect(&self, port: &str, baud: u32) -> Result<Self::Session, SessionError>;

    /// Backend name for log output
    fn name(&self) -> &'static str;
}

/// Exclusive handle that closes its session exactly once
///
/// Call [`SessionGuard::finish`] to close and observe the result; a guard
/// dropped without it (early return, panic unwinding) closes on drop and
/// logs any failure.
pub struct SessionGuard<S: DeviceSession> {
    session: S,
    port: String,
    closed: bool,
}

impl<S: DeviceSession> SessionGuard<S> {
    pub fn new(port: impl Into<String>, session: S) -> Self {
        Self {
            session,
            port: port.into(),
            closed: false,
        }
    }

    /// Port the session is connected to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Close the session
    pub fn finish(mut self) -> Result<(), SessionError> {
        self.closed = true;
        log::debug!("Closing session on {}", self.port);
        self.session.close()
    }
}

impl<S: DeviceSession> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: DeviceSession> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: DeviceSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::debug!("Closing session on {} (dropped)", self.port);
        if let Err(e) = self.session.close() {
            log::warn!("Failed to close session on {}: {}", self.port, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MacAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        closes: Arc<AtomicUsize>,
    }

    impl DeviceSession for Counting {
        fn identify(&mut self) -> Result<ChipIdentity, SessionError> {
            Ok(ChipIdentity {
                chip_name: "ESP32".into(),
                mac: MacAddress::default(),
            })
        }
        fn erase_region(&mut self, _addr: u32, _len: u32) -> Result<(), SessionError> {
            Ok(())
        }
        fn erase_all(&mut self) -> Result<(), SessionError> {
            Err(SessionError::Unsupported("erase_all"))
        }
        fn write(
            &mut self,
            _addr: u32,
            _data: &[u8],
            _config: &FlashConfig,
        ) -> Result<(), SessionError> {
            Ok(())
        }
        fn verify(&mut self, _addr: u32, _data: &[u8]) -> Result<bool, SessionError> {
            Ok(true)
        }
        fn reset(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), SessionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_finish_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = SessionGuard::new(
            "COM3",
            Counting {
                closes: closes.clone(),
            },
        );
        guard.identify().unwrap();
        guard.finish().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let mut guard = SessionGuard::new(
                "COM3",
                Counting {
                    closes: closes.clone(),
                },
            );
            assert!(guard.erase_all().is_err());
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
