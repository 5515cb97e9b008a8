//! Baud fallback policy
//!
//! Every operation reaches a device the same way: connect and identify at
//! the first baud of a [`BaudPolicy`], and on failure move on to the next.
//! Discovery tries the ROM default first and then a fast rate; flash and
//! erase try the requested rate first and then the ROM default.

use std::sync::atomic::{AtomicBool, Ordering};

use espforge_core::{
    ChipIdentity, DeviceSession, Error, SessionError, SessionFactory, SessionGuard, SAFE_BAUD,
};

/// Fast baud rate discovery falls back to
pub const FAST_BAUD: u32 = 921_600;

/// Ordered list of baud rates to try on one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaudPolicy {
    bauds: Vec<u32>,
}

impl BaudPolicy {
    /// Try each rate in order; duplicates are dropped
    pub fn new(bauds: impl IntoIterator<Item = u32>) -> Self {
        let mut list = Vec::new();
        for baud in bauds {
            if baud != 0 && !list.contains(&baud) {
                list.push(baud);
            }
        }
        if list.is_empty() {
            list.push(SAFE_BAUD);
        }
        Self { bauds: list }
    }

    /// Discovery policy: 115200, then 921600 unless retries are constrained
    pub fn discovery(no_fallback: bool) -> Self {
        if no_fallback {
            Self::new([SAFE_BAUD])
        } else {
            Self::new([SAFE_BAUD, FAST_BAUD])
        }
    }

    /// Flash/erase policy: the requested rate, then 115200
    pub fn pipeline(requested: u32) -> Self {
        Self::new([requested, SAFE_BAUD])
    }

    pub fn bauds(&self) -> &[u32] {
        &self.bauds
    }
}

/// A session that has answered `identify`
pub struct Connected<S: DeviceSession> {
    pub session: SessionGuard<S>,
    pub baud: u32,
    pub identity: ChipIdentity,
}

/// Connect to `port` and identify the chip, walking the baud policy
///
/// Each attempt's session is closed before the next attempt starts. The
/// cancel flag is checked before every connect and before every identify.
/// Per-attempt failures go to the debug log; the caller only sees
/// [`Error::ConnectFailed`] once every rate has failed.
pub fn connect_with_fallback<F: SessionFactory>(
    factory: &F,
    port: &str,
    policy: &BaudPolicy,
    cancel: &AtomicBool,
) -> Result<Connected<F::Session>, Error> {
    let mut last_err = SessionError::NoResponse;

    for &baud in policy.bauds() {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        log::debug!("{}: connecting at {} baud via {}", port, baud, factory.name());
        let mut session = match factory.connect(port, baud) {
            Ok(s) => SessionGuard::new(port, s),
            Err(e) => {
                log::debug!("{}: connect at {} baud failed: {}", port, baud, e);
                last_err = e;
                continue;
            }
        };

        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        match session.identify() {
            Ok(identity) => {
                log::debug!(
                    "{}: {} ({}) answered at {} baud",
                    port,
                    identity.chip_name,
                    identity.mac,
                    baud
                );
                return Ok(Connected {
                    session,
                    baud,
                    identity,
                });
            }
            Err(e) => {
                log::debug!("{}: identify at {} baud failed: {}", port, baud, e);
                last_err = e;
            }
        }
    }

    Err(Error::ConnectFailed {
        port: port.to_string(),
        attempted: policy.bauds().to_vec(),
        source: last_err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use espforge_dummy::{Call, DummyConfig, DummyFactory, Faults};

    #[test]
    fn test_policies() {
        assert_eq!(BaudPolicy::discovery(false).bauds(), [115_200, 921_600]);
        assert_eq!(BaudPolicy::discovery(true).bauds(), [115_200]);
        assert_eq!(BaudPolicy::pipeline(460_800).bauds(), [460_800, 115_200]);
        assert_eq!(BaudPolicy::pipeline(115_200).bauds(), [115_200]);
        assert_eq!(BaudPolicy::new([]).bauds(), [115_200]);
    }

    #[test]
    fn test_falls_back_to_second_rate() {
        let factory = DummyFactory::new()
            .with_device("COM3", DummyConfig::default().bauds(&[921_600]));
        let cancel = AtomicBool::new(false);

        let conn =
            connect_with_fallback(&factory, "COM3", &BaudPolicy::discovery(false), &cancel)
                .unwrap();
        assert_eq!(conn.baud, 921_600);
        assert_eq!(conn.identity.chip_name, "ESP32");
        conn.session.finish().unwrap();
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn test_no_fallback_when_constrained() {
        let factory = DummyFactory::new()
            .with_device("COM3", DummyConfig::default().bauds(&[921_600]));
        let cancel = AtomicBool::new(false);

        let err = connect_with_fallback(&factory, "COM3", &BaudPolicy::discovery(true), &cancel)
            .err()
            .unwrap();
        assert!(
            matches!(err, Error::ConnectFailed { ref attempted, .. } if attempted == &[115_200])
        );
        assert_eq!(factory.calls().len(), 1);
    }

    #[test]
    fn test_identify_failure_closes_each_attempt() {
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        factory.set_faults(
            "COM3",
            Faults {
                identify: true,
                ..Faults::default()
            },
        );
        let cancel = AtomicBool::new(false);

        let result =
            connect_with_fallback(&factory, "COM3", &BaudPolicy::discovery(false), &cancel);
        assert!(matches!(
            result,
            Err(Error::ConnectFailed {
                source: SessionError::Timeout,
                ..
            })
        ));
        let closes = factory
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Close { .. }))
            .count();
        assert_eq!(closes, 2);
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn test_cancelled_before_connect() {
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        let cancel = AtomicBool::new(true);
        let result =
            connect_with_fallback(&factory, "COM3", &BaudPolicy::discovery(false), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(factory.calls().is_empty());
    }
}
