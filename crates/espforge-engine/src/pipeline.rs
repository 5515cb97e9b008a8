//! Flash and erase pipelines
//!
//! Both pipelines run entirely on a blocking thread and follow the same
//! discipline: validate, connect and identify (with baud fallback), do the
//! work, hard-reset, close. The session is closed exactly once on every path
//! by its [`SessionGuard`](espforge_core::SessionGuard).
//!
//! Pipelines cannot be cancelled: stopping between an erase and a write
//! leaves the device without a bootable image.

use std::sync::atomic::AtomicBool;

use espforge_core::{
    ChipIdentity, ChipProfiles, DeviceSession, Error, Event, FlashConfig, FlashParams,
    FlashPlan, LoadedTask, OperationState, SessionError, SessionFactory, Setting, Stage,
    SAFE_BAUD,
};

use crate::baud::{connect_with_fallback, BaudPolicy, Connected};
use crate::channel::StatusSender;

/// A flash operation
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub port: String,
    pub plan: FlashPlan,
    pub params: FlashParams,
    /// Chip the user expects; used for defaults before the device answers
    pub chip: Option<String>,
}

/// A full-chip erase
#[derive(Debug, Clone)]
pub struct EraseRequest {
    pub port: String,
    pub baud: Setting<u32>,
    pub chip: Option<String>,
}

/// Outcome of a successful flash
#[derive(Debug, Clone)]
pub struct FlashReport {
    pub chip: ChipIdentity,
    /// Baud rate the session ran at
    pub baud: u32,
    /// Settings passed to every write
    pub config: FlashConfig,
    /// Number of tasks written and verified
    pub tasks: usize,
    /// Total bytes written
    pub bytes: usize,
    /// Whether the final hard reset succeeded
    pub reset: bool,
}

/// Outcome of a successful erase
#[derive(Debug, Clone)]
pub struct EraseReport {
    pub chip: ChipIdentity,
    pub baud: u32,
    pub reset: bool,
}

/// Baud to connect at: explicit, else the expected chip's profile
fn requested_baud(profiles: &ChipProfiles, chip: Option<&str>, baud: Setting<u32>) -> u32 {
    let params = FlashParams {
        baud,
        ..FlashParams::default()
    };
    profiles
        .resolve(chip, params)
        .baud
        .get()
        .unwrap_or(SAFE_BAUD)
}

fn connect<F: SessionFactory>(
    factory: &F,
    port: &str,
    baud: u32,
    status: &StatusSender,
) -> Result<Connected<F::Session>, Error> {
    status.state(OperationState::Connecting);
    let never = AtomicBool::new(false);
    let conn = connect_with_fallback(factory, port, &BaudPolicy::pipeline(baud), &never)?;
    if conn.baud != baud {
        status.warning(format!(
            "{} did not answer at {} baud, continuing at {}",
            port, baud, conn.baud
        ));
    }
    status.info(format!(
        "Connected to {} ({}) on {} at {} baud",
        conn.identity.chip_name, conn.identity.mac, port, conn.baud
    ));
    Ok(conn)
}

fn reset_device<S: DeviceSession>(session: &mut S, port: &str, status: &StatusSender) -> bool {
    match session.reset() {
        Ok(()) => {
            status.info("Device reset");
            true
        }
        Err(e) => {
            let err = Error::Device {
                port: port.to_string(),
                stage: Stage::Reset,
                source: e,
            };
            status.warning(format!("{}; reset the device manually", err));
            false
        }
    }
}

fn task_error(task: &LoadedTask, stage: Stage) -> impl FnOnce(SessionError) -> Error + '_ {
    move |source| Error::TaskFailed {
        index: task.index,
        path: task.path.clone(),
        stage,
        source,
    }
}

/// Validate the plan, then erase, write and verify every enabled task in
/// order, then hard-reset the device
///
/// The first failing step aborts the rest of the plan. Validation happens
/// before any session is opened.
pub(crate) fn run_flash<F: SessionFactory>(
    factory: &F,
    profiles: &ChipProfiles,
    request: &FlashRequest,
    status: &StatusSender,
) -> Result<FlashReport, Error> {
    let tasks = request.plan.load(request.params.flash_size.get().map(|s| s.bytes()))?;
    let total = tasks.len();
    log::info!(
        "Flash plan for {}: {} task(s), {} bytes",
        request.port,
        total,
        tasks.iter().map(|t| t.data.len()).sum::<usize>()
    );

    let baud = requested_baud(profiles, request.chip.as_deref(), request.params.baud);
    let Connected {
        mut session,
        baud,
        identity,
    } = connect(factory, &request.port, baud, status)?;

    if let Some(expected) = request.chip.as_deref() {
        if !espforge_core::chip_matches(&identity.chip_name, Some(expected)) {
            status.warning(format!(
                "Expected {} but {} reports {}",
                expected, request.port, identity.chip_name
            ));
        }
    }

    let resolved = profiles.resolve(Some(&identity.chip_name), request.params);
    let config = resolved.flash_config();
    status.info(format!("Flash settings: {}", config));

    let mut bytes = 0;
    for (step, task) in (1..).zip(&tasks) {
        status.send(Event::TaskStarted {
            index: task.index,
            step,
            total,
            path: task.path.clone(),
            address: task.address,
            len: task.data.len(),
        });

        status.state(OperationState::Erasing);
        session
            .erase_region(task.address, task.len())
            .map_err(task_error(task, Stage::Erase))?;

        status.state(OperationState::Flashing);
        session
            .write(task.address, &task.data, &config)
            .map_err(task_error(task, Stage::Write))?;

        let verified = session
            .verify(task.address, &task.data)
            .map_err(task_error(task, Stage::Verify))?;
        if !verified {
            return Err(task_error(task, Stage::Verify)(SessionError::VerifyMismatch {
                addr: task.address,
                len: task.len(),
            }));
        }

        bytes += task.data.len();
        status.info(format!(
            "Task {}/{} verified: {} bytes at 0x{:08X}",
            step,
            total,
            task.data.len(),
            task.address
        ));
    }

    let reset = reset_device(&mut *session, &request.port, status);
    if let Err(e) = session.finish() {
        log::warn!("Failed to close {}: {}", request.port, e);
    }

    Ok(FlashReport {
        chip: identity,
        baud,
        config,
        tasks: total,
        bytes,
        reset,
    })
}

/// Erase the whole flash chip, then hard-reset the device
pub(crate) fn run_erase<F: SessionFactory>(
    factory: &F,
    profiles: &ChipProfiles,
    request: &EraseRequest,
    status: &StatusSender,
) -> Result<EraseReport, Error> {
    let baud = requested_baud(profiles, request.chip.as_deref(), request.baud);
    let Connected {
        mut session,
        baud,
        identity,
    } = connect(factory, &request.port, baud, status)?;

    status.state(OperationState::Erasing);
    status.info("Erasing entire flash, this may take a while");
    session.erase_all().map_err(|source| Error::Device {
        port: request.port.clone(),
        stage: Stage::EraseAll,
        source,
    })?;

    let reset = reset_device(&mut *session, &request.port, status);
    if let Err(e) = session.finish() {
        log::warn!("Failed to close {}: {}", request.port, e);
    }

    Ok(EraseReport {
        chip: identity,
        baud,
        reset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::status_channel;
    use espforge_core::{FlashMode, FlashSize, FlashTask};
    use espforge_dummy::{Call, DummyConfig, DummyFactory, Faults};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn image(dir: &TempDir, name: &str, len: usize, fill: u8) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, vec![fill; len]).unwrap();
        path
    }

    fn request(plan: FlashPlan) -> FlashRequest {
        FlashRequest {
            port: "COM3".into(),
            plan,
            params: FlashParams::default(),
            chip: None,
        }
    }

    #[test]
    fn test_flash_writes_and_verifies() {
        let dir = TempDir::new().unwrap();
        let app = image(&dir, "app.bin", 64, 0x5A);
        let factory = DummyFactory::new()
            .with_device("COM3", DummyConfig::chip("ESP32-C2", [1, 2, 3, 4, 5, 6]));
        let (status, _rx) = status_channel();

        let mut req = request(FlashPlan::single(&app));
        req.params.flash_mode = Setting::Value(FlashMode::Dout);
        let report = run_flash(&factory, &ChipProfiles::builtin(), &req, &status).unwrap();

        assert_eq!(report.tasks, 1);
        assert_eq!(report.bytes, 64);
        assert!(report.reset);
        // Explicit mode wins, size comes from the ESP32-C2 profile
        assert_eq!(report.config.mode, Some(FlashMode::Dout));
        assert_eq!(report.config.size, Some(FlashSize::Size2Mb));
        assert_eq!(&factory.memory("COM3").unwrap()[..64], &[0x5A; 64][..]);
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn test_task_progress_counts_enabled_tasks() {
        let dir = TempDir::new().unwrap();
        let a = image(&dir, "a.bin", 16, 0x11);
        let b = image(&dir, "b.bin", 16, 0x22);
        let c = image(&dir, "c.bin", 16, 0x33);
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        let (status, mut rx) = status_channel();

        let skipped = FlashTask {
            enabled: false,
            ..FlashTask::new(&a, 0x1000)
        };
        let plan = FlashPlan::new(vec![
            skipped,
            FlashTask::new(&b, 0x2000),
            FlashTask::new(&c, 0x3000),
        ]);
        let report = run_flash(&factory, &ChipProfiles::builtin(), &request(plan), &status).unwrap();
        assert_eq!(report.tasks, 2);

        let events = rx.drain();
        let started: Vec<(usize, usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                Event::TaskStarted {
                    index, step, total, ..
                } => Some((*index, *step, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(started, [(2, 1, 2), (3, 2, 2)]);
        assert!(events.iter().any(|e| e.message().starts_with("Task 2/2: ")));
        assert!(events.iter().all(|e| !e.message().starts_with("Task 3/")));

        let erased: Vec<u32> = factory
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::EraseRegion { addr, .. } => Some(*addr),
                _ => None,
            })
            .collect();
        assert_eq!(erased, [0x2000, 0x3000]);
    }

    #[test]
    fn test_validation_opens_no_session() {
        let dir = TempDir::new().unwrap();
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        let (status, _rx) = status_channel();

        let req = request(FlashPlan::single(dir.path().join("missing.bin")));
        let err = run_flash(&factory, &ChipProfiles::builtin(), &req, &status)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn test_write_failure_stops_plan() {
        let dir = TempDir::new().unwrap();
        let a = image(&dir, "a.bin", 16, 0x11);
        let b = image(&dir, "b.bin", 16, 0x22);
        let c = image(&dir, "c.bin", 16, 0x33);
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        factory.set_faults(
            "COM3",
            Faults {
                write_at: Some(0x2000),
                ..Faults::default()
            },
        );
        let (status, _rx) = status_channel();

        let plan = FlashPlan::new(vec![
            FlashTask::new(&a, 0x1000),
            FlashTask::new(&b, 0x2000),
            FlashTask::new(&c, 0x3000),
        ]);
        let err = run_flash(&factory, &ChipProfiles::builtin(), &request(plan), &status)
            .err()
            .unwrap();
        match err {
            Error::TaskFailed {
                index, path, stage, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(path, b);
                assert_eq!(stage, Stage::Write);
            }
            other => panic!("unexpected error: {}", other),
        }

        let calls = factory.calls();
        assert!(!calls
            .iter()
            .any(|c| matches!(c, Call::EraseRegion { addr: 0x3000, .. })));
        assert!(!calls.iter().any(|c| matches!(c, Call::Reset { .. })));
        assert!(matches!(calls.last(), Some(Call::Close { .. })));
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn test_reset_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let app = image(&dir, "app.bin", 8, 0x00);
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        factory.set_faults(
            "COM3",
            Faults {
                reset: true,
                ..Faults::default()
            },
        );
        let (status, mut rx) = status_channel();

        let report = run_flash(
            &factory,
            &ChipProfiles::builtin(),
            &request(FlashPlan::single(&app)),
            &status,
        )
        .unwrap();
        assert!(!report.reset);
        assert!(rx
            .drain()
            .iter()
            .any(|e| e.severity() == espforge_core::Severity::Warning
                && e.message().contains("reset")));
    }

    #[test]
    fn test_requested_baud_falls_back_to_safe_rate() {
        let dir = TempDir::new().unwrap();
        let app = image(&dir, "app.bin", 8, 0x00);
        let factory = DummyFactory::new()
            .with_device("COM3", DummyConfig::default().bauds(&[115_200]));
        let (status, _rx) = status_channel();

        let mut req = request(FlashPlan::single(&app));
        req.params.baud = Setting::Value(921_600);
        let report = run_flash(&factory, &ChipProfiles::builtin(), &req, &status).unwrap();
        assert_eq!(report.baud, 115_200);
        assert_eq!(
            factory.calls()[..2],
            [
                Call::Connect {
                    port: "COM3".into(),
                    baud: 921_600
                },
                Call::Connect {
                    port: "COM3".into(),
                    baud: 115_200
                },
            ]
        );
    }

    #[test]
    fn test_erase_all() {
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        let (status, _rx) = status_channel();
        let req = EraseRequest {
            port: "COM3".into(),
            baud: Setting::Keep,
            chip: None,
        };

        let report = run_erase(&factory, &ChipProfiles::builtin(), &req, &status).unwrap();
        assert!(report.reset);
        let kinds: Vec<&str> = factory
            .calls()
            .iter()
            .map(|c| match c {
                Call::Connect { .. } => "connect",
                Call::Identify { .. } => "identify",
                Call::EraseAll { .. } => "erase_all",
                Call::Reset { .. } => "reset",
                Call::Close { .. } => "close",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["connect", "identify", "erase_all", "reset", "close"]);
    }

    #[test]
    fn test_erase_failure_reports_stage() {
        let factory = DummyFactory::new().with_device("COM3", DummyConfig::default());
        factory.set_faults(
            "COM3",
            Faults {
                erase_all: true,
                ..Faults::default()
            },
        );
        let (status, _rx) = status_channel();
        let req = EraseRequest {
            port: "COM3".into(),
            baud: Setting::Keep,
            chip: None,
        };

        let err = run_erase(&factory, &ChipProfiles::builtin(), &req, &status)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Device {
                stage: Stage::EraseAll,
                ..
            }
        ));
        assert_eq!(factory.open_sessions(), 0);
    }
}
