//! Status events
//!
//! Every operation reports progress as an ordered stream of [`Event`]s. Each
//! event reduces to a (message, severity) pair; state transitions and
//! discovery results are the same stream, told apart by [`Event::category`].

use std::fmt;
use std::path::PathBuf;

use crate::device::DetectedDevice;

/// Severity of a status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    /// The `log` level the message is mirrored at
    pub fn log_level(self) -> log::Level {
        match self {
            Self::Info | Self::Success => log::Level::Info,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of the current operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Detecting,
    Connecting,
    Erasing,
    Flashing,
    Success,
    Error,
    Cancelled,
}

impl OperationState {
    /// Whether the operation has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether an operation is running; start actions should be disabled
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Detecting | Self::Connecting | Self::Erasing | Self::Flashing
        )
    }

    fn severity(self) -> Severity {
        match self {
            Self::Success => Severity::Success,
            Self::Error => Severity::Error,
            Self::Cancelled => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Detecting => "Detecting",
            Self::Connecting => "Connecting",
            Self::Erasing => "Erasing",
            Self::Flashing => "Flashing",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse kind of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Message,
    State,
    Device,
    Task,
    Completion,
}

/// One entry of the status stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Free-form progress note
    Message { text: String, severity: Severity },
    /// Operation state transition
    State(OperationState),
    /// A discovery probe identified a device
    DeviceFound(DetectedDevice),
    /// A flash task is about to be erased, written and verified
    TaskStarted {
        /// 1-based position in the plan, as used in errors
        index: usize,
        /// 1-based position among the enabled tasks
        step: usize,
        /// Number of enabled tasks in the plan
        total: usize,
        path: PathBuf,
        address: u32,
        len: usize,
    },
    /// Discovery has finished; always the last event of a discovery cycle
    DiscoveryFinished { found: usize },
}

impl Event {
    pub fn info(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            severity: Severity::Info,
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            severity: Severity::Warning,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            severity: Severity::Error,
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            severity: Severity::Success,
        }
    }

    /// Human-readable message
    pub fn message(&self) -> String {
        match self {
            Self::Message { text, .. } => text.clone(),
            Self::State(state) => format!("State: {}", state),
            Self::DeviceFound(dev) => format!("Found {}", dev),
            Self::TaskStarted {
                step,
                total,
                path,
                address,
                len,
                ..
            } => format!(
                "Task {}/{}: {} ({} bytes) at 0x{:08X}",
                step,
                total,
                path.display(),
                len,
                address
            ),
            Self::DiscoveryFinished { found } => {
                format!("Discovery finished ({} found)", found)
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Message { severity, .. } => *severity,
            Self::State(state) => state.severity(),
            Self::DeviceFound(_) => Severity::Success,
            Self::TaskStarted { .. } | Self::DiscoveryFinished { .. } => Severity::Info,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Message { .. } => Category::Message,
            Self::State(_) => Category::State,
            Self::DeviceFound(_) => Category::Device,
            Self::TaskStarted { .. } => Category::Task,
            Self::DiscoveryFinished { .. } => Category::Completion,
        }
    }

    /// The state carried by a [`Event::State`]
    pub fn state(&self) -> Option<OperationState> {
        match self {
            Self::State(s) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity(), self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        for state in [
            OperationState::Detecting,
            OperationState::Connecting,
            OperationState::Erasing,
            OperationState::Flashing,
        ] {
            assert!(state.is_busy());
            assert!(!state.is_terminal());
        }
        for state in [
            OperationState::Success,
            OperationState::Error,
            OperationState::Cancelled,
        ] {
            assert!(state.is_terminal());
            assert!(!state.is_busy());
        }
        assert!(!OperationState::Idle.is_busy());
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(Event::warning("x").severity(), Severity::Warning);
        assert_eq!(
            Event::State(OperationState::Error).severity(),
            Severity::Error
        );
        assert_eq!(
            Event::State(OperationState::Flashing).category(),
            Category::State
        );
        assert_eq!(
            Event::DiscoveryFinished { found: 0 }.category(),
            Category::Completion
        );
    }

    #[test]
    fn test_task_message() {
        let ev = Event::TaskStarted {
            index: 1,
            step: 1,
            total: 2,
            path: PathBuf::from("bootloader.bin"),
            address: 0x1000,
            len: 4096,
        };
        assert_eq!(
            ev.message(),
            "Task 1/2: bootloader.bin (4096 bytes) at 0x00001000"
        );
    }
}
