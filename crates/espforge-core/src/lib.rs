//! espforge-core - Core types for ESP device discovery and flashing
//!
//! This crate holds the data model shared by the engine, the session
//! backends and the CLI:
//! - Device session traits ([`DeviceSession`], [`SessionFactory`])
//! - Serial port candidates and the USB vendor filter
//! - Chip profiles and typed flash parameters
//! - Flash plans and their validation
//! - Status events and operation states
//! - Error types

pub mod chip;
pub mod device;
pub mod error;
pub mod event;
pub mod plan;
pub mod port;
pub mod session;

pub use chip::{
    chip_matches, ChipProfile, ChipProfiles, FlashConfig, FlashFreq, FlashMode, FlashParams,
    FlashSize, ProfileError, Setting, SAFE_BAUD,
};
pub use device::{ChipIdentity, DetectedDevice, MacAddress};
pub use error::{Error, Result, SessionError, Stage, ValidationError};
pub use event::{Category, Event, OperationState, Severity};
pub use plan::{parse_address, FlashPlan, FlashTask, LoadedTask};
pub use port::{Port, VendorFilter, KNOWN_VENDORS};
pub use session::{DeviceSession, SessionFactory, SessionGuard};
