//! CLI command implementations
//!
//! Each command that talks to devices starts an engine operation and follows
//! its status stream with [`progress::follow`] until the operation finishes.
//! Commands are generic over the session backend so the same code drives
//! the emulator and real serial ports.

mod chips;
mod detect;
mod flash;
mod ports;
mod progress;

pub use chips::list_chips;
pub use detect::run_detect;
pub use flash::{run_erase, run_flash, FlashArgs};
pub use ports::run_ports;
