//! espforge-engine - Discovery and flash orchestration
//!
//! This crate drives device sessions from a [`SessionFactory`] backend:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   CLI (bin/espforge)                     │
//! │  - Issues start/cancel commands, renders the status      │
//! │    stream                                                │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                espforge-engine (this crate)              │
//! │  - Engine: start_discovery / start_flash / start_erase   │
//! │  - Lease table: one pipeline, one discovery, one probe   │
//! │    per port                                              │
//! │  - Baud fallback shared by every operation               │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!             ┌──────────────┴──────────────┐
//!             ▼                             ▼
//! ┌────────────────────────┐   ┌────────────────────────────┐
//! │    espforge-core       │   │  Session backends          │
//! │  - DeviceSession trait │   │  - espforge-dummy          │
//! │  - Plans, profiles,    │   │  - espforge-espflash       │
//! │    events, errors      │   │                            │
//! └────────────────────────┘   └────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use espforge_engine::{DiscoveryRequest, Engine, EngineConfig};
//!
//! let (engine, mut status) = Engine::new(factory, EngineConfig::default());
//! let handle = engine.start_discovery(DiscoveryRequest::default())?;
//! while let Some(event) = status.recv().await {
//!     println!("{}", event);
//! }
//! let report = handle.await?;
//! ```
//!
//! [`SessionFactory`]: espforge_core::SessionFactory

mod baud;
mod channel;
mod discovery;
mod engine;
mod enumerate;
mod lease;
mod pipeline;

pub use baud::{connect_with_fallback, BaudPolicy, Connected, FAST_BAUD};
pub use channel::{status_channel, StatusReceiver, StatusSender};
pub use discovery::{DiscoveryReport, DiscoveryRequest};
pub use engine::{Engine, EngineConfig};
pub use enumerate::{list_all_ports, list_candidate_ports, list_candidate_ports_with};
pub use pipeline::{EraseReport, EraseRequest, FlashReport, FlashRequest};

// Re-export core types the CLI needs
pub use espforge_core::{Error, Event, OperationState, Result};
