//! espforge - ESP device discovery and flashing
//!
//! Finds Espressif chips in ROM bootloader mode on the host's serial ports
//! and writes firmware images to them.
//!
//! # Architecture
//!
//! The CLI is a thin presentation layer over `espforge-engine`:
//! - **Discovery** probes candidate ports concurrently and reports every
//!   device that answers
//! - **Flash / erase** run one exclusive session against a single port
//!
//! Both stream their progress as status events, rendered here as a spinner
//! while the messages themselves go through `log`.

mod backends;
mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use espforge_core::{ChipProfiles, FlashParams};
use espforge_engine::{Engine, EngineConfig};
use std::path::Path;

use backends::Backend;
use commands::FlashArgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let profiles = match load_profiles(cli.profiles.as_deref()) {
        Ok(profiles) => profiles,
        Err(e) => {
            eprintln!("Failed to load chip profiles: {}", e);
            std::process::exit(1);
        }
    };
    log::debug!("Loaded {} chip profiles", profiles.len());

    if let Commands::ListChips { filter } = &cli.command {
        commands::list_chips(&profiles, filter.as_deref());
        return Ok(());
    }

    let mut config = EngineConfig {
        profiles,
        ..EngineConfig::default()
    };
    if let Commands::Detect { max_probes, .. } = &cli.command {
        config.max_concurrent_probes = *max_probes as usize;
    }

    if cli.dummy {
        return dummy(cli.command, config).await;
    }
    serial(cli.command, config).await
}

#[cfg(feature = "dummy")]
async fn dummy(command: Commands, config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    run(backends::dummy_factory(), command, config).await
}

#[cfg(not(feature = "dummy"))]
async fn dummy(_: Commands, _: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err(backends::BackendError::NotBuilt("dummy").into())
}

#[cfg(feature = "espflash")]
async fn serial(command: Commands, config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    run(espforge_espflash::EspflashFactory::new(), command, config).await
}

#[cfg(not(feature = "espflash"))]
async fn serial(_: Commands, _: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let built: Vec<_> = backends::available_backends()
        .iter()
        .map(|b| format!("{} ({})", b.name, b.description))
        .collect();
    log::info!("Available backends: {}", built.join(", "));
    Err(backends::BackendError::NotBuilt("espflash").into())
}

/// Dispatch a device command to the engine
async fn run<F: Backend>(
    factory: F,
    command: Commands,
    config: EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    log::debug!("Using the {} backend", factory.name());
    let (engine, mut status) = Engine::new(factory, config);

    match command {
        Commands::Ports { all } => {
            let ports = if all {
                engine.factory().all_ports()
            } else {
                engine
                    .factory()
                    .candidate_ports(&engine.config().vendor_filter)
            };
            commands::run_ports(&ports, all);
            Ok(())
        }
        Commands::Detect {
            chip,
            port,
            no_baud_fallback,
            max_probes: _,
        } => commands::run_detect(&engine, &mut status, chip, &port, no_baud_fallback).await,
        Commands::Flash {
            port,
            plan,
            image,
            chip,
            params,
        } => {
            let args = FlashArgs {
                port,
                plan,
                images: image,
                chip,
                params: FlashParams {
                    baud: params.baud,
                    flash_mode: params.flash_mode,
                    flash_freq: params.flash_freq,
                    flash_size: params.flash_size,
                },
            };
            commands::run_flash(&engine, &mut status, args).await
        }
        Commands::Erase { port, baud, chip } => {
            commands::run_erase(&engine, &mut status, port, baud, chip).await
        }
        Commands::ListChips { filter } => {
            commands::list_chips(&engine.config().profiles, filter.as_deref());
            Ok(())
        }
    }
}

/// Built-in profiles, extended from `path` when one is given
fn load_profiles(path: Option<&Path>) -> Result<ChipProfiles, Box<dyn std::error::Error>> {
    let mut profiles = ChipProfiles::builtin();

    if let Some(path) = path {
        if !path.is_file() {
            return Err(format!("Chip profile file not found: {}", path.display()).into());
        }
        let count = profiles.load_file(path)?;
        log::info!("Loaded {} chip profiles from {}", count, path.display());
    }

    Ok(profiles)
}
