//! Flash and erase command implementations

use std::path::PathBuf;

use espforge_core::{FlashParams, FlashPlan, FlashTask, Setting};
use espforge_engine::{Engine, EraseRequest, FlashRequest, StatusReceiver};

use super::progress::follow;
use crate::backends::Backend;

/// Everything the flash command needs from the command line
pub struct FlashArgs {
    pub port: String,
    pub plan: Option<PathBuf>,
    pub images: Vec<FlashTask>,
    pub chip: Option<String>,
    pub params: FlashParams,
}

impl FlashArgs {
    /// The plan file if one was given, otherwise the images in order
    fn plan(&self) -> Result<FlashPlan, Box<dyn std::error::Error>> {
        match &self.plan {
            Some(path) => Ok(FlashPlan::load_file(path)?),
            None => Ok(FlashPlan::new(self.images.clone())),
        }
    }
}

/// Run the flash command
pub async fn run_flash<F: Backend>(
    engine: &Engine<F>,
    status: &mut StatusReceiver,
    args: FlashArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let plan = args.plan()?;
    for (index, task) in plan.enabled() {
        log::debug!(
            "Task {}: {} at 0x{:08X}",
            index,
            task.path.display(),
            task.address
        );
    }

    let request = FlashRequest {
        port: args.port,
        plan,
        params: args.params,
        chip: args.chip,
    };
    let handle = engine.start_flash(request)?;
    let report = follow(engine, status, handle).await??;

    println!(
        "Flashed {} task(s), {} bytes to {} ({}) at {} baud",
        report.tasks, report.bytes, report.chip.chip_name, report.chip.mac, report.baud
    );
    println!("Flash settings: {}", report.config);
    if !report.reset {
        println!("Reset the device manually to run the new firmware");
    }
    Ok(())
}

/// Run the erase command
pub async fn run_erase<F: Backend>(
    engine: &Engine<F>,
    status: &mut StatusReceiver,
    port: String,
    baud: Setting<u32>,
    chip: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = engine.start_erase(EraseRequest { port, baud, chip })?;
    let report = follow(engine, status, handle).await??;

    println!(
        "Erased flash of {} ({}) at {} baud",
        report.chip.chip_name, report.chip.mac, report.baud
    );
    if !report.reset {
        println!("Reset the device manually");
    }
    Ok(())
}
