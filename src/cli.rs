//! CLI argument parsing

use clap::{Parser, Subcommand};
use espforge_core::{FlashFreq, FlashMode, FlashSize, FlashTask, Setting};
use std::path::PathBuf;

/// Parse a baud rate, or `keep` for the chip default
fn parse_baud(s: &str) -> Result<Setting<u32>, String> {
    let baud: Setting<u32> = s.parse().map_err(|e| format!("Invalid baud rate: {}", e))?;
    if baud.value() == Some(&0) {
        return Err("Baud rate must be non-zero".to_string());
    }
    Ok(baud)
}

fn parse_setting<T>(s: &str) -> Result<Setting<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse::<Setting<T>>().map_err(|e| e.to_string())
}

fn parse_image(s: &str) -> Result<FlashTask, String> {
    s.parse::<FlashTask>().map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "espforge")]
#[command(author, version, about = "ESP device discovery and flashing", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// RON file with chip profiles extending or overriding the built-in table
    #[arg(long, global = true)]
    pub profiles: Option<PathBuf>,

    /// Use emulated devices instead of real serial ports
    #[arg(long, global = true)]
    pub dummy: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flash parameters; each accepts `keep` to use the chip default
#[derive(clap::Args, Debug, Clone)]
pub struct FlashParamArgs {
    /// Baud rate for the flash session
    #[arg(short, long, default_value = "keep", value_parser = parse_baud)]
    pub baud: Setting<u32>,

    /// SPI flash mode (qio, qout, dio, dout, fastrd)
    #[arg(long, default_value = "keep", value_parser = parse_setting::<FlashMode>)]
    pub flash_mode: Setting<FlashMode>,

    /// SPI flash frequency (26.7m, 40m, 80m, 120m)
    #[arg(long, default_value = "keep", value_parser = parse_setting::<FlashFreq>)]
    pub flash_freq: Setting<FlashFreq>,

    /// Flash size (1MB .. 32MB), also bounds-checks the plan
    #[arg(long, default_value = "keep", value_parser = parse_setting::<FlashSize>)]
    pub flash_size: Setting<FlashSize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List serial ports
    Ports {
        /// Include ports whose USB vendor is not a known ESP bridge
        #[arg(short, long)]
        all: bool,
    },

    /// Probe serial ports for ESP devices in bootloader mode
    Detect {
        /// Only report chips whose model contains this string
        #[arg(short, long)]
        chip: Option<String>,

        /// Probe these ports instead of the enumerated candidates
        #[arg(short, long, value_delimiter = ',')]
        port: Vec<String>,

        /// Only try 115200 baud
        #[arg(long)]
        no_baud_fallback: bool,

        /// Maximum number of ports probed at once
        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..=64))]
        max_probes: u32,
    },

    /// Write firmware images to a device
    Flash {
        /// Serial port of the device
        #[arg(short, long)]
        port: String,

        /// Flash plan file (TOML)
        #[arg(long, conflicts_with = "image", required_unless_present = "image")]
        plan: Option<PathBuf>,

        /// Image to write as PATH[@ADDRESS] (may be repeated; address defaults to 0x0)
        #[arg(short, long, value_parser = parse_image)]
        image: Vec<FlashTask>,

        /// Expected chip model; a mismatch is reported as a warning
        #[arg(short, long)]
        chip: Option<String>,

        #[command(flatten)]
        params: FlashParamArgs,
    },

    /// Erase the whole flash of a device
    Erase {
        /// Serial port of the device
        #[arg(short, long)]
        port: String,

        /// Baud rate for the erase session
        #[arg(short, long, default_value = "keep", value_parser = parse_baud)]
        baud: Setting<u32>,

        /// Expected chip model; also selects the default baud rate
        #[arg(short, long)]
        chip: Option<String>,
    },

    /// List chip profiles
    ListChips {
        /// Filter by chip name (case-insensitive substring)
        #[arg(short, long)]
        filter: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flash_defaults_keep() {
        let cli = Cli::parse_from(["espforge", "flash", "-p", "COM3", "-i", "app.bin@0x10000"]);
        match cli.command {
            Commands::Flash { port, image, params, plan, .. } => {
                assert_eq!(port, "COM3");
                assert!(plan.is_none());
                assert_eq!(image.len(), 1);
                assert_eq!(image[0].address, 0x10000);
                assert!(params.baud.is_keep());
                assert!(params.flash_mode.is_keep());
                assert!(params.flash_size.is_keep());
            }
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_flash_needs_plan_or_image() {
        assert!(Cli::try_parse_from(["espforge", "flash", "-p", "COM3"]).is_err());
        assert!(Cli::try_parse_from([
            "espforge", "flash", "-p", "COM3", "--plan", "p.toml", "-i", "a.bin"
        ])
        .is_err());
    }

    #[test]
    fn test_flash_params() {
        let cli = Cli::parse_from([
            "espforge", "flash", "-p", "COM3", "--plan", "p.toml", "-b", "460800",
            "--flash-mode", "dio", "--flash-size", "KEEP",
        ]);
        match cli.command {
            Commands::Flash { params, .. } => {
                assert_eq!(params.baud, Setting::Value(460_800));
                assert_eq!(params.flash_mode, Setting::Value(FlashMode::Dio));
                assert!(params.flash_size.is_keep());
            }
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_zero_baud_rejected() {
        assert!(Cli::try_parse_from(["espforge", "erase", "-p", "COM3", "-b", "0"]).is_err());
    }

    #[test]
    fn test_detect_ports() {
        let cli = Cli::parse_from(["espforge", "--dummy", "detect", "-p", "COM3,COM4"]);
        assert!(cli.dummy);
        match cli.command {
            Commands::Detect { port, max_probes, .. } => {
                assert_eq!(port, ["COM3", "COM4"]);
                assert_eq!(max_probes, 8);
            }
            _ => panic!("expected detect"),
        }
    }
}
