//! Flash plans
//!
//! A plan is an ordered list of firmware images and the flash addresses they
//! go to. Plans can be built in code or loaded from a TOML file:
//!
//! ```toml
//! [[task]]
//! file = "bootloader.bin"
//! address = 0x1000
//!
//! [[task]]
//! file = "partition-table.bin"
//! address = "0x8000"
//!
//! [[task]]
//! file = "app.bin"
//! address = 0x10000
//! enabled = false
//! ```
//!
//! Relative file paths are resolved against the directory of the plan file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ValidationError;

/// One image to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTask {
    pub path: PathBuf,
    pub address: u32,
    pub enabled: bool,
}

impl FlashTask {
    /// An enabled task
    pub fn new(path: impl Into<PathBuf>, address: u32) -> Self {
        Self {
            path: path.into(),
            address,
            enabled: true,
        }
    }
}

impl FromStr for FlashTask {
    type Err = ValidationError;

    /// Parses `PATH` (address 0) or `PATH@ADDR`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((path, addr)) if !path.is_empty() => Ok(Self::new(path, parse_address(addr)?)),
            _ => Ok(Self::new(s, 0)),
        }
    }
}

/// A task whose image has been read and checked
#[derive(Debug, Clone)]
pub struct LoadedTask {
    /// 1-based position in the plan
    pub index: usize,
    pub path: PathBuf,
    pub address: u32,
    pub data: Vec<u8>,
}

impl LoadedTask {
    /// Image length in bytes; always fits the flash address space
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

/// Ordered list of flash tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashPlan {
    tasks: Vec<FlashTask>,
}

/// TOML plan file structure
#[derive(Debug, serde::Deserialize)]
struct TomlPlanFile {
    #[serde(default)]
    task: Vec<TomlTask>,
}

/// Task definition in TOML
#[derive(Debug, serde::Deserialize)]
struct TomlTask {
    file: PathBuf,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    address: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_address(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a flash address that can be hex (0x...) or decimal
pub fn parse_address(s: &str) -> Result<u32, ValidationError> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        t.parse()
    };
    parsed.map_err(|_| ValidationError::InvalidAddress(s.to_string()))
}

impl FlashPlan {
    pub fn new(tasks: Vec<FlashTask>) -> Self {
        Self { tasks }
    }

    /// The one-task plan for a merged image at address 0
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::new(vec![FlashTask::new(path, 0)])
    }

    pub fn push(&mut self, task: FlashTask) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[FlashTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Enabled tasks with their 1-based plan positions
    pub fn enabled(&self) -> impl Iterator<Item = (usize, &FlashTask)> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enabled)
            .map(|(i, t)| (i + 1, t))
    }

    /// Load a plan from a TOML file
    pub fn load_file(path: &Path) -> Result<Self, ValidationError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ValidationError::PlanFile(format!("{}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_toml(&content, base)
    }

    /// Parse a plan from TOML, resolving relative paths against `base`
    pub fn from_toml(content: &str, base: &Path) -> Result<Self, ValidationError> {
        let file: TomlPlanFile =
            toml::from_str(content).map_err(|e| ValidationError::PlanFile(e.to_string()))?;

        let tasks = file
            .task
            .into_iter()
            .map(|t| FlashTask {
                path: if t.file.is_relative() {
                    base.join(t.file)
                } else {
                    t.file
                },
                address: t.address,
                enabled: t.enabled,
            })
            .collect();

        Ok(Self { tasks })
    }

    /// Read every enabled image and check the plan can be executed
    ///
    /// No device is touched. `flash_size` bounds the regions when known.
    pub fn load(&self, flash_size: Option<u32>) -> Result<Vec<LoadedTask>, ValidationError> {
        if self.tasks.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }

        let mut loaded = Vec::new();
        for (index, task) in self.enabled() {
            let data = read_image(index, &task.path)?;

            let end = task.address as u64 + data.len() as u64;
            if data.len() > u32::MAX as usize || end > 1u64 << 32 {
                return Err(ValidationError::AddressOverflow {
                    index,
                    address: task.address,
                    len: data.len(),
                });
            }
            if let Some(size) = flash_size {
                if end > size as u64 {
                    return Err(ValidationError::OutOfBounds {
                        index,
                        address: task.address,
                        end,
                        flash_size: size,
                    });
                }
            }

            loaded.push(LoadedTask {
                index,
                path: task.path.clone(),
                address: task.address,
                data,
            });
        }

        if loaded.is_empty() {
            return Err(ValidationError::NoEnabledTasks);
        }

        check_overlaps(&loaded)?;
        Ok(loaded)
    }
}

fn read_image(index: usize, path: &Path) -> Result<Vec<u8>, ValidationError> {
    let data = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ValidationError::MissingFile {
            index,
            path: path.to_path_buf(),
        },
        _ => ValidationError::Unreadable {
            index,
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    if data.is_empty() {
        return Err(ValidationError::EmptyImage {
            index,
            path: path.to_path_buf(),
        });
    }
    Ok(data)
}

fn check_overlaps(tasks: &[LoadedTask]) -> Result<(), ValidationError> {
    let mut sorted: Vec<&LoadedTask> = tasks.iter().collect();
    sorted.sort_by_key(|t| t.address);

    for pair in sorted.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if (b.address as u64) < a.end() {
            return Err(ValidationError::Overlap {
                first: a.index,
                second: b.index,
                address: b.address,
            });
        }
    }
    Ok(())
}
