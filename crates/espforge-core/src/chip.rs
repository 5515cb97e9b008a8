//! Chip profiles and flash parameters
//!
//! A [`ChipProfile`] holds the defaults used when the caller leaves a flash
//! parameter at [`Setting::Keep`]. The built-in table can be extended or
//! overridden at runtime from a RON file:
//!
//! ```ron
//! (
//!     profiles: [
//!         (
//!             name: "ESP32-S3",
//!             baud: 460800,
//!             flash_mode: "qio",
//!             flash_freq: "80m",
//!             flash_size: "8MB",
//!         ),
//!     ],
//! )
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

/// Baud rate every ROM bootloader answers at
pub const SAFE_BAUD: u32 = 115_200;

/// Error type for chip profile loading
#[derive(Debug, Error)]
pub enum ProfileError {
    /// I/O error reading a profile file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// RON parsing error
    #[error("parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// A field had an unknown value
    #[error("validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Flash parameters
// ============================================================================

/// A parameter that is either set by the caller or left to a default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    /// Use the chip profile value, or the session default if there is none
    Keep,
    /// Use this value
    Value(T),
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T> Setting<T> {
    /// The explicit value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Keep => None,
            Self::Value(v) => Some(v),
        }
    }

    /// Whether this is [`Setting::Keep`]
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    /// Replace `Keep` with `fallback`
    pub fn or(self, fallback: T) -> Self {
        match self {
            Self::Keep => Self::Value(fallback),
            v => v,
        }
    }
}

impl<T: Copy> Setting<T> {
    /// Convert to `Option`, `Keep` becoming `None`
    pub fn get(&self) -> Option<T> {
        self.value().copied()
    }
}

impl<T: FromStr> FromStr for Setting<T> {
    type Err = T::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("keep") {
            Ok(Self::Keep)
        } else {
            s.parse().map(Self::Value)
        }
    }
}

impl<T: fmt::Display> fmt::Display for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep => write!(f, "keep"),
            Self::Value(v) => v.fmt(f),
        }
    }
}

/// SPI flash access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashMode {
    Qio,
    Qout,
    Dio,
    Dout,
    FastRead,
}

impl FlashMode {
    /// All modes, in the order they are listed to users
    pub const ALL: [FlashMode; 5] = [
        FlashMode::Qio,
        FlashMode::Qout,
        FlashMode::Dio,
        FlashMode::Dout,
        FlashMode::FastRead,
    ];
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Qio => "qio",
            Self::Qout => "qout",
            Self::Dio => "dio",
            Self::Dout => "dout",
            Self::FastRead => "fastrd",
        };
        f.write_str(s)
    }
}

impl FromStr for FlashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qio" => Ok(Self::Qio),
            "qout" => Ok(Self::Qout),
            "dio" => Ok(Self::Dio),
            "dout" => Ok(Self::Dout),
            "fastrd" | "fast_read" | "fastread" => Ok(Self::FastRead),
            other => Err(format!("unknown flash mode '{}'", other)),
        }
    }
}

/// SPI flash clock frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashFreq {
    /// 26.7 MHz
    Freq26M,
    /// 40 MHz
    Freq40M,
    /// 80 MHz
    Freq80M,
    /// 120 MHz
    Freq120M,
}

impl FlashFreq {
    /// Frequency in Hz
    pub fn hz(self) -> u32 {
        match self {
            Self::Freq26M => 26_700_000,
            Self::Freq40M => 40_000_000,
            Self::Freq80M => 80_000_000,
            Self::Freq120M => 120_000_000,
        }
    }
}

impl fmt::Display for FlashFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Freq26M => "26.7m",
            Self::Freq40M => "40m",
            Self::Freq80M => "80m",
            Self::Freq120M => "120m",
        };
        f.write_str(s)
    }
}

impl FromStr for FlashFreq {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "26.7m" | "26m" => Ok(Self::Freq26M),
            "40m" => Ok(Self::Freq40M),
            "80m" => Ok(Self::Freq80M),
            "120m" => Ok(Self::Freq120M),
            other => Err(format!("unknown flash frequency '{}'", other)),
        }
    }
}

/// Flash chip capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlashSize {
    Size1Mb,
    Size2Mb,
    Size4Mb,
    Size8Mb,
    Size16Mb,
    Size32Mb,
}

impl FlashSize {
    /// Capacity in bytes
    pub fn bytes(self) -> u32 {
        const MIB: u32 = 1024 * 1024;
        match self {
            Self::Size1Mb => MIB,
            Self::Size2Mb => 2 * MIB,
            Self::Size4Mb => 4 * MIB,
            Self::Size8Mb => 8 * MIB,
            Self::Size16Mb => 16 * MIB,
            Self::Size32Mb => 32 * MIB,
        }
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.bytes() / (1024 * 1024))
    }
}

impl FromStr for FlashSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let num = lower
            .strip_suffix("mib")
            .or_else(|| lower.strip_suffix("mb"))
            .unwrap_or(&lower)
            .trim();
        match num {
            "1" => Ok(Self::Size1Mb),
            "2" => Ok(Self::Size2Mb),
            "4" => Ok(Self::Size4Mb),
            "8" => Ok(Self::Size8Mb),
            "16" => Ok(Self::Size16Mb),
            "32" => Ok(Self::Size32Mb),
            _ => Err(format!("unknown flash size '{}'", s.trim())),
        }
    }
}

/// Flash parameters as requested by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashParams {
    pub baud: Setting<u32>,
    pub flash_mode: Setting<FlashMode>,
    pub flash_freq: Setting<FlashFreq>,
    pub flash_size: Setting<FlashSize>,
}

impl FlashParams {
    /// The part of the parameters a session applies when writing
    pub fn flash_config(&self) -> FlashConfig {
        FlashConfig {
            mode: self.flash_mode.get(),
            freq: self.flash_freq.get(),
            size: self.flash_size.get(),
        }
    }
}

/// Flash settings passed to [`crate::DeviceSession::write`]
///
/// `None` means the session keeps its own default for that field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashConfig {
    pub mode: Option<FlashMode>,
    pub freq: Option<FlashFreq>,
    pub size: Option<FlashSize>,
}

impl fmt::Display for FlashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "keep".to_string())
        }
        write!(
            f,
            "mode={} freq={} size={}",
            field(&self.mode),
            field(&self.freq),
            field(&self.size)
        )
    }
}

// ============================================================================
// Chip profiles
// ============================================================================

/// Default parameters for one chip model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipProfile {
    /// Model name as shown to users
    pub name: String,
    /// Alternative names that select the same profile
    pub aliases: Vec<String>,
    pub baud: u32,
    pub flash_mode: FlashMode,
    pub flash_freq: FlashFreq,
    pub flash_size: FlashSize,
}

impl ChipProfile {
    fn esp(name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            baud: SAFE_BAUD,
            flash_mode: FlashMode::Dio,
            flash_freq: FlashFreq::Freq80M,
            flash_size: FlashSize::Size4Mb,
        }
    }

    /// Whether `name` selects this profile
    pub fn matches(&self, name: &str) -> bool {
        let key = normalize(name);
        normalize(&self.name) == key || self.aliases.iter().any(|a| normalize(a) == key)
    }
}

/// Reduce a chip name to a lookup key
///
/// `"ESP32-C3 / ESP8685"` and `"esp32_c3"` both become `"esp32c3"`.
pub fn normalize(name: &str) -> String {
    let primary = name.split('/').next().unwrap_or(name);
    primary
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether a detected chip model passes a user chip filter
///
/// The filter is a case-insensitive substring of the model; `None` and
/// `"Any"` accept every chip.
pub fn chip_matches(model: &str, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(f) if f.trim().is_empty() || f.trim().eq_ignore_ascii_case("any") => true,
        Some(f) => model.to_lowercase().contains(&f.trim().to_lowercase()),
    }
}

/// RON profile definition (intermediate format)
#[derive(Debug, serde::Deserialize)]
struct ProfileDef {
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
    baud: Option<u32>,
    flash_mode: Option<String>,
    flash_freq: Option<String>,
    flash_size: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ProfileFileDef {
    profiles: Vec<ProfileDef>,
}

/// Table of chip profiles
#[derive(Debug, Clone)]
pub struct ChipProfiles {
    profiles: Vec<ChipProfile>,
}

impl Default for ChipProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ChipProfiles {
    /// Name of the profile used when no chip is selected
    pub const ANY: &'static str = "Any";

    /// The built-in table
    pub fn builtin() -> Self {
        let mut c2 = ChipProfile::esp("ESP32-C2");
        c2.aliases.push("ESP8684".to_string());
        c2.flash_mode = FlashMode::Qio;
        c2.flash_freq = FlashFreq::Freq40M;
        c2.flash_size = FlashSize::Size2Mb;

        let mut c3 = ChipProfile::esp("ESP32-C3");
        c3.aliases.push("ESP8685".to_string());

        let profiles = vec![
            ChipProfile::esp(Self::ANY),
            ChipProfile::esp("ESP32"),
            ChipProfile::esp("ESP8266"),
            c2,
            c3,
            ChipProfile::esp("ESP32-C5"),
            ChipProfile::esp("ESP32-C6"),
            ChipProfile::esp("ESP32-C61"),
            ChipProfile::esp("ESP32-H2"),
            ChipProfile::esp("ESP32-P4"),
            ChipProfile::esp("ESP32-S2"),
            ChipProfile::esp("ESP32-S3"),
        ];
        Self { profiles }
    }

    /// Load profile definitions from a RON file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, ProfileError> {
        let content = fs::read_to_string(path)?;
        self.load_ron(&content)
    }

    /// Load profile definitions from a RON string
    ///
    /// A profile whose name matches an existing one replaces it; fields the
    /// definition leaves out keep the existing (or `Any`) values.
    pub fn load_ron(&mut self, content: &str) -> Result<usize, ProfileError> {
        // Optional fields are written bare, without `Some(..)`
        let file: ProfileFileDef = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(content)?;
        let count = file.profiles.len();

        for def in file.profiles {
            let existing = self.find(&def.name).cloned();
            let name = existing
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| def.name.clone());
            let base = existing
                .or_else(|| self.find(Self::ANY).cloned())
                .unwrap_or_else(|| ChipProfile::esp(&def.name));

            let profile = ChipProfile {
                name,
                aliases: if def.aliases.is_empty() {
                    base.aliases.clone()
                } else {
                    def.aliases
                },
                baud: def.baud.unwrap_or(base.baud),
                flash_mode: parse_field(def.flash_mode, base.flash_mode)?,
                flash_freq: parse_field(def.flash_freq, base.flash_freq)?,
                flash_size: parse_field(def.flash_size, base.flash_size)?,
            };

            if profile.baud == 0 {
                return Err(ProfileError::Validation(format!(
                    "profile {}: baud must not be zero",
                    profile.name
                )));
            }

            match self.profiles.iter_mut().find(|p| p.matches(&profile.name)) {
                Some(existing) => {
                    log::debug!("Overriding chip profile {}", existing.name);
                    *existing = profile;
                }
                None => {
                    log::debug!("Adding chip profile {}", profile.name);
                    self.profiles.push(profile);
                }
            }
        }

        Ok(count)
    }

    /// Get all profiles
    pub fn profiles(&self) -> &[ChipProfile] {
        &self.profiles
    }

    /// Iterate over all profiles
    pub fn iter(&self) -> impl Iterator<Item = &ChipProfile> {
        self.profiles.iter()
    }

    /// Get the number of profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Find a profile by exact (normalized) name or alias
    pub fn find(&self, name: &str) -> Option<&ChipProfile> {
        self.profiles.iter().find(|p| p.matches(name))
    }

    /// Find the profile for a chip name reported by a device
    ///
    /// Devices report names with package or revision suffixes
    /// (`"ESP32-C3 (QFN32) (revision v0.4)"`), so after an exact lookup this
    /// falls back to the longest profile name the reported name starts with.
    pub fn for_detected(&self, reported: &str) -> Option<&ChipProfile> {
        if let Some(p) = self.find(reported) {
            return Some(p);
        }
        let key = normalize(reported);
        self.profiles
            .iter()
            .filter(|p| !p.matches(Self::ANY))
            .filter(|p| key.starts_with(&normalize(&p.name)))
            .max_by_key(|p| normalize(&p.name).len())
    }

    /// Fill `Keep` parameters from the profile of `chip`
    ///
    /// `None` and unknown chips resolve through the `Any` profile. Fields the
    /// caller set are never changed.
    pub fn resolve(&self, chip: Option<&str>, params: FlashParams) -> FlashParams {
        let profile = chip
            .and_then(|c| self.for_detected(c))
            .or_else(|| self.find(Self::ANY));

        match profile {
            Some(p) => FlashParams {
                baud: params.baud.or(p.baud),
                flash_mode: params.flash_mode.or(p.flash_mode),
                flash_freq: params.flash_freq.or(p.flash_freq),
                flash_size: params.flash_size.or(p.flash_size),
            },
            None => params,
        }
    }
}

fn parse_field<T>(value: Option<String>, fallback: T) -> Result<T, ProfileError>
where
    T: FromStr<Err = String>,
{
    match value {
        Some(s) => s.parse().map_err(ProfileError::Validation),
        None => Ok(fallback),
    }
}
