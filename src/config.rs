//! Calibration Configuration using Figment
//!
//! Strongly-typed configuration for a calibration run. Configuration is loaded from:
//! 1. a TOML file (default `config/calibration.toml`; missing file means all defaults)
//! 2. Environment variables (prefixed with `SLM_CAL_`, sections split on `__`)
//!
//! Every field has a default matching the bench setup the tool was written
//! for: board 1, 1000 ms DMA timeout, 1550 nm, 20 samples per point in uW,
//! 8-pixel stripes, one global region and raw (unquantized) output.
//!
//! # Example
//! ```no_run
//! use slm_lut_calibration::config::CalibrationConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CalibrationConfig::load()?;
//! config.validate()?;
//! println!("Sweeping {} regions", config.sweep.num_regions);
//! # Ok(())
//! # }
//! ```
//!
//! # Panel presets
//!
//! The detected panel width selects the linear-voltage LUT to load and fixes
//! which sweep direction the run must be configured with:
//!
//! | Panel     | LUT file                       | Reference | StepBy |
//! |-----------|--------------------------------|-----------|--------|
//! | 1920x1152 | `1920x1152_linearVoltage.LUT`  | 0         | +1     |
//! | 1024x1024 | `1024x1024_linearVoltage.LUT`  | 255       | -1     |
//!
//! The pairing is a precondition checked before the sweep starts; it is never
//! derived from the panel.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, CalibrationError};
use crate::hardware::stripe::region_grid_side;
use crate::hardware::ImageGeometry;
use crate::power_meter::PowerUnit;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/calibration.toml";

/// Gray levels an 8-bit controller can command
pub const MAX_DATA_POINTS: usize = 256;

/// Top-level calibration configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// SLM board settings
    pub slm: SlmConfig,
    /// Gray-level sweep settings
    pub sweep: SweepConfig,
    /// Power meter settings
    pub power_meter: PowerMeterConfig,
    /// Result file settings
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// SLM board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlmConfig {
    /// Board number passed to every SDK call
    pub board_number: u32,
    /// Bound on image write and write-complete polling
    pub timeout_ms: u32,
    /// Wait for an external trigger before loading each image
    pub external_trigger: bool,
    /// Flip to new images immediately
    pub flip_immediate: bool,
    /// Emit an output pulse on every image flip
    pub output_pulse: bool,
    /// Directory holding the vendor LUT files
    pub lut_dir: PathBuf,
    /// Explicit LUT file, e.g. a calibrated LUT being verified. Overrides the
    /// panel preset.
    pub lut_file: Option<PathBuf>,
    /// Use the simulated SLM and power meter instead of hardware
    pub simulate: bool,
}

impl Default for SlmConfig {
    fn default() -> Self {
        Self {
            board_number: 1,
            timeout_ms: 1000,
            external_trigger: false,
            flip_immediate: false,
            output_pulse: false,
            lut_dir: PathBuf::from("C:\\Program Files\\Meadowlark Optics\\Blink Plus\\LUT Files"),
            lut_file: None,
            simulate: false,
        }
    }
}

/// Gray-level sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Gray level of the fixed stripes, also where the swept level starts
    pub reference: i32,
    /// Increment of the swept level per data point (+1 or -1)
    pub step_by: i32,
    /// 1 for a global LUT, 64 for a regional LUT
    pub num_regions: u32,
    /// Stripe width in pixels
    pub pixels_per_stripe: u32,
    /// Vertical stripes
    pub vertical: bool,
    /// Data points per region
    pub num_data_points: usize,
    /// 0 keeps raw power values; otherwise readings are normalized and
    /// quantized to this many bits
    pub output_bits: u32,
    /// Liquid-crystal settle time before sampling
    pub settle_ms: u64,
    /// Pause after sampling
    pub post_sample_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reference: 0,
            step_by: 1,
            num_regions: 1,
            pixels_per_stripe: 8,
            vertical: true,
            num_data_points: MAX_DATA_POINTS,
            output_bits: 0,
            settle_ms: 1000,
            post_sample_ms: 500,
        }
    }
}

impl SweepConfig {
    /// Settle delay
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Post-sample delay
    pub fn post_sample(&self) -> Duration {
        Duration::from_millis(self.post_sample_ms)
    }
}

/// Power meter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerMeterConfig {
    /// Index into the discovered device list
    pub device_index: usize,
    /// Correction wavelength in nm
    pub wavelength_nm: f64,
    /// Readings averaged per data point
    pub sample_count: usize,
    /// Unit of recorded readings (uW, mW, W)
    pub unit: String,
    /// Stabilization wait after opening the meter
    pub startup_delay_ms: u64,
}

impl Default for PowerMeterConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            wavelength_nm: 1550.0,
            sample_count: 20,
            unit: "uW".to_string(),
            startup_delay_ms: 2000,
        }
    }
}

impl PowerMeterConfig {
    /// Parsed unit
    pub fn power_unit(&self) -> AppResult<PowerUnit> {
        self.unit.parse()
    }

    /// Stabilization wait
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Result file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving CSV files and plots
    pub dir: PathBuf,
    /// Prefix file names with a `yymmdd_` date stamp
    pub date_prefix: bool,
    /// Render a PNG plot per region in raw mode
    pub plot: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./measured_data"),
            date_prefix: true,
            plot: true,
        }
    }
}

/// Known panel with its linear-voltage LUT and sweep direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelPreset {
    /// Panel name, `{width}x{height}`
    pub name: &'static str,
    /// Panel width in pixels
    pub width: u32,
    /// LUT file name inside `slm.lut_dir`
    pub lut_file: &'static str,
    /// Reference gray level the sweep must use
    pub reference: i32,
    /// Step direction the sweep must use
    pub step_by: i32,
}

/// All supported panels
pub const PANEL_PRESETS: [PanelPreset; 2] = [
    PanelPreset {
        name: "1920x1152",
        width: 1920,
        lut_file: "1920x1152_linearVoltage.LUT",
        reference: 0,
        step_by: 1,
    },
    PanelPreset {
        name: "1024x1024",
        width: 1024,
        lut_file: "1024x1024_linearVoltage.LUT",
        reference: 255,
        step_by: -1,
    },
];

impl PanelPreset {
    /// Preset for a detected panel width
    pub fn for_width(width: u32) -> Option<&'static PanelPreset> {
        PANEL_PRESETS.iter().find(|p| p.width == width)
    }

    /// Check that a sweep is configured with this panel's direction.
    pub fn check_pairing(&self, sweep: &SweepConfig) -> AppResult<()> {
        if sweep.reference == self.reference && sweep.step_by == self.step_by {
            return Ok(());
        }
        Err(CalibrationError::PanelMismatch {
            panel: self.name.to_string(),
            reference: sweep.reference,
            step_by: sweep.step_by,
            expected_reference: self.reference,
            expected_step_by: self.step_by,
        })
    }
}

/// LUT selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LutSelection {
    /// File to load
    pub path: PathBuf,
    /// Preset that picked it, `None` for an explicit `slm.lut_file`
    pub preset: Option<&'static PanelPreset>,
}

impl CalibrationConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file with prefix `SLM_CAL_`.
    /// Example: `SLM_CAL_POWER_METER__SAMPLE_COUNT=50`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SLM_CAL_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(CalibrationError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let sweep = &self.sweep;
        if sweep.step_by != 1 && sweep.step_by != -1 {
            return invalid(format!("step_by must be +1 or -1, got {}", sweep.step_by));
        }
        if !(0..=255).contains(&sweep.reference) {
            return invalid(format!("reference must be 0-255, got {}", sweep.reference));
        }
        if sweep.num_data_points == 0 || sweep.num_data_points > MAX_DATA_POINTS {
            return invalid(format!(
                "num_data_points must be 1-{}, got {}",
                MAX_DATA_POINTS, sweep.num_data_points
            ));
        }
        if region_grid_side(sweep.num_regions).is_none() {
            return invalid(format!(
                "num_regions must be a perfect square (1, 4, 16, 64, ...), got {}",
                sweep.num_regions
            ));
        }
        if sweep.pixels_per_stripe == 0 {
            return invalid("pixels_per_stripe must be positive".to_string());
        }
        if sweep.output_bits > 16 {
            return invalid(format!("output_bits must be 0-16, got {}", sweep.output_bits));
        }

        let meter = &self.power_meter;
        if meter.sample_count == 0 {
            return Err(CalibrationError::InvalidSampleCount(0));
        }
        meter.power_unit()?;
        if !(meter.wavelength_nm > 0.0) {
            return invalid(format!(
                "wavelength_nm must be positive, got {}",
                meter.wavelength_nm
            ));
        }

        if self.slm.timeout_ms == 0 {
            return invalid("slm.timeout_ms must be positive".to_string());
        }

        Ok(())
    }

    /// Pick the LUT for a detected panel and check the sweep direction
    /// against the panel preset.
    ///
    /// # Errors
    /// - `UnknownPanel` if no preset matches and no `slm.lut_file` is set
    /// - `PanelMismatch` if a preset matches but the sweep direction differs
    pub fn select_lut(&self, geometry: ImageGeometry) -> AppResult<LutSelection> {
        if let Some(path) = &self.slm.lut_file {
            return Ok(LutSelection {
                path: path.clone(),
                preset: None,
            });
        }

        let preset =
            PanelPreset::for_width(geometry.width).ok_or(CalibrationError::UnknownPanel {
                width: geometry.width,
                height: geometry.height,
            })?;
        preset.check_pairing(&self.sweep)?;

        Ok(LutSelection {
            path: self.slm.lut_dir.join(preset.lut_file),
            preset: Some(preset),
        })
    }
}
