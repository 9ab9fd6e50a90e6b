//! Custom error types for the calibration tool.
//!
//! This module defines `CalibrationError`, the single error type shared by the
//! device sessions, the sweep controller and the result writers. Using the
//! `thiserror` crate, each failure mode of a calibration run gets its own
//! variant so callers can tell a fatal LUT problem apart from a region-local
//! DMA failure.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceConstruction`**: the SLM SDK session could not be constructed. The
//!   vendor driver falls back to simulation mode, so this is reported but not
//!   fatal to the process.
//! - **`DeviceConnection`**: the power meter could not be opened (bad index, open
//!   failure, wavelength rejected).
//! - **`LutLoad`**: the LUT file for the detected panel is missing or invalid.
//!   Fatal to the sweep; the run never proceeds with an unknown LUT.
//! - **`ImageWrite`** / **`WriteConfirm`**: DMA or trigger failures. These end
//!   the run and trigger the safe-shutdown sequence.
//! - **`UnsupportedUnit`**: a power unit string outside `uW`, `mW`, `W`.
//!
//! Driver seams report failures through `anyhow::Error`; the sessions wrap the
//! driver message into the matching variant at the point of detection.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CalibrationError>;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("SLM SDK did not construct successfully: {0}")]
    DeviceConstruction(String),

    #[error("No SLM controller found")]
    NoBoards,

    #[error("Power meter connection error: {0}")]
    DeviceConnection(String),

    #[error("Error loading LUT file '{path}': {reason}")]
    LutLoad { path: String, reason: String },

    #[error("DMA failed: {0}")]
    ImageWrite(String),

    #[error("ImageWriteComplete failed, trigger never received? {0}")]
    WriteConfirm(String),

    #[error("Pattern generation failed: {0}")]
    PatternGeneration(String),

    #[error("Power measurement failed: {0}")]
    Measurement(String),

    #[error("Unsupported unit '{0}'. Use 'uW', 'mW', or 'W'.")]
    UnsupportedUnit(String),

    #[error("Sample count must be at least 1, got {0}")]
    InvalidSampleCount(usize),

    #[error("No panel preset for a {width}x{height} SLM; set slm.lut_file explicitly")]
    UnknownPanel { width: u32, height: u32 },

    #[error(
        "Sweep configured with reference={reference}, step_by={step_by} but the {panel} panel expects reference={expected_reference}, step_by={expected_step_by}"
    )]
    PanelMismatch {
        panel: String,
        reference: i32,
        step_by: i32,
        expected_reference: i32,
        expected_step_by: i32,
    },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Plot rendering error: {0}")]
    Plot(String),
}
