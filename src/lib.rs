//! # SLM LUT Calibration Library
//!
//! Sweeps every gray level of a PCIe spatial light modulator while reading an
//! optical power meter, producing the raw or quantized response curves used to
//! build a linearizing look-up table.
//!
//! ## Crate Structure
//!
//! - **`config`**: `CalibrationConfig` loaded with figment from TOML and
//!   `SLM_CAL_*` environment variables, plus the panel presets that pick the
//!   linear-voltage LUT and sweep direction.
//! - **`error`**: The `CalibrationError` enum and `AppResult` alias.
//! - **`hardware`**: Capability traits for the SLM SDK, the pattern generator
//!   and the power meter, with simulated and vendor implementations.
//! - **`logging`**: `tracing-subscriber` initialization (pretty, compact, JSON).
//! - **`output`**: CSV and plot files for finalized regions.
//! - **`power_meter`**: `PowerMeterSession` (discover, connect, capture,
//!   disconnect) and unit handling.
//! - **`rig`**: The device set for a run and `run_calibration`, which falls
//!   back to a simulated SLM and always releases the meter.
//! - **`slm`**: `SlmSession`, the SDK handle between construction and release.
//! - **`sweep`**: The calibration sweep state machine and its records.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod output;
pub mod power_meter;
pub mod rig;
pub mod slm;
pub mod sweep;
