//! Mock Hardware Implementations
//!
//! Provides simulated devices for `--simulate` runs and for tests without a
//! physical SLM or power meter.
//!
//! # Available Mocks
//!
//! - `SimulatedSlm` - SLM controller that records every image it is sent
//! - `SimulatedPowerMeter` - power meter that reads the first diffraction order
//!   of whatever the simulated SLM currently displays
//!
//! Both sides share an [`OpticalBench`]: the SLM stores the stripe contrast of
//! the last image, the meter turns it into optical power with a sin^2 phase
//! response and a little seeded noise. The response is nonlinear in gray level,
//! like an uncalibrated panel.
//!
//! # Failure Injection
//!
//! Both builders can make a specific call fail (n-th image write, n-th
//! confirmation, open, LUT load) so abort paths can be tested.

use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::hardware::capabilities::{PowerMeterDriver, SdkSession, SlmDriver};
use crate::hardware::sdk_status::{
    check_lut_status, check_transfer_status, LUT_FAILED, TRANSFER_OK,
};
use crate::hardware::ImageGeometry;

// =============================================================================
// OpticalBench - shared state between the simulated devices
// =============================================================================

/// Shared optical state between a simulated SLM and a simulated power meter.
#[derive(Debug, Clone, Default)]
pub struct OpticalBench {
    contrast: Arc<Mutex<u8>>,
}

impl OpticalBench {
    /// Create a bench with a blank SLM
    pub fn new() -> Self {
        Self::default()
    }

    /// Gray-level contrast currently displayed on the SLM
    pub async fn contrast(&self) -> u8 {
        *self.contrast.lock().await
    }

    async fn set_contrast(&self, contrast: u8) {
        *self.contrast.lock().await = contrast;
    }
}

/// First-order diffraction efficiency of a binary grating whose two levels
/// differ by `contrast` gray levels, for a panel with a nonlinear response.
pub fn first_order_efficiency(contrast: u8, gamma: f64) -> f64 {
    let phase = 2.0 * PI * (f64::from(contrast) / 255.0).powf(gamma);
    (phase / 2.0).sin().powi(2)
}

// =============================================================================
// SimulatedSlm
// =============================================================================

/// Summary of one image written to the simulated SLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenImage {
    /// True when every byte was zero
    pub blank: bool,
    /// Lowest pixel value in the buffer
    pub min: u8,
    /// Highest pixel value in the buffer
    pub max: u8,
}

/// Everything the simulated SLM was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SlmLog {
    /// Successful image writes, in order
    pub writes: Vec<WrittenImage>,
    /// Number of `write_image` calls, including failed ones
    pub write_calls: usize,
    /// Number of `confirm_write_complete` calls, including failed ones
    pub confirm_calls: usize,
    /// Last LUT loaded
    pub lut: Option<String>,
    /// (external_trigger, flip_immediate, output_pulse)
    pub modes: (Option<bool>, Option<bool>, Option<bool>),
    /// Whether `create_session` ran
    pub created: bool,
    /// Whether `destroy_session` ran
    pub destroyed: bool,
}

impl SlmLog {
    /// Number of blank images written
    pub fn blank_writes(&self) -> usize {
        self.writes.iter().filter(|w| w.blank).count()
    }
}

/// Read-only view of a `SimulatedSlm` that stays usable after the driver has
/// been moved into a session.
#[derive(Debug, Clone)]
pub struct SlmMonitor {
    log: Arc<Mutex<SlmLog>>,
}

impl SlmMonitor {
    /// Snapshot of the log
    pub async fn log(&self) -> SlmLog {
        self.log.lock().await.clone()
    }
}

/// Simulated SLM controller.
///
/// # Example
///
/// ```rust,ignore
/// let bench = OpticalBench::new();
/// let slm = SimulatedSlm::builder()
///     .geometry(ImageGeometry::new(1920, 1152, 8))
///     .bench(bench.clone())
///     .fail_write_on_call(10)
///     .build();
/// ```
pub struct SimulatedSlm {
    geometry: ImageGeometry,
    board_count: u32,
    constructed_ok: bool,
    bench: OpticalBench,
    fail_write_on_call: Option<usize>,
    fail_confirm_on_call: Option<usize>,
    reject_lut: bool,
    fail_create: bool,
    log: Arc<Mutex<SlmLog>>,
}

impl SimulatedSlm {
    /// 1920x1152 8-bit panel on its own bench
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create builder for failure injection and custom geometry
    pub fn builder() -> SimulatedSlmBuilder {
        SimulatedSlmBuilder::default()
    }

    /// Handle for inspecting what the SLM was sent
    pub fn monitor(&self) -> SlmMonitor {
        SlmMonitor {
            log: self.log.clone(),
        }
    }

    fn check_board(&self, board: u32) -> Result<()> {
        ensure!(
            board >= 1 && board <= self.board_count,
            "Board {} not present ({} found)",
            board,
            self.board_count
        );
        Ok(())
    }
}

impl Default for SimulatedSlm {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`SimulatedSlm`]
pub struct SimulatedSlmBuilder {
    geometry: ImageGeometry,
    board_count: u32,
    constructed_ok: bool,
    bench: OpticalBench,
    fail_write_on_call: Option<usize>,
    fail_confirm_on_call: Option<usize>,
    reject_lut: bool,
    fail_create: bool,
}

impl Default for SimulatedSlmBuilder {
    fn default() -> Self {
        Self {
            geometry: ImageGeometry::new(1920, 1152, 8),
            board_count: 1,
            constructed_ok: true,
            bench: OpticalBench::new(),
            fail_write_on_call: None,
            fail_confirm_on_call: None,
            reject_lut: false,
            fail_create: false,
        }
    }
}

impl SimulatedSlmBuilder {
    /// Panel geometry
    pub fn geometry(mut self, geometry: ImageGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Number of boards reported by `create_session`
    pub fn board_count(mut self, board_count: u32) -> Self {
        self.board_count = board_count;
        self
    }

    /// Report a construction failure (simulation mode in the vendor SDK)
    pub fn constructed_ok(mut self, constructed_ok: bool) -> Self {
        self.constructed_ok = constructed_ok;
        self
    }

    /// Bench shared with a simulated power meter
    pub fn bench(mut self, bench: OpticalBench) -> Self {
        self.bench = bench;
        self
    }

    /// Fail the n-th `write_image` call (1-based, counting the initial blank)
    pub fn fail_write_on_call(mut self, call: usize) -> Self {
        self.fail_write_on_call = Some(call);
        self
    }

    /// Fail the n-th `confirm_write_complete` call (1-based)
    pub fn fail_confirm_on_call(mut self, call: usize) -> Self {
        self.fail_confirm_on_call = Some(call);
        self
    }

    /// Refuse every LUT file
    pub fn reject_lut(mut self) -> Self {
        self.reject_lut = true;
        self
    }

    /// Make `create_session` fail outright (SDK library missing)
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Build the simulated SLM
    pub fn build(self) -> SimulatedSlm {
        SimulatedSlm {
            geometry: self.geometry,
            board_count: self.board_count,
            constructed_ok: self.constructed_ok,
            bench: self.bench,
            fail_write_on_call: self.fail_write_on_call,
            fail_confirm_on_call: self.fail_confirm_on_call,
            reject_lut: self.reject_lut,
            fail_create: self.fail_create,
            log: Arc::new(Mutex::new(SlmLog::default())),
        }
    }
}

#[async_trait]
impl SlmDriver for SimulatedSlm {
    async fn create_session(&mut self) -> Result<SdkSession> {
        if self.fail_create {
            bail!("Blink_C_wrapper could not be loaded");
        }
        self.log.lock().await.created = true;
        Ok(SdkSession {
            board_count: self.board_count,
            constructed_ok: self.constructed_ok,
        })
    }

    async fn image_geometry(&mut self, board: u32) -> Result<ImageGeometry> {
        self.check_board(board)?;
        Ok(self.geometry)
    }

    async fn set_trigger_mode(&mut self, board: u32, external_trigger: bool) -> Result<()> {
        self.check_board(board)?;
        self.log.lock().await.modes.0 = Some(external_trigger);
        Ok(())
    }

    async fn set_flip_mode(&mut self, board: u32, flip_immediate: bool) -> Result<()> {
        self.check_board(board)?;
        self.log.lock().await.modes.1 = Some(flip_immediate);
        Ok(())
    }

    async fn set_output_pulse_mode(&mut self, board: u32, output_pulse: bool) -> Result<()> {
        self.check_board(board)?;
        self.log.lock().await.modes.2 = Some(output_pulse);
        Ok(())
    }

    async fn load_lut(&mut self, board: u32, path: &str) -> Result<()> {
        self.check_board(board)?;
        let status = if self.reject_lut { LUT_FAILED } else { 1 };
        check_lut_status(status)?;
        self.log.lock().await.lut = Some(path.to_string());
        Ok(())
    }

    async fn write_image(&mut self, board: u32, image: &[u8], _timeout_ms: u32) -> Result<()> {
        self.check_board(board)?;
        let mut log = self.log.lock().await;
        log.write_calls += 1;
        if self.fail_write_on_call == Some(log.write_calls) {
            check_transfer_status("Write_image", -1)?;
        }
        ensure!(
            image.len() == self.geometry.buffer_len(),
            "Image is {} bytes, panel expects {}",
            image.len(),
            self.geometry.buffer_len()
        );

        let min = image.iter().copied().min().unwrap_or(0);
        let max = image.iter().copied().max().unwrap_or(0);
        log.writes.push(WrittenImage {
            blank: max == 0,
            min,
            max,
        });
        drop(log);

        self.bench.set_contrast(max - min).await;
        Ok(())
    }

    async fn confirm_write_complete(&mut self, board: u32, _timeout_ms: u32) -> Result<()> {
        self.check_board(board)?;
        let mut log = self.log.lock().await;
        log.confirm_calls += 1;
        let status = if self.fail_confirm_on_call == Some(log.confirm_calls) {
            0
        } else {
            TRANSFER_OK
        };
        check_transfer_status("ImageWriteComplete", status)
    }

    async fn destroy_session(&mut self) -> Result<()> {
        self.log.lock().await.destroyed = true;
        Ok(())
    }
}

// =============================================================================
// SimulatedPowerMeter
// =============================================================================

/// Everything the simulated meter was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MeterLog {
    /// Resource opened last
    pub opened: Option<String>,
    /// Correction wavelength in nm
    pub wavelength_nm: Option<f64>,
    /// Number of `measure_power` calls
    pub measure_calls: usize,
    /// Number of `close` calls
    pub close_calls: usize,
}

/// Read-only view of a `SimulatedPowerMeter`.
#[derive(Debug, Clone)]
pub struct MeterMonitor {
    log: Arc<Mutex<MeterLog>>,
}

impl MeterMonitor {
    /// Snapshot of the log
    pub async fn log(&self) -> MeterLog {
        self.log.lock().await.clone()
    }
}

/// Simulated optical power meter.
///
/// Readings come from a script when one is given (useful for exact-value
/// tests), otherwise from the bench model:
/// `peak_watts * first_order_efficiency(contrast, gamma)` plus uniform noise of
/// `noise_fraction` of the reading.
pub struct SimulatedPowerMeter {
    resources: Vec<String>,
    bench: OpticalBench,
    peak_watts: f64,
    gamma: f64,
    noise_fraction: f64,
    script: VecDeque<f64>,
    fail_open: bool,
    open: bool,
    rng: StdRng,
    log: Arc<Mutex<MeterLog>>,
}

impl SimulatedPowerMeter {
    /// Meter on its own bench, 1 mW peak, 0.5% noise
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create builder for advanced configuration
    pub fn builder() -> SimulatedPowerMeterBuilder {
        SimulatedPowerMeterBuilder::default()
    }

    /// Handle for inspecting what the meter was asked to do
    pub fn monitor(&self) -> MeterMonitor {
        MeterMonitor {
            log: self.log.clone(),
        }
    }
}

impl Default for SimulatedPowerMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`SimulatedPowerMeter`]
pub struct SimulatedPowerMeterBuilder {
    resources: Vec<String>,
    bench: OpticalBench,
    peak_watts: f64,
    gamma: f64,
    noise_fraction: f64,
    script: VecDeque<f64>,
    fail_open: bool,
    seed: u64,
}

impl Default for SimulatedPowerMeterBuilder {
    fn default() -> Self {
        Self {
            resources: vec!["USB0::0x1313::0x8078::P0000001::INSTR".to_string()],
            bench: OpticalBench::new(),
            peak_watts: 1.0e-3,
            gamma: 1.4,
            noise_fraction: 0.005,
            script: VecDeque::new(),
            fail_open: false,
            seed: 42,
        }
    }
}

impl SimulatedPowerMeterBuilder {
    /// Resource names returned by `enumerate`
    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Bench shared with a simulated SLM
    pub fn bench(mut self, bench: OpticalBench) -> Self {
        self.bench = bench;
        self
    }

    /// First-order power at full modulation, in Watts
    pub fn peak_watts(mut self, peak_watts: f64) -> Self {
        self.peak_watts = peak_watts;
        self
    }

    /// Exponent of the simulated gray-level to phase response
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Relative noise amplitude (0 disables noise)
    pub fn noise_fraction(mut self, noise_fraction: f64) -> Self {
        self.noise_fraction = noise_fraction;
        self
    }

    /// Return these readings (Watts) in order before falling back to the model
    pub fn script<I: IntoIterator<Item = f64>>(mut self, readings: I) -> Self {
        self.script = readings.into_iter().collect();
        self
    }

    /// Make `open` fail
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Noise RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Build the simulated meter
    pub fn build(self) -> SimulatedPowerMeter {
        SimulatedPowerMeter {
            resources: self.resources,
            bench: self.bench,
            peak_watts: self.peak_watts,
            gamma: self.gamma,
            noise_fraction: self.noise_fraction,
            script: self.script,
            fail_open: self.fail_open,
            open: false,
            rng: StdRng::seed_from_u64(self.seed),
            log: Arc::new(Mutex::new(MeterLog::default())),
        }
    }
}

#[async_trait]
impl PowerMeterDriver for SimulatedPowerMeter {
    async fn enumerate(&mut self) -> Result<Vec<String>> {
        Ok(self.resources.clone())
    }

    async fn open(&mut self, resource: &str, _reset: bool, _id_query: bool) -> Result<()> {
        if self.fail_open {
            bail!("VI_ERROR_RSRC_NFOUND: {}", resource);
        }
        if !self.resources.iter().any(|r| r == resource) {
            return Err(anyhow!("Unknown resource {}", resource));
        }
        self.open = true;
        self.log.lock().await.opened = Some(resource.to_string());
        Ok(())
    }

    async fn set_wavelength(&mut self, wavelength_nm: f64) -> Result<()> {
        ensure!(self.open, "Meter not open");
        self.log.lock().await.wavelength_nm = Some(wavelength_nm);
        Ok(())
    }

    async fn measure_power(&mut self) -> Result<f64> {
        ensure!(self.open, "Meter not open");
        self.log.lock().await.measure_calls += 1;

        if let Some(watts) = self.script.pop_front() {
            return Ok(watts);
        }

        let contrast = self.bench.contrast().await;
        let power = self.peak_watts * first_order_efficiency(contrast, self.gamma);
        let noise = if self.noise_fraction > 0.0 && power > 0.0 {
            let amplitude = power * self.noise_fraction;
            self.rng.gen_range(-amplitude..amplitude)
        } else {
            0.0
        };
        Ok((power + noise).max(0.0))
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.log.lock().await.close_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efficiency_spans_dark_to_full() {
        // 0 -> 2pi over the gray range: dark at both ends, bright at pi
        assert!(first_order_efficiency(0, 1.0).abs() < 1e-12);
        assert!(first_order_efficiency(255, 1.0) < 1e-12);
        assert!(first_order_efficiency(128, 1.0) > 0.9999);
        let skewed = first_order_efficiency(128, 1.4);
        assert!(skewed > 0.0 && skewed < 0.9999);
    }

    #[tokio::test]
    async fn slm_write_updates_bench_and_log() {
        let bench = OpticalBench::new();
        let mut slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(2, 1, 8))
            .bench(bench.clone())
            .build();
        let monitor = slm.monitor();

        slm.write_image(1, &[0, 0], 1000).await.unwrap();
        slm.write_image(1, &[10, 200], 1000).await.unwrap();

        assert_eq!(bench.contrast().await, 190);
        let log = monitor.log().await;
        assert_eq!(log.writes.len(), 2);
        assert_eq!(log.blank_writes(), 1);
    }

    #[tokio::test]
    async fn slm_fails_on_requested_write() {
        let mut slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(1, 1, 8))
            .fail_write_on_call(2)
            .build();

        assert!(slm.write_image(1, &[0], 1000).await.is_ok());
        let err = slm.write_image(1, &[5], 1000).await.unwrap_err();
        assert_eq!(err.to_string(), "Write_image returned -1");
        assert!(slm.write_image(1, &[5], 1000).await.is_ok());
        assert_eq!(slm.monitor().log().await.writes.len(), 2);
    }

    #[tokio::test]
    async fn slm_reports_sdk_status_codes() {
        let mut slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(1, 1, 8))
            .reject_lut()
            .fail_confirm_on_call(1)
            .build();

        let err = slm.load_lut(1, "missing.LUT").await.unwrap_err();
        assert_eq!(err.to_string(), "Load_LUT_file returned 0");
        let err = slm.confirm_write_complete(1, 1000).await.unwrap_err();
        assert_eq!(err.to_string(), "ImageWriteComplete returned 0");
        assert!(slm.confirm_write_complete(1, 1000).await.is_ok());
    }

    #[tokio::test]
    async fn slm_create_can_fail() {
        let mut slm = SimulatedSlm::builder().fail_create().build();
        assert!(slm.create_session().await.is_err());
        assert!(!slm.monitor().log().await.created);
    }

    #[tokio::test]
    async fn slm_rejects_unknown_board() {
        let mut slm = SimulatedSlm::new();
        assert!(slm.image_geometry(2).await.is_err());
        assert!(slm.image_geometry(1).await.is_ok());
    }

    #[tokio::test]
    async fn meter_follows_bench_contrast() {
        let bench = OpticalBench::new();
        let mut slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(2, 1, 8))
            .bench(bench.clone())
            .build();
        let mut meter = SimulatedPowerMeter::builder()
            .bench(bench)
            .noise_fraction(0.0)
            .gamma(1.0)
            .build();

        let resources = meter.enumerate().await.unwrap();
        meter.open(&resources[0], true, true).await.unwrap();

        assert_eq!(meter.measure_power().await.unwrap(), 0.0);
        slm.write_image(1, &[0, 128], 1000).await.unwrap();
        assert!((meter.measure_power().await.unwrap() - 1.0e-3).abs() < 1e-7);
    }

    #[tokio::test]
    async fn meter_replays_script_before_model() {
        let mut meter = SimulatedPowerMeter::builder()
            .script([1.0, 2.0])
            .noise_fraction(0.0)
            .build();
        let monitor = meter.monitor();
        let resources = meter.enumerate().await.unwrap();
        meter.open(&resources[0], true, true).await.unwrap();

        assert_eq!(meter.measure_power().await.unwrap(), 1.0);
        assert_eq!(meter.measure_power().await.unwrap(), 2.0);
        assert_eq!(meter.measure_power().await.unwrap(), 0.0);
        assert_eq!(monitor.log().await.measure_calls, 3);
    }

    #[tokio::test]
    async fn meter_requires_open() {
        let mut meter = SimulatedPowerMeter::new();
        assert!(meter.measure_power().await.is_err());
        assert!(meter.set_wavelength(1550.0).await.is_err());
    }
}
