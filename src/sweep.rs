//! Calibration Sweep Controller
//!
//! Drives the SLM through a full gray-level sweep per region, synchronously
//! paired with power capture, and assembles one [`CalibrationSweepRecord`] per
//! region.
//!
//! # State machine (per region)
//!
//! ```text
//! Init -> GenerateImage -> WriteImage -> ConfirmWrite -> Settle -> Sample -> Advance
//!              ^                                                              |
//!              +---------------------- index < NumDataPoints ----------------+
//!                                                                             |
//!                                                                         Finalize
//!
//! GenerateImage | WriteImage | ConfirmWrite | Sample --(failure)--> Aborted
//! ```
//!
//! The gray-level *index* bounds the loop. The commanded level itself
//! (`reference + index * step_by`) is never used for bounds checking.
//!
//! An aborted region is terminal for the run: its partial record is returned
//! in the report but never persisted, no further region is swept, and the
//! controller goes straight to safe shutdown. Safe shutdown (one blank image,
//! then SDK release) runs on every path, including LUT and configuration
//! failures.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{AppResult, CalibrationError};
use crate::hardware::capabilities::{PatternGenerator, StripeSpec};
use crate::hardware::ImageGeometry;
use crate::power_meter::{PowerMeterSession, PowerReading, PowerUnit};
use crate::slm::SlmSession;

/// Run parameters of a sweep, validated from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Level of the fixed stripes and first level of the swept stripes
    pub reference: i32,
    /// Level increment per data point
    pub step_by: i32,
    /// Regions swept one after another
    pub num_regions: u32,
    /// Stripe width in pixels
    pub pixels_per_stripe: u32,
    /// Vertical stripes
    pub vertical: bool,
    /// Data points per region
    pub num_data_points: usize,
    /// 0 for raw output, otherwise quantization bit depth
    pub output_bits: u32,
    /// Readings averaged per data point
    pub sample_count: usize,
    /// Unit of recorded readings
    pub unit: PowerUnit,
    /// Wait between write confirmation and sampling
    pub settle: Duration,
    /// Wait after sampling
    pub post_sample: Duration,
}

impl SweepPlan {
    /// Build a plan from a configuration, validating it first.
    pub fn from_config(config: &CalibrationConfig) -> AppResult<Self> {
        config.validate()?;
        let sweep = &config.sweep;
        Ok(Self {
            reference: sweep.reference,
            step_by: sweep.step_by,
            num_regions: sweep.num_regions,
            pixels_per_stripe: sweep.pixels_per_stripe,
            vertical: sweep.vertical,
            num_data_points: sweep.num_data_points,
            output_bits: sweep.output_bits,
            sample_count: config.power_meter.sample_count,
            unit: config.power_meter.power_unit()?,
            settle: sweep.settle(),
            post_sample: sweep.post_sample(),
        })
    }

    /// Commanded gray level at a data-point index
    pub fn gray_level(&self, index: usize) -> i32 {
        self.reference + self.step_by * index as i32
    }
}

/// One recorded data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepEntry {
    /// Gray-level index, 0-based
    pub index: usize,
    /// Gray level commanded at this index
    pub gray_level: i32,
    /// Noise-averaged power
    pub reading: PowerReading,
}

/// Readings of one region, filled in strictly increasing index order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSweepRecord {
    region: u32,
    num_data_points: usize,
    entries: Vec<SweepEntry>,
}

impl CalibrationSweepRecord {
    /// Empty record for a region
    pub fn new(region: u32, num_data_points: usize) -> Self {
        Self {
            region,
            num_data_points,
            entries: Vec::with_capacity(num_data_points),
        }
    }

    /// Append the next data point; returns its index.
    ///
    /// # Errors
    /// `Configuration` if the record is already complete.
    pub fn push(&mut self, gray_level: i32, reading: PowerReading) -> AppResult<usize> {
        let index = self.entries.len();
        if index >= self.num_data_points {
            return Err(CalibrationError::Configuration(format!(
                "region {} already holds {} data points",
                self.region, self.num_data_points
            )));
        }
        self.entries.push(SweepEntry {
            index,
            gray_level,
            reading,
        });
        Ok(index)
    }

    /// Region number
    pub fn region(&self) -> u32 {
        self.region
    }

    /// Recorded data points
    pub fn entries(&self) -> &[SweepEntry] {
        &self.entries
    }

    /// Number of recorded data points
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True before the first data point
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once every data point is recorded
    pub fn is_complete(&self) -> bool {
        self.entries.len() == self.num_data_points
    }

    /// Reading values in index order
    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.reading.value).collect()
    }

    /// Produce the persisted form of the record.
    ///
    /// `output_bits == 0` keeps the raw readings; otherwise every reading is
    /// normalized by the region maximum and quantized to `output_bits`.
    pub fn finalize(&self, output_bits: u32, unit: PowerUnit) -> FinalizedRecord {
        let values = self.values();
        if output_bits == 0 {
            FinalizedRecord::Raw {
                region: self.region,
                unit,
                rows: values.into_iter().enumerate().collect(),
            }
        } else {
            FinalizedRecord::Quantized {
                region: self.region,
                bits: output_bits,
                rows: quantize(&values, output_bits).into_iter().enumerate().collect(),
            }
        }
    }
}

/// Normalize `values` by their maximum and quantize to `bits`:
/// `round(v / max * (2^bits - 1))`.
///
/// Negative readings map to 0. A region whose maximum is not positive
/// quantizes to all zeros.
pub fn quantize(values: &[f64], bits: u32) -> Vec<u32> {
    let full_scale = ((1u64 << bits) - 1) as f64;
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > 0.0) {
        if !values.is_empty() {
            warn!("Maximum reading is {}, quantizing region to zeros", max);
        }
        return vec![0; values.len()];
    }
    values
        .iter()
        .map(|v| (v / max * full_scale).round().clamp(0.0, full_scale) as u32)
        .collect()
}

/// Persisted form of a completed region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FinalizedRecord {
    /// Raw readings, `(index, power)`
    Raw {
        /// Region number
        region: u32,
        /// Unit of the power column
        unit: PowerUnit,
        /// `(index, power)` rows
        rows: Vec<(usize, f64)>,
    },
    /// Normalized readings quantized to `bits`, `(index, value)`
    Quantized {
        /// Region number
        region: u32,
        /// Output bit depth
        bits: u32,
        /// `(index, value)` rows
        rows: Vec<(usize, u32)>,
    },
}

impl FinalizedRecord {
    /// Region number
    pub fn region(&self) -> u32 {
        match self {
            FinalizedRecord::Raw { region, .. } | FinalizedRecord::Quantized { region, .. } => {
                *region
            }
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        match self {
            FinalizedRecord::Raw { rows, .. } => rows.len(),
            FinalizedRecord::Quantized { rows, .. } => rows.len(),
        }
    }

    /// True when there are no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination for completed regions.
pub trait RecordSink {
    /// Persist one finalized region; returns the files written.
    fn persist(&mut self, record: &FinalizedRecord) -> AppResult<Vec<PathBuf>>;
}

/// Sweep step at which a region was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortStage {
    /// Blank image written before the first region
    InitialBlank,
    /// Pattern generation or masking
    GenerateImage,
    /// DMA of the image
    WriteImage,
    /// Waiting for the write-complete signal
    ConfirmWrite,
    /// Power capture
    Sample,
}

impl fmt::Display for AbortStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortStage::InitialBlank => "initial blank image",
            AbortStage::GenerateImage => "image generation",
            AbortStage::WriteImage => "image write",
            AbortStage::ConfirmWrite => "write confirmation",
            AbortStage::Sample => "power capture",
        };
        f.write_str(name)
    }
}

/// Why and where a sweep stopped early.
#[derive(Debug)]
pub struct AbortReason {
    /// Region being swept (0 for the initial blank)
    pub region: u32,
    /// Gray-level index being processed
    pub index: usize,
    /// Gray level being commanded
    pub gray_level: i32,
    /// Step that failed
    pub stage: AbortStage,
    /// Underlying error
    pub error: CalibrationError,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region {} aborted at index {} (gray {}) during {}: {}",
            self.region, self.index, self.gray_level, self.stage, self.error
        )
    }
}

/// Result of sweeping one region.
#[derive(Debug)]
pub enum RegionOutcome {
    /// Every data point recorded
    Completed(CalibrationSweepRecord),
    /// Stopped early; the partial record is not persisted
    Aborted {
        /// Data points recorded before the failure
        record: CalibrationSweepRecord,
        /// What failed
        reason: AbortReason,
    },
}

enum SweepState {
    Init,
    GenerateImage,
    WriteImage,
    ConfirmWrite,
    Settle,
    Sample,
    Advance,
    Finalize,
    Aborted {
        stage: AbortStage,
        error: CalibrationError,
    },
}

/// Summary of a calibration run.
#[derive(Debug)]
pub struct CalibrationReport {
    /// Panel geometry
    pub geometry: ImageGeometry,
    /// LUT loaded for the run
    pub lut: PathBuf,
    /// Regions that completed and were persisted, in order
    pub completed: Vec<FinalizedRecord>,
    /// Files written by the sink
    pub written: Vec<PathBuf>,
    /// The region that aborted the run, with its unpersisted partial record
    pub aborted: Option<(CalibrationSweepRecord, AbortReason)>,
    /// Error raised while returning the SLM to a safe state
    pub shutdown_error: Option<CalibrationError>,
}

impl CalibrationReport {
    /// True when every region completed and shutdown was clean
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.shutdown_error.is_none()
    }
}

/// Sequences the SLM and the power meter through a calibration run.
///
/// Owns the SLM session for the run and releases it at the end; the power
/// meter stays connected and is borrowed.
pub struct SweepController<'a> {
    config: CalibrationConfig,
    slm: SlmSession,
    meter: &'a mut PowerMeterSession,
    patterns: &'a dyn PatternGenerator,
    sink: &'a mut dyn RecordSink,
    image: Vec<u8>,
    wfc: Vec<u8>,
}

impl<'a> SweepController<'a> {
    /// Assemble a controller around an open SLM and a connected power meter.
    pub fn new(
        config: &CalibrationConfig,
        slm: SlmSession,
        meter: &'a mut PowerMeterSession,
        patterns: &'a dyn PatternGenerator,
        sink: &'a mut dyn RecordSink,
    ) -> Self {
        let geometry = slm.geometry();
        Self {
            config: config.clone(),
            slm,
            meter,
            patterns,
            sink,
            image: geometry.blank_buffer(),
            // Calibration always runs with a blank wavefront correction
            wfc: geometry.blank_buffer(),
        }
    }

    /// Run the calibration, then blank the SLM and release its session.
    ///
    /// # Errors
    /// Configuration, LUT and persistence failures. Write failures during the
    /// sweep are not errors; they end up in [`CalibrationReport::aborted`].
    /// Shutdown happens before any error is returned.
    pub async fn run(mut self) -> AppResult<CalibrationReport> {
        let result = self.execute().await;

        let mut shutdown_error = None;
        if let Err(e) = self.slm.write_blank().await {
            error!("DMA Failed while blanking the SLM: {}", e);
            shutdown_error = Some(e);
        }
        if let Err(e) = self.slm.close().await {
            shutdown_error.get_or_insert(e);
        }

        let mut report = result?;
        report.shutdown_error = shutdown_error;
        Ok(report)
    }

    async fn execute(&mut self) -> AppResult<CalibrationReport> {
        let plan = SweepPlan::from_config(&self.config).inspect_err(|e| error!("{}", e))?;
        let geometry = self.slm.geometry();

        let lut = self
            .config
            .select_lut(geometry)
            .inspect_err(|e| error!("{}", e))?;
        if lut.preset.is_none() {
            info!(lut = %lut.path.display(), "Using explicit LUT file");
        }
        self.slm.load_lut(&lut.path).await?;

        let mut report = CalibrationReport {
            geometry,
            lut: lut.path,
            completed: Vec::new(),
            written: Vec::new(),
            aborted: None,
            shutdown_error: None,
        };

        if let Err(err) = self.slm.display_blank().await {
            let reason = AbortReason {
                region: 0,
                index: 0,
                gray_level: 0,
                stage: AbortStage::InitialBlank,
                error: err,
            };
            error!("{}", reason);
            report.aborted = Some((CalibrationSweepRecord::new(0, 0), reason));
            return Ok(report);
        }

        for region in 0..plan.num_regions {
            match self.run_region(&plan, region).await {
                RegionOutcome::Completed(record) => {
                    let finalized = record.finalize(plan.output_bits, plan.unit);
                    let written = self.sink.persist(&finalized)?;
                    report.written.extend(written);
                    report.completed.push(finalized);
                }
                RegionOutcome::Aborted { record, reason } => {
                    warn!(
                        region,
                        discarded = record.len(),
                        "Region aborted, partial readings not persisted"
                    );
                    report.aborted = Some((record, reason));
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Sweep every gray level of one region.
    pub async fn run_region(&mut self, plan: &SweepPlan, region: u32) -> RegionOutcome {
        info!("Region: {}", region);

        let geometry = self.slm.geometry();
        let mut record = CalibrationSweepRecord::new(region, plan.num_data_points);
        let mut index = 0usize;
        let mut gray_level = plan.reference;
        let mut state = SweepState::Init;

        loop {
            state = match state {
                SweepState::Init => {
                    index = 0;
                    gray_level = plan.reference;
                    SweepState::GenerateImage
                }
                SweepState::GenerateImage => {
                    match self.render(plan, geometry, region, gray_level) {
                        Ok(()) => SweepState::WriteImage,
                        Err(error) => SweepState::Aborted {
                            stage: AbortStage::GenerateImage,
                            error,
                        },
                    }
                }
                SweepState::WriteImage => match self.slm.write_image(&self.image).await {
                    Ok(()) => SweepState::ConfirmWrite,
                    Err(error) => SweepState::Aborted {
                        stage: AbortStage::WriteImage,
                        error,
                    },
                },
                SweepState::ConfirmWrite => match self.slm.confirm_write().await {
                    Ok(()) => SweepState::Settle,
                    Err(error) => SweepState::Aborted {
                        stage: AbortStage::ConfirmWrite,
                        error,
                    },
                },
                SweepState::Settle => {
                    tokio::time::sleep(plan.settle).await;
                    SweepState::Sample
                }
                SweepState::Sample => {
                    let captured = match self.meter.capture(plan.sample_count, plan.unit).await {
                        Ok(reading) => record.push(gray_level, reading).map(|_| reading),
                        Err(e) => Err(e),
                    };
                    match captured {
                        Ok(reading) => {
                            debug!(region, index, gray = gray_level, power = %reading, "Gray level sampled");
                            tokio::time::sleep(plan.post_sample).await;
                            SweepState::Advance
                        }
                        Err(error) => SweepState::Aborted {
                            stage: AbortStage::Sample,
                            error,
                        },
                    }
                }
                SweepState::Advance => {
                    gray_level += plan.step_by;
                    index += 1;
                    if index < plan.num_data_points {
                        SweepState::GenerateImage
                    } else {
                        SweepState::Finalize
                    }
                }
                SweepState::Finalize => {
                    info!(region, points = record.len(), "Region complete");
                    return RegionOutcome::Completed(record);
                }
                SweepState::Aborted { stage, error } => {
                    let reason = AbortReason {
                        region,
                        index,
                        gray_level,
                        stage,
                        error,
                    };
                    error!("{}", reason);
                    return RegionOutcome::Aborted { record, reason };
                }
            };
        }
    }

    fn render(
        &mut self,
        plan: &SweepPlan,
        geometry: ImageGeometry,
        region: u32,
        gray_level: i32,
    ) -> AppResult<()> {
        let stripe = StripeSpec {
            reference_level: plan.reference,
            variable_level: gray_level,
            pixels_per_stripe: plan.pixels_per_stripe,
            vertical: plan.vertical,
            rgb: false,
        };
        self.patterns
            .generate_stripe(&mut self.image, &self.wfc, geometry, stripe)
            .and_then(|()| {
                self.patterns
                    .mask_to_region(&mut self.image, geometry, region, plan.num_regions, false)
            })
            .map_err(|e| CalibrationError::PatternGeneration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedPowerMeter, SimulatedSlm};
    use crate::hardware::stripe::StripeGenerator;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collect(Vec<FinalizedRecord>);

    impl RecordSink for Collect {
        fn persist(&mut self, record: &FinalizedRecord) -> AppResult<Vec<PathBuf>> {
            self.0.push(record.clone());
            Ok(Vec::new())
        }
    }

    fn quick_config(points: usize) -> CalibrationConfig {
        let mut config = CalibrationConfig::default();
        config.sweep.num_data_points = points;
        config.sweep.settle_ms = 0;
        config.sweep.post_sample_ms = 0;
        config.power_meter.sample_count = 1;
        config.power_meter.startup_delay_ms = 0;
        config.slm.lut_file = Some(PathBuf::from("test.LUT"));
        config
    }

    fn meter_session(config: &CalibrationConfig) -> PowerMeterSession {
        PowerMeterSession::new(
            Box::new(SimulatedPowerMeter::new()),
            config.power_meter.wavelength_nm,
            config.power_meter.startup_delay(),
        )
    }

    fn reading(value: f64) -> PowerReading {
        PowerReading {
            value,
            unit: PowerUnit::Microwatts,
        }
    }

    #[test]
    fn quantize_normalizes_to_bit_depth() {
        assert_eq!(quantize(&[10.0, 20.0, 40.0], 2), vec![1, 2, 3]);
        assert_eq!(quantize(&[0.0, 50.0, 100.0], 12), vec![0, 2048, 4095]);
    }

    #[test]
    fn quantize_handles_dark_regions() {
        assert_eq!(quantize(&[0.0, 0.0], 8), vec![0, 0]);
        assert_eq!(quantize(&[-1.0, 2.0], 1), vec![0, 1]);
        assert!(quantize(&[], 8).is_empty());
    }

    #[test]
    fn gray_level_follows_direction() {
        let mut config = CalibrationConfig::default();
        let plan = SweepPlan::from_config(&config).unwrap();
        assert_eq!(plan.gray_level(0), 0);
        assert_eq!(plan.gray_level(255), 255);

        config.sweep.reference = 255;
        config.sweep.step_by = -1;
        let plan = SweepPlan::from_config(&config).unwrap();
        assert_eq!(plan.gray_level(0), 255);
        assert_eq!(plan.gray_level(255), 0);
    }

    #[test]
    fn record_fills_in_order_and_stops_when_full() {
        let mut record = CalibrationSweepRecord::new(0, 2);
        assert_eq!(record.push(0, reading(1.0)).unwrap(), 0);
        assert_eq!(record.push(1, reading(2.0)).unwrap(), 1);
        assert!(record.is_complete());
        assert!(record.push(2, reading(3.0)).is_err());
        assert_eq!(record.values(), vec![1.0, 2.0]);
    }

    #[test]
    fn finalize_raw_and_quantized() {
        let mut record = CalibrationSweepRecord::new(3, 3);
        for (i, v) in [10.0, 20.0, 40.0].into_iter().enumerate() {
            record.push(i as i32, reading(v)).unwrap();
        }

        match record.finalize(0, PowerUnit::Microwatts) {
            FinalizedRecord::Raw { region, unit, rows } => {
                assert_eq!(region, 3);
                assert_eq!(unit, PowerUnit::Microwatts);
                assert_eq!(rows, vec![(0, 10.0), (1, 20.0), (2, 40.0)]);
            }
            other => panic!("expected raw record, got {other:?}"),
        }

        match record.finalize(2, PowerUnit::Microwatts) {
            FinalizedRecord::Quantized { bits, rows, .. } => {
                assert_eq!(bits, 2);
                assert_eq!(rows, vec![(0, 1), (1, 2), (2, 3)]);
            }
            other => panic!("expected quantized record, got {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn dma_failure_is_logged_and_aborts_region() {
        let config = quick_config(8);
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(32, 16, 8))
            // blank is call 1, index 3 is call 5
            .fail_write_on_call(5)
            .build();
        let monitor = slm.monitor();
        let slm = SlmSession::open(Box::new(slm), &config.slm).await.unwrap();
        let mut meter = meter_session(&config);
        meter.connect(0).await.unwrap();
        let mut sink = Collect::default();

        let report = SweepController::new(&config, slm, &mut meter, &StripeGenerator, &mut sink)
            .run()
            .await
            .unwrap();

        let (record, reason) = report.aborted.as_ref().unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(reason.index, 3);
        assert_eq!(reason.stage, AbortStage::WriteImage);
        assert!(sink.0.is_empty());
        assert!(logs_contain("DMA failed"));
        assert!(logs_contain("Region: 0"));

        let log = monitor.log().await;
        assert_eq!(log.write_calls, 6);
        assert!(log.writes.last().unwrap().blank);
        assert!(log.destroyed);
    }

    #[tokio::test]
    async fn capture_failure_aborts_at_sample() {
        let config = quick_config(4);
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(16, 16, 8))
            .build();
        let monitor = slm.monitor();
        let slm = SlmSession::open(Box::new(slm), &config.slm).await.unwrap();
        // never connected
        let mut meter = meter_session(&config);
        let mut sink = Collect::default();

        let report = SweepController::new(&config, slm, &mut meter, &StripeGenerator, &mut sink)
            .run()
            .await
            .unwrap();

        let (record, reason) = report.aborted.as_ref().unwrap();
        assert!(record.is_empty());
        assert_eq!(reason.stage, AbortStage::Sample);
        assert!(matches!(reason.error, CalibrationError::DeviceConnection(_)));
        assert!(monitor.log().await.destroyed);
    }

    #[tokio::test]
    async fn run_region_commands_each_gray_level() {
        let mut config = quick_config(5);
        config.sweep.reference = 255;
        config.sweep.step_by = -1;
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(16, 16, 8))
            .build();
        let slm = SlmSession::open(Box::new(slm), &config.slm).await.unwrap();
        let mut meter = meter_session(&config);
        meter.connect(0).await.unwrap();
        let mut sink = Collect::default();
        let plan = SweepPlan::from_config(&config).unwrap();

        let mut controller =
            SweepController::new(&config, slm, &mut meter, &StripeGenerator, &mut sink);
        let RegionOutcome::Completed(record) = controller.run_region(&plan, 0).await else {
            panic!("region did not complete");
        };

        let levels: Vec<(usize, i32)> = record
            .entries()
            .iter()
            .map(|e| (e.index, e.gray_level))
            .collect();
        assert_eq!(
            levels,
            vec![(0, 255), (1, 254), (2, 253), (3, 252), (4, 251)]
        );
    }
}
