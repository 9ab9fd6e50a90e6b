//! Device set for one calibration run, and the run itself.
//!
//! A [`Rig`] bundles the SLM driver, the power-meter driver and the pattern
//! generator, plus a simulated SLM used when the real SDK cannot be
//! constructed. [`run_calibration`] connects the meter, opens the SLM, drives
//! the sweep and releases both devices on every path out.

use tracing::{error, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{AppResult, CalibrationError};
use crate::hardware::capabilities::{PatternGenerator, PowerMeterDriver, SlmDriver};
use crate::hardware::mock::{OpticalBench, SimulatedPowerMeter, SimulatedSlm};
use crate::hardware::stripe::StripeGenerator;
use crate::power_meter::PowerMeterSession;
use crate::slm::SlmSession;
use crate::sweep::{CalibrationReport, RecordSink, SweepController};

/// Device drivers for one run.
pub struct Rig {
    /// SLM driver tried first
    pub slm: Box<dyn SlmDriver>,
    /// Power meter driver, not yet opened
    pub meter: Box<dyn PowerMeterDriver>,
    /// Stripe / mask generator
    pub patterns: Box<dyn PatternGenerator>,
    /// Stand-in SLM when `slm` cannot construct its SDK
    pub fallback_slm: Box<dyn SlmDriver>,
}

impl Rig {
    /// Simulated SLM and meter on a shared bench.
    pub fn simulated() -> Self {
        let bench = OpticalBench::new();
        Self {
            slm: Box::new(SimulatedSlm::builder().bench(bench.clone()).build()),
            meter: Box::new(SimulatedPowerMeter::builder().bench(bench).build()),
            patterns: Box::new(StripeGenerator),
            fallback_slm: Box::new(SimulatedSlm::new()),
        }
    }

    /// Vendor drivers, as far as the enabled features allow.
    ///
    /// # Errors
    /// `FeatureNotEnabled` when `blink_sdk` or `instrument_visa` is off.
    pub fn hardware() -> AppResult<Self> {
        Ok(Self {
            slm: hardware_slm()?,
            meter: hardware_meter()?,
            patterns: hardware_patterns(),
            fallback_slm: Box::new(SimulatedSlm::new()),
        })
    }

    pub fn from_config(config: &CalibrationConfig) -> AppResult<Self> {
        if config.slm.simulate {
            info!("Using simulated SLM and power meter");
            Ok(Self::simulated())
        } else {
            Self::hardware()
        }
    }

    /// Power meter session around this rig's meter driver.
    pub fn meter_session(
        config: &CalibrationConfig,
        driver: Box<dyn PowerMeterDriver>,
    ) -> PowerMeterSession {
        PowerMeterSession::new(
            driver,
            config.power_meter.wavelength_nm,
            config.power_meter.startup_delay(),
        )
    }
}

#[cfg(feature = "blink_sdk")]
fn hardware_slm() -> AppResult<Box<dyn SlmDriver>> {
    Ok(Box::new(crate::hardware::blink::BlinkSlm::new()))
}

#[cfg(not(feature = "blink_sdk"))]
fn hardware_slm() -> AppResult<Box<dyn SlmDriver>> {
    Err(CalibrationError::FeatureNotEnabled("blink_sdk".to_string()))
}

#[cfg(feature = "blink_sdk")]
fn hardware_patterns() -> Box<dyn PatternGenerator> {
    Box::new(crate::hardware::blink::BlinkImageGen)
}

#[cfg(not(feature = "blink_sdk"))]
fn hardware_patterns() -> Box<dyn PatternGenerator> {
    Box::new(StripeGenerator)
}

#[cfg(feature = "instrument_visa")]
fn hardware_meter() -> AppResult<Box<dyn PowerMeterDriver>> {
    Ok(Box::new(crate::hardware::thorlabs_pm::ThorlabsPm100::new()))
}

#[cfg(not(feature = "instrument_visa"))]
fn hardware_meter() -> AppResult<Box<dyn PowerMeterDriver>> {
    Err(CalibrationError::FeatureNotEnabled(
        "instrument_visa".to_string(),
    ))
}

/// Release the meter, logging a failed close.
pub async fn disconnect(meter: &mut PowerMeterSession) {
    if let Err(e) = meter.disconnect().await {
        error!("{}", e);
    }
}

/// Connect the meter, open the SLM (falling back to `rig.fallback_slm` on a
/// construction error), run the sweep and disconnect the meter.
///
/// The meter is disconnected on every path once it has connected, including
/// a failed fallback open.
pub async fn run_calibration(
    config: &CalibrationConfig,
    rig: Rig,
    sink: &mut dyn RecordSink,
) -> AppResult<CalibrationReport> {
    let Rig {
        slm,
        meter,
        patterns,
        fallback_slm,
    } = rig;

    let mut meter = Rig::meter_session(config, meter);
    meter.connect(config.power_meter.device_index).await?;

    let opened = match SlmSession::open(slm, &config.slm).await {
        Err(CalibrationError::DeviceConstruction(reason)) => {
            warn!("SLM unavailable ({}), continuing with a simulated SLM", reason);
            SlmSession::open(fallback_slm, &config.slm).await
        }
        other => other,
    };
    let slm = match opened {
        Ok(slm) => slm,
        Err(e) => {
            disconnect(&mut meter).await;
            return Err(e);
        }
    };

    let result = SweepController::new(config, slm, &mut meter, patterns.as_ref(), sink)
        .run()
        .await;
    disconnect(&mut meter).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MeterMonitor, SimulatedSlmBuilder, SlmMonitor};
    use crate::hardware::ImageGeometry;
    use crate::sweep::FinalizedRecord;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Collect(Vec<FinalizedRecord>);

    impl RecordSink for Collect {
        fn persist(&mut self, record: &FinalizedRecord) -> AppResult<Vec<PathBuf>> {
            self.0.push(record.clone());
            Ok(Vec::new())
        }
    }

    fn quick_config() -> CalibrationConfig {
        let mut config = CalibrationConfig::default();
        config.sweep.settle_ms = 0;
        config.sweep.post_sample_ms = 0;
        config.power_meter.startup_delay_ms = 0;
        config.power_meter.sample_count = 2;
        config.slm.lut_file = Some(PathBuf::from("test_linear.LUT"));
        config
    }

    fn panel() -> SimulatedSlmBuilder {
        SimulatedSlm::builder().geometry(ImageGeometry::new(32, 16, 8))
    }

    /// Rig whose primary SLM fails to construct its SDK.
    fn broken_rig() -> (Rig, SlmMonitor, SlmMonitor, MeterMonitor) {
        let bench = OpticalBench::new();
        let primary = panel().fail_create().bench(bench.clone()).build();
        let fallback = panel().bench(bench.clone()).build();
        let meter = SimulatedPowerMeter::builder().bench(bench).build();
        let monitors = (primary.monitor(), fallback.monitor(), meter.monitor());
        let rig = Rig {
            slm: Box::new(primary),
            meter: Box::new(meter),
            patterns: Box::new(StripeGenerator),
            fallback_slm: Box::new(fallback),
        };
        (rig, monitors.0, monitors.1, monitors.2)
    }

    #[tokio::test]
    async fn construction_error_falls_back_and_releases_devices() {
        let config = quick_config();
        let (rig, primary, fallback, meter) = broken_rig();
        let mut sink = Collect::default();

        let report = run_calibration(&config, rig, &mut sink).await.unwrap();

        assert!(report.is_success());
        assert_eq!(sink.0.len(), 1);
        assert!(!primary.log().await.created);
        let fallback = fallback.log().await;
        assert!(fallback.destroyed);
        assert_eq!(fallback.lut.as_deref(), Some("test_linear.LUT"));
        let meter = meter.log().await;
        assert_eq!(meter.close_calls, 1);
    }

    #[tokio::test]
    async fn failed_fallback_still_disconnects_meter() {
        let mut config = quick_config();
        config.slm.board_number = 2;
        let (rig, _, fallback, meter) = broken_rig();
        let mut sink = Collect::default();

        let err = run_calibration(&config, rig, &mut sink).await.unwrap_err();

        assert!(matches!(err, CalibrationError::Configuration(_)));
        assert!(sink.0.is_empty());
        assert!(fallback.log().await.destroyed);
        assert_eq!(meter.log().await.close_calls, 1);
    }

    #[tokio::test]
    async fn open_error_without_fallback_disconnects_meter() {
        let config = quick_config();
        let bench = OpticalBench::new();
        let slm = panel().board_count(0).bench(bench.clone()).build();
        let meter = SimulatedPowerMeter::builder().bench(bench).build();
        let meter_log = meter.monitor();
        let rig = Rig {
            slm: Box::new(slm),
            meter: Box::new(meter),
            patterns: Box::new(StripeGenerator),
            fallback_slm: Box::new(SimulatedSlm::new()),
        };

        let err = run_calibration(&config, rig, &mut Collect::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CalibrationError::NoBoards));
        assert_eq!(meter_log.log().await.close_calls, 1);
    }

    #[cfg(not(feature = "blink_sdk"))]
    #[test]
    fn hardware_rig_needs_features() {
        assert!(matches!(
            Rig::hardware(),
            Err(CalibrationError::FeatureNotEnabled(_))
        ));
    }
}
