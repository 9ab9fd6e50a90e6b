//! Power Meter Session
//!
//! Owns the optical power meter for the length of a run: discovery, connection,
//! wavelength configuration and noise-averaged power capture.
//!
//! A capture takes `sample_count` back-to-back readings, converts each from
//! Watts into the requested unit and reduces them to their arithmetic mean. The
//! full sample set (raw Watts, converted values, timestamps) of the most recent
//! capture is kept for inspection.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut meter = PowerMeterSession::new(Box::new(driver), 1550.0, Duration::from_secs(2));
//! meter.discover().await?;
//! meter.connect(0).await?;
//! let reading = meter.capture(20, PowerUnit::Microwatts).await?;
//! meter.disconnect().await?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, CalibrationError};
use crate::hardware::capabilities::PowerMeterDriver;

/// Display unit for power readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerUnit {
    /// Microwatts (`uW`)
    #[serde(rename = "uW")]
    Microwatts,
    /// Milliwatts (`mW`)
    #[serde(rename = "mW")]
    Milliwatts,
    /// Watts (`W`)
    #[serde(rename = "W")]
    Watts,
}

impl PowerUnit {
    /// Size of one unit in Watts
    pub fn scale(self) -> f64 {
        match self {
            PowerUnit::Microwatts => 1e-6,
            PowerUnit::Milliwatts => 1e-3,
            PowerUnit::Watts => 1.0,
        }
    }

    /// Short name used in file names and configuration
    pub fn as_str(self) -> &'static str {
        match self {
            PowerUnit::Microwatts => "uW",
            PowerUnit::Milliwatts => "mW",
            PowerUnit::Watts => "W",
        }
    }

    /// Convert a reading in Watts into this unit
    pub fn from_watts(self, watts: f64) -> f64 {
        watts / self.scale()
    }
}

impl FromStr for PowerUnit {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uW" => Ok(PowerUnit::Microwatts),
            "mW" => Ok(PowerUnit::Milliwatts),
            "W" => Ok(PowerUnit::Watts),
            other => Err(CalibrationError::UnsupportedUnit(other.to_string())),
        }
    }
}

impl fmt::Display for PowerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale factor (Watts per unit) for a unit name.
///
/// # Errors
/// `UnsupportedUnit` for anything other than `uW`, `mW` or `W`.
pub fn unit_conversion(unit: &str) -> AppResult<f64> {
    unit.parse::<PowerUnit>().map(PowerUnit::scale)
}

/// One noise-averaged power value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// Mean of the sample set, in `unit`
    pub value: f64,
    /// Unit of `value`
    pub unit: PowerUnit,
}

impl fmt::Display for PowerReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} {}", self.value, self.unit)
    }
}

/// Readings taken in rapid succession by one capture call.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSampleSet {
    unit: PowerUnit,
    raw_watts: Vec<f64>,
    values: Vec<f64>,
    timestamps: Vec<f64>,
}

impl PowerSampleSet {
    fn with_capacity(unit: PowerUnit, capacity: usize) -> Self {
        Self {
            unit,
            raw_watts: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, watts: f64, elapsed_s: f64) {
        self.raw_watts.push(watts);
        self.values.push(self.unit.from_watts(watts));
        self.timestamps.push(elapsed_s);
    }

    /// Unit shared by every value in the set
    pub fn unit(&self) -> PowerUnit {
        self.unit
    }

    /// Readings as returned by the meter, in Watts
    pub fn raw_watts(&self) -> &[f64] {
        &self.raw_watts
    }

    /// Readings converted to `unit`
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Seconds since the first sample of the set
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no sample was taken
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Arithmetic mean of the converted values (0 for an empty set)
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Summary reading of the set
    pub fn reading(&self) -> PowerReading {
        PowerReading {
            value: self.mean(),
            unit: self.unit,
        }
    }

    /// Human-readable listing of the captured values, 4 decimals each
    pub fn describe(&self) -> String {
        let values: Vec<String> = self.values.iter().map(|v| format!("{v:0.4}")).collect();
        format!(
            "Captured Power Values (in {}): [{}]",
            self.unit,
            values.join(", ")
        )
    }
}

/// Connection lifecycle and sampling for one optical power meter.
pub struct PowerMeterSession {
    driver: Box<dyn PowerMeterDriver>,
    wavelength_nm: f64,
    startup_delay: Duration,
    resources: Vec<String>,
    connected: Option<String>,
    last_capture: Option<PowerSampleSet>,
}

impl PowerMeterSession {
    /// Wrap a driver.
    ///
    /// # Arguments
    /// * `driver` - Power meter driver, not yet opened
    /// * `wavelength_nm` - Correction wavelength applied on connect
    /// * `startup_delay` - Wait after opening before the meter is configured
    pub fn new(
        driver: Box<dyn PowerMeterDriver>,
        wavelength_nm: f64,
        startup_delay: Duration,
    ) -> Self {
        Self {
            driver,
            wavelength_nm,
            startup_delay,
            resources: Vec::new(),
            connected: None,
            last_capture: None,
        }
    }

    /// Query the driver for attached meters.
    ///
    /// Replaces the stored device list; ordering is whatever the driver
    /// reports and may change between calls.
    pub async fn discover(&mut self) -> AppResult<&[String]> {
        let resources = self.driver.enumerate().await.map_err(|e| {
            error!(error = %e, "Power meter enumeration failed");
            CalibrationError::DeviceConnection(format!("enumeration failed: {e}"))
        })?;

        info!("Number of found devices: {}", resources.len());
        for (i, name) in resources.iter().enumerate() {
            info!("Resource name of device {}: {}", i, name);
        }

        self.resources = resources;
        Ok(&self.resources)
    }

    /// Devices found by the last `discover` call
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Open the device at `index` of the discovered list, wait for it to
    /// stabilize, then set the monitoring wavelength.
    pub async fn connect(&mut self, index: usize) -> AppResult<()> {
        if let Some(resource) = &self.connected {
            return Err(CalibrationError::DeviceConnection(format!(
                "already connected to {resource}"
            )));
        }
        if self.resources.is_empty() {
            self.discover().await?;
        }

        let resource = self.resources.get(index).cloned().ok_or_else(|| {
            let err = CalibrationError::DeviceConnection(format!(
                "device index {} out of range ({} found)",
                index,
                self.resources.len()
            ));
            error!("{}", err);
            err
        })?;

        self.driver.open(&resource, true, true).await.map_err(|e| {
            error!(resource = %resource, error = %e, "Failed to open power meter");
            CalibrationError::DeviceConnection(format!("failed to open {resource}: {e}"))
        })?;

        tokio::time::sleep(self.startup_delay).await;

        if let Err(e) = self.driver.set_wavelength(self.wavelength_nm).await {
            error!(error = %e, "Failed to set power meter wavelength");
            if let Err(close_err) = self.driver.close().await {
                warn!(error = %close_err, "Power meter close after failed configuration");
            }
            return Err(CalibrationError::DeviceConnection(format!(
                "failed to set wavelength {} nm: {e}",
                self.wavelength_nm
            )));
        }
        info!("Wavelength set to {} nm", self.wavelength_nm);
        info!("Connected to device: {}", resource);

        self.connected = Some(resource);
        Ok(())
    }

    /// True between a successful `connect` and `disconnect`
    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Resource name of the connected meter
    pub fn connected_resource(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    /// Correction wavelength in nm
    pub fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    /// Take `sample_count` readings and keep the full sample set.
    pub async fn capture_samples(
        &mut self,
        sample_count: usize,
        unit: PowerUnit,
    ) -> AppResult<&PowerSampleSet> {
        if sample_count == 0 {
            return Err(CalibrationError::InvalidSampleCount(sample_count));
        }
        if self.connected.is_none() {
            return Err(CalibrationError::DeviceConnection(
                "power meter not connected".to_string(),
            ));
        }

        let mut samples = PowerSampleSet::with_capacity(unit, sample_count);
        let start = Instant::now();
        for _ in 0..sample_count {
            let watts = self.driver.measure_power().await.map_err(|e| {
                error!(error = %e, "Power read failed");
                CalibrationError::Measurement(e.to_string())
            })?;
            samples.push(watts, start.elapsed().as_secs_f64());
        }
        debug!(
            samples = samples.len(),
            mean = samples.mean(),
            unit = %unit,
            "Power capture complete"
        );

        Ok(&*self.last_capture.insert(samples))
    }

    /// Take `sample_count` readings and return their mean in `unit`.
    ///
    /// # Errors
    /// - `InvalidSampleCount` if `sample_count` is 0
    /// - `DeviceConnection` if the meter is not connected
    /// - `Measurement` if a single read fails
    pub async fn capture(&mut self, sample_count: usize, unit: PowerUnit) -> AppResult<PowerReading> {
        Ok(self.capture_samples(sample_count, unit).await?.reading())
    }

    /// Sample set of the most recent capture
    pub fn last_capture(&self) -> Option<&PowerSampleSet> {
        self.last_capture.as_ref()
    }

    /// Release the device. Call exactly once after a successful `connect`.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        let Some(resource) = self.connected.take() else {
            return Err(CalibrationError::DeviceConnection(
                "power meter not connected".to_string(),
            ));
        };
        self.driver.close().await.map_err(|e| {
            error!(resource = %resource, error = %e, "Power meter close failed");
            CalibrationError::DeviceConnection(format!("failed to close {resource}: {e}"))
        })?;
        info!("Disconnected from {}", resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedPowerMeter;

    fn session(meter: SimulatedPowerMeter) -> PowerMeterSession {
        PowerMeterSession::new(Box::new(meter), 1550.0, Duration::ZERO)
    }

    #[test]
    fn unit_scales() {
        assert_eq!(unit_conversion("uW").unwrap(), 1e-6);
        assert_eq!(unit_conversion("mW").unwrap(), 1e-3);
        assert_eq!(unit_conversion("W").unwrap(), 1.0);
    }

    #[test]
    fn unknown_units_are_rejected() {
        for bad in ["kW", "uw", "µW", "", "watts"] {
            match unit_conversion(bad) {
                Err(CalibrationError::UnsupportedUnit(u)) => assert_eq!(u, bad),
                other => panic!("expected UnsupportedUnit for {bad:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn capture_averages_exactly_n_reads() {
        let meter = SimulatedPowerMeter::builder()
            .script([1e-6, 2e-6, 3e-6, 4e-6, 5e-6, 100.0])
            .build();
        let monitor = meter.monitor();
        let mut pm = session(meter);
        pm.connect(0).await.unwrap();

        let reading = pm.capture(5, PowerUnit::Microwatts).await.unwrap();

        assert!((reading.value - 3.0).abs() < 1e-9);
        assert_eq!(reading.unit, PowerUnit::Microwatts);
        assert_eq!(monitor.log().await.measure_calls, 5);

        let set = pm.last_capture().unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.raw_watts()[0], 1e-6);
        assert_eq!(set.timestamps().len(), 5);
        assert!(set.timestamps().windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn changing_unit_rescales_by_ratio() {
        let readings = [2.0e-3, 4.0e-3];
        let mut values = Vec::new();
        for unit in [PowerUnit::Microwatts, PowerUnit::Milliwatts, PowerUnit::Watts] {
            let mut pm = session(SimulatedPowerMeter::builder().script(readings).build());
            pm.connect(0).await.unwrap();
            values.push(pm.capture(2, unit).await.unwrap().value);
        }

        assert!((values[0] - 3000.0).abs() < 1e-9);
        assert!((values[1] - 3.0).abs() < 1e-12);
        assert!((values[2] - 3.0e-3).abs() < 1e-15);
        assert!((values[0] / values[1] - 1e3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_samples_rejected() {
        let mut pm = session(SimulatedPowerMeter::new());
        pm.connect(0).await.unwrap();
        assert!(matches!(
            pm.capture(0, PowerUnit::Milliwatts).await,
            Err(CalibrationError::InvalidSampleCount(0))
        ));
    }

    #[tokio::test]
    async fn capture_requires_connection() {
        let mut pm = session(SimulatedPowerMeter::new());
        assert!(matches!(
            pm.capture(1, PowerUnit::Watts).await,
            Err(CalibrationError::DeviceConnection(_))
        ));
    }

    #[tokio::test]
    async fn connect_sets_wavelength() {
        let meter = SimulatedPowerMeter::new();
        let monitor = meter.monitor();
        let mut pm = session(meter);

        assert_eq!(pm.discover().await.unwrap().len(), 1);
        pm.connect(0).await.unwrap();

        let log = monitor.log().await;
        assert_eq!(log.wavelength_nm, Some(1550.0));
        assert!(log.opened.is_some());
        assert!(pm.is_connected());
        assert_eq!(
            pm.connected_resource(),
            Some("USB0::0x1313::0x8078::P0000001::INSTR")
        );
        assert_eq!(pm.wavelength_nm(), 1550.0);
    }

    #[tokio::test]
    async fn connect_out_of_range_fails() {
        let mut pm = session(SimulatedPowerMeter::new());
        pm.discover().await.unwrap();
        assert!(matches!(
            pm.connect(3).await,
            Err(CalibrationError::DeviceConnection(_))
        ));
        assert!(!pm.is_connected());
    }

    #[tokio::test]
    async fn connect_open_failure_is_connection_error() {
        let mut pm = session(SimulatedPowerMeter::builder().fail_open().build());
        assert!(matches!(
            pm.connect(0).await,
            Err(CalibrationError::DeviceConnection(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_once() {
        let meter = SimulatedPowerMeter::new();
        let monitor = meter.monitor();
        let mut pm = session(meter);
        pm.connect(0).await.unwrap();

        pm.disconnect().await.unwrap();
        assert!(pm.disconnect().await.is_err());
        assert_eq!(monitor.log().await.close_calls, 1);
    }

    #[tokio::test]
    async fn describe_lists_values() {
        let mut pm = session(SimulatedPowerMeter::builder().script([1.5e-3, 2.25e-3]).build());
        pm.connect(0).await.unwrap();
        pm.capture(2, PowerUnit::Milliwatts).await.unwrap();

        assert_eq!(
            pm.last_capture().unwrap().describe(),
            "Captured Power Values (in mW): [1.5000, 2.2500]"
        );
    }
}
