//! Thorlabs PM100 power meter over VISA.
//!
//! SCPI commands used:
//! - `*RST` / `*IDN?` on open (reset and identity query)
//! - `SENS:CORR:WAV <nm>` to set the correction wavelength
//! - `MEAS:POW?` for one reading in Watts
//!
//! VISA calls block for at most the session timeout; they are made in
//! sequence from the sweep and never overlap.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use visa_rs::prelude::*;

use crate::hardware::capabilities::PowerMeterDriver;

/// VISA expression matching Thorlabs (vendor 0x1313) USB instruments
pub const THORLABS_RESOURCE_FILTER: &str = "USB?*::0x1313::?*::INSTR";

const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// PM100-series power meter.
pub struct ThorlabsPm100 {
    rm: Option<DefaultRM>,
    instr: Option<Instrument>,
    filter: String,
}

impl ThorlabsPm100 {
    /// Driver searching for Thorlabs instruments
    pub fn new() -> Self {
        Self::with_filter(THORLABS_RESOURCE_FILTER)
    }

    /// Driver using a custom VISA resource expression
    pub fn with_filter(filter: impl Into<String>) -> Self {
        Self {
            rm: None,
            instr: None,
            filter: filter.into(),
        }
    }

    fn resource_manager(&mut self) -> Result<&DefaultRM> {
        if self.rm.is_none() {
            let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager: {e}"))?;
            self.rm = Some(rm);
        }
        self.rm
            .as_ref()
            .ok_or_else(|| anyhow!("VISA resource manager unavailable"))
    }

    fn instrument(&mut self) -> Result<&mut Instrument> {
        self.instr
            .as_mut()
            .ok_or_else(|| anyhow!("power meter not open"))
    }

    fn send(&mut self, command: &str) -> Result<()> {
        let instr = self.instrument()?;
        instr
            .write_all(format!("{command}\n").as_bytes())
            .with_context(|| format!("writing '{command}'"))
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.send(command)?;
        let instr = self.instrument()?;
        let mut response = String::new();
        {
            let mut reader = BufReader::new(&*instr);
            reader
                .read_line(&mut response)
                .with_context(|| format!("reading response to '{command}'"))?;
        }
        Ok(response.trim().to_string())
    }
}

impl Default for ThorlabsPm100 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerMeterDriver for ThorlabsPm100 {
    async fn enumerate(&mut self) -> Result<Vec<String>> {
        let filter = CString::new(self.filter.clone())?;
        let rm = self.resource_manager()?;
        let mut resources = Vec::new();
        // VISA reports "no resources found" as an error
        let Ok(mut list) = rm.find_res_list(&filter.into()) else {
            return Ok(resources);
        };
        while let Some(name) = list.find_next().map_err(|e| anyhow!("VISA find_next: {e}"))? {
            resources.push(name.to_string());
        }
        Ok(resources)
    }

    async fn open(&mut self, resource: &str, reset: bool, id_query: bool) -> Result<()> {
        let name = CString::new(resource)?;
        let rm = self.resource_manager()?;
        let instr = rm
            .open(&name.into(), AccessMode::NO_LOCK, OPEN_TIMEOUT)
            .map_err(|e| anyhow!("VISA open {resource}: {e}"))?;
        self.instr = Some(instr);

        if reset {
            self.send("*RST")?;
        }
        if id_query {
            let idn = self.query("*IDN?")?;
            if !idn.to_uppercase().contains("THORLABS") {
                self.instr = None;
                return Err(anyhow!("unexpected instrument identity '{idn}'"));
            }
            info!(idn = %idn, "Power meter identified");
        }
        Ok(())
    }

    async fn set_wavelength(&mut self, wavelength_nm: f64) -> Result<()> {
        self.send(&format!("SENS:CORR:WAV {wavelength_nm}"))
    }

    async fn measure_power(&mut self) -> Result<f64> {
        let response = self.query("MEAS:POW?")?;
        let watts = response
            .parse::<f64>()
            .with_context(|| format!("parsing power reading '{response}'"))?;
        debug!(watts, "PM100 reading");
        Ok(watts)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the instrument closes the VISA session
        self.instr
            .take()
            .map(drop)
            .ok_or_else(|| anyhow!("power meter not open"))
    }
}
