//! CLI entry point for the SLM LUT calibration tool.
//!
//! # Usage
//!
//! Full calibration against simulated hardware:
//! ```bash
//! slm-calibrate run --simulate --output-dir ./measured_data
//! ```
//!
//! List attached power meters, or take one capture:
//! ```bash
//! slm-calibrate list-meters
//! slm-calibrate measure --samples 50 --unit mW
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use slm_lut_calibration::config::{CalibrationConfig, DEFAULT_CONFIG_PATH};
use slm_lut_calibration::logging;
use slm_lut_calibration::output::CsvSink;
use slm_lut_calibration::rig::{disconnect, run_calibration, Rig};
use slm_lut_calibration::sweep::CalibrationReport;

#[derive(Parser)]
#[command(name = "slm-calibrate")]
#[command(about = "Gray-level sweep of a spatial light modulator against an optical power meter", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated SLM and power meter
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full calibration sweep
    Run {
        /// Directory for CSV files and plots
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Readings averaged per gray level
        #[arg(long)]
        samples: Option<usize>,

        /// Power unit (uW, mW, W)
        #[arg(long)]
        unit: Option<String>,
    },

    /// Discover attached power meters
    ListMeters,

    /// Connect to the power meter, take one capture and disconnect
    Measure {
        /// Readings to average
        #[arg(long)]
        samples: Option<usize>,

        /// Power unit (uW, mW, W)
        #[arg(long)]
        unit: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CalibrationConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulate {
        config.slm.simulate = true;
    }
    match &cli.command {
        Commands::Run {
            output_dir,
            samples,
            unit,
        } => {
            if let Some(dir) = output_dir {
                config.output.dir = dir.clone();
            }
            apply_capture_overrides(&mut config, *samples, unit.as_deref());
        }
        Commands::Measure { samples, unit } => {
            apply_capture_overrides(&mut config, *samples, unit.as_deref());
        }
        Commands::ListMeters => {}
    }

    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run { .. } => calibrate(&config).await,
        Commands::ListMeters => list_meters(&config).await,
        Commands::Measure { .. } => measure(&config).await,
    }
}

fn apply_capture_overrides(config: &mut CalibrationConfig, samples: Option<usize>, unit: Option<&str>) {
    if let Some(samples) = samples {
        config.power_meter.sample_count = samples;
    }
    if let Some(unit) = unit {
        config.power_meter.unit = unit.to_string();
    }
}

async fn calibrate(config: &CalibrationConfig) -> Result<()> {
    let rig = Rig::from_config(config)?;
    let mut sink = CsvSink::from_config(config);
    let report = run_calibration(config, rig, &mut sink).await?;

    print_summary(&report, &sink);
    if let Some((_, reason)) = &report.aborted {
        anyhow::bail!("calibration aborted: {reason}");
    }
    if let Some(e) = report.shutdown_error {
        anyhow::bail!("SLM shutdown failed: {e}");
    }
    Ok(())
}

fn print_summary(report: &CalibrationReport, sink: &CsvSink) {
    println!("Panel: {}", report.geometry);
    println!("LUT: {}", report.lut.display());
    println!(
        "Regions completed: {} (output in {})",
        report.completed.len(),
        sink.dir().display()
    );
    for path in &report.written {
        println!("  {}", path.display());
    }
    if let Some((record, reason)) = &report.aborted {
        println!(
            "Aborted: {} ({} readings discarded)",
            reason,
            record.len()
        );
    }
}

async fn list_meters(config: &CalibrationConfig) -> Result<()> {
    let rig = Rig::from_config(config)?;
    let mut meter = Rig::meter_session(config, rig.meter);
    let resources = meter.discover().await?;
    println!("Number of found devices: {}", resources.len());
    for (i, name) in resources.iter().enumerate() {
        println!("  [{}] {}", i, name);
    }
    Ok(())
}

async fn measure(config: &CalibrationConfig) -> Result<()> {
    let rig = Rig::from_config(config)?;
    let unit = config.power_meter.power_unit()?;
    let mut meter = Rig::meter_session(config, rig.meter);
    meter.connect(config.power_meter.device_index).await?;
    println!(
        "Connected to {} at {} nm",
        meter.connected_resource().unwrap_or("?"),
        meter.wavelength_nm()
    );

    let result = meter
        .capture_samples(config.power_meter.sample_count, unit)
        .await
        .map(|samples| {
            println!("{}", samples.describe());
            println!("Mean: {}", samples.reading());
        });
    disconnect(&mut meter).await;
    Ok(result?)
}
