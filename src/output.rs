//! Result files.
//!
//! [`CsvSink`] writes one headerless `index,value` CSV per completed region
//! and, in raw mode, a PNG plot of power against gray-level index.

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use tracing::{error, info};

use crate::config::CalibrationConfig;
use crate::error::{AppResult, CalibrationError};
use crate::power_meter::PowerUnit;
use crate::sweep::{FinalizedRecord, RecordSink};

const PLOT_WIDTH: u32 = 800;
const PLOT_HEIGHT: u32 = 600;
const MARGIN: u32 = 50;

/// Writes finalized regions into an output directory.
#[derive(Debug, Clone)]
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
    pixels_per_stripe: u32,
    plot: bool,
}

impl CsvSink {
    /// Sink for `dir`. `prefix` is prepended to every file name.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, pixels_per_stripe: u32) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            pixels_per_stripe,
            plot: true,
        }
    }

    /// Sink configured from `output.*`, with a `yymmdd_` prefix for today
    /// when `output.date_prefix` is set.
    pub fn from_config(config: &CalibrationConfig) -> Self {
        let prefix = if config.output.date_prefix {
            chrono::Local::now().format("%y%m%d_").to_string()
        } else {
            String::new()
        };
        Self::new(&config.output.dir, prefix, config.sweep.pixels_per_stripe)
            .with_plot(config.output.plot)
    }

    /// Enable or disable raw-mode plots
    pub fn with_plot(mut self, plot: bool) -> Self {
        self.plot = plot;
        self
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// CSV file for a raw region
    pub fn raw_csv_path(&self, region: u32, unit: PowerUnit) -> PathBuf {
        self.dir.join(format!(
            "{}Raw{}_power_{}px_{}.csv",
            self.prefix,
            region,
            2 * self.pixels_per_stripe,
            unit
        ))
    }

    /// Plot file for a raw region, named after its region and power unit
    pub fn raw_plot_path(&self, region: u32, unit: PowerUnit) -> PathBuf {
        self.dir
            .join(format!("{}Raw{}_power_{}.png", self.prefix, region, unit))
    }

    /// CSV file for a quantized region
    pub fn quantized_csv_path(&self, region: u32, bits: u32) -> PathBuf {
        self.dir
            .join(format!("{}Raw{}_{}bit.csv", self.prefix, region, bits))
    }

    fn write_rows<T: serde::Serialize>(path: &Path, rows: &[(usize, T)]) -> AppResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl RecordSink for CsvSink {
    fn persist(&mut self, record: &FinalizedRecord) -> AppResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)?;

        let mut written = Vec::new();
        match record {
            FinalizedRecord::Raw { region, unit, rows } => {
                let csv_path = self.raw_csv_path(*region, *unit);
                Self::write_rows(&csv_path, rows).inspect_err(|e| error!("{}", e))?;
                written.push(csv_path);

                if self.plot {
                    let plot_path = self.raw_plot_path(*region, *unit);
                    render_plot(rows).save(&plot_path).map_err(|e| {
                        let err = CalibrationError::Plot(format!("{}: {}", plot_path.display(), e));
                        error!("{}", err);
                        err
                    })?;
                    written.push(plot_path);
                }
            }
            FinalizedRecord::Quantized { region, bits, rows } => {
                let csv_path = self.quantized_csv_path(*region, *bits);
                Self::write_rows(&csv_path, rows).inspect_err(|e| error!("{}", e))?;
                written.push(csv_path);
            }
        }

        for path in &written {
            info!(region = record.region(), file = %path.display(), "Saved");
        }
        Ok(written)
    }
}

/// Line plot of `(index, power)` with axes, autoscaled to the data.
///
/// No text is drawn. The region and unit of a plot are carried by its file
/// name, see [`CsvSink::raw_plot_path`].
pub fn render_plot(rows: &[(usize, f64)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(PLOT_WIDTH, PLOT_HEIGHT, Rgb([255, 255, 255]));
    let axis = Rgb([0, 0, 0]);
    let grid = Rgb([220, 220, 220]);
    let trace = Rgb([31, 119, 180]);

    let (left, right) = (MARGIN, PLOT_WIDTH - MARGIN);
    let (top, bottom) = (MARGIN, PLOT_HEIGHT - MARGIN);

    for i in 1..=4 {
        let y = bottom - (bottom - top) * i / 4;
        draw_line(&mut img, (left, y), (right, y), grid);
        let x = left + (right - left) * i / 4;
        draw_line(&mut img, (x, top), (x, bottom), grid);
    }
    draw_line(&mut img, (left, bottom), (right, bottom), axis);
    draw_line(&mut img, (left, top), (left, bottom), axis);

    if rows.is_empty() {
        return img;
    }

    let max_index = rows.iter().map(|(i, _)| *i).max().unwrap_or(0).max(1) as f64;
    let (lo, hi) = rows
        .iter()
        .map(|(_, v)| *v)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return img;
    }
    let span = if hi > lo { hi - lo } else { 1.0 };

    let to_pixel = |index: usize, value: f64| -> (u32, u32) {
        let fx = index as f64 / max_index;
        let fy = ((value - lo) / span).clamp(0.0, 1.0);
        let x = left as f64 + fx * f64::from(right - left);
        let y = bottom as f64 - fy * f64::from(bottom - top);
        (x.round() as u32, y.round() as u32)
    };

    let points: Vec<(u32, u32)> = rows
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, v)| to_pixel(*i, *v))
        .collect();
    for pair in points.windows(2) {
        draw_line(&mut img, pair[0], pair[1], trace);
    }
    for &(x, y) in &points {
        draw_marker(&mut img, x, y, trace);
    }
    img
}

fn draw_line(img: &mut RgbImage, from: (u32, u32), to: (u32, u32), color: Rgb<u8>) {
    let (mut x0, mut y0) = (i64::from(from.0), i64::from(from.1));
    let (x1, y1) = (i64::from(to.0), i64::from(to.1));
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_marker(img: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    let (cx, cy) = (i64::from(x), i64::from(y));
    for dx in -1..=1 {
        for dy in -1..=1 {
            put(img, cx + dx, cy + dy, color);
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(region: u32, values: &[f64]) -> FinalizedRecord {
        FinalizedRecord::Raw {
            region,
            unit: PowerUnit::Microwatts,
            rows: values.iter().copied().enumerate().collect(),
        }
    }

    #[test]
    fn file_names() {
        let sink = CsvSink::new("/data", "240102_", 8);
        assert_eq!(sink.dir(), Path::new("/data"));
        assert_eq!(
            sink.raw_csv_path(0, PowerUnit::Microwatts),
            PathBuf::from("/data/240102_Raw0_power_16px_uW.csv")
        );
        assert_eq!(
            sink.raw_plot_path(3, PowerUnit::Milliwatts),
            PathBuf::from("/data/240102_Raw3_power_mW.png")
        );
        assert_eq!(
            sink.quantized_csv_path(63, 12),
            PathBuf::from("/data/240102_Raw63_12bit.csv")
        );
    }

    #[test]
    fn raw_region_writes_csv_and_plot() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("measured");
        let mut sink = CsvSink::new(&out, "", 8);

        let written = sink.persist(&raw(0, &[0.5, 1.25, 2.0])).unwrap();
        assert_eq!(written.len(), 2);

        let csv = fs::read_to_string(out.join("Raw0_power_16px_uW.csv")).unwrap();
        assert_eq!(csv, "0,0.5\n1,1.25\n2,2.0\n");

        let plot = image::open(out.join("Raw0_power_uW.png")).unwrap();
        assert_eq!((plot.width(), plot.height()), (PLOT_WIDTH, PLOT_HEIGHT));
    }

    #[test]
    fn plot_file_names_region_and_unit() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "240102_", 8);
        let record = FinalizedRecord::Raw {
            region: 5,
            unit: PowerUnit::Milliwatts,
            rows: vec![(0, 0.1), (1, 0.4)],
        };

        let written = sink.persist(&record).unwrap();
        let plot = dir.path().join("240102_Raw5_power_mW.png");
        assert!(written.contains(&plot));
        assert!(plot.exists());
    }

    #[test]
    fn quantized_region_writes_csv_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "", 8);

        let record = FinalizedRecord::Quantized {
            region: 2,
            bits: 2,
            rows: vec![(0, 1), (1, 2), (2, 3)],
        };
        let written = sink.persist(&record).unwrap();
        assert_eq!(written, vec![dir.path().join("Raw2_2bit.csv")]);

        let csv = fs::read_to_string(&written[0]).unwrap();
        assert_eq!(csv, "0,1\n1,2\n2,3\n");
    }

    #[test]
    fn plot_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "", 4).with_plot(false);
        let written = sink.persist(&raw(1, &[1.0, 2.0])).unwrap();
        assert_eq!(written, vec![dir.path().join("Raw1_power_8px_uW.csv")]);
    }

    #[test]
    fn plot_of_flat_data_stays_in_bounds() {
        let img = render_plot(&[(0, 3.0), (1, 3.0), (2, 3.0)]);
        assert_eq!(img.get_pixel(MARGIN, PLOT_HEIGHT - MARGIN), &Rgb([31, 119, 180]));
    }
}
