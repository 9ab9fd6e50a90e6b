//! Native stripe pattern generator.
//!
//! Produces the binary phase grating used for LUT calibration: stripes of
//! `pixels_per_stripe` pixels alternate between the reference and the variable
//! gray level, so the grating period is `2 * pixels_per_stripe`. A fairly high
//! spatial frequency keeps the first diffraction order well away from the zeroth.
//!
//! Regions tile the panel as a square grid (`region_count` = 1, 4, 16, 64, ...),
//! numbered row-major from the top-left corner.

use anyhow::{anyhow, ensure, Result};

use crate::hardware::capabilities::{PatternGenerator, StripeSpec};
use crate::hardware::ImageGeometry;

/// Pattern generator implemented in Rust.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripeGenerator;

fn clamp_level(level: i32) -> u8 {
    level.clamp(0, u8::MAX as i32) as u8
}

/// Side length of the square region grid, if `region_count` is a perfect square.
pub fn region_grid_side(region_count: u32) -> Option<u32> {
    if region_count == 0 {
        return None;
    }
    let side = (region_count as f64).sqrt().round() as u32;
    (side * side == region_count).then_some(side)
}

/// Pixel bounds `(x0, x1, y0, y1)` (end-exclusive) of a region.
pub fn region_bounds(
    geometry: ImageGeometry,
    region: u32,
    region_count: u32,
) -> Result<(u32, u32, u32, u32)> {
    let side = region_grid_side(region_count)
        .ok_or_else(|| anyhow!("Region count {} is not a perfect square", region_count))?;
    ensure!(
        region < region_count,
        "Region {} out of range for {} regions",
        region,
        region_count
    );

    let row = region / side;
    let col = region % side;
    let x0 = col * geometry.width / side;
    let x1 = (col + 1) * geometry.width / side;
    let y0 = row * geometry.height / side;
    let y1 = (row + 1) * geometry.height / side;
    Ok((x0, x1, y0, y1))
}

impl PatternGenerator for StripeGenerator {
    fn generate_stripe(
        &self,
        image: &mut [u8],
        wfc: &[u8],
        geometry: ImageGeometry,
        stripe: StripeSpec,
    ) -> Result<()> {
        let expected = geometry.buffer_len();
        ensure!(
            image.len() == expected,
            "Image buffer is {} bytes, expected {} for {}",
            image.len(),
            expected,
            geometry
        );
        ensure!(
            wfc.len() == expected,
            "Wavefront correction is {} bytes, expected {}",
            wfc.len(),
            expected
        );
        ensure!(stripe.pixels_per_stripe > 0, "Stripe width must be positive");

        let reference = clamp_level(stripe.reference_level);
        let variable = clamp_level(stripe.variable_level);
        let bpp = geometry.bytes_per_pixel();
        let period = stripe.pixels_per_stripe;

        for y in 0..geometry.height {
            for x in 0..geometry.width {
                let coord = if stripe.vertical { x } else { y };
                let level = if (coord / period) % 2 == 0 {
                    reference
                } else {
                    variable
                };
                let start = (y as usize * geometry.width as usize + x as usize) * bpp;
                for i in start..start + bpp {
                    image[i] = level.wrapping_add(wfc[i]);
                }
            }
        }
        Ok(())
    }

    fn mask_to_region(
        &self,
        image: &mut [u8],
        geometry: ImageGeometry,
        region: u32,
        region_count: u32,
        _rgb: bool,
    ) -> Result<()> {
        ensure!(
            image.len() == geometry.buffer_len(),
            "Image buffer is {} bytes, expected {}",
            image.len(),
            geometry.buffer_len()
        );
        if region_count == 1 {
            return Ok(());
        }

        let (x0, x1, y0, y1) = region_bounds(geometry, region, region_count)?;
        let bpp = geometry.bytes_per_pixel();
        let row_bytes = geometry.width as usize * bpp;

        for (y, row) in image.chunks_exact_mut(row_bytes).enumerate() {
            let y = y as u32;
            if y < y0 || y >= y1 {
                row.fill(0);
                continue;
            }
            row[..x0 as usize * bpp].fill(0);
            row[x1 as usize * bpp..].fill(0);
        }
        Ok(())
    }
}
