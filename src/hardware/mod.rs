//! Hardware seams and drivers.
//!
//! The calibration core never talks to a vendor library directly. It goes
//! through the three capability traits in [`capabilities`]:
//!
//! - [`SlmDriver`](capabilities::SlmDriver) - SLM board SDK (session, LUT, DMA write/complete)
//! - [`PatternGenerator`](capabilities::PatternGenerator) - stripe image generation and region masking
//! - [`PowerMeterDriver`](capabilities::PowerMeterDriver) - optical power meter
//!
//! Implementations:
//!
//! - [`stripe::StripeGenerator`] - native pattern generator (always available)
//! - [`mock`] - simulated SLM and power meter sharing an optical bench model
//! - `blink` - Meadowlark Blink SDK via FFI (feature `blink_sdk`)
//! - `thorlabs_pm` - Thorlabs PM100 over VISA (feature `instrument_visa`)

pub mod capabilities;
pub mod mock;
pub mod sdk_status;
pub mod stripe;

#[cfg(feature = "blink_sdk")]
pub mod blink;

#[cfg(feature = "instrument_visa")]
pub mod thorlabs_pm;

use serde::{Deserialize, Serialize};

/// Image geometry reported by the SLM controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    /// Panel width in pixels
    pub width: u32,
    /// Panel height in pixels
    pub height: u32,
    /// Bits per pixel
    pub bit_depth: u32,
}

impl ImageGeometry {
    /// Create a geometry description
    pub fn new(width: u32, height: u32, bit_depth: u32) -> Self {
        Self {
            width,
            height,
            bit_depth,
        }
    }

    /// Bytes used by one pixel (at least one).
    pub fn bytes_per_pixel(&self) -> usize {
        ((self.bit_depth / 8) as usize).max(1)
    }

    /// Number of bytes in one full-panel image buffer.
    pub fn buffer_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }

    /// Zero-filled buffer sized for this panel (the blank image).
    pub fn blank_buffer(&self) -> Vec<u8> {
        vec![0u8; self.buffer_len()]
    }
}

impl std::fmt::Display for ImageGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} @ {} bpp", self.width, self.height, self.bit_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_accounts_for_depth() {
        assert_eq!(ImageGeometry::new(1920, 1152, 8).buffer_len(), 1920 * 1152);
        assert_eq!(ImageGeometry::new(4, 2, 16).buffer_len(), 16);
        // Sub-byte depths still occupy one byte per pixel
        assert_eq!(ImageGeometry::new(4, 2, 1).buffer_len(), 8);
    }
}
