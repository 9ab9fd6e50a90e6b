//! Hardware Capabilities
//!
//! This module defines the traits the calibration core uses to reach its three
//! external collaborators. Each trait mirrors one vendor interface and nothing
//! more, so the sweep logic can be exercised against mock implementations:
//!
//! - [`SlmDriver`] - the SLM board SDK (session, modes, LUT, DMA write/complete)
//! - [`PatternGenerator`] - stripe image generation and per-region masking
//! - [`PowerMeterDriver`] - discovery, connection and single-sample power reads
//!
//! # Design Philosophy
//!
//! Each device trait:
//! - Is async (uses #[async_trait])
//! - Takes `&mut self`: a handle is owned by exactly one session
//! - Uses anyhow::Result for errors; sessions map them to `CalibrationError`
//!
//! # Example
//!
//! ```rust,ignore
//! async fn push<S: SlmDriver>(slm: &mut S, board: u32, image: &[u8]) -> Result<()> {
//!     slm.write_image(board, image, 1000).await?;
//!     slm.confirm_write_complete(board, 1000).await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::ImageGeometry;

/// Result of constructing the SLM SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkSession {
    /// Number of controller boards the SDK found
    pub board_count: u32,
    /// False when the SDK could not construct normally (no board attached,
    /// driver handle held by another program). The vendor SDK then runs in
    /// simulation mode and still reports one board.
    pub constructed_ok: bool,
}

/// Capability: SLM board control
///
/// # Contract
/// - `create_session` must be called before any other method
/// - `write_image` returns once the DMA transfer is complete
/// - `confirm_write_complete` returns once the hardware memory bank can accept
///   the next DMA
/// - `destroy_session` is called exactly once, last
#[async_trait]
pub trait SlmDriver: Send {
    /// Construct the SDK and enumerate boards
    async fn create_session(&mut self) -> Result<SdkSession>;

    /// Panel geometry of a board
    async fn image_geometry(&mut self, board: u32) -> Result<ImageGeometry>;

    /// Wait for an external trigger before each image load
    async fn set_trigger_mode(&mut self, board: u32, external_trigger: bool) -> Result<()>;

    /// Flip to new images immediately instead of on frame boundaries
    async fn set_flip_mode(&mut self, board: u32, flip_immediate: bool) -> Result<()>;

    /// Emit an output pulse when new image data is loaded
    async fn set_output_pulse_mode(&mut self, board: u32, output_pulse: bool) -> Result<()>;

    /// Load a LUT file into the controller
    async fn load_lut(&mut self, board: u32, path: &str) -> Result<()>;

    /// DMA an image buffer into the controller's frame buffer
    ///
    /// # Arguments
    /// * `board` - Board number
    /// * `image` - Full-panel buffer, `ImageGeometry::buffer_len` bytes
    /// * `timeout_ms` - Upper bound on the transfer
    async fn write_image(&mut self, board: u32, image: &[u8], timeout_ms: u32) -> Result<()>;

    /// Wait until the hardware reports the write finished
    async fn confirm_write_complete(&mut self, board: u32, timeout_ms: u32) -> Result<()>;

    /// Release the SDK
    async fn destroy_session(&mut self) -> Result<()>;
}

/// Parameters of one stripe image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSpec {
    /// Gray level of the fixed stripes
    pub reference_level: i32,
    /// Gray level of the swept stripes
    pub variable_level: i32,
    /// Width of one stripe in pixels (grating period is twice this)
    pub pixels_per_stripe: u32,
    /// Vertical stripes when true, horizontal otherwise
    pub vertical: bool,
    /// RGB image layout (never used over PCIe)
    pub rgb: bool,
}

/// Capability: image generation
///
/// Pure buffer manipulation, so the trait is synchronous.
pub trait PatternGenerator: Send + Sync {
    /// Fill `image` with a two-level stripe grating, adding the wavefront
    /// correction `wfc` pixel by pixel.
    fn generate_stripe(
        &self,
        image: &mut [u8],
        wfc: &[u8],
        geometry: ImageGeometry,
        stripe: StripeSpec,
    ) -> Result<()>;

    /// Restrict `image` to region `region` of `region_count`, blanking all
    /// other pixels.
    fn mask_to_region(
        &self,
        image: &mut [u8],
        geometry: ImageGeometry,
        region: u32,
        region_count: u32,
        rgb: bool,
    ) -> Result<()>;
}

/// Capability: optical power measurement
///
/// # Contract
/// - `enumerate` may return devices in a different order on each call
/// - `measure_power` returns one reading in Watts
#[async_trait]
pub trait PowerMeterDriver: Send {
    /// Resource names of attached meters
    async fn enumerate(&mut self) -> Result<Vec<String>>;

    /// Open a meter by resource name
    ///
    /// # Arguments
    /// * `resource` - Name as returned by `enumerate`
    /// * `reset` - Reset the instrument on open
    /// * `id_query` - Verify the instrument identity on open
    async fn open(&mut self, resource: &str, reset: bool, id_query: bool) -> Result<()>;

    /// Set the correction wavelength in nanometres
    async fn set_wavelength(&mut self, wavelength_nm: f64) -> Result<()>;

    /// Take one power reading in Watts
    async fn measure_power(&mut self) -> Result<f64>;

    /// Release the instrument
    async fn close(&mut self) -> Result<()>;
}
