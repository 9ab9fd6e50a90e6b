//! Meadowlark Blink SDK bindings.
//!
//! Links against `Blink_C_wrapper` (board control) and `ImageGen` (pattern
//! generation) from the Blink Plus SDK. Both libraries must be on the linker
//! search path when building with `--features blink_sdk`.
//!
//! Return codes are interpreted by [`sdk_status`](super::sdk_status):
//! `Load_LUT_file` fails with 0, `Write_image` and `ImageWriteComplete`
//! succeed only with 1.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uint};

use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;

use crate::hardware::capabilities::{PatternGenerator, SdkSession, SlmDriver, StripeSpec};
use crate::hardware::sdk_status::{check_lut_status, check_transfer_status};
use crate::hardware::ImageGeometry;

#[link(name = "Blink_C_wrapper")]
extern "C" {
    fn Create_SDK(num_boards_found: *mut c_uint, constructed_ok: *mut c_int);
    fn Delete_SDK();
    fn Get_image_width(board: c_uint) -> c_int;
    fn Get_image_height(board: c_uint) -> c_int;
    fn Get_image_depth(board: c_uint) -> c_int;
    fn SetWaitForTrigger(board: c_uint, external_trigger: c_uint);
    fn SetFlipImmediate(board: c_uint, flip_immediate: c_uint);
    fn SetOutputPulse(board: c_uint, output_pulse: c_uint);
    fn Load_LUT_file(board: c_uint, path: *const c_char) -> c_int;
    fn Write_image(board: c_uint, image: *const u8, timeout_ms: c_uint) -> c_int;
    fn ImageWriteComplete(board: c_uint, timeout_ms: c_uint) -> c_int;
}

#[link(name = "ImageGen")]
extern "C" {
    #[allow(clippy::too_many_arguments)]
    fn Generate_Stripe(
        image: *mut u8,
        wfc: *const u8,
        width: c_int,
        height: c_int,
        depth: c_int,
        reference: c_int,
        variable: c_int,
        pixels_per_stripe: c_int,
        vertical: c_int,
        rgb: c_int,
        horizontal_shift: c_int,
    );
    fn Mask_Image(
        image: *mut u8,
        width: c_int,
        height: c_int,
        depth: c_int,
        region: c_int,
        num_regions: c_int,
        rgb: c_int,
    );
}

fn c_int_of(value: u32, what: &str) -> Result<c_int> {
    c_int::try_from(value).map_err(|_| anyhow!("{what} {value} out of range"))
}

/// SLM board driven through `Blink_C_wrapper`.
#[derive(Debug, Default)]
pub struct BlinkSlm {
    created: bool,
    geometry: Option<ImageGeometry>,
}

impl BlinkSlm {
    /// Driver with no SDK constructed yet
    pub fn new() -> Self {
        Self::default()
    }

    fn check_buffer(&self, image: &[u8]) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        if let Some(geometry) = self.geometry {
            ensure!(
                image.len() == geometry.buffer_len(),
                "image buffer is {} bytes, panel needs {}",
                image.len(),
                geometry.buffer_len()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SlmDriver for BlinkSlm {
    async fn create_session(&mut self) -> Result<SdkSession> {
        ensure!(!self.created, "Blink SDK already constructed");
        let mut boards: c_uint = 0;
        let mut ok: c_int = 0;
        // SAFETY: both out-pointers reference live stack variables.
        unsafe { Create_SDK(&mut boards, &mut ok) };
        self.created = true;
        Ok(SdkSession {
            board_count: boards,
            constructed_ok: ok == 1,
        })
    }

    async fn image_geometry(&mut self, board: u32) -> Result<ImageGeometry> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: plain value calls into the SDK after construction.
        let (width, height, depth) = unsafe {
            (
                Get_image_width(board),
                Get_image_height(board),
                Get_image_depth(board),
            )
        };
        ensure!(
            width > 0 && height > 0 && depth > 0,
            "board {board} reported {width}x{height}x{depth}"
        );
        let geometry = ImageGeometry::new(width as u32, height as u32, depth as u32);
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    async fn set_trigger_mode(&mut self, board: u32, external_trigger: bool) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: plain value call.
        unsafe { SetWaitForTrigger(board, c_uint::from(external_trigger)) };
        Ok(())
    }

    async fn set_flip_mode(&mut self, board: u32, flip_immediate: bool) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: plain value call.
        unsafe { SetFlipImmediate(board, c_uint::from(flip_immediate)) };
        Ok(())
    }

    async fn set_output_pulse_mode(&mut self, board: u32, output_pulse: bool) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: plain value call.
        unsafe { SetOutputPulse(board, c_uint::from(output_pulse)) };
        Ok(())
    }

    async fn load_lut(&mut self, board: u32, path: &str) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        let c_path = CString::new(path)?;
        // SAFETY: c_path outlives the call and is NUL-terminated.
        let status = unsafe { Load_LUT_file(board, c_path.as_ptr()) };
        check_lut_status(status)
    }

    async fn write_image(&mut self, board: u32, image: &[u8], timeout_ms: u32) -> Result<()> {
        self.check_buffer(image)?;
        // SAFETY: the buffer length matches the panel geometry checked above.
        let status = unsafe { Write_image(board, image.as_ptr(), timeout_ms) };
        check_transfer_status("Write_image", status)
    }

    async fn confirm_write_complete(&mut self, board: u32, timeout_ms: u32) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: plain value call.
        let status = unsafe { ImageWriteComplete(board, timeout_ms) };
        check_transfer_status("ImageWriteComplete", status)
    }

    async fn destroy_session(&mut self) -> Result<()> {
        ensure!(self.created, "Blink SDK not constructed");
        // SAFETY: called once, after Create_SDK.
        unsafe { Delete_SDK() };
        self.created = false;
        self.geometry = None;
        Ok(())
    }
}

/// Pattern generator backed by the SDK's `ImageGen` library.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlinkImageGen;

impl BlinkImageGen {
    fn dims(geometry: ImageGeometry) -> Result<(c_int, c_int, c_int)> {
        Ok((
            c_int_of(geometry.width, "width")?,
            c_int_of(geometry.height, "height")?,
            c_int_of(geometry.bit_depth, "bit depth")?,
        ))
    }
}

impl PatternGenerator for BlinkImageGen {
    fn generate_stripe(
        &self,
        image: &mut [u8],
        wfc: &[u8],
        geometry: ImageGeometry,
        stripe: StripeSpec,
    ) -> Result<()> {
        let len = geometry.buffer_len();
        ensure!(
            image.len() == len && wfc.len() == len,
            "image/wfc buffers must be {len} bytes"
        );
        let (width, height, depth) = Self::dims(geometry)?;
        // SAFETY: both buffers hold a full frame for this geometry.
        unsafe {
            Generate_Stripe(
                image.as_mut_ptr(),
                wfc.as_ptr(),
                width,
                height,
                depth,
                stripe.reference_level,
                stripe.variable_level,
                c_int_of(stripe.pixels_per_stripe, "pixels per stripe")?,
                c_int::from(stripe.vertical),
                c_int::from(stripe.rgb),
                0,
            )
        };
        Ok(())
    }

    fn mask_to_region(
        &self,
        image: &mut [u8],
        geometry: ImageGeometry,
        region: u32,
        region_count: u32,
        rgb: bool,
    ) -> Result<()> {
        ensure!(
            image.len() == geometry.buffer_len(),
            "image buffer must be {} bytes",
            geometry.buffer_len()
        );
        let (width, height, depth) = Self::dims(geometry)?;
        // SAFETY: the buffer holds a full frame for this geometry.
        unsafe {
            Mask_Image(
                image.as_mut_ptr(),
                width,
                height,
                depth,
                c_int_of(region, "region")?,
                c_int_of(region_count, "region count")?,
                c_int::from(rgb),
            )
        };
        Ok(())
    }
}
