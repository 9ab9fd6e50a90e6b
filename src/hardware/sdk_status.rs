//! Return-code conventions of the Blink SDK.
//!
//! - `Load_LUT_file` returns 0 on failure, anything else on success
//! - `Write_image` and `ImageWriteComplete` return 1 on success; any other
//!   value (0 or -1) is a failed transfer
//!
//! The simulated SLM reports its injected failures through the same codes.

use anyhow::{bail, Result};

/// Success code of the image transfer calls
pub const TRANSFER_OK: i32 = 1;

/// Failure code of `Load_LUT_file`
pub const LUT_FAILED: i32 = 0;

/// Interpret a `Load_LUT_file` return value.
pub fn check_lut_status(status: i32) -> Result<()> {
    if status == LUT_FAILED {
        bail!("Load_LUT_file returned {status}");
    }
    Ok(())
}

/// Interpret a `Write_image` / `ImageWriteComplete` return value.
pub fn check_transfer_status(call: &str, status: i32) -> Result<()> {
    if status != TRANSFER_OK {
        bail!("{call} returned {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_load_fails_only_on_zero() {
        assert!(check_lut_status(1).is_ok());
        assert!(check_lut_status(2).is_ok());
        assert!(check_lut_status(-1).is_ok());
        let err = check_lut_status(0).unwrap_err();
        assert_eq!(err.to_string(), "Load_LUT_file returned 0");
    }

    #[test]
    fn transfer_succeeds_only_on_one() {
        assert!(check_transfer_status("Write_image", 1).is_ok());
        for status in [0, -1, 2] {
            let err = check_transfer_status("Write_image", status).unwrap_err();
            assert_eq!(err.to_string(), format!("Write_image returned {status}"));
        }
        assert!(check_transfer_status("ImageWriteComplete", 0).is_err());
    }
}
