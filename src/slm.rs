//! SLM Session
//!
//! Owns the SLM board handle between SDK construction and destruction and
//! turns driver status into typed errors:
//!
//! - construction problems become `DeviceConstruction` (reported; the vendor SDK
//!   keeps running in simulation mode when it can still report a board)
//! - LUT failures become `LutLoad`
//! - DMA failures become `ImageWrite`, trigger failures `WriteConfirm`
//!
//! Writes are never retried here: a partially applied image must not be
//! resent blindly.

use std::path::Path;

use tracing::{error, info, warn};

use crate::config::SlmConfig;
use crate::error::{AppResult, CalibrationError};
use crate::hardware::capabilities::SlmDriver;
use crate::hardware::ImageGeometry;

/// An open SLM board.
pub struct SlmSession {
    driver: Box<dyn SlmDriver>,
    board: u32,
    timeout_ms: u32,
    geometry: ImageGeometry,
    sdk_simulation: bool,
    blank: Vec<u8>,
}

impl SlmSession {
    /// Construct the SDK, pick the configured board, read its geometry and
    /// apply the trigger / flip / output-pulse modes.
    ///
    /// # Errors
    /// - `DeviceConstruction` if the SDK cannot be constructed at all
    /// - `NoBoards` if no controller is reported
    /// - `Configuration` if `board_number` exceeds the boards found
    pub async fn open(mut driver: Box<dyn SlmDriver>, settings: &SlmConfig) -> AppResult<Self> {
        let sdk = driver.create_session().await.map_err(|e| {
            error!(error = %e, "Blink SDK did not construct successfully");
            CalibrationError::DeviceConstruction(e.to_string())
        })?;

        // The SDK reports construction problems but keeps a simulated board.
        let sdk_simulation = !sdk.constructed_ok;
        if sdk_simulation {
            let err = CalibrationError::DeviceConstruction(
                "no SLM attached or driver handle held by another program".to_string(),
            );
            warn!("{}; continuing in SDK simulation mode", err);
        }

        if let Err(err) = Self::check_boards(sdk.board_count, settings.board_number) {
            error!("{}", err);
            if let Err(e) = driver.destroy_session().await {
                warn!(error = %e, "SDK teardown after failed open");
            }
            return Err(err);
        }
        info!("Found {} SLM controller(s)", sdk.board_count);

        match Self::configure(driver.as_mut(), settings).await {
            Ok(geometry) => {
                info!(board = settings.board_number, %geometry, "SLM session open");
                Ok(Self {
                    driver,
                    board: settings.board_number,
                    timeout_ms: settings.timeout_ms,
                    geometry,
                    sdk_simulation,
                    blank: geometry.blank_buffer(),
                })
            }
            Err(e) => {
                let err = CalibrationError::DeviceConstruction(e.to_string());
                error!("{}", err);
                if let Err(e) = driver.destroy_session().await {
                    warn!(error = %e, "SDK teardown after failed open");
                }
                Err(err)
            }
        }
    }

    fn check_boards(board_count: u32, board: u32) -> AppResult<()> {
        if board_count == 0 {
            return Err(CalibrationError::NoBoards);
        }
        if board == 0 || board > board_count {
            return Err(CalibrationError::Configuration(format!(
                "board_number {} not available, {} board(s) found",
                board, board_count
            )));
        }
        Ok(())
    }

    async fn configure(
        driver: &mut dyn SlmDriver,
        settings: &SlmConfig,
    ) -> anyhow::Result<ImageGeometry> {
        let board = settings.board_number;
        let geometry = driver.image_geometry(board).await?;
        driver
            .set_trigger_mode(board, settings.external_trigger)
            .await?;
        driver.set_flip_mode(board, settings.flip_immediate).await?;
        driver
            .set_output_pulse_mode(board, settings.output_pulse)
            .await?;
        Ok(geometry)
    }

    /// Panel geometry
    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    /// True when the SDK reported a construction problem and simulates the board
    pub fn sdk_simulation(&self) -> bool {
        self.sdk_simulation
    }

    /// Load a LUT file into the controller.
    pub async fn load_lut(&mut self, path: &Path) -> AppResult<()> {
        let path_str = path.to_string_lossy();
        let result = self.driver.load_lut(self.board, &path_str).await;
        match result {
            Ok(()) => {
                info!(lut = %path_str, "LUT loaded");
                Ok(())
            }
            Err(e) => {
                let err = CalibrationError::LutLoad {
                    path: path_str.into_owned(),
                    reason: e.to_string(),
                };
                error!("{}. Check LUT file and path.", err);
                Err(err)
            }
        }
    }

    /// DMA an image to the board. Returns once the transfer is complete.
    pub async fn write_image(&mut self, image: &[u8]) -> AppResult<()> {
        self.driver
            .write_image(self.board, image, self.timeout_ms)
            .await
            .map_err(|e| CalibrationError::ImageWrite(e.to_string()))
    }

    /// Wait until the board can accept the next image.
    pub async fn confirm_write(&mut self) -> AppResult<()> {
        self.driver
            .confirm_write_complete(self.board, self.timeout_ms)
            .await
            .map_err(|e| CalibrationError::WriteConfirm(e.to_string()))
    }

    /// Write and confirm the all-zero image.
    pub async fn display_blank(&mut self) -> AppResult<()> {
        self.write_blank().await?;
        self.confirm_write().await
    }

    /// Write the all-zero image without waiting for completion.
    pub async fn write_blank(&mut self) -> AppResult<()> {
        self.driver
            .write_image(self.board, &self.blank, self.timeout_ms)
            .await
            .map_err(|e| CalibrationError::ImageWrite(e.to_string()))
    }

    /// Release the SDK.
    pub async fn close(mut self) -> AppResult<()> {
        self.driver.destroy_session().await.map_err(|e| {
            error!(error = %e, "SDK teardown failed");
            CalibrationError::DeviceConstruction(format!("teardown failed: {e}"))
        })?;
        info!("SLM session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedSlm;

    fn settings() -> SlmConfig {
        SlmConfig::default()
    }

    #[tokio::test]
    async fn open_applies_modes() {
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(16, 8, 8))
            .build();
        let monitor = slm.monitor();

        let mut config = settings();
        config.output_pulse = true;
        let session = SlmSession::open(Box::new(slm), &config).await.unwrap();

        assert_eq!(session.geometry(), ImageGeometry::new(16, 8, 8));
        assert!(!session.sdk_simulation());
        let log = monitor.log().await;
        assert!(log.created);
        assert_eq!(log.modes, (Some(false), Some(false), Some(true)));
    }

    #[tokio::test]
    async fn construction_problem_continues_in_simulation() {
        let slm = SimulatedSlm::builder().constructed_ok(false).build();
        let session = SlmSession::open(Box::new(slm), &settings()).await.unwrap();
        assert!(session.sdk_simulation());
    }

    #[tokio::test]
    async fn no_boards_is_an_error_and_tears_down() {
        let slm = SimulatedSlm::builder().board_count(0).build();
        let monitor = slm.monitor();
        let result = SlmSession::open(Box::new(slm), &settings()).await;

        assert!(matches!(result, Err(CalibrationError::NoBoards)));
        assert!(monitor.log().await.destroyed);
    }

    #[tokio::test]
    async fn lut_failure_is_typed() {
        let slm = SimulatedSlm::builder().reject_lut().build();
        let mut session = SlmSession::open(Box::new(slm), &settings()).await.unwrap();
        let result = session.load_lut(Path::new("missing.LUT")).await;
        assert!(matches!(result, Err(CalibrationError::LutLoad { .. })));
    }

    #[tokio::test]
    async fn write_failures_are_typed() {
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(2, 2, 8))
            .fail_write_on_call(1)
            .fail_confirm_on_call(1)
            .build();
        let mut session = SlmSession::open(Box::new(slm), &settings()).await.unwrap();

        assert!(matches!(
            session.write_image(&[1, 2, 3, 4]).await,
            Err(CalibrationError::ImageWrite(_))
        ));
        assert!(matches!(
            session.confirm_write().await,
            Err(CalibrationError::WriteConfirm(_))
        ));
    }

    #[tokio::test]
    async fn blank_and_close() {
        let slm = SimulatedSlm::builder()
            .geometry(ImageGeometry::new(4, 4, 8))
            .build();
        let monitor = slm.monitor();
        let mut session = SlmSession::open(Box::new(slm), &settings()).await.unwrap();

        session.display_blank().await.unwrap();
        session.close().await.unwrap();

        let log = monitor.log().await;
        assert_eq!(log.blank_writes(), 1);
        assert_eq!(log.confirm_calls, 1);
        assert!(log.destroyed);
    }
}
