use image::imageops;
use tracing::debug;

use super::{Capture, ScreenSource};
use crate::anchor::Region;
use crate::errors::{FlowError, Result};

/// Captures the primary monitor through `xcap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct XcapScreen;

impl XcapScreen {
    pub fn new() -> Self {
        Self
    }

    fn primary_monitor() -> Result<xcap::Monitor> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| FlowError::Capture(format!("Failed to get monitors: {e}")))?;
        for monitor in monitors {
            match monitor.is_primary() {
                Ok(true) => return Ok(monitor),
                Ok(false) => continue,
                Err(e) => {
                    return Err(FlowError::Capture(format!(
                        "Error checking monitor primary status: {e}"
                    )));
                }
            }
        }
        Err(FlowError::Capture("Could not find primary monitor".to_string()))
    }
}

impl ScreenSource for XcapScreen {
    fn capture(&self, region: Option<Region>) -> Result<Capture> {
        let monitor = Self::primary_monitor()?;
        let origin_x = monitor
            .x()
            .map_err(|e| FlowError::Capture(format!("Failed to get monitor x: {e}")))?;
        let origin_y = monitor
            .y()
            .map_err(|e| FlowError::Capture(format!("Failed to get monitor y: {e}")))?;
        let image = monitor
            .capture_image()
            .map_err(|e| FlowError::Capture(format!("Failed to capture screen: {e}")))?;

        let Some(region) = region else {
            return Ok(Capture {
                image,
                origin: (origin_x, origin_y),
            });
        };

        // Clip the requested region to the monitor.
        let left = (region.x - origin_x).max(0) as u32;
        let top = (region.y - origin_y).max(0) as u32;
        let right = ((region.x - origin_x) as i64 + region.width as i64).min(image.width() as i64);
        let bottom = ((region.y - origin_y) as i64 + region.height as i64).min(image.height() as i64);
        if right <= left as i64 || bottom <= top as i64 {
            return Err(FlowError::Capture(format!(
                "region {region:?} lies outside the primary monitor"
            )));
        }
        let (width, height) = (right as u32 - left, bottom as u32 - top);
        debug!("Cropping capture to {}x{} at {},{}", width, height, left, top);
        let cropped = imageops::crop_imm(&image, left, top, width, height).to_image();

        Ok(Capture {
            image: cropped,
            origin: (origin_x + left as i32, origin_y + top as i32),
        })
    }
}
