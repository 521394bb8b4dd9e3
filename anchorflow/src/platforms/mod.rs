//! Seams to the machine: pixels in, input events out.

use image::RgbaImage;
use std::sync::Arc;

use crate::anchor::Region;
use crate::clock::{Clock, SystemClock};
use crate::config::FlowConfig;
use crate::download::{DownloadDir, FsDownloadDir};
use crate::errors::Result;

mod rdev_input;
mod xcap_screen;

pub use rdev_input::{Hotkey, RdevInput};
pub use xcap_screen::XcapScreen;

/// One screen grab and where its top-left pixel sits on the screen.
#[derive(Debug, Clone)]
pub struct Capture {
    pub image: RgbaImage,
    pub origin: (i32, i32),
}

/// The common trait that all screen grabbers must implement
pub trait ScreenSource: Send + Sync {
    /// Capture the whole primary screen, or only `region` (absolute pixels).
    fn capture(&self, region: Option<Region>) -> Result<Capture>;
}

/// Synthesized mouse and keyboard input.
pub trait InputDevice: Send + Sync {
    /// Left click at absolute screen coordinates.
    fn click(&self, x: i32, y: i32) -> Result<()>;

    /// Wheel scroll; negative deltas scroll down.
    fn scroll(&self, delta: i64) -> Result<()>;

    /// Press every key of the chord in order, then release in reverse.
    fn hotkey(&self, hotkey: &Hotkey) -> Result<()>;
}

/// The machine a workflow runs against.
#[derive(Clone)]
pub struct Platform {
    pub screen: Arc<dyn ScreenSource>,
    pub input: Arc<dyn InputDevice>,
    pub downloads: Arc<dyn DownloadDir>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    /// Primary monitor, real input and the configured download folder.
    pub fn native(config: &FlowConfig) -> Self {
        Self {
            screen: Arc::new(XcapScreen::new()),
            input: Arc::new(RdevInput::default()),
            downloads: Arc::new(FsDownloadDir::new(config.paths.download_folder.clone())),
            clock: Arc::new(SystemClock),
        }
    }
}
