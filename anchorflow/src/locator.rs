use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::anchor::{Anchor, Region};
use crate::clock::{clip_to_deadline, deadline_after, CancelToken, Clock};
use crate::errors::{ErrorKind, FlowError, Result};
use crate::matcher::{best_match, Haystack, MatchMethod, MatchingConfig};
use crate::platforms::{InputDevice, ScreenSource};
use crate::retry::RetryPolicy;

/// Where an accepted anchor sits on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Center of the matched template, absolute screen pixels.
    pub x: i32,
    pub y: i32,
    /// Raw metric value; a distance for [`MatchMethod::SqdiffNormed`].
    pub score: f64,
    pub scale: f64,
}

/// Per-call knobs for [`AnchorLocator::find_and_click`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClickOptions {
    /// Maximum number of locate attempts.
    pub retry: u32,
    /// Pause after a successful click.
    pub wait_after: Duration,
    /// Overall bound on the search.
    pub timeout: Duration,
    /// Overrides the anchor's own click offset when set.
    pub click_offset: Option<(i32, i32)>,
}

impl Default for ClickOptions {
    fn default() -> Self {
        Self {
            retry: 3,
            wait_after: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
            click_offset: None,
        }
    }
}

/// Finds anchors on screen and clicks them.
///
/// Absence is an ordinary value (`None`/`false`); only the bounded
/// `find_and_click` search turns a miss into [`FlowError::AnchorNotFound`].
pub struct AnchorLocator {
    screen: Arc<dyn ScreenSource>,
    input: Arc<dyn InputDevice>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    method: MatchMethod,
    grayscale: bool,
    scales: Vec<f64>,
    retry_interval: Duration,
    capture_retry: RetryPolicy<FlowError>,
}

impl AnchorLocator {
    pub fn new(
        config: &MatchingConfig,
        screen: Arc<dyn ScreenSource>,
        input: Arc<dyn InputDevice>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        let capture_retry = config
            .capture_retry
            .policy([ErrorKind::Capture], clock.clone())?;
        Ok(Self {
            screen,
            input,
            clock,
            cancel,
            method: config.method,
            grayscale: config.grayscale,
            scales: config.scales.clone(),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            capture_retry,
        })
    }

    pub fn method(&self) -> MatchMethod {
        self.method
    }

    /// Pause between missed attempts; also the default poll interval.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Capture the screen (or `region`, else the anchor's own region) and
    /// look for the anchor at every configured scale.
    #[instrument(level = "debug", skip(self, anchor), fields(anchor = %anchor.name()))]
    pub fn locate(&self, anchor: &Anchor, region: Option<Region>) -> Result<Option<MatchResult>> {
        let region = region.or(anchor.region());
        let capture = self.capture_retry.run(|| self.screen.capture(region))?;
        let haystack = Haystack::new(&capture.image, self.grayscale);

        let Some(candidate) = best_match(&haystack, anchor.template(), self.method, &self.scales) else {
            debug!("Template larger than capture at every scale");
            return Ok(None);
        };
        if !self.method.accepts(candidate.score, anchor.confidence()) {
            debug!(
                score = candidate.score,
                confidence = anchor.confidence(),
                "Best candidate rejected"
            );
            return Ok(None);
        }

        let (cx, cy) = candidate.center();
        let hit = MatchResult {
            x: capture.origin.0 + cx as i32,
            y: capture.origin.1 + cy as i32,
            score: candidate.score,
            scale: candidate.scale,
        };
        debug!(x = hit.x, y = hit.y, score = hit.score, scale = hit.scale, "Anchor located");
        Ok(Some(hit))
    }

    pub fn exists(&self, anchor: &Anchor) -> Result<bool> {
        Ok(self.locate(anchor, None)?.is_some())
    }

    /// Locate the anchor up to `retry` times within `timeout` and click its
    /// center plus the click offset.
    #[instrument(level = "debug", skip(self, anchor, options), fields(anchor = %anchor.name()))]
    pub fn find_and_click(&self, anchor: &Anchor, options: &ClickOptions) -> Result<MatchResult> {
        let start = self.clock.now();
        let deadline = deadline_after(start, options.timeout);
        let mut attempts = 0;

        while attempts < options.retry && deadline.map_or(true, |deadline| self.clock.now() < deadline) {
            self.check_cancelled()?;
            attempts += 1;
            if let Some(hit) = self.locate(anchor, None)? {
                let (dx, dy) = options.click_offset.unwrap_or(anchor.click_offset());
                self.input.click(hit.x + dx, hit.y + dy)?;
                info!(
                    "Clicked '{}' at ({}, {}) on attempt {}",
                    anchor.name(),
                    hit.x + dx,
                    hit.y + dy,
                    attempts
                );
                self.clock.sleep(options.wait_after);
                return Ok(hit);
            }
            if attempts < options.retry {
                self.clock.sleep(self.retry_interval);
            }
        }

        let elapsed = self.clock.now().saturating_duration_since(start);
        debug!(attempts, ?elapsed, "Anchor search exhausted");
        Err(FlowError::AnchorNotFound {
            anchor: anchor.name().to_string(),
            attempts,
            elapsed,
        })
    }

    /// Poll until the anchor shows up; `None` once `timeout` has passed.
    pub fn wait_until_visible(
        &self,
        anchor: &Anchor,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Option<MatchResult>> {
        let poll = self.poll(anchor, timeout, interval, true)?;
        if poll.hit.is_none() {
            debug!(anchor = %anchor.name(), ?timeout, "Anchor never appeared");
        }
        Ok(poll.hit)
    }

    /// Poll until the anchor is gone; `false` once `timeout` has passed.
    pub fn wait_until_missing(&self, anchor: &Anchor, timeout: Duration, interval: Duration) -> Result<bool> {
        let poll = self.poll(anchor, timeout, interval, false)?;
        if poll.hit.is_some() {
            debug!(anchor = %anchor.name(), ?timeout, "Anchor still visible");
        }
        Ok(poll.hit.is_none())
    }

    /// [`wait_until_visible`](Self::wait_until_visible), failing with
    /// [`FlowError::AnchorNotFound`] on timeout.
    pub fn require_visible(&self, anchor: &Anchor, timeout: Duration, interval: Duration) -> Result<MatchResult> {
        let poll = self.poll(anchor, timeout, interval, true)?;
        poll.hit.ok_or_else(|| FlowError::AnchorNotFound {
            anchor: anchor.name().to_string(),
            attempts: poll.attempts,
            elapsed: poll.elapsed,
        })
    }

    /// [`wait_until_missing`](Self::wait_until_missing), failing with
    /// [`FlowError::AnchorStillVisible`] on timeout.
    pub fn require_missing(&self, anchor: &Anchor, timeout: Duration, interval: Duration) -> Result<()> {
        let poll = self.poll(anchor, timeout, interval, false)?;
        match poll.hit {
            None => Ok(()),
            Some(_) => Err(FlowError::AnchorStillVisible {
                anchor: anchor.name().to_string(),
                elapsed: poll.elapsed,
            }),
        }
    }

    /// Locate at `interval` until visibility equals `visible` or the
    /// deadline passes. At least one locate is always made.
    fn poll(&self, anchor: &Anchor, timeout: Duration, interval: Duration, visible: bool) -> Result<Poll> {
        let start = self.clock.now();
        let deadline = deadline_after(start, timeout);
        let mut attempts = 0;
        loop {
            self.check_cancelled()?;
            attempts += 1;
            let hit = self.locate(anchor, None)?;
            let now = self.clock.now();
            if hit.is_some() == visible || deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(Poll {
                    hit,
                    attempts,
                    elapsed: now.saturating_duration_since(start),
                });
            }
            self.clock.sleep(clip_to_deadline(interval, now, deadline));
        }
    }
}

struct Poll {
    /// Last locate result.
    hit: Option<MatchResult>,
    attempts: u32,
    elapsed: Duration,
}
