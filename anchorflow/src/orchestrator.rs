//! Per-item state machine: open the item detail, capture it, download its
//! report, hand the result to post-processing and move on to the next tab.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{clip_to_deadline, deadline_after, CancelToken, Clock};
use crate::config::{FlowConfig, WorkflowPlan};
use crate::download::DownloadWatcher;
use crate::errors::{ErrorKind, FlowError, ItemFailure, Result};
use crate::locator::{AnchorLocator, ClickOptions};
use crate::platforms::{InputDevice, Platform};
use crate::retry::RetryPolicy;
use crate::workflow::{
    ItemContext, ItemReport, NoopProgress, OrganizedPayload, PostProcessor, ProgressSink, Stage,
};

const SMOOTH_SCROLL_CHUNK: u32 = 100;
const SMOOTH_SCROLL_PAUSE: Duration = Duration::from_millis(50);
const MIN_WAIT_SLICE: Duration = Duration::from_millis(50);

/// What one item has produced so far.
struct ItemState {
    context: ItemContext,
    started: Instant,
    detail_attempts: u32,
    download: Option<PathBuf>,
    payload: Option<OrganizedPayload>,
}

pub struct StepOrchestrator {
    plan: Arc<WorkflowPlan>,
    locator: AnchorLocator,
    input: Arc<dyn InputDevice>,
    watcher: DownloadWatcher,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    post_processor: Option<Arc<dyn PostProcessor>>,
    progress: Arc<dyn ProgressSink>,
    post_retry: RetryPolicy<FlowError>,
    startup_done: bool,
    detail_stabilized: bool,
}

impl StepOrchestrator {
    pub fn new(
        config: &FlowConfig,
        plan: WorkflowPlan,
        platform: Platform,
        cancel: CancelToken,
    ) -> Result<Self> {
        let locator = AnchorLocator::new(
            &config.matching,
            platform.screen,
            platform.input.clone(),
            platform.clock.clone(),
            cancel.clone(),
        )?;
        let watcher = DownloadWatcher::new(
            &config.download.watcher,
            platform.downloads,
            platform.clock.clone(),
            cancel.clone(),
        )?;
        let post_retry = config
            .post_process_retry
            .policy([ErrorKind::PostProcessing], platform.clock.clone())?;
        Ok(Self {
            plan: Arc::new(plan),
            locator,
            input: platform.input,
            watcher,
            clock: platform.clock,
            cancel,
            post_processor: None,
            progress: Arc::new(NoopProgress),
            post_retry,
            startup_done: false,
            detail_stabilized: false,
        })
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn locator(&self) -> &AnchorLocator {
        &self.locator
    }

    /// Folder the download watcher observes.
    pub fn download_dir(&self) -> &Path {
        self.watcher.directory()
    }

    /// Forget the once-per-run startup delay and detail stabilization.
    pub fn reset_run(&mut self) {
        self.startup_done = false;
        self.detail_stabilized = false;
    }

    /// Drive one item from `Detail` to `Done`. Any stage failure aborts the
    /// item; nothing is retried at item level.
    #[instrument(level = "info", skip(self, item), fields(item = item.index, item_id = %item.item_id()))]
    pub fn run_item(&mut self, item: &ItemContext) -> Result<ItemReport, ItemFailure> {
        let mut state = ItemState {
            context: item.clone(),
            started: self.clock.now(),
            detail_attempts: 0,
            download: None,
            payload: None,
        };
        let mut stage = Stage::Detail;
        let mut reported = None;

        loop {
            let step = stage.step();
            if reported != Some(step) {
                self.progress.on_stage(item.index, step, step.percent());
                reported = Some(step);
            }

            let next = if self.cancel.is_cancelled() {
                Err(FlowError::Cancelled)
            } else {
                self.advance(stage, &mut state)
            };

            match next {
                Ok(Some(next)) => {
                    debug!(from = ?stage, to = ?next, "Stage transition");
                    stage = next;
                }
                Ok(None) => break,
                Err(source) => {
                    let elapsed = self.elapsed_since(state.started);
                    if source.kind() == ErrorKind::Cancelled {
                        warn!(stage = ?step, "Item cancelled");
                    } else {
                        error!(stage = ?step, elapsed_ms = elapsed.as_millis() as u64, "Item failed: {}", source);
                    }
                    return Err(ItemFailure {
                        item: item.index,
                        stage: step,
                        elapsed,
                        source,
                    });
                }
            }
        }

        let elapsed = self.elapsed_since(state.started);
        let (Some(download), Some(payload)) = (state.download, state.payload) else {
            return Err(ItemFailure {
                item: item.index,
                stage: stage.step(),
                elapsed,
                source: FlowError::PostProcessing("item finished without a payload".to_string()),
            });
        };
        info!(elapsed_ms = elapsed.as_millis() as u64, "Item complete");
        Ok(ItemReport {
            item: item.index,
            item_id: item.item_id(),
            elapsed,
            download,
            payload,
        })
    }

    fn advance(&mut self, stage: Stage, state: &mut ItemState) -> Result<Option<Stage>> {
        let next = match stage {
            Stage::Detail => self.detail(state)?,
            Stage::Scrolling { cycle } => self.scroll_cycle(cycle, state)?,
            Stage::Capture => self.capture()?,
            Stage::TabCleanup { capture_confirmed } => self.tab_cleanup(capture_confirmed)?,
            Stage::Download => {
                state.download = Some(self.download()?);
                Stage::Organize
            }
            Stage::Organize => {
                self.organize(state)?;
                Stage::Email
            }
            Stage::Email => {
                self.email(state)?;
                Stage::Done
            }
            Stage::Done => {
                self.finish(state.context.index)?;
                return Ok(None);
            }
        };
        Ok(Some(next))
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.clock.now().saturating_duration_since(start)
    }

    /// Sleep for `duration` in slices of one poll interval, returning
    /// [`FlowError::Cancelled`] at the first slice boundary after a stop
    /// request.
    fn wait(&self, duration: Duration) -> Result<()> {
        let slice = self.locator.retry_interval().max(MIN_WAIT_SLICE);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let step = remaining.min(slice);
            self.clock.sleep(step);
            remaining -= step;
        }
        Ok(())
    }

    fn detail(&mut self, state: &mut ItemState) -> Result<Stage> {
        let plan = self.plan.clone();

        if !self.startup_done {
            self.startup_done = true;
            if !plan.startup_delay.is_zero() {
                info!("Waiting {:?} before the first item", plan.startup_delay);
                self.wait(plan.startup_delay)?;
            }
        }

        if !self.detail_stabilized {
            self.detail_stabilized = true;
            let scrolling = &plan.scrolling;
            if scrolling.amount > 0 {
                for _ in 0..scrolling.initial_scrolls {
                    self.scroll_down(scrolling.amount)?;
                    self.wait(scrolling.wait_between)?;
                }
            }
            let attempts = plan.detail.initial_attempts;
            for attempt in 1..=attempts {
                if self.click_detail(Some(plan.detail.initial_timeout), state)? {
                    return Ok(Stage::Capture);
                }
                if attempt < attempts {
                    self.wait(plan.detail.initial_wait)?;
                }
            }
        }

        if self.click_detail(None, state)? {
            return Ok(Stage::Capture);
        }
        if plan.scrolling.amount == 0 || plan.scrolling.max_scrolls == 0 {
            return Err(self.detail_not_found(state));
        }
        Ok(Stage::Scrolling { cycle: 1 })
    }

    fn scroll_cycle(&self, cycle: u32, state: &mut ItemState) -> Result<Stage> {
        let scrolling = self.plan.scrolling;
        info!(cycle, max = scrolling.max_scrolls, "Scrolling to find the detail anchor");
        self.scroll_down(scrolling.amount)?;
        self.wait(scrolling.wait_between)?;

        if self.click_detail(None, state)? {
            return Ok(Stage::Capture);
        }
        if cycle >= scrolling.max_scrolls {
            return Err(self.detail_not_found(state));
        }
        Ok(Stage::Scrolling { cycle: cycle + 1 })
    }

    fn detail_not_found(&self, state: &ItemState) -> FlowError {
        FlowError::AnchorNotFound {
            anchor: self.plan.detail.anchor.name().to_string(),
            attempts: state.detail_attempts,
            elapsed: self.elapsed_since(state.started),
        }
    }

    /// One click attempt on the detail anchor, then its alternate.
    /// `Ok(false)` when neither was found.
    fn click_detail(&self, timeout: Option<Duration>, state: &mut ItemState) -> Result<bool> {
        let detail = &self.plan.detail;
        state.detail_attempts += 1;
        let options = ClickOptions {
            timeout: timeout.unwrap_or(detail.click.timeout),
            ..detail.click
        };

        match self.locator.find_and_click(&detail.anchor, &options) {
            Ok(_) => return Ok(true),
            Err(FlowError::AnchorNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let Some(alternate) = detail.anchor.alternate() else {
            return Ok(false);
        };
        warn!("Primary detail anchor missed, trying '{}'", alternate.name());
        let options = ClickOptions {
            retry: detail.alternate_retry,
            ..options
        };
        match self.locator.find_and_click(alternate, &options) {
            Ok(_) => Ok(true),
            Err(FlowError::AnchorNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Scroll down by `amount`, in ~100 px chunks when smoothing is on.
    fn scroll_down(&self, amount: u32) -> Result<()> {
        let amount = amount.max(1);
        if self.plan.scrolling.smooth && amount > SMOOTH_SCROLL_CHUNK {
            let increments = (amount / SMOOTH_SCROLL_CHUNK).max(2);
            let chunk = (amount / increments).max(1);
            for _ in 0..increments {
                self.input.scroll(-i64::from(chunk))?;
                self.clock.sleep(SMOOTH_SCROLL_PAUSE);
            }
            Ok(())
        } else {
            self.input.scroll(-i64::from(amount))
        }
    }

    fn capture(&self) -> Result<Stage> {
        let capture = &self.plan.capture;
        self.input.hotkey(&capture.trigger)?;
        self.wait(capture.pre_wait)?;
        self.locator.find_and_click(&capture.save_button, &capture.save_click)?;
        let capture_confirmed = self.wait_capture_finished()?;
        Ok(Stage::TabCleanup { capture_confirmed })
    }

    /// True once no progress indicator is visible and the completion anchor
    /// (if configured) is.
    fn wait_capture_finished(&self) -> Result<bool> {
        let capture = &self.plan.capture;
        let deadline = deadline_after(self.clock.now(), capture.post_wait_timeout);
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let mut in_progress = match &capture.progress {
                Some(progress) => self.locator.exists(progress)?,
                None => false,
            };
            if !in_progress {
                if let Some(save) = &capture.save_watch {
                    in_progress = self.locator.exists(save)?;
                }
            }
            if !in_progress {
                match &capture.completion {
                    Some(completion) => {
                        if self.locator.exists(completion)? {
                            return Ok(true);
                        }
                    }
                    None => return Ok(true),
                }
            }

            let now = self.clock.now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!("Capture progress could not be confirmed within {:?}", capture.post_wait_timeout);
                return Ok(false);
            }
            self.clock.sleep(clip_to_deadline(capture.post_wait_interval, now, deadline));
        }
    }

    fn tab_cleanup(&self, capture_confirmed: bool) -> Result<Stage> {
        let capture = &self.plan.capture;
        let navigation = &self.plan.navigation;

        if capture.auto_close_tab {
            self.input.hotkey(&navigation.close_tab)?;
            self.wait(capture.tab_close_wait)?;
        }

        if capture.save_tab.is_some() || capture.item_tab.is_some() {
            let start = self.clock.now();
            let deadline = deadline_after(start, capture.tab_close_timeout);
            let mut last_prev_tab: Option<Instant> = None;
            let mut back_on_item = false;

            while deadline.map_or(true, |deadline| self.clock.now() < deadline) {
                if self.cancel.is_cancelled() {
                    return Err(FlowError::Cancelled);
                }
                let save_tab_open = match &capture.save_tab {
                    Some(save_tab) => self.locator.exists(save_tab)?,
                    None => false,
                };
                if save_tab_open && capture.auto_close_tab {
                    debug!("Save tab still open, closing it");
                    self.input.hotkey(&navigation.close_tab)?;
                    self.wait(capture.tab_close_wait)?;
                    continue;
                }

                match &capture.item_tab {
                    Some(item_tab) => {
                        if self.locator.exists(item_tab)? {
                            back_on_item = true;
                            break;
                        }
                    }
                    None if !save_tab_open => {
                        back_on_item = true;
                        break;
                    }
                    None => {}
                }

                if !save_tab_open && capture.item_tab.is_some() {
                    if let Some(prev_tab) = &navigation.prev_tab {
                        let now = self.clock.now();
                        let due = last_prev_tab
                            .map_or(true, |sent| now.saturating_duration_since(sent) >= capture.tab_close_wait);
                        if due {
                            debug!("Item tab not in front, sending {}", prev_tab);
                            self.input.hotkey(prev_tab)?;
                            last_prev_tab = Some(now);
                        }
                    }
                }
                self.clock.sleep(capture.tab_poll_interval);
            }

            if !back_on_item {
                return Err(FlowError::CleanupFailed {
                    elapsed: self.elapsed_since(start),
                });
            }
        }

        if !capture_confirmed {
            warn!("Capture completion was not confirmed; check the capture templates");
        }
        self.wait(capture.wait_after)?;
        Ok(Stage::Download)
    }

    fn download(&self) -> Result<PathBuf> {
        let download = &self.plan.download;
        let baseline = self.watcher.baseline()?;
        let interval = self.locator.retry_interval();

        if let Some(prelude) = &download.prelude {
            if let Some(trigger) = &prelude.trigger {
                self.input.hotkey(trigger)?;
            }
            self.wait(prelude.wait_after_trigger)?;
            if let Some(detector) = &prelude.detector {
                self.locator.require_visible(detector, prelude.timeout, interval)?;
            }
        }

        let total = download.steps.len();
        for (index, step) in download.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            info!(step = %step.name, "Download step {}/{}", index + 1, total);
            self.locator.find_and_click(&step.anchor, &step.click)?;

            if step.wait_for_next {
                if let Some(next) = download.steps.get(index + 1) {
                    let visible = self
                        .locator
                        .wait_until_visible(&next.anchor, next.click.timeout, interval)?;
                    if visible.is_none() {
                        warn!("'{}' did not appear after '{}'", next.name, step.name);
                    }
                }
            }
        }

        if let Some(disappear) = &download.disappear {
            self.locator
                .require_missing(&disappear.anchor, disappear.timeout, disappear.interval)?;
        }

        self.watcher
            .wait_for_completion(&download.extensions, Some(&baseline))
    }

    fn post_processor(&self) -> Result<&Arc<dyn PostProcessor>> {
        self.post_processor
            .as_ref()
            .ok_or_else(|| FlowError::PostProcessing("no post-processor configured".to_string()))
    }

    fn organize(&self, state: &mut ItemState) -> Result<()> {
        let processor = self.post_processor()?;
        let download = state
            .download
            .as_deref()
            .ok_or_else(|| FlowError::PostProcessing("no verified download to organize".to_string()))?;
        let context = state.context.with_download(download);
        let payload = self
            .post_retry
            .run(|| processor.organize(&context).map_err(FlowError::PostProcessing))?;
        info!(item_id = %payload.item_id, "Post-download processing finished");
        self.progress.on_payload(context.index, &payload);
        state.context = context;
        state.payload = Some(payload);
        Ok(())
    }

    fn email(&self, state: &ItemState) -> Result<()> {
        let processor = self.post_processor()?;
        let Some(payload) = &state.payload else {
            return Err(FlowError::PostProcessing("nothing organized to email".to_string()));
        };
        self.post_retry
            .run(|| processor.email(&state.context, payload).map_err(FlowError::PostProcessing))
    }

    fn finish(&self, index: usize) -> Result<()> {
        self.progress.on_item_done(index);
        let navigation = &self.plan.navigation;
        let hotkey = if navigation.close_after_process {
            &navigation.close_tab
        } else {
            &navigation.next_tab
        };
        self.input.hotkey(hotkey)?;
        self.clock.sleep(self.plan.tab_switch_delay);
        Ok(())
    }
}
