//! A small fake web page: five templates on a noise background, a download
//! folder that fills up when the last download step is clicked, and a
//! configuration pointing at template files on disk.

use image::RgbaImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::fakes::{
    entry, noise, DesktopState, FakeDesktop, Rect, RecordingPostProcessor, RecordingProgress,
    ScriptedDir,
};
use crate::clock::{CancelToken, ManualClock};
use crate::config::{FlowConfig, WorkflowPlan};
use crate::orchestrator::StepOrchestrator;
use crate::platforms::Platform;

pub const CAPTURE_HOTKEY: &str = "ctrl+shift+s";
pub const TEMPLATE_SIZE: u32 = 16;
/// Final slice of the 4321 ms startup delay waited out in 300 ms polls.
pub const STARTUP_TAIL: Duration = Duration::from_millis(121);

const BASE_CONFIG: &str = r#"
matching:
  scales: [1.0]
  retry_interval_ms: 300
timing:
  startup_delay_ms: 4321
  tab_switch_delay_ms: 200
detail:
  primary: detail.png
  retry: 2
  timeout_ms: 5000
  wait_after_ms: 100
  initial_attempts: 1
  initial_wait_ms: 150
scrolling:
  amount: 300
  max_scrolls: 3
  wait_between_ms: 200
capture:
  trigger: ctrl+shift+s
  save_button: save.png
  pre_wait_ms: 100
  post_wait_timeout_ms: 2000
  post_wait_interval_ms: 250
  tab_poll_interval_ms: 250
  tab_close_wait_ms: 500
  tab_close_timeout_ms: 1000
download:
  steps:
    - name: export
      anchor: export.png
      retry: 2
      timeout_ms: 2000
      wait_for_next: true
    - name: confirm
      anchor: confirm.png
      retry: 2
      timeout_ms: 2000
  disappear_check:
    enabled: false
  watcher:
    poll_interval_ms: 100
    stable_checks: 2
    max_timeout_ms: 10000
post_process_retry:
  max_attempts: 2
  initial_delay_ms: 50
"#;

pub struct Template {
    pub image: RgbaImage,
    pub rect: Rect,
    pub file: PathBuf,
}

pub struct Scene {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub desktop: Arc<FakeDesktop>,
    pub downloads: Arc<ScriptedDir>,
    pub progress: Arc<RecordingProgress>,
    pub post: Arc<RecordingPostProcessor>,
    pub detail: Template,
    pub save: Template,
    pub export: Template,
    pub confirm: Template,
    pub tab: Template,
}

impl Scene {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let desktop = Arc::new(FakeDesktop::new(160, 120, clock.clone()));

        let template = |name: &str, seed: u32, at: (u32, u32)| {
            let image = noise(TEMPLATE_SIZE, TEMPLATE_SIZE, seed);
            let file = dir.path().join(format!("{name}.png"));
            image.save(&file).unwrap();
            Template {
                rect: Rect {
                    x: at.0,
                    y: at.1,
                    width: TEMPLATE_SIZE,
                    height: TEMPLATE_SIZE,
                },
                image,
                file,
            }
        };
        let detail = template("detail", 11, (20, 20));
        let save = template("save", 12, (60, 20));
        let export = template("export", 13, (100, 20));
        let confirm = template("confirm", 14, (20, 70));
        let tab = template("tab", 15, (60, 70));

        let confirm_rect = confirm.rect;
        let watched = desktop.clone();
        let downloads = Arc::new(ScriptedDir::from_fn(move |_| {
            (0..watched.clicks_in(confirm_rect))
                .map(|i| entry(&format!("report_{i}.xlsx"), 2048))
                .collect()
        }));

        Self {
            dir,
            clock,
            desktop,
            downloads,
            progress: Arc::new(RecordingProgress::default()),
            post: Arc::new(RecordingPostProcessor::default()),
            detail,
            save,
            export,
            confirm,
            tab,
        }
    }

    pub fn show(
        &self,
        template: &Template,
        visible: impl Fn(&DesktopState<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.desktop
            .show(&template.image, (template.rect.x, template.rect.y), visible);
    }

    /// Save button while a capture is pending, then each download step after
    /// the previous one was clicked.
    pub fn show_standard_flow(&self) {
        let save = self.save.rect;
        let export = self.export.rect;
        let confirm = self.confirm.rect;
        self.show(&self.save, move |s| s.hotkeys(CAPTURE_HOTKEY) > s.clicks_in(save));
        self.show(&self.export, move |s| s.clicks_in(save) > s.clicks_in(export));
        self.show(&self.confirm, move |s| s.clicks_in(export) > s.clicks_in(confirm));
    }

    /// `overrides` are `(KEY, value)` pairs with the `ANCHORFLOW_` prefix
    /// left off.
    pub fn config(&self, overrides: &[(&str, &str)]) -> FlowConfig {
        let env = overrides
            .iter()
            .map(|(k, v)| (format!("ANCHORFLOW_{k}"), v.to_string()));
        FlowConfig::from_yaml_str(BASE_CONFIG, self.dir.path(), env).unwrap()
    }

    pub fn platform(&self) -> Platform {
        Platform {
            screen: self.desktop.clone(),
            input: self.desktop.clone(),
            downloads: self.downloads.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn orchestrator(&self, config: &FlowConfig) -> StepOrchestrator {
        let plan = WorkflowPlan::from_config(config, &config.template_cache()).unwrap();
        StepOrchestrator::new(config, plan, self.platform(), CancelToken::new())
            .unwrap()
            .with_post_processor(self.post.clone())
            .with_progress(self.progress.clone())
    }
}
