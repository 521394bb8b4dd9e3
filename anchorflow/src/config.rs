//! YAML configuration with environment overrides, and the [`WorkflowPlan`]
//! of loaded anchors built from it.
//!
//! Every key can be overridden from the environment as
//! `ANCHORFLOW_<SECTION>__<KEY>=<yaml value>`, e.g.
//! `ANCHORFLOW_DETAIL__RETRY=5` or `ANCHORFLOW_DOWNLOAD__WATCHER__STABLE_CHECKS=2`.

use rdev::Key;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::anchor::{check_confidence, Anchor, Region, TemplateCache};
use crate::download::{normalize_extension, WatchConfig};
use crate::errors::{FlowError, Result};
use crate::locator::ClickOptions;
use crate::matcher::MatchingConfig;
use crate::platforms::Hotkey;
use crate::retry::RetrySettings;

pub const ENV_PREFIX: &str = "ANCHORFLOW_";
const ENV_SEPARATOR: &str = "__";

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// A template reference. Either a bare path or a mapping with overrides:
///
/// ```yaml
/// primary: templates/detail.png
/// alternative:
///   template: templates/detail_alt.png
///   confidence: 0.7
///   region: [0, 200, 1280, 600]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "AnchorSpecRepr")]
pub struct AnchorSpec {
    pub template: PathBuf,
    pub confidence: Option<f64>,
    pub region: Option<Region>,
    pub click_offset: Option<(i32, i32)>,
}

impl AnchorSpec {
    pub fn from_path(template: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            confidence: None,
            region: None,
            click_offset: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnchorSpecRepr {
    Path(PathBuf),
    Full(AnchorSpecFields),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AnchorSpecFields {
    template: PathBuf,
    confidence: Option<f64>,
    region: Option<Region>,
    click_offset: Option<(i32, i32)>,
}

impl From<AnchorSpecRepr> for AnchorSpec {
    fn from(repr: AnchorSpecRepr) -> Self {
        match repr {
            AnchorSpecRepr::Path(template) => AnchorSpec::from_path(template),
            AnchorSpecRepr::Full(fields) => AnchorSpec {
                template: fields.template,
                confidence: fields.confidence,
                region: fields.region,
                click_offset: fields.click_offset,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub download_folder: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_folder: PathBuf::from("downloads"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Slept once per run before the first item.
    pub startup_delay_ms: u64,
    /// Slept after closing or switching tabs at the end of an item.
    pub tab_switch_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 5_000,
            tab_switch_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NavigationConfig {
    pub close_tab: Hotkey,
    pub next_tab: Hotkey,
    pub prev_tab: Option<Hotkey>,
    /// Close the item tab when done instead of moving to the next one.
    pub close_after_process: bool,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            close_tab: Hotkey::preset("ctrl+w", &[Key::ControlLeft, Key::KeyW]),
            next_tab: Hotkey::preset("ctrl+tab", &[Key::ControlLeft, Key::Tab]),
            prev_tab: Some(Hotkey::preset(
                "ctrl+shift+tab",
                &[Key::ControlLeft, Key::ShiftLeft, Key::Tab],
            )),
            close_after_process: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetailConfig {
    pub primary: Option<AnchorSpec>,
    pub alternative: Option<AnchorSpec>,
    pub confidence: f64,
    /// Alternative anchor confidence as a fraction of `confidence`.
    pub alternative_confidence_factor: f64,
    pub search_region: Option<Region>,
    pub click_offset: (i32, i32),
    pub retry: u32,
    pub alternative_retry: u32,
    pub timeout_ms: u64,
    pub wait_after_ms: u64,
    /// Click attempts made once per run before the regular search.
    pub initial_attempts: u32,
    pub initial_wait_ms: Option<u64>,
    pub initial_timeout_ms: Option<u64>,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            primary: None,
            alternative: None,
            confidence: 0.8,
            alternative_confidence_factor: 0.95,
            search_region: None,
            click_offset: (0, 0),
            retry: 3,
            alternative_retry: 3,
            timeout_ms: 10_000,
            wait_after_ms: 1_000,
            initial_attempts: 2,
            initial_wait_ms: None,
            initial_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScrollConfig {
    /// Pixels per scroll-down. 0 disables scroll recovery.
    pub amount: u32,
    pub max_scrolls: u32,
    pub wait_between_ms: u64,
    pub smooth: bool,
    /// Scrolls performed once per run before stabilizing.
    pub initial_scrolls: u32,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            amount: 0,
            max_scrolls: 0,
            wait_between_ms: 500,
            smooth: false,
            initial_scrolls: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub trigger: Option<Hotkey>,
    pub save_button: Option<AnchorSpec>,
    pub confidence: f64,
    pub retry: u32,
    pub timeout_ms: u64,
    pub pre_wait_ms: u64,
    pub wait_after_ms: u64,
    pub post_wait_timeout_ms: u64,
    pub post_wait_interval_ms: u64,
    /// Defaults to 85% of `confidence`.
    pub post_wait_confidence: Option<f64>,
    pub progress: Option<AnchorSpec>,
    pub completion: Option<AnchorSpec>,
    /// Treat a still-visible save button as capture in progress.
    pub treat_save_as_progress: bool,
    pub auto_close_tab: bool,
    pub tab_poll_interval_ms: u64,
    /// Also the minimum spacing between prev-tab hotkeys.
    pub tab_close_wait_ms: Option<u64>,
    pub tab_close_timeout_ms: u64,
    pub save_tab: Option<AnchorSpec>,
    pub item_tab: Option<AnchorSpec>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trigger: None,
            save_button: None,
            confidence: 0.9,
            retry: 3,
            timeout_ms: 10_000,
            pre_wait_ms: 1_000,
            wait_after_ms: 0,
            post_wait_timeout_ms: 15_000,
            post_wait_interval_ms: 500,
            post_wait_confidence: None,
            progress: None,
            completion: None,
            treat_save_as_progress: true,
            auto_close_tab: true,
            tab_poll_interval_ms: 500,
            tab_close_wait_ms: None,
            tab_close_timeout_ms: 10_000,
            save_tab: None,
            item_tab: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreludeConfig {
    pub trigger: Option<Hotkey>,
    pub wait_after_trigger_ms: Option<u64>,
    /// Must become visible before the download steps start.
    pub detector: Option<AnchorSpec>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadStepConfig {
    pub name: String,
    pub anchor: AnchorSpec,
    #[serde(default)]
    pub retry: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_after_ms: Option<u64>,
    /// Wait (without failing) for the next step's anchor after clicking.
    #[serde(default)]
    pub wait_for_next: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisappearConfig {
    pub enabled: bool,
    /// Defaults to the first step's anchor.
    pub anchor: Option<AnchorSpec>,
    pub timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
}

impl Default for DisappearConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anchor: None,
            timeout_ms: None,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub confidence: f64,
    pub default_retry: u32,
    pub default_timeout_ms: u64,
    pub wait_between_ms: u64,
    pub prelude: Option<PreludeConfig>,
    pub steps: Vec<DownloadStepConfig>,
    pub disappear_check: DisappearConfig,
    pub extensions: Vec<String>,
    pub watcher: WatchConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            confidence: 0.85,
            default_retry: 5,
            default_timeout_ms: 30_000,
            wait_between_ms: 500,
            prelude: None,
            steps: Vec::new(),
            disappear_check: DisappearConfig::default(),
            extensions: vec!["xlsx".to_string(), "xls".to_string()],
            watcher: WatchConfig::default(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub paths: PathsConfig,
    pub matching: MatchingConfig,
    pub timing: TimingConfig,
    pub navigation: NavigationConfig,
    pub detail: DetailConfig,
    pub scrolling: ScrollConfig,
    pub capture: CaptureConfig,
    pub download: DownloadConfig,
    /// Retry policy for the organize and email collaborator calls.
    pub post_process_retry: RetrySettings,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            matching: MatchingConfig::default(),
            timing: TimingConfig::default(),
            navigation: NavigationConfig::default(),
            detail: DetailConfig::default(),
            scrolling: ScrollConfig::default(),
            capture: CaptureConfig::default(),
            download: DownloadConfig::default(),
            post_process_retry: RetrySettings {
                max_attempts: 2,
                initial_delay_ms: 500,
                ..RetrySettings::default()
            },
        }
    }
}

impl FlowConfig {
    /// Read `path`, apply `ANCHORFLOW_*` overrides from the process
    /// environment and validate. Relative paths resolve against the file's
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FlowError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let config = Self::from_yaml_str(&content, &base_dir, std::env::vars())?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(
        yaml: &str,
        base_dir: &Path,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut document = if yaml.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_yaml::from_str::<Value>(yaml)
                .map_err(|e| FlowError::Configuration(format!("invalid YAML: {e}")))?
        };
        if document.is_null() {
            document = Value::Object(Map::new());
        }

        let overrides = collect_env_overrides(env);
        if !overrides.is_empty() {
            deep_merge(&mut document, Value::Object(overrides));
        }

        let mut config: FlowConfig = serde_json::from_value(document)
            .map_err(|e| FlowError::Configuration(format!("invalid configuration: {e}")))?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };
        resolve(&mut self.paths.download_folder);
        for spec in self.anchor_specs_mut() {
            resolve(&mut spec.template);
        }
    }

    fn anchor_specs_mut(&mut self) -> Vec<&mut AnchorSpec> {
        let mut specs = Vec::new();
        specs.extend(self.detail.primary.as_mut());
        specs.extend(self.detail.alternative.as_mut());
        specs.extend(self.capture.save_button.as_mut());
        specs.extend(self.capture.progress.as_mut());
        specs.extend(self.capture.completion.as_mut());
        specs.extend(self.capture.save_tab.as_mut());
        specs.extend(self.capture.item_tab.as_mut());
        if let Some(prelude) = self.download.prelude.as_mut() {
            specs.extend(prelude.detector.as_mut());
        }
        specs.extend(self.download.steps.iter_mut().map(|step| &mut step.anchor));
        specs.extend(self.download.disappear_check.anchor.as_mut());
        specs
    }

    fn anchor_specs(&self) -> Vec<(String, &AnchorSpec)> {
        let optional = [
            ("detail.primary", self.detail.primary.as_ref()),
            ("detail.alternative", self.detail.alternative.as_ref()),
            ("capture.save_button", self.capture.save_button.as_ref()),
            ("capture.progress", self.capture.progress.as_ref()),
            ("capture.completion", self.capture.completion.as_ref()),
            ("capture.save_tab", self.capture.save_tab.as_ref()),
            ("capture.item_tab", self.capture.item_tab.as_ref()),
            (
                "download.prelude.detector",
                self.download.prelude.as_ref().and_then(|p| p.detector.as_ref()),
            ),
            (
                "download.disappear_check.anchor",
                self.download.disappear_check.anchor.as_ref(),
            ),
        ];
        let mut specs: Vec<(String, &AnchorSpec)> = optional
            .into_iter()
            .filter_map(|(name, spec)| spec.map(|spec| (name.to_string(), spec)))
            .collect();
        specs.extend(
            self.download
                .steps
                .iter()
                .map(|step| (format!("download.steps.{}", step.name), &step.anchor)),
        );
        specs
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        self.download.watcher.validate()?;

        if self.detail.primary.is_none() {
            return Err(missing("detail.primary"));
        }
        if self.capture.trigger.is_none() {
            return Err(missing("capture.trigger"));
        }
        if self.capture.save_button.is_none() {
            return Err(missing("capture.save_button"));
        }
        if self.download.steps.is_empty() {
            return Err(missing("download.steps"));
        }
        if self.download.steps.iter().any(|step| step.name.trim().is_empty()) {
            return Err(FlowError::Configuration(
                "download.steps entries need a name".to_string(),
            ));
        }
        if !self
            .download
            .extensions
            .iter()
            .any(|ext| normalize_extension(ext).is_some())
        {
            return Err(missing("download.extensions"));
        }

        check_confidence("detail", self.detail.confidence)?;
        check_confidence(
            "detail.alternative",
            self.detail.confidence * self.detail.alternative_confidence_factor,
        )?;
        check_confidence("capture", self.capture.confidence)?;
        if let Some(confidence) = self.capture.post_wait_confidence {
            check_confidence("capture.post_wait", confidence)?;
        }
        check_confidence("download", self.download.confidence)?;
        for (name, spec) in self.anchor_specs() {
            if let Some(confidence) = spec.confidence {
                check_confidence(&name, confidence)?;
            }
        }
        Ok(())
    }

    /// Template cache honoring `matching.cache_templates`.
    pub fn template_cache(&self) -> TemplateCache {
        TemplateCache::new(self.matching.cache_templates)
    }
}

fn missing(key: &str) -> FlowError {
    FlowError::Configuration(format!("{key} is required"))
}

fn collect_env_overrides(env: impl IntoIterator<Item = (String, String)>) -> Map<String, Value> {
    let mut collected = Map::new();
    for (key, raw) in env {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let keys: Vec<String> = path
            .split(ENV_SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(str::to_lowercase)
            .collect();
        if keys.is_empty() {
            continue;
        }
        let value = serde_yaml::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        debug!("Configuration override from {}", key);
        set_nested(&mut collected, &keys, value);
    }
    collected
}

fn set_nested(container: &mut Map<String, Value>, keys: &[String], value: Value) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };
    if rest.is_empty() {
        container.insert(first.clone(), value);
        return;
    }
    let child = container
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        set_nested(map, rest, value);
    }
}

fn deep_merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let nested = value.is_object() && base.get(&key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = base.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    base.insert(key, value);
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[derive(Debug, Clone)]
pub struct DetailPlan {
    /// Primary anchor, carrying the alternative (if any) as its alternate.
    pub anchor: Anchor,
    pub click: ClickOptions,
    pub alternate_retry: u32,
    pub initial_attempts: u32,
    pub initial_wait: Duration,
    pub initial_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPlan {
    pub amount: u32,
    pub max_scrolls: u32,
    pub wait_between: Duration,
    pub smooth: bool,
    pub initial_scrolls: u32,
}

#[derive(Debug, Clone)]
pub struct CapturePlan {
    pub trigger: Hotkey,
    pub save_button: Anchor,
    pub save_click: ClickOptions,
    pub pre_wait: Duration,
    pub wait_after: Duration,
    pub post_wait_timeout: Duration,
    pub post_wait_interval: Duration,
    /// The save button at the post-wait confidence, when it signals progress.
    pub save_watch: Option<Anchor>,
    pub progress: Option<Anchor>,
    pub completion: Option<Anchor>,
    pub auto_close_tab: bool,
    pub tab_poll_interval: Duration,
    pub tab_close_wait: Duration,
    pub tab_close_timeout: Duration,
    pub save_tab: Option<Anchor>,
    pub item_tab: Option<Anchor>,
}

#[derive(Debug, Clone)]
pub struct PreludePlan {
    pub trigger: Option<Hotkey>,
    pub wait_after_trigger: Duration,
    pub detector: Option<Anchor>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadStep {
    pub name: String,
    pub anchor: Anchor,
    pub click: ClickOptions,
    pub wait_for_next: bool,
}

#[derive(Debug, Clone)]
pub struct DisappearPlan {
    pub anchor: Anchor,
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub prelude: Option<PreludePlan>,
    pub steps: Vec<DownloadStep>,
    pub disappear: Option<DisappearPlan>,
    pub extensions: Vec<String>,
}

/// Everything the orchestrator needs for one run, with templates loaded.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub startup_delay: Duration,
    pub tab_switch_delay: Duration,
    pub navigation: NavigationConfig,
    pub detail: DetailPlan,
    pub scrolling: ScrollPlan,
    pub capture: CapturePlan,
    pub download: DownloadPlan,
}

struct AnchorLoader<'a> {
    cache: &'a TemplateCache,
}

impl AnchorLoader<'_> {
    fn load(
        &self,
        name: &str,
        spec: &AnchorSpec,
        confidence: f64,
        region: Option<Region>,
        click_offset: (i32, i32),
    ) -> Result<Anchor> {
        let template = self.cache.load(&spec.template)?;
        Ok(
            Anchor::new(name, &spec.template, template, spec.confidence.unwrap_or(confidence))?
                .with_region(spec.region.or(region))
                .with_click_offset(spec.click_offset.unwrap_or(click_offset)),
        )
    }

    fn load_opt(&self, name: &str, spec: Option<&AnchorSpec>, confidence: f64) -> Result<Option<Anchor>> {
        spec.map(|spec| self.load(name, spec, confidence, None, (0, 0)))
            .transpose()
    }
}

fn require<'a, T>(value: Option<&'a T>, key: &str) -> Result<&'a T> {
    value.ok_or_else(|| missing(key))
}

impl WorkflowPlan {
    /// Load every template the configuration references.
    pub fn from_config(config: &FlowConfig, cache: &TemplateCache) -> Result<Self> {
        config.validate()?;
        let loader = AnchorLoader { cache };

        let detail_cfg = &config.detail;
        let mut detail_anchor = loader.load(
            "detail.primary",
            require(detail_cfg.primary.as_ref(), "detail.primary")?,
            detail_cfg.confidence,
            detail_cfg.search_region,
            detail_cfg.click_offset,
        )?;
        if let Some(spec) = &detail_cfg.alternative {
            let alternate = loader.load(
                "detail.alternative",
                spec,
                detail_cfg.confidence * detail_cfg.alternative_confidence_factor,
                detail_cfg.search_region,
                detail_cfg.click_offset,
            )?;
            detail_anchor = detail_anchor.with_alternate(alternate);
        }
        let detail = DetailPlan {
            anchor: detail_anchor,
            click: ClickOptions {
                retry: detail_cfg.retry,
                wait_after: ms(detail_cfg.wait_after_ms),
                timeout: ms(detail_cfg.timeout_ms),
                click_offset: None,
            },
            alternate_retry: detail_cfg.alternative_retry,
            initial_attempts: detail_cfg.initial_attempts.max(1),
            initial_wait: ms(detail_cfg
                .initial_wait_ms
                .unwrap_or(config.scrolling.wait_between_ms)),
            initial_timeout: ms(detail_cfg.initial_timeout_ms.unwrap_or(detail_cfg.timeout_ms)),
        };

        let scrolling = ScrollPlan {
            amount: config.scrolling.amount,
            max_scrolls: config.scrolling.max_scrolls,
            wait_between: ms(config.scrolling.wait_between_ms),
            smooth: config.scrolling.smooth,
            initial_scrolls: config.scrolling.initial_scrolls,
        };

        let capture_cfg = &config.capture;
        let save_button = loader.load(
            "capture.save_button",
            require(capture_cfg.save_button.as_ref(), "capture.save_button")?,
            capture_cfg.confidence,
            None,
            (0, 0),
        )?;
        let post_wait_confidence = capture_cfg
            .post_wait_confidence
            .unwrap_or(capture_cfg.confidence * 0.85);
        let save_watch = if capture_cfg.treat_save_as_progress {
            Some(save_button.with_confidence(post_wait_confidence)?)
        } else {
            None
        };
        let tab_poll_interval = ms(capture_cfg.tab_poll_interval_ms);
        let capture = CapturePlan {
            trigger: require(capture_cfg.trigger.as_ref(), "capture.trigger")?.clone(),
            save_click: ClickOptions {
                retry: capture_cfg.retry,
                wait_after: Duration::ZERO,
                timeout: ms(capture_cfg.timeout_ms),
                click_offset: None,
            },
            save_button,
            pre_wait: ms(capture_cfg.pre_wait_ms),
            wait_after: ms(capture_cfg.wait_after_ms),
            post_wait_timeout: ms(capture_cfg.post_wait_timeout_ms),
            post_wait_interval: ms(capture_cfg.post_wait_interval_ms),
            save_watch,
            progress: loader.load_opt(
                "capture.progress",
                capture_cfg.progress.as_ref(),
                post_wait_confidence,
            )?,
            completion: loader.load_opt(
                "capture.completion",
                capture_cfg.completion.as_ref(),
                post_wait_confidence,
            )?,
            auto_close_tab: capture_cfg.auto_close_tab,
            tab_poll_interval,
            tab_close_wait: capture_cfg
                .tab_close_wait_ms
                .map(ms)
                .unwrap_or(tab_poll_interval),
            tab_close_timeout: ms(capture_cfg.tab_close_timeout_ms),
            save_tab: loader.load_opt(
                "capture.save_tab",
                capture_cfg.save_tab.as_ref(),
                capture_cfg.confidence * 0.9,
            )?,
            item_tab: loader.load_opt(
                "capture.item_tab",
                capture_cfg.item_tab.as_ref(),
                capture_cfg.confidence,
            )?,
        };

        let download_cfg = &config.download;
        let prelude = download_cfg
            .prelude
            .as_ref()
            .map(|prelude| -> Result<PreludePlan> {
                Ok(PreludePlan {
                    trigger: prelude.trigger.clone(),
                    wait_after_trigger: ms(prelude
                        .wait_after_trigger_ms
                        .unwrap_or(download_cfg.wait_between_ms)),
                    detector: loader.load_opt(
                        "download.prelude.detector",
                        prelude.detector.as_ref(),
                        download_cfg.confidence,
                    )?,
                    timeout: ms(prelude.timeout_ms.unwrap_or(download_cfg.default_timeout_ms)),
                })
            })
            .transpose()?;

        let steps = download_cfg
            .steps
            .iter()
            .map(|step| -> Result<DownloadStep> {
                Ok(DownloadStep {
                    name: step.name.clone(),
                    anchor: loader.load(
                        &format!("download.{}", step.name),
                        &step.anchor,
                        download_cfg.confidence,
                        None,
                        (0, 0),
                    )?,
                    click: ClickOptions {
                        retry: step.retry.unwrap_or(download_cfg.default_retry),
                        wait_after: ms(step.wait_after_ms.unwrap_or(download_cfg.wait_between_ms)),
                        timeout: ms(step.timeout_ms.unwrap_or(download_cfg.default_timeout_ms)),
                        click_offset: None,
                    },
                    wait_for_next: step.wait_for_next,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let disappear_cfg = &download_cfg.disappear_check;
        let disappear = if disappear_cfg.enabled {
            let anchor = match &disappear_cfg.anchor {
                Some(spec) => Some(loader.load(
                    "download.disappear_check",
                    spec,
                    download_cfg.confidence,
                    None,
                    (0, 0),
                )?),
                None => steps.first().map(|step| step.anchor.clone()),
            };
            anchor.map(|anchor| DisappearPlan {
                anchor,
                timeout: ms(disappear_cfg
                    .timeout_ms
                    .unwrap_or(download_cfg.default_timeout_ms)),
                interval: ms(disappear_cfg.poll_interval_ms),
            })
        } else {
            None
        };

        let extensions = download_cfg
            .extensions
            .iter()
            .filter_map(|ext| normalize_extension(ext))
            .collect();

        debug!(templates = cache.len(), "Workflow plan ready");
        Ok(WorkflowPlan {
            startup_delay: ms(config.timing.startup_delay_ms),
            tab_switch_delay: ms(config.timing.tab_switch_delay_ms),
            navigation: config.navigation.clone(),
            detail,
            scrolling,
            capture,
            download: DownloadPlan {
                prelude,
                steps,
                disappear,
                extensions,
            },
        })
    }
}
