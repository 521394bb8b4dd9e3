//! GUI automation driven by visual anchors
//!
//! Finds UI elements on screen by multi-scale template matching, clicks them
//! through synthesized input, and confirms the downloads they trigger by
//! watching the file system. A per-item state machine strings these actions
//! into a resumable workflow.

pub mod anchor;
pub mod clock;
pub mod config;
pub mod download;
pub mod errors;
pub mod locator;
pub mod matcher;
pub mod orchestrator;
pub mod platforms;
pub mod retry;
pub mod runner;
#[cfg(test)]
mod tests;
pub mod workflow;

pub use anchor::{Anchor, Region, TemplateCache};
pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use config::{FlowConfig, WorkflowPlan};
pub use download::{Baseline, DownloadDir, DownloadWatcher, FileEntry, FsDownloadDir, WatchConfig};
pub use errors::{ErrorKind, FlowError, ItemFailure, Result};
pub use locator::{AnchorLocator, ClickOptions, MatchResult};
pub use matcher::{MatchMethod, MatchingConfig};
pub use orchestrator::StepOrchestrator;
pub use platforms::{Capture, Hotkey, InputDevice, Platform, ScreenSource};
pub use retry::{Classified, RetryContext, RetryPolicy, RetrySettings};
pub use runner::{RunHandle, Runner};
pub use workflow::{
    ChannelProgress, ItemContext, ItemReport, NoopProgress, OrganizedPayload, PostProcessor,
    ProgressEvent, ProgressSink, RunSummary, Stage, WorkflowStep,
};
