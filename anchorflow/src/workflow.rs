//! Per-item workflow vocabulary: steps, stages, item context, outcomes and
//! the collaborator traits the orchestrator hands work to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::ItemFailure;

/// Coarse, user-visible phase of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Detail,
    Capture,
    Download,
    Organize,
    Email,
    Done,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 6] = [
        WorkflowStep::Detail,
        WorkflowStep::Capture,
        WorkflowStep::Download,
        WorkflowStep::Organize,
        WorkflowStep::Email,
        WorkflowStep::Done,
    ];

    pub fn percent(self) -> u8 {
        match self {
            WorkflowStep::Detail => 0,
            WorkflowStep::Capture => 20,
            WorkflowStep::Download => 40,
            WorkflowStep::Organize => 70,
            WorkflowStep::Email => 90,
            WorkflowStep::Done => 100,
        }
    }
}

/// State of the per-item state machine, including recovery sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detail,
    /// Scroll-assisted retry of the detail click; `cycle` starts at 1.
    Scrolling { cycle: u32 },
    Capture,
    /// Closing the capture tab and getting back to the item tab.
    TabCleanup { capture_confirmed: bool },
    Download,
    Organize,
    Email,
    Done,
}

impl Stage {
    pub fn step(self) -> WorkflowStep {
        match self {
            Stage::Detail | Stage::Scrolling { .. } => WorkflowStep::Detail,
            Stage::Capture | Stage::TabCleanup { .. } => WorkflowStep::Capture,
            Stage::Download => WorkflowStep::Download,
            Stage::Organize => WorkflowStep::Organize,
            Stage::Email => WorkflowStep::Email,
            Stage::Done => WorkflowStep::Done,
        }
    }
}

/// Metadata key under which the orchestrator records the verified download.
pub const DOWNLOAD_PATH_KEY: &str = "download_path";
const ITEM_ID_KEY: &str = "item_id";

/// One unit of work and whatever the caller knows about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContext {
    pub index: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ItemContext {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// `metadata.item_id` when present, else the 1-based position.
    pub fn item_id(&self) -> String {
        match self.metadata.get(ITEM_ID_KEY) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => (self.index + 1).to_string(),
        }
    }

    pub fn download_path(&self) -> Option<PathBuf> {
        self.metadata
            .get(DOWNLOAD_PATH_KEY)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    pub(crate) fn with_download(&self, path: &std::path::Path) -> Self {
        let mut context = self.clone();
        context
            .metadata
            .entry(ITEM_ID_KEY.to_string())
            .or_insert_with(|| Value::from(self.index + 1));
        context.metadata.insert(
            DOWNLOAD_PATH_KEY.to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        context
    }
}

/// What the organize step produced for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizedPayload {
    pub item_id: String,
    pub base_dir: PathBuf,
    #[serde(default)]
    pub assets: Vec<PathBuf>,
}

/// Downstream processing after a verified download.
pub trait PostProcessor: Send + Sync {
    fn organize(&self, item: &ItemContext) -> Result<OrganizedPayload, String>;

    fn email(&self, _item: &ItemContext, _payload: &OrganizedPayload) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage {
        item: usize,
        step: WorkflowStep,
        percent: u8,
    },
    ItemDone {
        item: usize,
    },
    Payload {
        item: usize,
        payload: OrganizedPayload,
    },
}

/// Receives progress from the orchestrator. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn on_stage(&self, item: usize, step: WorkflowStep, percent: u8);

    fn on_item_done(&self, _item: usize) {}

    fn on_payload(&self, _item: usize, _payload: &OrganizedPayload) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_stage(&self, _item: usize, _step: WorkflowStep, _percent: u8) {}
}

/// Forwards progress to a broadcast channel; events are dropped while
/// nobody is subscribed.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<ProgressEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    fn send(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            debug!("No progress subscribers");
        }
    }
}

impl ProgressSink for ChannelProgress {
    fn on_stage(&self, item: usize, step: WorkflowStep, percent: u8) {
        self.send(ProgressEvent::Stage { item, step, percent });
    }

    fn on_item_done(&self, item: usize) {
        self.send(ProgressEvent::ItemDone { item });
    }

    fn on_payload(&self, item: usize, payload: &OrganizedPayload) {
        self.send(ProgressEvent::Payload {
            item,
            payload: payload.clone(),
        });
    }
}

/// A finished item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub item: usize,
    pub item_id: String,
    pub elapsed: Duration,
    pub download: PathBuf,
    pub payload: OrganizedPayload,
}

/// Outcome of one run over a list of items.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the run stopped early on request.
    pub cancelled: bool,
    pub reports: Vec<ItemReport>,
    pub failures: Vec<ItemFailure>,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn percentages_follow_step_order() {
        let percents: Vec<u8> = WorkflowStep::ALL.iter().map(|s| s.percent()).collect();
        assert_eq!(percents, vec![0, 20, 40, 70, 90, 100]);
    }

    #[test]
    fn recovery_stages_report_their_parent_step() {
        assert_eq!(Stage::Scrolling { cycle: 2 }.step(), WorkflowStep::Detail);
        assert_eq!(
            Stage::TabCleanup {
                capture_confirmed: false
            }
            .step(),
            WorkflowStep::Capture
        );
    }

    #[test]
    fn item_id_defaults_to_one_based_index() {
        let item = ItemContext::new(4);
        assert_eq!(item.item_id(), "5");

        let json = json!({ "item_id": "SKU-9", "name": "lamp" });
        let Value::Object(map) = json else { unreachable!() };
        let item = ItemContext::new(0).with_metadata(map);
        assert_eq!(item.item_id(), "SKU-9");
    }

    #[test]
    fn download_is_recorded_in_metadata() {
        let item = ItemContext::new(1).with_download(std::path::Path::new("/tmp/report.xlsx"));
        assert_eq!(item.download_path(), Some(PathBuf::from("/tmp/report.xlsx")));
        assert_eq!(item.metadata.get("item_id"), Some(&json!(2)));
    }

    #[test]
    fn channel_progress_forwards_events() {
        let (sink, mut rx) = ChannelProgress::new(8);
        sink.on_stage(0, WorkflowStep::Capture, 20);
        sink.on_item_done(0);
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::Stage {
                item: 0,
                step: WorkflowStep::Capture,
                percent: 20
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::ItemDone { item: 0 });
    }

    #[test]
    fn stage_events_serialize_with_a_type_tag() {
        let event = ProgressEvent::Stage {
            item: 3,
            step: WorkflowStep::Organize,
            percent: 70,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "stage", "item": 3, "step": "organize", "percent": 70 })
        );
    }
}
