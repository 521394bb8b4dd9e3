use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::CancelToken;
use crate::config::{FlowConfig, WorkflowPlan};
use crate::errors::{ErrorKind, FlowError, Result};
use crate::orchestrator::StepOrchestrator;
use crate::platforms::Platform;
use crate::workflow::{ItemContext, PostProcessor, ProgressSink, RunSummary};

/// Drives the orchestrator over a list of items, one at a time.
pub struct Runner {
    orchestrator: StepOrchestrator,
}

impl Runner {
    pub fn new(orchestrator: StepOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Load templates and wire an orchestrator for `platform`.
    pub fn from_config(
        config: &FlowConfig,
        platform: Platform,
        post_processor: Arc<dyn PostProcessor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let cache = config.template_cache();
        let plan = WorkflowPlan::from_config(config, &cache)?;
        let orchestrator = StepOrchestrator::new(config, plan, platform, CancelToken::new())?
            .with_post_processor(post_processor)
            .with_progress(progress);
        Ok(Self::new(orchestrator))
    }

    /// Wire against the primary monitor and real input, watching the
    /// configured `paths.download_folder`.
    pub fn native(
        config: &FlowConfig,
        post_processor: Arc<dyn PostProcessor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        Self::from_config(config, Platform::native(config), post_processor, progress)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.orchestrator.cancel_token().clone()
    }

    pub fn orchestrator(&self) -> &StepOrchestrator {
        &self.orchestrator
    }

    /// Process `items` in order. Failed items are counted and skipped; a
    /// stop request ends the run before the next item.
    ///
    /// A stop request applies to the run in progress, or to the next run when
    /// none is; it is cleared when that run returns, so the runner can be
    /// reused.
    #[instrument(skip(self, items), fields(run_id = %Uuid::new_v4(), total = items.len()))]
    pub fn run(&mut self, items: &[ItemContext]) -> RunSummary {
        let cancel = self.orchestrator.cancel_token().clone();
        self.orchestrator.reset_run();
        let mut summary = RunSummary {
            total: items.len(),
            ..RunSummary::default()
        };
        info!("🚀 Starting run over {} item(s)", items.len());

        for item in items {
            if cancel.is_cancelled() {
                warn!("Stop requested, {} item(s) left unprocessed", items.len() - summary.processed());
                summary.cancelled = true;
                break;
            }
            match self.orchestrator.run_item(item) {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.reports.push(report);
                }
                Err(failure) if failure.source.kind() == ErrorKind::Cancelled => {
                    warn!("Stopped during item {}", failure.item);
                    summary.cancelled = true;
                    break;
                }
                Err(failure) => {
                    error!("{}", failure);
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "🏁 Run finished"
        );
        cancel.reset();
        summary
    }

    /// Run on the blocking pool. The runner comes back with the summary so
    /// it can be reused.
    pub fn spawn(mut self, items: Vec<ItemContext>) -> RunHandle {
        let cancel = self.cancel_token();
        let handle = task::spawn_blocking(move || {
            let summary = self.run(&items);
            (self, summary)
        });
        RunHandle { cancel, handle }
    }
}

pub struct RunHandle {
    cancel: CancelToken,
    handle: JoinHandle<(Runner, RunSummary)>,
}

impl RunHandle {
    /// Ask the run to stop at the next stage or poll boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<(Runner, RunSummary)> {
        self.handle
            .await
            .map_err(|e| FlowError::Worker(format!("run task failed: {e}")))
    }
}
