use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{RecordingPostProcessor, RecordingProgress};
use super::init_tracing;
use super::scene::{Scene, STARTUP_TAIL};
use crate::errors::ErrorKind;
use crate::runner::Runner;
use crate::workflow::{ChannelProgress, ItemContext, ProgressEvent, WorkflowStep};

fn items(count: usize) -> Vec<ItemContext> {
    (0..count).map(ItemContext::new).collect()
}

#[test]
fn test_run_processes_items_in_order() {
    init_tracing();
    let scene = Scene::new();
    scene.show(&scene.detail, |_| true);
    scene.show_standard_flow();
    let mut runner = Runner::new(scene.orchestrator(&scene.config(&[])));

    let summary = runner.run(&items(2));

    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert!(!summary.cancelled);
    let downloads: Vec<PathBuf> = summary.reports.iter().map(|r| r.download.clone()).collect();
    assert_eq!(
        downloads,
        vec![
            PathBuf::from("/downloads/report_0.xlsx"),
            PathBuf::from("/downloads/report_1.xlsx")
        ]
    );
    assert_eq!(scene.clock.sleeps().iter().filter(|d| **d == STARTUP_TAIL).count(), 1);
    assert_eq!(*scene.post.emailed.lock().unwrap(), vec!["1", "2"]);
}

#[test]
fn test_failed_item_does_not_stop_the_run() {
    init_tracing();
    let mut scene = Scene::new();
    scene.post = Arc::new(RecordingPostProcessor::failing(2));
    scene.show(&scene.detail, |_| true);
    scene.show_standard_flow();
    let mut runner = Runner::new(scene.orchestrator(&scene.config(&[])));

    let summary = runner.run(&items(2));

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed(), 2);
    let failure = &summary.failures[0];
    assert_eq!(failure.item, 0);
    assert_eq!(failure.stage, WorkflowStep::Organize);
    assert_eq!(failure.source.kind(), ErrorKind::PostProcessing);
    assert_eq!(summary.reports[0].item, 1);
    // One backoff between the two organize attempts of the first item.
    assert!(scene.clock.sleeps().contains(&Duration::from_millis(50)));
}

#[test]
fn test_cancel_before_start_processes_nothing() {
    init_tracing();
    let scene = Scene::new();
    scene.show(&scene.detail, |_| true);
    scene.show_standard_flow();
    let mut runner = Runner::new(scene.orchestrator(&scene.config(&[])));
    runner.cancel_token().cancel();

    let summary = runner.run(&items(3));

    assert!(summary.cancelled);
    assert_eq!(summary.processed(), 0);
    assert!(summary.failures.is_empty());
    assert_eq!(scene.desktop.captures(), 0);
}

#[test]
fn test_runner_is_reusable_after_a_cancelled_run() {
    init_tracing();
    let scene = Scene::new();
    scene.show(&scene.detail, |_| true);
    scene.show_standard_flow();
    let mut runner = Runner::new(scene.orchestrator(&scene.config(&[])));
    runner.cancel_token().cancel();

    let stopped = runner.run(&items(2));
    assert!(stopped.cancelled);
    assert_eq!(stopped.processed(), 0);
    assert!(!runner.cancel_token().is_cancelled());

    let summary = runner.run(&items(2));
    assert!(!summary.cancelled);
    assert_eq!(summary.succeeded, 2);
}

#[test]
fn test_native_runner_watches_configured_download_folder() {
    init_tracing();
    let scene = Scene::new();
    let config = scene.config(&[("PATHS__DOWNLOAD_FOLDER", "inbox")]);

    let runner = Runner::native(
        &config,
        Arc::new(RecordingPostProcessor::default()),
        Arc::new(RecordingProgress::default()),
    )
    .unwrap();

    assert_eq!(runner.orchestrator().download_dir(), scene.dir.path().join("inbox"));
}

#[tokio::test]
async fn test_spawned_run_streams_progress() -> anyhow::Result<()> {
    init_tracing();
    let scene = Scene::new();
    scene.show(&scene.detail, |_| true);
    scene.show_standard_flow();
    let (progress, mut events) = ChannelProgress::new(64);
    let orchestrator = scene
        .orchestrator(&scene.config(&[]))
        .with_progress(Arc::new(progress));

    let handle = Runner::new(orchestrator).spawn(items(1));
    let (_runner, summary) = handle.join().await?;
    assert_eq!(summary.succeeded, 1);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let steps: Vec<WorkflowStep> = received
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Stage { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(steps, WorkflowStep::ALL.to_vec());
    assert!(received
        .iter()
        .any(|e| matches!(e, ProgressEvent::Payload { item: 0, .. })));
    println!("✅ Received {} progress events", received.len());
    Ok(())
}
