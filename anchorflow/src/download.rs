//! Detects finished browser downloads from file-system evidence alone.
//!
//! A download is finished when no partial-download file remains, a file with
//! an allowed extension has kept the same size for `stable_checks` polls, and
//! that file can be opened for reading.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, warn};

use crate::clock::{clip_to_deadline, deadline_after, CancelToken, Clock};
use crate::errors::{FlowError, Result};
use crate::retry::{scale_duration, RetryPolicy, RetrySettings};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MIN_OPEN_BACKOFF: Duration = Duration::from_millis(50);
const OPEN_BACKOFF_GROWTH: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Extensions browsers use while a download is still being written.
    pub temporary_extensions: Vec<String>,
    /// Consecutive unchanged-size polls before a file counts as settled.
    pub stable_checks: u32,
    pub poll_interval_ms: u64,
    /// Growth of the poll interval after a cycle without progress.
    pub backoff_factor: f64,
    /// Defaults to four times the poll interval.
    pub max_interval_ms: Option<u64>,
    /// 0 disables the overall timeout.
    pub max_timeout_ms: u64,
    /// 0 means unlimited polls.
    pub max_attempts: u32,
    pub open_retry: u32,
    pub open_backoff_ms: u64,
    /// Retry policy for transient directory listing failures.
    pub snapshot_retry: RetrySettings,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            temporary_extensions: vec![".crdownload".into(), ".part".into(), ".tmp".into()],
            stable_checks: 3,
            poll_interval_ms: 500,
            backoff_factor: 1.5,
            max_interval_ms: None,
            max_timeout_ms: 60_000,
            max_attempts: 0,
            open_retry: 3,
            open_backoff_ms: 750,
            snapshot_retry: RetrySettings::default(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() {
            return Err(FlowError::Configuration(format!(
                "watcher.backoff_factor must be finite, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    fn max_interval(&self) -> Duration {
        let base = self.poll_interval();
        self.max_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(base * 4)
            .max(base)
    }

    fn timeout(&self) -> Option<Duration> {
        (self.max_timeout_ms > 0).then(|| Duration::from_millis(self.max_timeout_ms))
    }
}

/// One regular file in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Read-only view of the download directory.
pub trait DownloadDir: Send + Sync {
    fn path(&self) -> &Path;

    /// List the regular files currently in the directory.
    fn snapshot(&self) -> io::Result<Vec<FileEntry>>;

    /// Open `path` for shared reading and close it again.
    fn open_shared(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsDownloadDir {
    root: PathBuf,
}

impl FsDownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DownloadDir for FsDownloadDir {
    fn path(&self) -> &Path {
        &self.root
    }

    fn snapshot(&self) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            // Files renamed away between listing and stat are skipped.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
        Ok(entries)
    }

    fn open_shared(&self, path: &Path) -> io::Result<()> {
        File::open(path).map(drop)
    }
}

/// `"XLSX "` and `"xlsx"` both become `".xlsx"`; blank input is dropped.
pub fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().to_lowercase();
    if ext.is_empty() || ext == "." {
        return None;
    }
    Some(if ext.starts_with('.') { ext } else { format!(".{ext}") })
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

/// Directory contents captured before a download is triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub names: HashSet<String>,
    /// Wall-clock time of the snapshot. Known files modified at or after it
    /// count as candidates again.
    pub since: SystemTime,
}

impl Baseline {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Temporary,
    Final { size: u64, stable_polls: u32 },
}

pub struct DownloadWatcher {
    dir: Arc<dyn DownloadDir>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    temporary: HashSet<String>,
    stable_checks: u32,
    poll_interval: Duration,
    max_interval: Duration,
    backoff_factor: f64,
    timeout: Option<Duration>,
    max_attempts: u32,
    open_retry: u32,
    open_backoff: Duration,
    snapshot_retry: RetryPolicy<io::Error>,
}

impl DownloadWatcher {
    pub fn new(
        config: &WatchConfig,
        dir: Arc<dyn DownloadDir>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        let snapshot_retry = config.snapshot_retry.policy(
            [
                io::ErrorKind::Interrupted,
                io::ErrorKind::WouldBlock,
                io::ErrorKind::TimedOut,
                io::ErrorKind::PermissionDenied,
            ],
            clock.clone(),
        )?;
        Ok(Self {
            dir,
            clock,
            cancel,
            temporary: config
                .temporary_extensions
                .iter()
                .filter_map(|ext| normalize_extension(ext))
                .collect(),
            stable_checks: config.stable_checks.max(1),
            poll_interval: config.poll_interval(),
            max_interval: config.max_interval(),
            backoff_factor: config.backoff_factor.max(1.0),
            timeout: config.timeout(),
            max_attempts: config.max_attempts,
            open_retry: config.open_retry.max(1),
            open_backoff: Duration::from_millis(config.open_backoff_ms).max(MIN_OPEN_BACKOFF),
            snapshot_retry,
        })
    }

    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    fn snapshot(&self) -> Result<Vec<FileEntry>> {
        Ok(self.snapshot_retry.run(|| self.dir.snapshot())?)
    }

    /// Snapshot the directory before triggering a download.
    pub fn baseline(&self) -> Result<Baseline> {
        let since = self.clock.system_time();
        let names = self.snapshot()?.into_iter().map(|entry| entry.name).collect();
        Ok(Baseline { names, since })
    }

    fn classify(&self, name: &str, allowed: &HashSet<String>) -> Option<Tracked> {
        let ext = extension_of(name)?;
        if self.temporary.contains(&ext) {
            Some(Tracked::Temporary)
        } else if allowed.contains(&ext) {
            Some(Tracked::Final {
                size: 0,
                stable_polls: 0,
            })
        } else {
            None
        }
    }

    /// Block until a new file with one of `allowed_extensions` has settled.
    ///
    /// Files named in `baseline` are ignored unless modified at or after the
    /// baseline was taken. Without a baseline one is taken when the call
    /// starts.
    #[instrument(level = "info", skip(self, baseline), fields(dir = %self.dir.path().display()))]
    pub fn wait_for_completion(
        &self,
        allowed_extensions: &[String],
        baseline: Option<&Baseline>,
    ) -> Result<PathBuf> {
        let allowed: HashSet<String> = allowed_extensions
            .iter()
            .filter_map(|ext| normalize_extension(ext))
            .collect();
        if allowed.is_empty() {
            return Err(FlowError::Configuration(
                "at least one download extension is required".to_string(),
            ));
        }

        let start = self.clock.now();
        let deadline = self.timeout.and_then(|timeout| deadline_after(start, timeout));
        let Baseline {
            names: mut known,
            since,
        } = match baseline {
            Some(baseline) => baseline.clone(),
            None => self.baseline()?,
        };
        let mut tracked: HashMap<String, Tracked> = HashMap::new();
        let mut polls = 0u32;
        let mut interval = self.poll_interval;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let now = self.clock.now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let elapsed = now.saturating_duration_since(start);
                warn!(?elapsed, pending = tracked.len(), "Download verification timed out");
                return Err(FlowError::DownloadTimeout { elapsed });
            }
            if self.max_attempts > 0 && polls >= self.max_attempts {
                warn!(polls, "Download verification gave up after the poll limit");
                return Err(FlowError::DownloadStalled { attempts: polls });
            }
            polls += 1;

            let current: HashMap<String, FileEntry> = self
                .snapshot()?
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect();
            let mut progress = false;

            tracked.retain(|name, _| {
                let present = current.contains_key(name);
                if !present {
                    debug!("{} vanished before settling", name);
                }
                present
            });

            for (name, entry) in &current {
                if tracked.contains_key(name) {
                    continue;
                }
                let is_new = known.insert(name.clone());
                let touched = entry.modified.is_some_and(|modified| modified >= since);
                if !is_new && !touched {
                    continue;
                }
                progress |= is_new;
                if let Some(mut kind) = self.classify(name, &allowed) {
                    if let Tracked::Final { size, .. } = &mut kind {
                        *size = entry.size;
                    }
                    debug!(file = %name, ?kind, "Tracking download candidate");
                    tracked.insert(name.clone(), kind);
                    progress = true;
                }
            }

            let temporary_active = tracked.values().any(|kind| *kind == Tracked::Temporary);
            if temporary_active {
                debug!("Partial download present, waiting for it to finish");
                for kind in tracked.values_mut() {
                    if let Tracked::Final { stable_polls, .. } = kind {
                        *stable_polls = 0;
                    }
                }
            } else {
                let mut names: Vec<String> = tracked.keys().cloned().collect();
                names.sort();
                let mut settled = None;
                for name in &names {
                    let (Some(Tracked::Final { size, stable_polls }), Some(entry)) =
                        (tracked.get_mut(name), current.get(name))
                    else {
                        continue;
                    };
                    if entry.size == *size {
                        *stable_polls += 1;
                    } else {
                        debug!(file = %name, size = entry.size, "Download size changed");
                        *size = entry.size;
                        *stable_polls = 1;
                        progress = true;
                    }
                    if *stable_polls >= self.stable_checks {
                        settled = Some(entry.path.clone());
                        break;
                    }
                }

                if let Some(path) = settled {
                    return match self.wait_openable(&path, deadline) {
                        Ok(()) => {
                            info!(
                                "Download complete: {} after {:?}",
                                path.display(),
                                self.clock.now().saturating_duration_since(start)
                            );
                            Ok(path)
                        }
                        Err(attempts) => {
                            warn!("Could not open {} after {} attempt(s)", path.display(), attempts);
                            Err(FlowError::FileUnopenable { path, attempts })
                        }
                    };
                }
            }

            if progress {
                interval = self.poll_interval;
            }
            self.clock.sleep(clip_to_deadline(interval, self.clock.now(), deadline));
            interval = scale_duration(interval, self.backoff_factor).min(self.max_interval);
        }
    }

    /// Err carries the number of open attempts made.
    fn wait_openable(&self, path: &Path, deadline: Option<Instant>) -> std::result::Result<(), u32> {
        let mut wait = self.open_backoff;
        let mut attempts = 0;
        while attempts < self.open_retry {
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                break;
            }
            attempts += 1;
            match self.dir.open_shared(path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Waiting to open {} ({}/{}): {}", path.display(), attempts, self.open_retry, e);
                    if attempts >= self.open_retry {
                        break;
                    }
                    self.clock.sleep(clip_to_deadline(wait, self.clock.now(), deadline));
                    wait = scale_duration(wait, OPEN_BACKOFF_GROWTH);
                }
            }
        }
        Err(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn normalizes_extensions() {
        assert_eq!(normalize_extension(" XLSX "), Some(".xlsx".to_string()));
        assert_eq!(normalize_extension(".Csv"), Some(".csv".to_string()));
        assert_eq!(normalize_extension("   "), None);
        assert_eq!(normalize_extension("."), None);
    }

    #[test]
    fn extension_is_the_last_suffix() {
        assert_eq!(extension_of("report.xlsx.crdownload").as_deref(), Some(".crdownload"));
        assert_eq!(extension_of("REPORT.XLSX").as_deref(), Some(".xlsx"));
        assert_eq!(extension_of("README"), None);
    }

    #[test]
    fn derived_intervals_respect_minimums() {
        let config = WatchConfig {
            poll_interval_ms: 10,
            max_interval_ms: Some(20),
            ..WatchConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.max_interval(), Duration::from_millis(50));
        assert_eq!(WatchConfig::default().max_interval(), Duration::from_secs(2));
        assert_eq!(
            WatchConfig {
                max_timeout_ms: 0,
                ..WatchConfig::default()
            }
            .timeout(),
            None
        );
    }

    #[test]
    fn fs_snapshot_lists_only_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let mut file = File::create(dir.path().join("a.xlsx")).unwrap();
        file.write_all(b"abcd").unwrap();
        drop(file);

        let listing = FsDownloadDir::new(dir.path()).snapshot().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.xlsx");
        assert_eq!(listing[0].size, 4);
        assert!(listing[0].modified.is_some());
    }
}
