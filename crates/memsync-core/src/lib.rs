pub mod archive;
pub mod bundle;
pub mod composite;
pub mod destination;
pub mod download;
pub mod error;
pub mod guard;
pub mod metadata;
pub mod record;
pub mod report;
pub mod sync;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bundle::BundleProcessor;
use crate::composite::video::VideoCompositor;
use crate::destination::{Destination, DriveStore, LocalDestination, RemoteDestination};
use crate::download::HttpFetcher;
use crate::report::RunReport;
use crate::sync::{CommitOutcome, SyncManager};

pub use crate::error::{DestinationError, FatalError, ItemError};
pub use crate::record::{MediaType, Record};
pub use crate::sync::ConflictPolicy;

fn default_timeout_secs() -> u64 {
    download::DEFAULT_TIMEOUT.as_secs()
}

fn default_folder_name() -> String {
    "Snapchat Memories".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationOptions {
    Local {
        dir: PathBuf,
    },
    Drive {
        /// Existing folder to upload into; a new one is created when absent
        #[serde(default)]
        folder_id: Option<String>,
        #[serde(default = "default_folder_name")]
        folder_name: String,
        #[serde(default, skip_serializing)]
        access_token: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    pub destination: DestinationOptions,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    /// Where to write the url -> outcomes report; none when unset
    #[serde(default)]
    pub report: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,
    /// Only process records of this media type
    #[serde(default)]
    pub media_type: Option<MediaType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub total_records: u64,
    /// Dropped by the media-type filter
    pub filtered_out: u64,
    /// Dropped up front by the `new` policy
    pub already_present: u64,
    pub files_written: u64,
    pub files_skipped: u64,
    /// Records that produced no output at all (no url, failed download, nothing usable)
    pub records_without_output: u64,
}

/// Type alias for progress callback
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Rate-limits per-record progress. The first tick and the final tick always go through.
pub struct ThrottledProgress<'a> {
    callback: &'a ProgressCallback,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(callback: &'a ProgressCallback) -> Self {
        Self::with_interval(callback, PROGRESS_INTERVAL)
    }

    pub fn with_interval(callback: &'a ProgressCallback, interval: Duration) -> Self {
        Self {
            callback,
            interval,
            last: Mutex::new(None),
        }
    }

    fn due(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let finished = current + 1 >= total;
        if finished || self.due() {
            (self.callback)(stage, current, total, message);
        }
    }
}

/// Open the configured destination and sync `records` into it.
pub fn run(options: &SyncOptions, records: Vec<Record>, progress: &ProgressCallback) -> anyhow::Result<RunResult> {
    let timeout = Duration::from_secs(options.download_timeout_secs);

    let destination: Box<dyn Destination> = match &options.destination {
        DestinationOptions::Local { dir } => Box::new(LocalDestination::new(dir)?),
        DestinationOptions::Drive {
            folder_id,
            folder_name,
            access_token,
        } => {
            if access_token.is_empty() {
                anyhow::bail!("a Drive access token is required for the drive destination");
            }
            let store = DriveStore::connect(access_token, folder_id.as_deref(), folder_name, timeout)?;
            Box::new(RemoteDestination::new(store))
        }
    };

    let sync = SyncManager::open(destination, options.conflict)?;
    let fetcher = HttpFetcher::new(timeout)?;
    let video = VideoCompositor::discover(options.ffmpeg.as_deref());
    if !video.is_available() {
        warn!("ffmpeg not found, a video with overlays will stop the run");
    }
    let mut processor = BundleProcessor::new(Box::new(fetcher), sync, video);

    run_with(&mut processor, records, options, progress)
}

/// Drive an already assembled processor over `records`, one at a time.
///
/// The report is written once, after the last record or after the first fatal error,
/// so a failed run still leaves a record of what was committed.
pub fn run_with(
    processor: &mut BundleProcessor,
    records: Vec<Record>,
    options: &SyncOptions,
    progress: &ProgressCallback,
) -> anyhow::Result<RunResult> {
    let tp = ThrottledProgress::new(progress);
    let mut result = RunResult {
        total_records: records.len() as u64,
        ..RunResult::default()
    };

    let records: Vec<Record> = match options.media_type {
        Some(wanted) => records.into_iter().filter(|r| r.media_type == wanted).collect(),
        None => records,
    };
    result.filtered_out = result.total_records - records.len() as u64;

    let (records, already_present) = processor.sync().retain_new(records);
    result.already_present = already_present as u64;
    if already_present > 0 {
        info!(count = already_present, "records already present at destination, not processed");
    }

    let mut report = RunReport::new();
    let mut failure = None;
    let total = records.len() as u64;

    for (i, record) in records.iter().enumerate() {
        tp.report("sync", i as u64, total, &record.prefix);
        match processor.process(record) {
            Ok(outcomes) => {
                if outcomes.is_empty() {
                    result.records_without_output += 1;
                }
                for outcome in &outcomes {
                    match outcome {
                        CommitOutcome::Committed { .. } => result.files_written += 1,
                        CommitOutcome::Skipped { .. } => result.files_skipped += 1,
                    }
                }
                if let Some(url) = record.download_url.as_deref() {
                    report.record(url, outcomes);
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if let Some(path) = &options.report {
        match report::write_report(&report, path) {
            Ok(()) => info!(path = %path.display(), urls = report.len(), "report written"),
            // Surface the fatal error, not the report failure
            Err(e) if failure.is_some() => warn!(path = %path.display(), error = %e, "failed writing report"),
            Err(e) => return Err(e),
        }
    }

    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::{local_processor, record, StaticFetcher};
    use crate::composite::still::tests::jpeg_bytes;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn options(dir: &std::path::Path, conflict: ConflictPolicy) -> SyncOptions {
        SyncOptions {
            destination: DestinationOptions::Local { dir: dir.to_path_buf() },
            conflict,
            report: Some(dir.join("report.json")),
            download_timeout_secs: 60,
            ffmpeg: None,
            media_type: None,
        }
    }

    fn read_report(dir: &std::path::Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(dir.join("report.json")).unwrap()).unwrap()
    }

    #[test]
    fn test_run_writes_report_and_counts() {
        let out = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::default()
            .with("https://x/a.jpg", jpeg_bytes(4, 4, [1, 1, 1]), None)
            .with("https://x/b.jpg", jpeg_bytes(4, 4, [2, 2, 2]), None);
        let mut processor = local_processor(out.path(), fetcher, ConflictPolicy::Skip);
        let records = vec![
            record("a", "https://x/a.jpg"),
            record("b", "https://x/b.jpg"),
            record("c", "https://x/missing"),
        ];

        let result = run_with(&mut processor, records, &options(out.path(), ConflictPolicy::Skip), &|_, _, _, _| {})
            .unwrap();
        assert_eq!(result.total_records, 3);
        assert_eq!(result.files_written, 2);
        assert_eq!(result.records_without_output, 1);

        let report = read_report(out.path());
        assert_eq!(report["https://x/a.jpg"][0]["name"], "a.jpg");
        assert_eq!(report["https://x/a.jpg"][0]["status"], "committed");
        assert_eq!(report["https://x/missing"], serde_json::json!([]));
    }

    #[test]
    fn test_new_policy_drops_records_without_report_entry() {
        let out = tempfile::tempdir().unwrap();
        fs::write(out.path().join("a_1.jpg"), b"existing").unwrap();
        let fetcher = StaticFetcher::default()
            .with("https://x/a.jpg", jpeg_bytes(4, 4, [1, 1, 1]), None)
            .with("https://x/b.jpg", jpeg_bytes(4, 4, [2, 2, 2]), None);
        let mut processor = local_processor(out.path(), fetcher, ConflictPolicy::New);

        let records = vec![record("a", "https://x/a.jpg"), record("b", "https://x/b.jpg")];
        let result =
            run_with(&mut processor, records, &options(out.path(), ConflictPolicy::New), &|_, _, _, _| {}).unwrap();

        assert_eq!(result.already_present, 1);
        assert_eq!(result.files_written, 1);
        let report = read_report(out.path());
        assert!(report.get("https://x/a.jpg").is_none());
        assert!(report.get("https://x/b.jpg").is_some());
        assert!(!out.path().join("a.jpg").exists());
    }

    #[test]
    fn test_media_type_filter() {
        let out = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::default().with("https://x/a.jpg", jpeg_bytes(4, 4, [1, 1, 1]), None);
        let mut processor = local_processor(out.path(), fetcher, ConflictPolicy::Skip);

        let mut video = record("v", "https://x/v.mp4");
        video.media_type = MediaType::Video;
        let mut opts = options(out.path(), ConflictPolicy::Skip);
        opts.media_type = Some(MediaType::Image);

        let result = run_with(&mut processor, vec![record("a", "https://x/a.jpg"), video], &opts, &|_, _, _, _| {})
            .unwrap();
        assert_eq!(result.filtered_out, 1);
        assert_eq!(result.files_written, 1);
        assert_eq!(result.records_without_output, 0);
    }

    #[test]
    fn test_fatal_error_still_writes_report() {
        let out = tempfile::tempdir().unwrap();
        let zip = crate::archive::tests::build_zip(&[
            ("abc-main.jpg", &jpeg_bytes(4, 4, [1, 1, 1])),
            ("abc-overlay.png", b"garbage"),
        ]);
        let fetcher = StaticFetcher::default()
            .with("https://x/a.jpg", jpeg_bytes(4, 4, [1, 1, 1]), None)
            .with("https://x/bundle.zip", zip, None);
        let mut processor = local_processor(out.path(), fetcher, ConflictPolicy::Skip);

        let records = vec![record("a", "https://x/a.jpg"), record("b", "https://x/bundle.zip")];
        let err = run_with(&mut processor, records, &options(out.path(), ConflictPolicy::Skip), &|_, _, _, _| {})
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<FatalError>(), Some(FatalError::OverlayComposite { .. })));

        let report = read_report(out.path());
        assert_eq!(report["https://x/a.jpg"][0]["status"], "committed");
        assert!(report.get("https://x/bundle.zip").is_none());
    }

    #[test]
    fn test_throttled_progress_always_emits_last() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let callback = move |_: &str, _: u64, _: u64, _: &str| {
            seen.fetch_add(1, Ordering::Relaxed);
        };
        let tp = ThrottledProgress::with_interval(&callback, Duration::from_secs(3600));
        for i in 0..100 {
            tp.report("sync", i, 100, "");
        }
        // First tick passes, the rest are held back until completion
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_throttled_progress_zero_interval_emits_everything() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let callback = move |_: &str, _: u64, _: u64, _: &str| {
            seen.fetch_add(1, Ordering::Relaxed);
        };
        let tp = ThrottledProgress::with_interval(&callback, Duration::ZERO);
        for i in 0..10 {
            tp.report("sync", i, 10, "");
        }
        assert_eq!(calls.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_options_from_json() {
        let opts: SyncOptions = serde_json::from_str(
            r#"{"destination":{"kind":"drive","access_token":"t"},"conflict":"overwrite"}"#,
        )
        .unwrap();
        assert_eq!(opts.conflict, ConflictPolicy::Overwrite);
        assert_eq!(opts.download_timeout_secs, 60);
        match opts.destination {
            DestinationOptions::Drive {
                folder_id, folder_name, ..
            } => {
                assert!(folder_id.is_none());
                assert_eq!(folder_name, "Snapchat Memories");
            }
            other => panic!("unexpected destination {:?}", other),
        }
    }
}
