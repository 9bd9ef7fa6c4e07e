//! C6 orchestration + C13 scan controller. Ties the hasher (C1), enumerator
//! (C2), signature database (C3), detection engines (C4), cache (C5), and
//! aggregator (C6) into one entry point per file, then exposes that as a
//! cancellable, progress-reporting job over one or many roots for the IPC
//! layer to drive.

use crate::aggregator::ThreatAggregator;
use crate::cache::ScanCache;
use crate::engines::DetectionEngine;
use crate::enumerator::{estimate_count, FileEnumerator};
use crate::monitor::MonitorStats;
use anyhow::Result;
use parking_lot::RwLock;
use sentinel_core::hashing::{hash_file_async, HashKind};
use sentinel_core::ipc::EventEnvelope;
use sentinel_core::model::{AggregatedResult, EngineResult, ScanContext};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything needed to turn one `ScanContext` into one `AggregatedResult`.
/// Grouped separately from `ScanController` so unit tests can exercise
/// single-file scanning without a job/progress harness.
pub struct ScanEngineSet {
    pub cache: Arc<ScanCache>,
    pub engines: Vec<Box<dyn DetectionEngine>>,
    pub aggregator: ThreatAggregator,
}

impl ScanEngineSet {
    /// Hashes, checks the cache, runs every engine in turn, aggregates, and
    /// stores the result back in the cache. A per-engine failure is folded
    /// in as an `EngineResult::error` rather than aborting the scan: one
    /// broken engine must not blind the others.
    pub async fn scan_path(&self, path: &std::path::Path) -> Result<AggregatedResult> {
        let start = Instant::now();
        // A file that has vanished (or was never a regular file) between
        // enumeration and scan is not a scan error: the aggregator still
        // owes the caller a well-formed, empty-contribution `Allow` result
        // rather than propagating a failure that would poison a job's
        // error tally.
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                return Ok(self.aggregator.aggregate(
                    path.to_path_buf(),
                    Vec::new(),
                    start.elapsed(),
                ));
            }
        };

        let digest = hash_file_async(path, HashKind::Both).await?;
        let last_write = metadata.modified().ok().map(chrono::DateTime::<chrono::Utc>::from);
        let sha256 = digest.sha256.clone().unwrap_or_default();

        if let Some(cached) = self.cache.try_get(&sha256, digest.size, last_write) {
            return Ok(cached);
        }

        let mut ctx = ScanContext::new(path.to_path_buf());
        ctx.size = digest.size;
        ctx.sha256 = digest.sha256;
        ctx.md5 = digest.md5;
        ctx.last_write = last_write;
        if ctx.size <= SAMPLE_CONTENT_CEILING_BYTES {
            ctx.content = tokio::fs::read(path).await.ok();
        }

        let mut results = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            let result = match engine.analyze(&ctx).await {
                Ok(r) => r,
                Err(e) => EngineResult::error(engine.name(), e.to_string()),
            };
            results.push(result);
        }

        let aggregated = self.aggregator.aggregate(ctx.path.clone(), results, start.elapsed());
        self.cache.store(&sha256, ctx.size, ctx.last_write, aggregated.clone());
        Ok(aggregated)
    }
}

/// Engines are only asked to read file content up to this size; beyond it
/// only hash- and metadata-based signals are available, matching the
/// per-engine size ceilings already enforced individually (e.g. the script
/// engine's own 5 MiB gate).
const SAMPLE_CONTENT_CEILING_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanProgress {
    pub job_id: String,
    pub total_estimate: u64,
    pub scanned: u64,
    pub threats_found: u64,
    pub current_path: Option<PathBuf>,
    pub done: bool,
    pub cancelled: bool,
}

struct ScanJob {
    id: String,
    cancel: Arc<AtomicBool>,
    scanned: Arc<AtomicU64>,
    threats_found: Arc<AtomicU64>,
    total_estimate: Arc<AtomicU64>,
    current_path: Arc<RwLock<Option<PathBuf>>>,
    done: Arc<AtomicBool>,
    handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScanJob {
    fn progress(&self) -> ScanProgress {
        ScanProgress {
            job_id: self.id.clone(),
            total_estimate: self.total_estimate.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            threats_found: self.threats_found.load(Ordering::Relaxed),
            current_path: self.current_path.read().clone(),
            done: self.done.load(Ordering::Relaxed),
            cancelled: self.cancel.load(Ordering::Relaxed),
        }
    }
}

/// A single callback invoked once per scanned file, used to apply
/// enforcement policy (quarantine/block/ask) to whatever the aggregator
/// decided. Kept generic over a closure rather than a concrete
/// `ActionExecutor` reference so unit tests can scan without enforcing.
pub type ResultSink = Arc<dyn Fn(&ScanContext, &AggregatedResult) + Send + Sync>;

pub struct ScanController {
    engines: Arc<ScanEngineSet>,
    sink: ResultSink,
    events: broadcast::Sender<EventEnvelope>,
    stats: Arc<MonitorStats>,
    current: AsyncMutex<Option<Arc<ScanJob>>>,
}

/// How often `ScanProgress` is pushed to subscribers during a running job.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

impl ScanController {
    pub fn new(
        engines: Arc<ScanEngineSet>,
        sink: ResultSink,
        events: broadcast::Sender<EventEnvelope>,
        stats: Arc<MonitorStats>,
    ) -> Self {
        Self {
            engines,
            sink,
            events,
            stats,
            current: AsyncMutex::new(None),
        }
    }

    /// Scans exactly one file outside of the job/progress machinery; used
    /// by the real-time monitor path where there is no multi-file job to
    /// track.
    pub async fn scan_single(&self, path: &std::path::Path) -> Result<AggregatedResult> {
        let ctx = ScanContext::new(path.to_path_buf());
        let aggregated = self.engines.scan_path(path).await?;
        (self.sink)(&ctx, &aggregated);
        Ok(aggregated)
    }

    /// Starts a new job scanning `roots` (already expanded to `(path, mode)`
    /// pairs by the caller) with `worker_pool_size` files in flight at once.
    /// Only one job may run at a time; starting a new one while another is
    /// active replaces it after cancelling the old one.
    pub async fn start_scan(
        &self,
        roots: Vec<PathBuf>,
        exceptions: Vec<PathBuf>,
        max_file_size_bytes: u64,
        worker_pool_size: usize,
    ) -> String {
        let mut current = self.current.lock().await;
        if let Some(old) = current.take() {
            old.cancel.store(true, Ordering::SeqCst);
        }

        let job_id = Uuid::new_v4().to_string();
        let job = Arc::new(ScanJob {
            id: job_id.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            scanned: Arc::new(AtomicU64::new(0)),
            threats_found: Arc::new(AtomicU64::new(0)),
            total_estimate: Arc::new(AtomicU64::new(0)),
            current_path: Arc::new(RwLock::new(None)),
            done: Arc::new(AtomicBool::new(false)),
            handle: AsyncMutex::new(None),
        });

        let engines = self.engines.clone();
        let sink = self.sink.clone();
        let events = self.events.clone();
        let stats = self.stats.clone();
        let job_for_task = job.clone();

        let task = tokio::spawn(async move {
            let estimate_roots = roots.clone();
            let estimate = tokio::task::spawn_blocking(move || estimate_count(&estimate_roots))
                .await
                .unwrap_or(0);
            job_for_task.total_estimate.store(estimate, Ordering::Relaxed);

            let semaphore = Arc::new(Semaphore::new(worker_pool_size.max(1)));
            let enumerator = FileEnumerator::recursive(roots, exceptions, max_file_size_bytes);
            let mut last_progress_push = Instant::now();
            let mut tasks = Vec::new();

            for ctx in enumerator {
                if job_for_task.cancel.load(Ordering::Relaxed) {
                    break;
                }
                *job_for_task.current_path.write() = Some(ctx.path.clone());

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let engines = engines.clone();
                let sink = sink.clone();
                let scanned = job_for_task.scanned.clone();
                let threats_found = job_for_task.threats_found.clone();
                let stats = stats.clone();
                let path = ctx.path.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    match engines.scan_path(&path).await {
                        Ok(aggregated) => {
                            if aggregated.verdict != sentinel_core::model::Verdict::Allow {
                                threats_found.fetch_add(1, Ordering::Relaxed);
                            }
                            (sink)(&ctx, &aggregated);
                        }
                        Err(e) => {
                            stats.record_scan_error();
                            warn!(path = %path.display(), error = %e, "scan failed for file");
                        }
                    }
                    scanned.fetch_add(1, Ordering::Relaxed);
                }));

                if last_progress_push.elapsed() >= PROGRESS_INTERVAL {
                    let _ = events.send(EventEnvelope::new(
                        "ScanProgress",
                        serde_json::to_value(job_for_task.progress()).unwrap_or_default(),
                    ));
                    last_progress_push = Instant::now();
                }
            }

            for t in tasks {
                let _ = t.await;
            }

            job_for_task.done.store(true, Ordering::SeqCst);
            *job_for_task.current_path.write() = None;
            let _ = events.send(EventEnvelope::new(
                "ScanProgress",
                serde_json::to_value(job_for_task.progress()).unwrap_or_default(),
            ));
            info!(job_id = %job_for_task.id, "scan job finished");
        });

        *job.handle.lock().await = Some(task);
        *current = Some(job);
        job_id
    }

    pub async fn progress(&self) -> Option<ScanProgress> {
        self.current.lock().await.as_ref().map(|j| j.progress())
    }

    pub async fn cancel(&self) -> bool {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(job) => {
                job.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::engines::{heuristic::HeuristicEngine, signature::SignatureEngine};
    use crate::signatures::SignatureDatabase;
    use std::time::Duration as StdDuration;

    fn engine_set() -> Arc<ScanEngineSet> {
        let signatures = Arc::new(SignatureDatabase::with_builtin_eicar());
        Arc::new(ScanEngineSet {
            cache: Arc::new(ScanCache::new(StdDuration::from_secs(60), 1000)),
            engines: vec![
                Box::new(SignatureEngine::new(signatures)),
                Box::new(HeuristicEngine::new()),
            ],
            aggregator: ThreatAggregator::new(
                AggregatorConfig::default(),
                vec![("signature", 1.0), ("heuristic", 0.6)],
            ),
        })
    }

    #[tokio::test]
    async fn scan_path_detects_eicar_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eicar.txt");
        std::fs::write(&path, crate::signatures::EICAR_TEST_STRING).unwrap();

        let result = engine_set().scan_path(&path).await.unwrap();
        assert_eq!(result.verdict, sentinel_core::model::Verdict::Block);
    }

    #[tokio::test]
    async fn scan_path_clean_file_allows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.txt");
        std::fs::write(&path, b"just some normal text").unwrap();

        let result = engine_set().scan_path(&path).await.unwrap();
        assert_eq!(result.verdict, sentinel_core::model::Verdict::Allow);
    }

    #[tokio::test]
    async fn scan_path_of_vanished_file_allows_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        let result = engine_set().scan_path(&path).await.unwrap();
        assert_eq!(result.verdict, sentinel_core::model::Verdict::Allow);
        assert_eq!(result.risk_score, 0);
        assert!(result.engine_results.is_empty());
    }

    #[tokio::test]
    async fn repeated_scan_of_unchanged_file_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.txt");
        std::fs::write(&path, b"stable content").unwrap();
        let engines = engine_set();

        let first = engines.scan_path(&path).await.unwrap();
        assert_eq!(engines.cache.len(), 1);
        let second = engines.scan_path(&path).await.unwrap();
        assert_eq!(first.risk_score, second.risk_score);
    }

    #[tokio::test]
    async fn job_scans_directory_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"clean one").unwrap();
        std::fs::write(dir.path().join("b.txt"), crate::signatures::EICAR_TEST_STRING).unwrap();

        let (events_tx, _rx) = broadcast::channel(16);
        let found: Arc<AsyncMutex<Vec<sentinel_core::model::Verdict>>> =
            Arc::new(AsyncMutex::new(Vec::new()));
        let found_clone = found.clone();
        let sink: ResultSink = Arc::new(move |_ctx, result| {
            found_clone.blocking_lock().push(result.verdict);
        });

        let controller = ScanController::new(
            engine_set(),
            sink,
            events_tx,
            Arc::new(MonitorStats::default()),
        );
        let job_id = controller
            .start_scan(vec![dir.path().to_path_buf()], vec![], 1024 * 1024, 2)
            .await;

        let deadline = Instant::now() + StdDuration::from_secs(5);
        loop {
            let progress = controller.progress().await.unwrap();
            assert_eq!(progress.job_id, job_id);
            if progress.done {
                break;
            }
            if Instant::now() > deadline {
                panic!("scan job did not finish in time");
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        assert_eq!(found.lock().await.len(), 2);
    }
}
