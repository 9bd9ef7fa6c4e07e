//! C9 — real-time monitor. Bridges the synchronous `notify` callback into
//! an async broadcast channel the coalescer subscribes to.

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sentinel_core::model::{path_is_under, ChangeKind, FileEvent};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Running counters for the real-time protection surface. Shared between
/// the monitor (which only ever increments `events_seen`) and the scan
/// controller / action executor, which increment the rest as they act on
/// what the monitor forwards.
#[derive(Default)]
pub struct MonitorStats {
    events_seen: AtomicU64,
    threats_blocked: AtomicU64,
    files_quarantined: AtomicU64,
    scan_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MonitorStatsSnapshot {
    pub events_seen: u64,
    pub threats_blocked: u64,
    pub files_quarantined: u64,
    pub scan_errors: u64,
    pub uptime_ms: u64,
}

impl MonitorStats {
    pub fn record_event(&self) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_threat_blocked(&self) {
        self.threats_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self) {
        self.files_quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_error(&self) {
        self.scan_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, uptime_ms: u64) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            threats_blocked: self.threats_blocked.load(Ordering::Relaxed),
            files_quarantined: self.files_quarantined.load(Ordering::Relaxed),
            scan_errors: self.scan_errors.load(Ordering::Relaxed),
            uptime_ms,
        }
    }
}

pub struct RealTimeMonitor {
    watcher: RecommendedWatcher,
    change_tx: broadcast::Sender<FileEvent>,
    started_at: Instant,
    running: Arc<AtomicBool>,
    exceptions: Arc<parking_lot::RwLock<Vec<PathBuf>>>,
    stats: Arc<MonitorStats>,
}

impl RealTimeMonitor {
    pub fn new() -> Result<(Self, broadcast::Receiver<FileEvent>)> {
        let (change_tx, change_rx) = broadcast::channel(2048);
        let tx = change_tx.clone();
        let started_at = Instant::now();
        let running = Arc::new(AtomicBool::new(false));
        let exceptions: Arc<parking_lot::RwLock<Vec<PathBuf>>> =
            Arc::new(parking_lot::RwLock::new(Vec::new()));
        let stats = Arc::new(MonitorStats::default());

        let (sync_tx, sync_rx) = mpsc::channel::<Result<Event, notify::Error>>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let tx_clone = tx.clone();
        let running_clone = running.clone();
        let exceptions_clone = exceptions.clone();
        let stats_clone = stats.clone();
        std::thread::Builder::new()
            .name("sentinel-monitor-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        if !running_clone.load(Ordering::Relaxed) {
                            continue;
                        }
                        let exceptions = exceptions_clone.read();
                        for change in classify_event(&event, started_at) {
                            if exceptions.iter().any(|ex| path_is_under(&change.path, ex)) {
                                continue;
                            }
                            stats_clone.record_event();
                            if tx_clone.send(change).is_err() {
                                debug!("all monitor receivers dropped, stopping bridge");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => error!(error = %e, "file watcher error"),
                    Err(_) => {
                        debug!("monitor channel closed");
                        return;
                    }
                }
            })?;

        Ok((
            Self {
                watcher,
                change_tx: tx,
                started_at,
                running,
                exceptions,
                stats,
            },
            change_rx,
        ))
    }

    pub fn set_exceptions(&self, exceptions: Vec<PathBuf>) {
        *self.exceptions.write() = exceptions;
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    pub fn stats_snapshot(&self) -> MonitorStatsSnapshot {
        self.stats.snapshot(self.uptime_ms())
    }

    pub fn watch_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if !path.exists() {
                warn!(path = %path.display(), "watch root does not exist, skipping");
                continue;
            }
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            self.watcher.watch(path, mode)?;
            info!(path = %path.display(), "watching path for real-time protection");
        }
        Ok(())
    }

    pub fn unwatch(&mut self, path: &PathBuf) -> Result<()> {
        self.watcher.unwatch(path)?;
        Ok(())
    }

    /// Begins forwarding events to subscribers. Idempotent: calling it
    /// again while already running is a no-op.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("real-time protection enabled");
        }
    }

    /// Stops forwarding events without tearing down the underlying watches;
    /// `start()` resumes forwarding without re-registering watch roots.
    /// Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("real-time protection disabled");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.change_tx.subscribe()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Renames surface as a `Created` event on the new path: from the
/// perspective of the scan pipeline a rename-into-place is indistinguishable
/// from a fresh write, and treating it as such means a renamed-in payload is
/// scanned exactly like one that was just written.
fn classify_event(event: &Event, started_at: Instant) -> Vec<FileEvent> {
    let timestamp_ms = started_at.elapsed().as_millis() as u64;
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                out.push(FileEvent {
                    path: path.clone(),
                    kind: ChangeKind::Created,
                    timestamp_ms,
                });
            }
        }
        EventKind::Modify(modify_kind) => {
            use notify::event::ModifyKind;
            match modify_kind {
                ModifyKind::Name(_) if event.paths.len() >= 2 => {
                    out.push(FileEvent {
                        path: event.paths[1].clone(),
                        kind: ChangeKind::Created,
                        timestamp_ms,
                    });
                }
                _ => {
                    for path in &event.paths {
                        out.push(FileEvent {
                            path: path.clone(),
                            kind: ChangeKind::Modified,
                            timestamp_ms,
                        });
                    }
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                out.push(FileEvent {
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                    timestamp_ms,
                });
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_surfaces_as_created() {
        let event = Event::new(EventKind::Modify(notify::event::ModifyKind::Name(
            notify::event::RenameMode::Both,
        )))
        .add_path(PathBuf::from("/tmp/old"))
        .add_path(PathBuf::from("/tmp/new"));
        let changes = classify_event(&event, Instant::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("/tmp/new"));
        assert_eq!(changes[0].kind, ChangeKind::Created);
    }

    #[test]
    fn stats_start_at_zero_and_accumulate() {
        let stats = MonitorStats::default();
        stats.record_event();
        stats.record_event();
        stats.record_threat_blocked();
        let snap = stats.snapshot(0);
        assert_eq!(snap.events_seen, 2);
        assert_eq!(snap.threats_blocked, 1);
        assert_eq!(snap.files_quarantined, 0);
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let (monitor, _rx) = RealTimeMonitor::new().unwrap();
        assert!(!monitor.is_running());
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
