//! C8 — event coalescer. Debounces bursts of raw file-system events into
//! one event per path per window, so a program that writes-then-renames
//! doesn't cause two full scans. Any path that has vanished by the time its
//! debounce window elapses is dropped rather than forwarded.
//!
//! Holds a `path -> (event, deadline)` map behind a short-held lock so
//! `add`, `pending_count`, and `clear` are all safe to call from outside the
//! flush task — `clear()` in particular is reached from `DisableRealTime`,
//! which must be able to drop whatever is mid-debounce without waiting for
//! the next tick.

use crate::event_queue::FileEventQueue;
use parking_lot::Mutex;
use sentinel_core::model::FileEvent;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

struct CoalescerState {
    pending: HashMap<PathBuf, FileEvent>,
    deadlines: HashMap<PathBuf, Instant>,
}

/// The debounce map itself, independent of the task that drains it. Exposed
/// so callers can observe `pending_count` and issue `clear()` without a
/// command channel round trip through the flush loop.
pub struct Coalescer {
    state: Mutex<CoalescerState>,
    window: Duration,
}

impl Coalescer {
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            state: Mutex::new(CoalescerState {
                pending: HashMap::new(),
                deadlines: HashMap::new(),
            }),
            window: coalesce_window,
        }
    }

    /// Updates or inserts the pending entry for `event.path`, restarting its
    /// debounce window. A later event for the same path replaces the
    /// earlier one rather than queuing both.
    pub fn add(&self, event: FileEvent) {
        let mut state = self.state.lock();
        let path = event.path.clone();
        state.deadlines.insert(path.clone(), Instant::now() + self.window);
        state.pending.insert(path, event);
    }

    /// Number of paths currently debouncing, awaiting their flush window.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drops every pending entry without forwarding any of them.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.deadlines.clear();
    }

    /// Removes and returns every entry whose deadline has elapsed as of `now`.
    fn take_ready(&self, now: Instant) -> Vec<FileEvent> {
        let mut state = self.state.lock();
        let ready_paths: Vec<PathBuf> = state
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        let mut ready = Vec::with_capacity(ready_paths.len());
        for path in ready_paths {
            state.deadlines.remove(&path);
            if let Some(event) = state.pending.remove(&path) {
                ready.push(event);
            }
        }
        ready
    }
}

/// Spawns the flush task and returns a handle to the shared debounce map
/// alongside the task's `JoinHandle`. The handle's `pending_count`/`clear`
/// stay valid for the task's whole lifetime since both hold the same `Arc`.
pub fn spawn_coalescer(
    mut raw_rx: broadcast::Receiver<FileEvent>,
    out_queue: Arc<FileEventQueue>,
    coalesce_window: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (Arc<Coalescer>, tokio::task::JoinHandle<()>) {
    let coalescer = Arc::new(Coalescer::new(coalesce_window));
    let task_coalescer = coalescer.clone();

    let handle = tokio::spawn(async move {
        let tick = coalesce_window.min(Duration::from_millis(50)).max(Duration::from_millis(5));

        loop {
            tokio::select! {
                result = raw_rx.recv() => {
                    match result {
                        Ok(event) => task_coalescer.add(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "coalescer lagged behind the monitor; periodic scan will catch up");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("monitor channel closed, coalescer exiting");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            for event in task_coalescer.take_ready(Instant::now()) {
                if !event.path.exists() {
                    debug!(path = %event.path.display(), "path vanished before flush, dropping event");
                    continue;
                }
                let path = event.path.clone();
                if let Err(e) = out_queue.try_enqueue(event) {
                    match e {
                        tokio::sync::mpsc::error::TrySendError::Full(_) => {
                            warn!(path = %path.display(), "file-event queue full, dropping event");
                        }
                        tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                            debug!("event queue closed, coalescer exiting");
                            return;
                        }
                    }
                }
            }
        }
    });

    (coalescer, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::model::ChangeKind;
    use std::fs;

    #[tokio::test]
    async fn coalesces_repeated_events_for_same_path_into_one() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let out_queue = Arc::new(FileEventQueue::new(16));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"x").unwrap();

        let (_coalescer, handle) =
            spawn_coalescer(raw_rx, out_queue.clone(), Duration::from_millis(20), shutdown_rx);

        for _ in 0..5 {
            raw_tx
                .send(FileEvent {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                    timestamp_ms: 0,
                })
                .unwrap();
        }

        let event = wait_for_dequeue(&out_queue, Duration::from_millis(500))
            .await
            .expect("expected one coalesced event");
        assert_eq!(event.path, path);

        assert!(
            wait_for_dequeue(&out_queue, Duration::from_millis(100))
                .await
                .is_none(),
            "expected only one coalesced event"
        );

        handle.abort();
    }

    #[tokio::test]
    async fn drops_event_for_path_deleted_before_flush() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let out_queue = Arc::new(FileEventQueue::new(16));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        fs::write(&path, b"x").unwrap();

        let (_coalescer, handle) =
            spawn_coalescer(raw_rx, out_queue.clone(), Duration::from_millis(20), shutdown_rx);
        raw_tx
            .send(FileEvent {
                path: path.clone(),
                kind: ChangeKind::Created,
                timestamp_ms: 0,
            })
            .unwrap();
        fs::remove_file(&path).unwrap();

        assert!(wait_for_dequeue(&out_queue, Duration::from_millis(200))
            .await
            .is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn pending_count_reflects_in_flight_debounce_entries() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let out_queue = Arc::new(FileEventQueue::new(16));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"y").unwrap();

        let (coalescer, handle) =
            spawn_coalescer(raw_rx, out_queue.clone(), Duration::from_millis(200), shutdown_rx);

        raw_tx
            .send(FileEvent { path: a.clone(), kind: ChangeKind::Created, timestamp_ms: 0 })
            .unwrap();
        raw_tx
            .send(FileEvent { path: b.clone(), kind: ChangeKind::Created, timestamp_ms: 0 })
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        while coalescer.pending_count() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coalescer.pending_count(), 2);

        assert!(wait_for_dequeue(&out_queue, Duration::from_millis(500)).await.is_some());
        assert!(wait_for_dequeue(&out_queue, Duration::from_millis(500)).await.is_some());
        assert_eq!(coalescer.pending_count(), 0);

        handle.abort();
    }

    #[tokio::test]
    async fn clear_drops_pending_entries_without_forwarding_them() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let out_queue = Arc::new(FileEventQueue::new(16));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleared.txt");
        fs::write(&path, b"x").unwrap();

        let (coalescer, handle) =
            spawn_coalescer(raw_rx, out_queue.clone(), Duration::from_millis(200), shutdown_rx);

        raw_tx
            .send(FileEvent { path: path.clone(), kind: ChangeKind::Created, timestamp_ms: 0 })
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        while coalescer.pending_count() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coalescer.pending_count(), 1);

        coalescer.clear();
        assert_eq!(coalescer.pending_count(), 0);

        assert!(wait_for_dequeue(&out_queue, Duration::from_millis(400)).await.is_none());
        handle.abort();
    }

    async fn wait_for_dequeue(queue: &FileEventQueue, timeout: Duration) -> Option<FileEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = queue.try_dequeue() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
