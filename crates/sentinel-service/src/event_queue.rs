//! C7 — file-event queue. A bounded async FIFO sitting between the
//! coalescer (C8) and the scan worker pool (C13). Bounding it gives the
//! real-time monitor a natural backpressure signal instead of growing
//! memory without limit under a write storm.

use sentinel_core::model::FileEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub struct FileEventQueue {
    sender: mpsc::Sender<FileEvent>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<FileEvent>>>,
    capacity: usize,
    len: AtomicUsize,
}

impl FileEventQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<FileEvent> {
        self.sender.clone()
    }

    /// Takes the receiving half for the worker pool. May only be called
    /// once; subsequent calls return `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<FileEvent>> {
        self.receiver.lock().take()
    }

    pub async fn enqueue(&self, event: FileEvent) -> Result<(), mpsc::error::SendError<FileEvent>> {
        self.sender.send(event).await?;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking enqueue; drops and returns the event on a full queue
    /// rather than applying backpressure to the monitor's forwarding loop.
    pub fn try_enqueue(&self, event: FileEvent) -> Result<(), mpsc::error::TrySendError<FileEvent>> {
        self.sender.try_send(event)?;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking dequeue. Returns `None` immediately if the queue is
    /// empty or the sending half has been dropped, rather than awaiting the
    /// next event.
    pub fn try_dequeue(&self) -> Option<FileEvent> {
        let mut guard = self.receiver.lock();
        let receiver = guard.as_mut()?;
        match receiver.try_recv() {
            Ok(event) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Number of events currently queued. Best-effort: concurrent
    /// enqueue/dequeue can make this stale by the time a caller reads it.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::model::ChangeKind;
    use std::path::PathBuf;

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let queue = FileEventQueue::new(8);
        let mut receiver = queue.take_receiver().unwrap();
        for i in 0..3u64 {
            queue
                .enqueue(FileEvent {
                    path: PathBuf::from(format!("/tmp/{i}")),
                    kind: ChangeKind::Modified,
                    timestamp_ms: i,
                })
                .await
                .unwrap();
        }
        for i in 0..3u64 {
            let event = receiver.recv().await.unwrap();
            assert_eq!(event.timestamp_ms, i);
        }
    }

    #[test]
    fn receiver_can_only_be_taken_once() {
        let queue = FileEventQueue::new(4);
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }

    #[tokio::test]
    async fn try_dequeue_is_non_blocking_and_tracks_len() {
        let queue = FileEventQueue::new(4);
        assert!(queue.is_empty());
        assert!(queue.try_dequeue().is_none());

        queue
            .enqueue(FileEvent {
                path: PathBuf::from("/tmp/a"),
                kind: ChangeKind::Created,
                timestamp_ms: 0,
            })
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);

        let event = queue.try_dequeue().unwrap();
        assert_eq!(event.path, PathBuf::from("/tmp/a"));
        assert_eq!(queue.len(), 0);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn capacity_reports_configured_bound() {
        let queue = FileEventQueue::new(7);
        assert_eq!(queue.capacity(), 7);
    }
}
