// Async result recorder: bounded queue plus a fixed worker pool. Recording
// never silently drops an item; when the queue is full the caller waits,
// bounded by the stop signal.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub queue_size: usize,
    pub workers: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            workers: 4,
        }
    }
}

pub struct ResultRecorder<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    stop: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_size: usize,
}

impl<T: Send + 'static> ResultRecorder<T> {
    /// The handler runs in one of the worker tasks; it must be idempotent
    /// because in-flight items are lost if the process dies.
    pub fn new(cfg: RecorderConfig, handler: Arc<dyn Fn(T) + Send + Sync>) -> Self {
        let queue_size = cfg.queue_size.max(1);
        let workers = cfg.workers.max(1);

        let (tx, rx) = mpsc::channel::<T>(queue_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            handles.push(tokio::spawn(async move {
                loop {
                    // Receiving returns None once the sender is dropped and
                    // the queue is drained, so shutdown drains remaining
                    // items before workers exit.
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => handler(item),
                        None => return,
                    }
                }
            }));
        }

        Self {
            tx: Mutex::new(Some(tx)),
            stop: CancellationToken::new(),
            workers: Mutex::new(handles),
            queue_size,
        }
    }

    /// Queues an item. Fast path is non-blocking; a full queue degrades to a
    /// wait bounded by the stop signal. Returns false when stopped.
    pub async fn record(&self, item: T) -> bool {
        let tx = {
            let guard = self.tx.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return false,
            }
        };

        match tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(item)) => {
                tokio::select! {
                    sent = tx.send(item) => sent.is_ok(),
                    _ = self.stop.cancelled() => false,
                }
            }
        }
    }

    /// Items currently queued.
    pub async fn pending(&self) -> usize {
        match self.tx.lock().await.as_ref() {
            Some(tx) => self.queue_size - tx.capacity(),
            None => 0,
        }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.tx.lock().await.take();
        let handles = {
            let mut workers = self.workers.lock().await;
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_are_processed() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let recorder = ResultRecorder::new(
            RecorderConfig::default(),
            Arc::new(move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..50 {
            assert!(recorder.record(i).await);
        }
        recorder.stop().await;
        assert_eq!(processed.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let recorder = ResultRecorder::new(
            RecorderConfig {
                queue_size: 64,
                workers: 2,
            },
            Arc::new(move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
            }),
        );

        for i in 0..64 {
            recorder.record(i).await;
        }
        recorder.stop().await;
        // Every queued item was handled before stop returned.
        assert_eq!(processed.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn test_record_after_stop_returns_false() {
        let recorder: ResultRecorder<u32> =
            ResultRecorder::new(RecorderConfig::default(), Arc::new(|_| {}));
        recorder.stop().await;
        assert!(!recorder.record(1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_blocks_instead_of_dropping() {
        let release = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let processed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&processed);
        let gate = Arc::clone(&release);
        let recorder = Arc::new(ResultRecorder::new(
            RecorderConfig {
                queue_size: 2,
                workers: 1,
            },
            Arc::new(move |_: u32| {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        // Fill the queue beyond capacity while the worker is held at the
        // gate; the extra records must wait rather than drop.
        let r = Arc::clone(&recorder);
        let pusher = tokio::spawn(async move {
            for i in 0..6 {
                assert!(r.record(i).await);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        release.store(true, Ordering::SeqCst);
        pusher.await.unwrap();
        recorder.stop().await;
        assert_eq!(processed.load(Ordering::SeqCst), 6);
    }
}
