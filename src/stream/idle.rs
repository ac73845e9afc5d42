// Shared idle watcher: one background task multiplexes the idleness checks
// of every active stream, so N streams never cost N watchdog tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// O(1) activity bump, safe to call concurrently with the tick.
pub type Touch = Arc<dyn Fn() + Send + Sync>;
/// Removes the registration. Idempotent.
pub type Done = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    /// Milliseconds since the watcher epoch of the last activity.
    last_activity: Arc<AtomicU64>,
    idle_timeout: Duration,
    /// Taken on fire, so the callback runs at most once.
    on_idle: Option<Box<dyn FnOnce() + Send>>,
}

struct WatcherInner {
    epoch: Instant,
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl WatcherInner {
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

pub struct IdleWatcher {
    inner: Arc<WatcherInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleWatcher {
    /// Starts the watcher with the given tick resolution. The resolution
    /// must be at most a quarter of the smallest idle timeout in use.
    pub fn new(resolution: Duration) -> Self {
        let inner = Arc::new(WatcherInner {
            epoch: Instant::now(),
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let tick_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_inner.shutdown.cancelled() => return,
                    _ = interval.tick() => tick(&tick_inner),
                }
            }
        });

        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The process-wide watcher with a 250ms tick.
    pub fn global() -> &'static IdleWatcher {
        static GLOBAL: OnceLock<IdleWatcher> = OnceLock::new();
        GLOBAL.get_or_init(|| IdleWatcher::new(Duration::from_millis(250)))
    }

    /// Registers a stream with last-activity = now. `on_idle` fires at most
    /// once, after `idle_timeout` passes without a touch.
    pub fn register(
        &self,
        idle_timeout: Duration,
        on_idle: Box<dyn FnOnce() + Send>,
    ) -> (Touch, Done) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let last_activity = Arc::new(AtomicU64::new(self.inner.elapsed_ms()));

        self.inner.entries.lock().unwrap().insert(
            id,
            Entry {
                last_activity: Arc::clone(&last_activity),
                idle_timeout,
                on_idle: Some(on_idle),
            },
        );

        let touch_inner = Arc::clone(&self.inner);
        let touch_stamp = Arc::clone(&last_activity);
        let touch: Touch = Arc::new(move || {
            touch_stamp.store(touch_inner.elapsed_ms(), Ordering::Relaxed);
        });

        let done_inner = Arc::clone(&self.inner);
        let done: Done = Arc::new(move || {
            done_inner.entries.lock().unwrap().remove(&id);
        });

        (touch, done)
    }

    pub fn active_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Stops the background task and clears all registrations.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.entries.lock().unwrap().clear();
    }
}

fn tick(inner: &WatcherInner) {
    let now = inner.elapsed_ms();
    let mut fired = Vec::new();
    {
        let mut entries = inner.entries.lock().unwrap();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| {
                let last = e.last_activity.load(Ordering::Relaxed);
                now.saturating_sub(last) > e.idle_timeout.as_millis() as u64
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut entry) = entries.remove(&id) {
                if let Some(on_idle) = entry.on_idle.take() {
                    fired.push(on_idle);
                }
            }
        }
    }
    // Callbacks run outside the entries lock.
    for on_idle in fired {
        on_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_idle_fires_once() {
        let watcher = IdleWatcher::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let (_touch, _done) = watcher.register(
            Duration::from_millis(40),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.active_count(), 0);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_touch_defers_idle() {
        let watcher = IdleWatcher::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let (touch, done) = watcher.register(
            Duration::from_millis(80),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            touch();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        done();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Removed before expiry: never fires.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_done_idempotent() {
        let watcher = IdleWatcher::new(Duration::from_millis(10));
        let (_touch, done) = watcher.register(Duration::from_secs(10), Box::new(|| {}));
        done();
        done();
        assert_eq!(watcher.active_count(), 0);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_single_task_many_registrations() {
        let watcher = IdleWatcher::new(Duration::from_millis(10));
        let mut handles = Vec::new();
        for _ in 0..100 {
            handles.push(watcher.register(Duration::from_secs(10), Box::new(|| {})));
        }
        assert_eq!(watcher.active_count(), 100);
        for (_, done) in &handles {
            done();
        }
        assert_eq!(watcher.active_count(), 0);
        watcher.shutdown();
    }
}
