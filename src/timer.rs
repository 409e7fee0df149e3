//! Keyed, cancellable background tasks.
//!
//! Every delayed action in the crate (promotion grace, bot fallback, bot
//! think time, match monitors) runs as a task registered under a key,
//! normally the session id. Cancelling a key signals the task's
//! [`CancelToken`]; spawning over an existing key cancels the previous task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

/// Cancellation signal handed to a task.
///
/// A token whose owning entry has been dropped counts as cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A fresh token paired with its trigger.
    pub fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    cancel: watch::Sender<bool>,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of running tasks for one component.
#[derive(Debug)]
pub struct TaskSet {
    name: &'static str,
    entries: Entries,
    generation: AtomicU64,
}

impl TaskSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Spawn `task` under `key`, replacing any task already registered there.
    /// The entry is removed when the task returns.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, task: F)
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, token) = CancelToken::pair();

        let previous = lock(&self.entries).insert(key.clone(), Entry { generation, cancel });
        if let Some(previous) = previous {
            log::debug!("[{}] replacing task {}", self.name, key);
            previous.cancel.send_replace(true);
        }

        let entries = Arc::clone(&self.entries);
        let fut = task(token);
        tokio::spawn(async move {
            fut.await;
            let mut entries = lock(&entries);
            if entries.get(&key).is_some_and(|e| e.generation == generation) {
                entries.remove(&key);
            }
        });
    }

    /// Run `body` after `delay` unless `key` is cancelled first. Only the
    /// wait is cancellable; once started, `body` runs to completion and is
    /// expected to re-validate whatever it acts on.
    pub fn schedule<Fut>(&self, key: impl Into<String>, delay: Duration, body: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let name = self.name;
        let label = key.clone();
        self.spawn(key, move |mut token| async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("[{}] timer {} cancelled", name, label);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            body.await;
        });
    }

    /// Cancel the task under `key`. Returns whether one was registered.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.entries).remove(key) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Entry> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.cancel.send_replace(true);
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let tasks = TaskSet::new("test");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tasks.schedule("room-1", Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(tasks.contains("room-1"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let tasks = TaskSet::new("test");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tasks.schedule("room-1", Duration::from_secs(120), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tasks.cancel("room-1"));
        assert!(!tasks.cancel("room-1"));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_respawn_replaces_previous() {
        let tasks = TaskSet::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            tasks.schedule("room-1", Duration::from_secs(1), async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_signals_tokens() {
        let tasks = TaskSet::new("test");
        let stopped = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let stopped = stopped.clone();
            tasks.spawn(key, move |mut token| async move {
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::task::yield_now().await;
        tasks.cancel_all();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_sender_counts_as_cancelled() {
        let (tx, token) = CancelToken::pair();
        assert!(!token.is_cancelled());
        drop(tx);
        assert!(token.is_cancelled());
    }
}
