use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Owned registry of live event-stream pumps, keyed by subscription name.
///
/// This is the idempotency boundary for everything stream-shaped: a second
/// `subscribe` under a live key is a no-op, `unsubscribe` can be called any
/// number of times, and `shutdown` force-closes whatever is still open.
/// Pumps release their own entry as they exit a terminal event; nothing here
/// expires on a timer.
pub struct SubscriptionSet {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn `pump` under `key`. Returns false (dropping the pump) if a live
    /// subscription already holds the key.
    pub async fn subscribe<F>(&self, key: &str, pump: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(key) {
            if !handle.is_finished() {
                tracing::debug!(key = %key, "subscription already live, ignoring");
                return false;
            }
        }
        tasks.insert(key.to_string(), tokio::spawn(pump));
        true
    }

    /// Abort and forget the subscription. Safe to call repeatedly and for
    /// keys that were never subscribed.
    pub async fn unsubscribe(&self, key: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(key) {
            handle.abort();
        }
    }

    /// Forget the entry without aborting. Called by a pump for its own key
    /// as it exits, so the terminal path never cancels itself mid-cleanup.
    pub async fn release(&self, key: &str) {
        self.tasks.lock().await.remove(key);
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Force-close every open subscription (process-wide teardown).
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (key, handle) in tasks.drain() {
            tracing::debug!(key = %key, "force-closing subscription");
            handle.abort();
        }
    }
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let subs = SubscriptionSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            subs.subscribe("k", async move {
                count.fetch_add(1, Ordering::SeqCst);
                // Stay alive so later subscribes see a live entry.
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(subs.contains("k").await);
        subs.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_repeat_safe() {
        let subs = SubscriptionSet::new();
        subs.subscribe("k", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;

        subs.unsubscribe("k").await;
        subs.unsubscribe("k").await;
        subs.unsubscribe("never-existed").await;
        assert!(!subs.contains("k").await);
    }

    #[tokio::test]
    async fn test_finished_key_can_be_resubscribed() {
        let subs = SubscriptionSet::new();
        subs.subscribe("k", async {}).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!subs.contains("k").await);

        let spawned = subs
            .subscribe("k", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(spawned);
        assert!(subs.contains("k").await);
        subs.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_drops_entry_without_abort() {
        let subs = Arc::new(SubscriptionSet::new());
        let done = Arc::new(AtomicUsize::new(0));

        let subs2 = subs.clone();
        let done2 = done.clone();
        subs.subscribe("k", async move {
            subs2.release("k").await;
            done2.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // The pump survived its own release and ran to completion.
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!subs.contains("k").await);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_all() {
        let subs = SubscriptionSet::new();
        for key in ["a", "b", "c"] {
            subs.subscribe(key, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        }
        subs.shutdown().await;
        for key in ["a", "b", "c"] {
            assert!(!subs.contains(key).await);
        }
    }
}
