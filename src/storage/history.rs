//! Bounded in-memory snapshot history
//!
//! `SnapshotHistory` keeps one queue of snapshots per key, ordered by
//! `reported_at` with ties kept in insertion order. The agent uses it for
//! its own readings, the in-memory hub backend for per-target history.
//!
//! Pruning first drops entries reported before the retention cutoff, then
//! drops the oldest entries beyond the count limit, so after a prune at most
//! `max_count` of the newest surviving entries remain.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::schema::Retention;
use crate::SnapshotView;

/// Apply `retention` to a single queue. Returns the number of entries removed.
pub fn prune_queue<T: SnapshotView>(
    queue: &mut VecDeque<T>,
    retention: &Retention,
    now: DateTime<Utc>,
) -> usize {
    let before = queue.len();
    let cutoff = retention.cutoff(now);
    queue.retain(|entry| entry.reported_at() >= cutoff);

    if let Some(max_count) = retention.max_count {
        while queue.len() > max_count {
            queue.pop_front();
        }
    }

    before - queue.len()
}

/// Insert keeping the queue ordered by `reported_at`. Readings arrive in
/// order almost always, so this is a `push_back` in practice.
pub fn insert_ordered<T: SnapshotView>(queue: &mut VecDeque<T>, snapshot: T) {
    let at = snapshot.reported_at();
    if queue.back().is_none_or(|last| last.reported_at() <= at) {
        queue.push_back(snapshot);
    } else {
        let index = queue.partition_point(|entry| entry.reported_at() <= at);
        queue.insert(index, snapshot);
    }
}

pub struct SnapshotHistory<K, T> {
    entries: Mutex<HashMap<K, VecDeque<T>>>,
}

impl<K, T> SnapshotHistory<K, T>
where
    K: Eq + Hash + Clone,
    T: SnapshotView + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, key: K, snapshot: T) {
        let mut entries = self.entries.lock().await;
        insert_ordered(entries.entry(key).or_default(), snapshot);
    }

    /// Newest snapshot, as an owned copy.
    pub async fn latest(&self, key: &K) -> Option<T> {
        self.entries
            .lock()
            .await
            .get(key)
            .and_then(|queue| queue.back().cloned())
    }

    /// All retained snapshots of `key`, oldest first.
    pub async fn all(&self, key: &K) -> Vec<T> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, key: &K) -> usize {
        self.entries.lock().await.get(key).map_or(0, VecDeque::len)
    }

    pub async fn prune(&self, key: &K, retention: &Retention, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(queue) => prune_queue(queue, retention, now),
            None => 0,
        }
    }

    /// Prune every key. Returns the total number of entries removed.
    pub async fn prune_all(&self, retention: &Retention, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        entries
            .values_mut()
            .map(|queue| prune_queue(queue, retention, now))
            .sum()
    }

    /// Record and prune under one lock acquisition.
    pub async fn record_and_prune(
        &self,
        key: K,
        snapshot: T,
        retention: &Retention,
        now: DateTime<Utc>,
    ) -> usize {
        let mut entries = self.entries.lock().await;
        let queue = entries.entry(key).or_default();
        insert_ordered(queue, snapshot);
        prune_queue(queue, retention, now)
    }

    /// Run `f` with mutable access to `key`'s queue.
    pub async fn with_queue<R>(&self, key: &K, f: impl FnOnce(&mut VecDeque<T>) -> R) -> Option<R> {
        let mut entries = self.entries.lock().await;
        entries.get_mut(key).map(f)
    }

    /// Latest snapshot of every key in `keys` that has one.
    pub async fn latest_many(&self, keys: &[K]) -> HashMap<K, T> {
        let entries = self.entries.lock().await;
        keys.iter()
            .filter_map(|key| {
                entries
                    .get(key)
                    .and_then(|queue| queue.back())
                    .map(|snapshot| (key.clone(), snapshot.clone()))
            })
            .collect()
    }

    pub async fn keys(&self) -> Vec<K> {
        self.entries.lock().await.keys().cloned().collect()
    }
}

impl<K, T> Default for SnapshotHistory<K, T>
where
    K: Eq + Hash + Clone,
    T: SnapshotView + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricsPayload;
    use chrono::Duration;

    fn reading(at: DateTime<Utc>, ram: f64) -> MetricsPayload {
        MetricsPayload {
            reported_at: at,
            ram_used_percent: Some(ram),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_latest_returns_last_recorded() {
        let history = SnapshotHistory::<(), MetricsPayload>::new();
        let now = Utc::now();

        assert!(history.latest(&()).await.is_none());

        history.record((), reading(now - Duration::seconds(60), 10.0)).await;
        history.record((), reading(now, 20.0)).await;

        let latest = history.latest(&()).await.unwrap();
        assert_eq!(latest.ram_used_percent, Some(20.0));
        assert_eq!(history.len(&()).await, 2);
    }

    #[tokio::test]
    async fn test_prune_by_age_then_count() {
        let history = SnapshotHistory::<&str, MetricsPayload>::new();
        let now = Utc::now();

        // 2 expired, 4 fresh
        for minutes in [120, 90, 50, 40, 30, 20] {
            history
                .record("a", reading(now - Duration::minutes(minutes), minutes as f64))
                .await;
        }

        let retention = Retention::new(Duration::hours(1), Some(3));
        let removed = history.prune(&"a", &retention, now).await;

        assert_eq!(removed, 3);
        let kept: Vec<f64> = history
            .all(&"a")
            .await
            .iter()
            .filter_map(|s| s.ram_used_percent)
            .collect();
        assert_eq!(kept, vec![40.0, 30.0, 20.0]);
    }

    #[tokio::test]
    async fn test_prune_all_leaves_other_keys_consistent() {
        let history = SnapshotHistory::<i64, MetricsPayload>::new();
        let now = Utc::now();
        history.record(1, reading(now - Duration::days(3), 1.0)).await;
        history.record(2, reading(now, 2.0)).await;

        let removed = history
            .prune_all(&Retention::new(Duration::days(1), None), now)
            .await;

        assert_eq!(removed, 1);
        assert!(history.latest(&1).await.is_none());
        assert!(history.latest(&2).await.is_some());
        assert_eq!(history.latest_many(&[1, 2, 3]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_reading_is_ordered_by_report_time() {
        let history = SnapshotHistory::<(), MetricsPayload>::new();
        let now = Utc::now();
        history.record((), reading(now, 3.0)).await;
        history.record((), reading(now - Duration::seconds(30), 2.0)).await;

        let latest = history.latest(&()).await.unwrap();
        assert_eq!(latest.ram_used_percent, Some(3.0));
        let order: Vec<f64> = history
            .all(&())
            .await
            .iter()
            .filter_map(|s| s.ram_used_percent)
            .collect();
        assert_eq!(order, vec![2.0, 3.0]);
    }
}
