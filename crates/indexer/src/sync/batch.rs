//! Cache-aware batched fetch.
//!
//! Scheduled polling, proactive warm and the inline fallback all go through
//! [`cached_batch_fetch`] (or, for a single key, [`ensure_cached`]) so that
//! every trigger applies the same check-before-fetch rule to the same key.
//! Sources that share a [`SingleFlight`] also serialize that rule per key, so
//! triggers racing on one key resolve to one fetch and cache hits.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Per-key async locks shared by every trigger of one engine.
#[derive(Debug, Default)]
pub struct SingleFlight {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SingleFlight {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive use of `key`.
    pub async fn acquire(&self, key: String) -> FlightGuard<'_> {
        let slot = Arc::clone(self.slots().entry(key.clone()).or_default());
        let guard = slot.lock_owned().await;
        FlightGuard {
            flights: self,
            key,
            _guard: guard,
        }
    }

    /// Keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.slots().len()
    }
}

/// Exclusive use of one key; the slot is removed once nobody waits on it.
pub struct FlightGuard<'a> {
    flights: &'a SingleFlight,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.flights.slots();
        // Table entry plus the guard's own handle: no waiter holds a clone.
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2)
        {
            slots.remove(&self.key);
        }
    }
}

/// One cacheable data kind over a key space.
#[async_trait]
pub trait CachedFetch: Send + Sync {
    /// Key of one cache row.
    type Key: Clone + Display + Send + Sync;

    /// Whether the row for `key` is present.
    async fn is_cached(&self, key: &Self::Key) -> Result<bool>;

    /// Fetch the row for `key` upstream and store it.
    async fn fetch_and_store(&self, key: &Self::Key) -> Result<()>;

    /// Lock table serializing check-then-fetch per key, if shared.
    fn single_flight(&self) -> Option<&SingleFlight> {
        None
    }

    /// Lock-table key of `key`; must identify the cache row across sources.
    fn flight_key(&self, key: &Self::Key) -> String {
        key.to_string()
    }
}

/// Outcome of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Row was already present; no upstream call was made.
    Cached,
    /// Row was fetched and stored.
    Fetched,
    /// Check or fetch failed; the row stays absent.
    Failed,
}

/// Summary of one batched run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Batches issued
    pub batches: usize,
    /// Rows fetched upstream
    pub fetched: usize,
    /// Rows already cached
    pub cached: usize,
    /// Rows whose check or fetch failed
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Cached => self.cached += 1,
            FetchOutcome::Fetched => self.fetched += 1,
            FetchOutcome::Failed => self.failed += 1,
        }
    }

    /// Keys processed.
    pub fn total(&self) -> usize {
        self.fetched + self.cached + self.failed
    }
}

/// Check one key and fetch it on a miss. Errors are returned, not logged.
pub async fn ensure_cached<S: CachedFetch + ?Sized>(source: &S, key: &S::Key) -> Result<FetchOutcome> {
    let _flight = match source.single_flight() {
        Some(flights) => Some(flights.acquire(source.flight_key(key)).await),
        None => None,
    };
    if source.is_cached(key).await? {
        return Ok(FetchOutcome::Cached);
    }
    source.fetch_and_store(key).await?;
    Ok(FetchOutcome::Fetched)
}

/// Run [`ensure_cached`] over `keys` in sequential batches of `batch_size`.
///
/// Members of a batch run concurrently and the whole batch resolves before the
/// next one starts. A failing member is logged and counted; it never aborts
/// the batch.
pub async fn cached_batch_fetch<S: CachedFetch + ?Sized>(
    source: &S,
    keys: &[S::Key],
    batch_size: usize,
) -> Result<BatchReport> {
    ensure!(batch_size > 0, "batch_size must be > 0");

    let mut report = BatchReport::default();

    for (index, batch) in keys.chunks(batch_size).enumerate() {
        report.batches += 1;
        debug!("Batch {}: {} keys", index + 1, batch.len());

        let outcomes = join_all(batch.iter().map(|key| async move {
            match ensure_cached(source, key).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Fetch failed for {}: {:#}", key, e);
                    FetchOutcome::Failed
                }
            }
        }))
        .await;

        for outcome in outcomes {
            report.record(outcome);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemorySource {
        rows: Mutex<HashSet<u32>>,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        failing: HashSet<u32>,
        flights: Option<Arc<SingleFlight>>,
    }

    #[async_trait]
    impl CachedFetch for MemorySource {
        type Key = u32;

        async fn is_cached(&self, key: &u32) -> Result<bool> {
            Ok(self.rows.lock().unwrap().contains(key))
        }

        async fn fetch_and_store(&self, key: &u32) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(key) {
                anyhow::bail!("upstream timeout");
            }
            self.rows.lock().unwrap().insert(*key);
            Ok(())
        }

        fn single_flight(&self) -> Option<&SingleFlight> {
            self.flights.as_deref()
        }
    }

    #[tokio::test]
    async fn test_97_keys_in_batches_of_10() {
        let source = MemorySource::default();
        let keys: Vec<u32> = (0..97).collect();

        let report = cached_batch_fetch(&source, &keys, 10).await.unwrap();
        assert_eq!(report.batches, 10);
        assert_eq!(report.fetched, 97);
        assert_eq!(report.cached, 0);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 10);

        // Second run is served entirely from cache.
        let again = cached_batch_fetch(&source, &keys, 10).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.cached, 97);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 97);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let source = MemorySource {
            failing: [3, 12].into_iter().collect(),
            ..Default::default()
        };
        let keys: Vec<u32> = (0..20).collect();

        let report = cached_batch_fetch(&source, &keys, 10).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.fetched, 18);
        assert_eq!(report.total(), 20);

        let rows = source.rows.lock().unwrap();
        assert!(!rows.contains(&3));
        assert!(rows.contains(&4));
        assert!(rows.contains(&19));
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let source = MemorySource::default();
        assert!(cached_batch_fetch(&source, &[1, 2], 0).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_cached_single_key() {
        let source = MemorySource::default();
        assert_eq!(ensure_cached(&source, &7).await.unwrap(), FetchOutcome::Fetched);
        assert_eq!(ensure_cached(&source, &7).await.unwrap(), FetchOutcome::Cached);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_racing_triggers_fetch_once_with_single_flight() {
        let flights = Arc::new(SingleFlight::new());
        let source = MemorySource {
            flights: Some(Arc::clone(&flights)),
            ..Default::default()
        };

        let (a, b, c) = tokio::join!(
            ensure_cached(&source, &5),
            ensure_cached(&source, &5),
            cached_batch_fetch(&source, &[5], 10),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let batch = c.unwrap();
        let fetched = outcomes
            .iter()
            .filter(|o| **o == FetchOutcome::Fetched)
            .count()
            + batch.fetched;
        assert_eq!(fetched, 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(flights.active(), 0);
    }
}
