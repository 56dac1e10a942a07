//! Request Deduplication
//!
//! Collapses concurrent identical cache-miss requests into one producer
//! execution. The first caller for a key installs a shared future; later
//! callers for the same key await that future instead of running their own
//! producer. The producer runs on its own task, so it completes even when
//! every caller gives up. The in-flight entry is removed when the producer
//! finishes, whether it succeeded or failed, so the next request after
//! completion starts a fresh execution.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{Error, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Removes the in-flight entry for `key` when dropped, if it still holds `id`
struct InFlightGuard<T: Clone + Send + Sync + 'static> {
    in_flight: Arc<DashMap<String, (u64, SharedResult<T>)>>,
    key: String,
    id: u64,
}

impl<T: Clone + Send + Sync + 'static> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        self.in_flight.remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

/// Deduplicates concurrent producers by key
pub struct RequestDeduplicator<T: Clone + Send + Sync + 'static> {
    in_flight: Arc<DashMap<String, (u64, SharedResult<T>)>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    joined: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `producer` for `key`, or join an execution already in flight.
    ///
    /// Every caller that joins receives a clone of the same result or error.
    /// Must be called within a Tokio runtime.
    pub async fn dedupe<F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                existing.get().1.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.executions.fetch_add(1, Ordering::Relaxed);

                let guard = InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                    id,
                };
                let fut = producer();
                // Cleanup runs when the producer task ends, on success or error
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    fut.await
                });
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(Error::Internal(format!("producer task failed: {}", e))),
                    }
                }
                .boxed()
                .shared();

                slot.insert((id, shared.clone()));
                shared
            }
        };

        shared.await
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Producer executions started
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Callers that joined an existing execution
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifty_concurrent_callers_one_execution() {
        let dedup = Arc::new(RequestDeduplicator::<String>::new());
        let calls = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    dedup
                        .dedupe("doc:merge:s:abc", move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("merged".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "merged");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.executions(), 1);
        assert_eq!(dedup.joined(), 49);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_shared_and_entry_removed() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());

        let a = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .dedupe("k", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(Error::producer(anyhow::anyhow!("encoder crashed")))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = dedup.dedupe("k", || async { Ok(7) }).await;

        let a = a.await.unwrap();
        assert!(matches!(a, Err(Error::Producer(_))));
        assert!(matches!(b, Err(Error::Producer(_))));
        assert_eq!(dedup.in_flight(), 0);

        // Completed executions are not reused
        assert_eq!(dedup.dedupe("k", || async { Ok(7) }).await.unwrap(), 7);
        assert_eq!(dedup.executions(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let dedup = RequestDeduplicator::<&'static str>::new();
        let (a, b) = tokio::join!(
            dedup.dedupe("a", || async { Ok("A") }),
            dedup.dedupe("b", || async { Ok("B") }),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(dedup.executions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_execution_is_resumed_by_next_caller() {
        let dedup = RequestDeduplicator::<u8>::new();
        let first = dedup.dedupe("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });
        assert!(tokio::time::timeout(Duration::from_millis(5), first)
            .await
            .is_err());
        assert_eq!(dedup.in_flight(), 1);

        let second = dedup.dedupe("slow", || async { Ok(2) }).await.unwrap();
        assert_eq!(second, 1);
        assert_eq!(dedup.executions(), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_removed_after_every_caller_gives_up() {
        let dedup = RequestDeduplicator::<u8>::new();
        let finished = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&finished);
        let first = dedup.dedupe("slow", move || async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        assert!(tokio::time::timeout(Duration::from_millis(5), first)
            .await
            .is_err());
        assert_eq!(dedup.in_flight(), 1);

        // Nobody awaits the execution any more; it still completes and cleans up
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);

        let next = dedup.dedupe("slow", || async { Ok(2) }).await.unwrap();
        assert_eq!(next, 2);
        assert_eq!(dedup.executions(), 2);
    }
}
