//! Collapse concurrent work on the same key into one execution.
//!
//! Used for session handshakes and OAuth token refreshes: whoever arrives
//! first starts the work, everyone else awaits the same shared future, and
//! all of them observe the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Keyed in-flight deduplication.
pub struct SingleFlight<K, T>
where
    T: Clone,
{
    inner: Arc<Mutex<Inflight<K, T>>>,
}

struct Inflight<K, T>
where
    T: Clone,
{
    next_generation: u64,
    flights: HashMap<K, (u64, Flight<T>)>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inflight {
                next_generation: 0,
                flights: HashMap::new(),
            })),
        }
    }

    /// Run `work` for `key` unless a flight for `key` is already running, in
    /// which case join it. `work` is only invoked by the caller that starts
    /// the flight.
    ///
    /// The flight keeps running if its initiator is dropped, as long as any
    /// other caller is still awaiting it.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.flights.get(&key) {
                Some((_, flight)) => flight.clone(),
                None => {
                    guard.next_generation += 1;
                    let generation = guard.next_generation;
                    let inner = Arc::clone(&self.inner);
                    let cleanup_key = key.clone();
                    let fut = work();
                    let flight = async move {
                        let out = fut.await;
                        let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
                        if matches!(guard.flights.get(&cleanup_key), Some((g, _)) if *g == generation) {
                            guard.flights.remove(&cleanup_key);
                        }
                        out
                    }
                    .boxed()
                    .shared();
                    guard.flights.insert(key, (generation, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    /// Whether a flight is currently registered for `key`.
    pub fn in_flight(&self, key: &K) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flights
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("srv".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flights.in_flight(&"srv".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flights: SingleFlight<&'static str, usize> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for expected in 1..=2 {
            let runs = Arc::clone(&runs);
            let n = flights
                .run("k", move || async move { runs.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(n, expected);
        }
    }

    #[tokio::test]
    async fn test_failures_are_shared_then_cleared() {
        let flights: Arc<SingleFlight<u8, Result<(), String>>> = Arc::new(SingleFlight::new());
        let a = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err("refused".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = flights.run(1, || async { Ok(()) }).await;
        assert_eq!(b, Err("refused".to_string()));
        assert_eq!(a.await.unwrap(), Err("refused".to_string()));

        let c = flights.run(1, || async { Ok(()) }).await;
        assert_eq!(c, Ok(()));
    }
}
