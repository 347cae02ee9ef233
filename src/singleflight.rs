//! Provides per-key coalescing of concurrent origin loads.
//!
//! When a burst of requests misses the cache for the same key, all of them would hit
//! the origin at once and stampede it. The [SingleFlight](SingleFlight) coordinator
//! ensures that for any key, at most one load is executing at any instant: the first
//! caller becomes the *leader* and runs the operation, all other callers of the same
//! generation wait for the leader and receive the identical outcome.
//!
//! The in-flight marker is removed before the result is published, so a caller which
//! arrives just after a completed load starts a fresh generation instead of observing
//! a stale result.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::value::Value;

/// An error shared between all waiters of one flight generation.
///
/// `anyhow::Error` is not clonable, therefore the leader's error is wrapped into an
/// **Arc** so that every waiter observes the very same failure.
#[derive(Clone, Debug)]
pub struct FlightError(Arc<anyhow::Error>);

impl FlightError {
    fn new(error: anyhow::Error) -> Self {
        FlightError(Arc::new(error))
    }
}

impl fmt::Display for FlightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FlightError {}

/// The outcome of a flight as observed by the leader and all of its waiters.
pub type FlightResult = Result<Value, FlightError>;

/// Coalesces concurrent operations per key.
#[derive(Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
}

impl SingleFlight {
    /// Creates a new coordinator without any in-flight operations.
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given operation for the given key, unless a call for the same key
    /// is already in flight - in that case the result of the ongoing call is awaited
    /// and returned.
    ///
    /// There is deliberately no cancellation or timeout here: a slow origin load delays
    /// all waiters of its generation. Bounding the wait is the responsibility of outer
    /// layers (e.g. the per-request handle timeout of the RPC server).
    pub async fn execute<F>(&self, key: &str, operation: F) -> FlightResult
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        let waiter = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key) {
                Some(leader) => Some(leader.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    let _ = flights.insert(key.to_owned(), sender);
                    None
                }
            }
        };

        if let Some(mut waiter) = waiter {
            return match waiter.recv().await {
                Ok(result) => result,
                // The leader vanished without publishing a result. This only happens if
                // its task was dropped mid-flight, so all we can do is report it...
                Err(_) => Err(FlightError::new(anyhow::anyhow!(
                    "the in-flight load for this key was abandoned"
                ))),
            };
        }

        let result = match operation.await {
            Ok(value) => Ok(value),
            Err(error) => Err(FlightError::new(error)),
        };

        // Remove the marker first, then publish: callers arriving from here on start a
        // fresh generation while already registered waiters still receive this result.
        let leader = self.flights.lock().unwrap().remove(key);
        if let Some(leader) = leader {
            let _ = leader.send(result.clone());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::SingleFlight;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_executes_share_one_invocation() {
        let flights = Arc::new(SingleFlight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let flights = flights.clone();
            let invocations = invocations.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .execute("Tom", async {
                        let _ = invocations.fetch_add(1, Ordering::SeqCst);
                        // Keep the flight open long enough for all waiters to attach...
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Value::from("630"))
                    })
                    .await
            }));
        }

        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result, Value::from("630"));
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_completed_flight_starts_a_fresh_generation() {
        let flights = SingleFlight::new();
        let invocations = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = flights
                .execute("key", async {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from("value"))
                })
                .await;
            assert_eq!(result.unwrap(), Value::from("value"));
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_waiters_observe_the_same_error() {
        let flights = Arc::new(SingleFlight::new());

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let flights = flights.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .execute("missing", async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(anyhow::anyhow!("missing not exist"))
                    })
                    .await
            }));
        }

        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.unwrap_err().to_string(), "missing not exist");
        }
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flights = Arc::new(SingleFlight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let flights = flights.clone();
            let invocations = invocations.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .execute(&format!("key-{}", i), async {
                        let _ = invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Value::from("x"))
                    })
                    .await
            }));
        }

        for task in tasks {
            let _ = task.await.unwrap().unwrap();
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }
}
