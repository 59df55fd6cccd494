//! Keyed coalescing of concurrent cache misses.
//!
//! The first request for a missing key becomes the *leader* and runs the
//! origin work; concurrent requests for the same key become *followers* and
//! await the leader's shared outcome. Success and failure are shared alike:
//! a leader error is observed by every follower rather than re-triggering
//! the work.

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::ProxyError;

type FlightOutcome<T> = Result<Arc<T>, Arc<ProxyError>>;
type FlightFuture<T> = Shared<BoxFuture<'static, FlightOutcome<T>>>;

pub struct FlightGroup<T> {
    flights: DashMap<String, FlightFuture<T>>,
}

impl<T: Send + Sync + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Runs `work` under `key`, coalescing with any flight already in
    /// progress. Returns the shared outcome and whether this caller was the
    /// leader.
    ///
    /// Registration is a compare-and-register on the flight map; the leader
    /// executes without holding any lock on it. The work runs as its own
    /// task, so a disconnecting client cannot abandon a flight that other
    /// callers may still join. The entry is removed once the outcome has
    /// been published, so a caller arriving later starts a fresh flight
    /// (after re-probing the cache tiers).
    pub async fn run<F>(&self, key: &str, work: F) -> (FlightOutcome<T>, bool)
    where
        F: Future<Output = Result<T, ProxyError>> + Send + 'static,
    {
        let (flight, is_leader) = match self.flights.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                debug!(key, "joining in-flight origin fetch as follower");
                (occupied.get().clone(), false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let handle = tokio::spawn(async move {
                    work.await.map(Arc::new).map_err(Arc::new)
                });
                let shared = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(Arc::new(ProxyError::internal(format!(
                            "origin task failed: {e}"
                        )))),
                    }
                }
                .boxed()
                .shared();
                vacant.insert(shared.clone());
                (shared, true)
            }
        };

        let outcome = flight.await;
        // Idempotent across leader and followers; whoever finishes first
        // unregisters the completed flight.
        self.flights.remove(key);
        (outcome, is_leader)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<T: Send + Sync + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
