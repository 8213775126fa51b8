//! Query API client with a bounded TTL cache and in-flight coalescing.
//!
//! `get_cached` guarantees at most one underlying fetch per key at a time:
//! concurrent callers for a key that is already being fetched wait on the
//! leader's result. The in-flight marker is removed on every exit path,
//! including when the leading future is dropped mid-flight.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, trace};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ApiConfig;
use crate::error::QueryError;
use crate::query::transport::QueryTransport;

type QueryResult = Result<Value, QueryError>;

struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the in-flight marker for `key` when dropped. Pending waiters are
/// dropped with it, which wakes them to retry.
struct InFlightGuard<'a> {
    client: &'a QueryClient,
    key: String,
    completed: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, result: &QueryResult) {
        let waiters = lock(&self.client.in_flight)
            .remove(&self.key)
            .unwrap_or_default();
        self.completed = true;
        if !waiters.is_empty() {
            trace!(
                "Query cache: fanning result for {} out to {} waiters",
                self.key,
                waiters.len()
            );
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            lock(&self.client.in_flight).remove(&self.key);
        }
    }
}

enum Slot {
    Leader,
    Follower(oneshot::Receiver<QueryResult>),
}

pub struct QueryClient {
    transport: Arc<dyn QueryTransport>,
    request_timeout: Duration,
    default_ttl: Duration,
    max_entries: usize,
    cache: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<QueryResult>>>>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl QueryClient {
    pub fn new(transport: Arc<dyn QueryTransport>, config: &ApiConfig) -> Self {
        let limiter = NonZeroU32::new(config.max_requests_per_second)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));
        Self {
            transport,
            request_timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
            default_ttl: Duration::from_millis(config.cache_ttl_ms.max(1)),
            max_entries: config.cache_max_entries.max(1),
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            limiter,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Runs one query against the transport, bounded by the request timeout.
    pub async fn query(&self, document: &str, variables: Value) -> QueryResult {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        match tokio::time::timeout(self.request_timeout, self.transport.execute(document, variables))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    /// Returns a fresh cached value for `key`, joins an identical in-flight
    /// request, or runs `fetcher` and caches its successful result.
    pub async fn get_cached<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> QueryResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryResult>,
    {
        let mut fetcher = Some(fetcher);
        loop {
            if let Some(value) = self.cached(key, ttl) {
                trace!("Query cache: hit {}", key);
                return Ok(value);
            }

            match self.claim(key) {
                Slot::Follower(receiver) => match receiver.await {
                    Ok(result) => return result,
                    // Leader dropped without a result; try again.
                    Err(_) => continue,
                },
                Slot::Leader => {
                    let guard = InFlightGuard {
                        client: self,
                        key: key.to_string(),
                        completed: false,
                    };
                    let Some(fetch) = fetcher.take() else {
                        return Err(QueryError::Network(format!(
                            "fetcher for {key} already consumed"
                        )));
                    };
                    debug!("Query cache: miss {}, fetching", key);
                    let result = fetch().await;
                    if let Ok(value) = &result {
                        self.store(key, value.clone(), ttl);
                    }
                    guard.complete(&result);
                    return result;
                }
            }
        }
    }

    fn cached(&self, key: &str, ttl: Duration) -> Option<Value> {
        lock(&self.cache)
            .get(key)
            .filter(|entry| entry.is_fresh(ttl))
            .map(|entry| entry.value.clone())
    }

    fn claim(&self, key: &str) -> Slot {
        let mut in_flight = lock(&self.in_flight);
        if let Some(waiters) = in_flight.get_mut(key) {
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            trace!("Query cache: coalescing {}", key);
            return Slot::Follower(receiver);
        }
        in_flight.insert(key.to_string(), Vec::new());
        Slot::Leader
    }

    fn store(&self, key: &str, value: Value, ttl: Duration) {
        let mut cache = lock(&self.cache);
        if !cache.contains_key(key) && cache.len() >= self.max_entries {
            cache.retain(|_, entry| entry.is_fresh(entry.ttl));
            if cache.len() >= self.max_entries {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(oldest_key, _)| oldest_key.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.cache).remove(key).is_some()
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut cache = lock(&self.cache);
        let before = cache.len();
        cache.retain(|key, _| !key.starts_with(prefix));
        before - cache.len()
    }

    pub fn clear(&self) {
        lock(&self.cache).clear();
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }
}
