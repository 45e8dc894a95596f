//! At-most-once request layer: deduplication of client retries.
//!
//! Responses are cached per client under `(request_id, operation)`. Keying on
//! the operation matters because a client may legitimately reuse a request id
//! across a SET/DELETE cycle; matching the operation narrows false cache hits
//! while still catching true retries. A request id seen under a *different*
//! operation is counted for observability but never returns the cached
//! response.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::wal::Operation;

/// Key within one client's cache.
type RequestKey = (String, Operation);

/// Bounded, TTL-expiring cache of processed client requests.
pub struct RequestDeduplicator {
    max_cache_size: usize,
    expiry: Duration,
    service_name: String,
    inner: Mutex<DedupInner>,
}

#[derive(Default)]
struct DedupInner {
    /// client_id -> (request_id, operation) -> (insertion time, response).
    processed: HashMap<String, HashMap<RequestKey, (Instant, Value)>>,
    total_requests_cached: u64,
    same_op_duplicates: u64,
    different_op_duplicates: u64,
    cache_cleanups: u64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupStats {
    /// Name this cache logs under.
    pub service_name: String,
    /// Entries currently cached across all clients.
    pub current_cache_size: usize,
    /// Clients with at least one cached entry.
    pub client_count: usize,
    /// Distinct request ids currently cached.
    pub unique_request_ids: usize,
    /// Responses ever cached.
    pub total_requests_cached: u64,
    /// Retries answered from the cache.
    pub same_op_duplicates: u64,
    /// Request-id reuse under a different operation.
    pub different_op_duplicates: u64,
    /// TTL/eviction sweeps that removed at least one entry.
    pub cache_cleanups: u64,
}

impl RequestDeduplicator {
    /// Create a cache bounded to `max_cache_size` total entries with the
    /// given TTL.
    #[must_use]
    pub fn new(max_cache_size: usize, expiry_seconds: u64, service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        info!(
            "[{service_name}] request deduplication initialized, \
             max_cache_size={max_cache_size}, expiry_seconds={expiry_seconds}"
        );
        Self {
            max_cache_size,
            expiry: Duration::from_secs(expiry_seconds),
            service_name,
            inner: Mutex::new(DedupInner::default()),
        }
    }

    /// Record the response for a completed request.
    pub fn mark_processed(
        &self,
        client_id: &str,
        request_id: &str,
        operation: Operation,
        response: Value,
    ) {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);

        inner
            .processed
            .entry(client_id.to_string())
            .or_default()
            .insert(
                (request_id.to_string(), operation),
                (Instant::now(), response),
            );
        inner.total_requests_cached += 1;
        debug!(
            "[{}] cached result for client={client_id}, request={request_id}, operation={operation}",
            self.service_name
        );

        self.evict_oldest(&mut inner);
    }

    /// Cached response for an exact `(client, request, operation)` match.
    ///
    /// Request-id reuse under another operation is a miss, counted
    /// separately.
    pub fn lookup(&self, client_id: &str, request_id: &str, operation: Operation) -> Option<Value> {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);

        let requests = inner.processed.get(client_id)?;
        if let Some((inserted_at, response)) = requests.get(&(request_id.to_string(), operation)) {
            let age = inserted_at.elapsed();
            let response = response.clone();
            inner.same_op_duplicates += 1;
            warn!(
                "[{}] duplicate request detected: client={client_id}, request={request_id}, \
                 operation={operation}, originally processed {:.2}s ago",
                self.service_name,
                age.as_secs_f64()
            );
            return Some(response);
        }

        let reused_id = requests
            .keys()
            .any(|(cached_request_id, _)| cached_request_id == request_id);
        if reused_id {
            inner.different_op_duplicates += 1;
            debug!(
                "[{}] request id {request_id} of client {client_id} reused with operation {operation}",
                self.service_name
            );
        }
        None
    }

    /// Side-effect-free view of a cached response; no counters move and
    /// nothing is swept. Expired entries are invisible.
    #[must_use]
    pub fn peek(&self, client_id: &str, request_id: &str, operation: Operation) -> Option<Value> {
        let inner = self.inner.lock();
        let (inserted_at, response) = inner
            .processed
            .get(client_id)?
            .get(&(request_id.to_string(), operation))?;
        (inserted_at.elapsed() <= self.expiry).then(|| response.clone())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock();
        let current_cache_size = inner.processed.values().map(HashMap::len).sum();
        let unique_request_ids = inner
            .processed
            .values()
            .flat_map(|requests| requests.keys().map(|(request_id, _)| request_id.as_str()))
            .collect::<HashSet<&str>>()
            .len();
        DedupStats {
            service_name: self.service_name.clone(),
            current_cache_size,
            client_count: inner.processed.len(),
            unique_request_ids,
            total_requests_cached: inner.total_requests_cached,
            same_op_duplicates: inner.same_op_duplicates,
            different_op_duplicates: inner.different_op_duplicates,
            cache_cleanups: inner.cache_cleanups,
        }
    }

    /// Drop everything past the TTL, then any client left empty.
    fn sweep_expired(&self, inner: &mut DedupInner) {
        let expiry = self.expiry;
        let mut expired = 0usize;
        inner.processed.retain(|_, requests| {
            requests.retain(|_, (inserted_at, _)| {
                let keep = inserted_at.elapsed() <= expiry;
                if !keep {
                    expired += 1;
                }
                keep
            });
            !requests.is_empty()
        });
        if expired > 0 {
            inner.cache_cleanups += 1;
            info!(
                "[{}] cleaned up {expired} expired cache entries",
                self.service_name
            );
        }
    }

    /// Evict oldest-by-insertion entries until the cache fits again.
    fn evict_oldest(&self, inner: &mut DedupInner) {
        let total: usize = inner.processed.values().map(HashMap::len).sum();
        if total <= self.max_cache_size {
            return;
        }
        let mut all: Vec<(Instant, String, RequestKey)> = inner
            .processed
            .iter()
            .flat_map(|(client_id, requests)| {
                requests.iter().map(|(key, (inserted_at, _))| {
                    (*inserted_at, client_id.clone(), key.clone())
                })
            })
            .collect();
        all.sort_by_key(|(inserted_at, _, _)| *inserted_at);

        let excess = total - self.max_cache_size;
        info!(
            "[{}] cache size limit reached, removing {excess} oldest entries",
            self.service_name
        );
        for (_, client_id, key) in all.into_iter().take(excess) {
            if let Some(requests) = inner.processed.get_mut(&client_id) {
                requests.remove(&key);
                if requests.is_empty() {
                    inner.processed.remove(&client_id);
                }
            }
        }
        inner.cache_cleanups += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    #[test]
    fn test_same_op_hit_and_different_op_miss() {
        let dedup = RequestDeduplicator::new(100, 3600, "test");
        dedup.mark_processed("c1", "r1", Operation::Set, json!({"id": 7}));

        assert_eq!(
            dedup.lookup("c1", "r1", Operation::Set),
            Some(json!({"id": 7}))
        );
        assert_eq!(dedup.lookup("c1", "r1", Operation::Get), None);

        let stats = dedup.stats();
        assert_eq!(stats.same_op_duplicates, 1);
        assert_eq!(stats.different_op_duplicates, 1);
        assert_eq!(stats.current_cache_size, 1);
        assert_eq!(stats.unique_request_ids, 1);
    }

    #[test]
    fn test_miss_for_unknown_client_or_request() {
        let dedup = RequestDeduplicator::new(100, 3600, "test");
        dedup.mark_processed("c1", "r1", Operation::Set, json!(1));

        assert_eq!(dedup.lookup("c2", "r1", Operation::Set), None);
        assert_eq!(dedup.lookup("c1", "r2", Operation::Set), None);
        assert_eq!(dedup.stats().same_op_duplicates, 0);
    }

    #[test]
    fn test_ttl_expiry() {
        let dedup = RequestDeduplicator::new(100, 0, "test");
        dedup.mark_processed("c1", "r1", Operation::Set, json!(1));
        sleep(Duration::from_millis(20));

        assert_eq!(dedup.lookup("c1", "r1", Operation::Set), None);
        let stats = dedup.stats();
        assert_eq!(stats.current_cache_size, 0);
        assert_eq!(stats.client_count, 0);
        assert!(stats.cache_cleanups >= 1);
    }

    #[test]
    fn test_eviction_drops_oldest_first() {
        let dedup = RequestDeduplicator::new(3, 3600, "test");
        for i in 0..5 {
            dedup.mark_processed("c1", &format!("r{i}"), Operation::Set, json!(i));
            sleep(Duration::from_millis(2));
        }

        let stats = dedup.stats();
        assert_eq!(stats.current_cache_size, 3);
        assert_eq!(dedup.lookup("c1", "r0", Operation::Set), None);
        assert_eq!(dedup.lookup("c1", "r1", Operation::Set), None);
        assert_eq!(dedup.lookup("c1", "r4", Operation::Set), Some(json!(4)));
    }

    #[test]
    fn test_same_request_id_for_set_and_delete_coexist() {
        let dedup = RequestDeduplicator::new(100, 3600, "test");
        dedup.mark_processed("c1", "r1", Operation::Set, json!("set-response"));
        dedup.mark_processed("c1", "r1", Operation::Delete, json!("delete-response"));

        assert_eq!(
            dedup.lookup("c1", "r1", Operation::Set),
            Some(json!("set-response"))
        );
        assert_eq!(
            dedup.lookup("c1", "r1", Operation::Delete),
            Some(json!("delete-response"))
        );
        let stats = dedup.stats();
        assert_eq!(stats.current_cache_size, 2);
        assert_eq!(stats.unique_request_ids, 1);
    }

    #[test]
    fn test_peek_has_no_side_effects() {
        let dedup = RequestDeduplicator::new(100, 3600, "test");
        dedup.mark_processed("c1", "r1", Operation::Set, json!(1));

        assert_eq!(dedup.peek("c1", "r1", Operation::Set), Some(json!(1)));
        assert_eq!(dedup.peek("c1", "r1", Operation::Get), None);
        let stats = dedup.stats();
        assert_eq!(stats.same_op_duplicates, 0);
        assert_eq!(stats.different_op_duplicates, 0);
    }
}
