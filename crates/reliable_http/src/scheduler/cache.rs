//! Coalescing map from identity key to the one live record for that key.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::RequestError;
use crate::request::{IdentityKey, RequestRecord};

/// Records of cacheable requests, keyed by identity.
///
/// Only the scheduler touches this, always under its shared lock.
#[derive(Debug, Default)]
pub struct RequestCache {
    items: HashMap<IdentityKey, Arc<RequestRecord>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live record for `key`, creating one with `make` when there is none or the
    /// existing one has expired. The flag is `true` when the record was created.
    pub fn get_or_create<F>(
        &mut self,
        key: &IdentityKey,
        now: Instant,
        make: F,
    ) -> Result<(Arc<RequestRecord>, bool), RequestError>
    where
        F: FnOnce() -> Result<Arc<RequestRecord>, RequestError>,
    {
        if let Some(record) = self.items.get(key) {
            if !record.is_expired(now) {
                return Ok((Arc::clone(record), false));
            }
        }
        let record = make()?;
        self.insert(Arc::clone(&record));
        Ok((record, true))
    }

    /// Stores `record` under its key, replacing whatever was there.
    pub fn insert(&mut self, record: Arc<RequestRecord>) -> Option<Arc<RequestRecord>> {
        self.items.insert(record.key().clone(), record)
    }

    pub fn get(&self, key: &IdentityKey) -> Result<Arc<RequestRecord>, RequestError> {
        self.items
            .get(key)
            .cloned()
            .ok_or_else(|| RequestError::NotFound { key: key.clone() })
    }

    /// Removes a complete record. Anything still in flight stays put, since dropping it would
    /// orphan its callbacks.
    pub fn remove(&mut self, key: &IdentityKey) -> Result<Arc<RequestRecord>, RequestError> {
        let record = self.get(key)?;
        if !record.is_terminal() {
            return Err(RequestError::NotTerminal { key: key.clone() });
        }
        self.items.remove(key);
        Ok(record)
    }

    /// Removes `record` whatever its state, provided it is still the entry for its key.
    pub(crate) fn evict(&mut self, record: &Arc<RequestRecord>) -> bool {
        match self.items.get(record.key()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                self.items.remove(record.key());
                true
            }
            _ => false,
        }
    }

    /// Drops every complete record whose expiration has passed and returns their keys.
    ///
    /// Removal failures are logged and skipped.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<IdentityKey> {
        let expired: Vec<IdentityKey> = self
            .items
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for key in expired {
            match self.remove(&key) {
                Ok(_) => purged.push(key),
                Err(error) => warn!(message = "Failed to purge cache item.", %key, %error),
            }
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::retries::DefaultRetryLogic;
    use crate::test_utils::spec;

    fn cached(url: &str, duration: Duration) -> Arc<RequestRecord> {
        let mut spec = spec(url);
        spec.cache_duration = duration;
        let record = RequestRecord::create(spec);
        record.mark_ready().unwrap();
        record
    }

    fn finish(record: &RequestRecord) {
        record.mark_pending(1, Instant::now()).unwrap();
        record
            .complete(Ok("item".into()), &DefaultRetryLogic)
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn item_can_be_cached() {
        let mut cache = RequestCache::new();
        let record = cached("https://example.com/foo", Duration::from_secs(10));
        let key = record.key().clone();

        let (found, created) = cache
            .get_or_create(&key, Instant::now(), || Ok(Arc::clone(&record)))
            .unwrap();
        assert!(created);
        assert!(Arc::ptr_eq(&found, &record));

        let (again, created) = cache
            .get_or_create(&key, Instant::now(), || panic!("must reuse the live record"))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&again, &record));
        assert!(Arc::ptr_eq(&cache.get(&key).unwrap(), &record));
    }

    #[tokio::test(start_paused = true)]
    async fn item_can_expire_and_be_purged() {
        let mut cache = RequestCache::new();
        let record = cached("https://example.com/foo", Duration::from_millis(1));
        let key = record.key().clone();
        cache.insert(Arc::clone(&record));
        finish(&record);

        assert!(cache.get(&key).is_ok());

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(cache.purge_expired(Instant::now()), vec![key.clone()]);

        let error = cache.get(&key).unwrap_err();
        assert!(matches!(error, RequestError::NotFound { .. }));
        assert_eq!(
            error.to_string(),
            "item for get https://example.com/foo was not found in the cache"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn purge_is_idempotent() {
        let mut cache = RequestCache::new();
        for n in 0..3 {
            let record = cached(&format!("https://example.com/{n}"), Duration::from_secs(1));
            cache.insert(Arc::clone(&record));
            finish(&record);
        }
        let live = cached("https://example.com/live", Duration::from_secs(60));
        cache.insert(Arc::clone(&live));
        finish(&live);

        tokio::time::advance(Duration::from_secs(2)).await;
        let now = Instant::now();
        assert_eq!(cache.purge_expired(now).len(), 3);
        assert!(cache.purge_expired(now).is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_records_are_neither_removed_nor_purged() {
        let mut cache = RequestCache::new();
        let record = cached("https://example.com/slow", Duration::from_millis(1));
        let key = record.key().clone();
        cache.insert(Arc::clone(&record));
        record.mark_pending(1, Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.purge_expired(Instant::now()).is_empty());
        assert!(matches!(
            cache.remove(&key),
            Err(RequestError::NotTerminal { .. })
        ));

        record
            .complete(Ok("done".into()), &DefaultRetryLogic)
            .unwrap();
        assert!(Arc::ptr_eq(&cache.remove(&key).unwrap(), &record));
        assert!(cache.is_empty());
        assert!(matches!(
            cache.remove(&key),
            Err(RequestError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_replaced_on_lookup() {
        let mut cache = RequestCache::new();
        let stale = cached("https://example.com/foo", Duration::from_secs(1));
        let key = stale.key().clone();
        cache.insert(Arc::clone(&stale));
        finish(&stale);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cached("https://example.com/foo", Duration::from_secs(1));
        let (found, created) = cache
            .get_or_create(&key, Instant::now(), || Ok(Arc::clone(&fresh)))
            .unwrap();
        assert!(created);
        assert!(Arc::ptr_eq(&found, &fresh));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn eviction_only_removes_the_current_entry() {
        let mut cache = RequestCache::new();
        let stale = cached("https://example.com/foo", Duration::from_secs(60));
        let current = cached("https://example.com/foo", Duration::from_secs(60));
        cache.insert(Arc::clone(&stale));
        cache.insert(Arc::clone(&current));

        assert!(!cache.evict(&stale));
        assert_eq!(cache.len(), 1);
        assert!(cache.evict(&current));
        assert!(cache.is_empty());
        assert!(!cache.evict(&current));
    }
}
