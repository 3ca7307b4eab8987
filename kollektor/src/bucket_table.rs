//! §4.3 `BucketTable`: the key → open-bucket mapping.
//!
//! Touched only from the ingress event loop (see spec.md §5), so no
//! internal locking is required — an `FxHashMap` suffices.

use rustc_hash::FxHashMap;

use crate::bucket::Bucket;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Admission refused because the table is at capacity (spec.md §4.3,
    /// §7 `CapacityExceeded`). Carries no payload: the caller already has
    /// the key and datagram it tried to admit.
    #[error("bucket table at capacity")]
    Rejected,
}

/// Mapping from key bytes to the open [`Bucket`] for that key.
#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: FxHashMap<Vec<u8>, Bucket>,
    max_bucket_count: usize,
}

impl BucketTable {
    #[must_use]
    pub fn new(max_bucket_count: usize) -> Self {
        Self {
            buckets: FxHashMap::default(),
            max_bucket_count,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[must_use]
    pub fn max_bucket_count(&self) -> usize {
        self.max_bucket_count
    }

    pub fn lookup_mut(&mut self, key: &[u8]) -> Option<&mut Bucket> {
        self.buckets.get_mut(key)
    }

    /// Whether admitting one more key would violate spec.md §4.5/§4.3's
    /// off-by-one capacity rule: the last slot is never filled
    /// (`bucket_count + 1 == max_bucket_count`). Preserved verbatim per
    /// spec.md §9 "Open questions" — this is a documented behavior, not a
    /// bug to silently fix.
    #[must_use]
    pub fn would_exceed_capacity(&self) -> bool {
        self.buckets.len() + 1 == self.max_bucket_count
    }

    /// Insert a freshly created bucket for `key`, refusing if capacity would
    /// be violated. On rejection the caller still owns `bucket` and must
    /// drop it without inserting (spec.md §4.3).
    pub fn admit(&mut self, bucket: Bucket) -> Result<&mut Bucket, Error> {
        if self.would_exceed_capacity() {
            return Err(Error::Rejected);
        }
        let key = bucket.key().to_vec();
        self.buckets.insert(key.clone(), bucket);
        Ok(self
            .buckets
            .get_mut(&key)
            .expect("just inserted this key"))
    }

    /// Remove and return the bucket for `key`, if present. Detach is purely
    /// a table operation; enqueueing the detached bucket to the writer is
    /// the caller's job (spec.md §4.3: "detach + enqueue happen atomically
    /// from the ingress event-loop's perspective" because both happen
    /// inline, on the same thread, with no await point between them).
    pub fn detach(&mut self, key: &[u8]) -> Option<Bucket> {
        self.buckets.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_succeeds_below_capacity() {
        let mut table = BucketTable::new(3);
        let b = Bucket::create(b"a", 0.0).unwrap();
        assert!(table.admit(b).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn admit_rejects_at_off_by_one_boundary() {
        // max_bucket_count = 2: only one bucket may ever be open at once,
        // per the preserved off-by-one (spec.md §9).
        let mut table = BucketTable::new(2);
        let a = Bucket::create(b"a", 0.0).unwrap();
        assert!(table.admit(a).is_ok());

        let b = Bucket::create(b"b", 0.0).unwrap();
        let err = table.admit(b).unwrap_err();
        assert_eq!(err, Error::Rejected);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn detach_removes_and_returns_bucket() {
        let mut table = BucketTable::new(10);
        let b = Bucket::create(b"a", 0.0).unwrap();
        table.admit(b).unwrap();
        assert_eq!(table.len(), 1);
        let detached = table.detach(b"a").expect("bucket present");
        assert_eq!(detached.key(), b"a");
        assert_eq!(table.len(), 0);
        assert!(table.detach(b"a").is_none());
    }

    #[test]
    fn lookup_mut_allows_in_place_append() {
        let mut table = BucketTable::new(10);
        let b = Bucket::create(b"a", 0.0).unwrap();
        table.admit(b).unwrap();
        table.lookup_mut(b"a").unwrap().append(b";x").unwrap();
        assert_eq!(table.lookup_mut(b"a").unwrap().item_count(), 1);
    }
}
