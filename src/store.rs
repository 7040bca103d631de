use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::rdb::Snapshot;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("no live string value under key")]
    MissingValue,
}

/// A string value with an optional absolute expiry. A value whose expiry has
/// passed is indistinguishable from an absent one on read.
#[derive(Debug, Clone)]
struct StringValue {
    data: Bytes,
    expires_at: Option<SystemTime>,
}

impl StringValue {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// The string keyspace. Expiry is lazy: reads drop dead entries, there is no
/// background sweeper.
#[derive(Default)]
pub struct KvStore {
    entries: HashMap<String, StringValue>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazy-expiring read; removing the dead entry is a side effect, which is
    /// why reads go through a write lock at the call site.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let now = SystemTime::now();
        let expired = self
            .entries
            .get(key)
            .map_or(false, |value| value.is_expired(now));
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|value| value.data.clone())
    }

    /// Replaces any prior binding under `key`.
    pub fn set(&mut self, key: &str, data: Bytes, expires_at: Option<SystemTime>) {
        self.entries
            .insert(key.to_string(), StringValue { data, expires_at });
    }

    /// Replaces the data of an existing live value, keeping its expiry. Fails
    /// when there is nothing live to update; INCR does a read-check first and
    /// relies on this.
    pub fn update(&mut self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let now = SystemTime::now();
        match self.entries.get_mut(key) {
            Some(value) if !value.is_expired(now) => {
                value.data = data;
                Ok(())
            }
            _ => Err(StoreError::MissingValue),
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains_live(&self, key: &str) -> bool {
        let now = SystemTime::now();
        self.entries
            .get(key)
            .map_or(false, |value| !value.is_expired(now))
    }

    /// Snapshot of live keys. Only `*` acts as a pattern; anything else
    /// matches literally.
    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let now = SystemTime::now();
        self.entries
            .iter()
            .filter(|(key, value)| {
                !value.is_expired(now) && (pattern == "*" || key.as_str() == pattern)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Load a decoded RDB snapshot. Entries already expired at restore time
    /// are dropped. Returns the number of keys restored.
    pub fn restore(&mut self, snapshot: Snapshot) -> usize {
        let now = SystemTime::now();
        let mut restored = 0;
        for entry in snapshot.entries {
            if entry.expires_at.map_or(false, |at| at <= now) {
                continue;
            }
            self.set(&entry.key, entry.value, entry.expires_at);
            restored += 1;
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rdb::Entry;
    use std::time::Duration;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn last_set_wins() {
        let mut store = KvStore::new();
        store.set("k", bytes("a"), None);
        store.set("k", bytes("b"), None);
        assert_eq!(store.get("k"), Some(bytes("b")));
    }

    #[test]
    fn expired_value_reads_as_absent_and_is_removed() {
        let mut store = KvStore::new();
        let past = SystemTime::now() - Duration::from_millis(10);
        store.set("k", bytes("v"), Some(past));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn future_expiry_still_readable() {
        let mut store = KvStore::new();
        let future = SystemTime::now() + Duration::from_secs(60);
        store.set("k", bytes("v"), Some(future));
        assert_eq!(store.get("k"), Some(bytes("v")));
    }

    #[test]
    fn update_requires_a_live_value() {
        let mut store = KvStore::new();
        assert_eq!(store.update("k", bytes("1")), Err(StoreError::MissingValue));
        store.set("k", bytes("1"), None);
        assert!(store.update("k", bytes("2")).is_ok());
        assert_eq!(store.get("k"), Some(bytes("2")));

        let past = SystemTime::now() - Duration::from_millis(10);
        store.set("dead", bytes("v"), Some(past));
        assert_eq!(
            store.update("dead", bytes("x")),
            Err(StoreError::MissingValue)
        );
    }

    #[test]
    fn keys_matching_star_skips_expired() {
        let mut store = KvStore::new();
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        let past = SystemTime::now() - Duration::from_millis(10);
        store.set("dead", bytes("3"), Some(past));
        let mut keys = store.keys_matching("*");
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.keys_matching("a"), vec!["a".to_string()]);
    }

    #[test]
    fn restore_drops_already_expired_entries() {
        let mut store = KvStore::new();
        let snapshot = Snapshot {
            version: 11,
            aux: Default::default(),
            entries: vec![
                Entry {
                    key: "live".to_string(),
                    value: bytes("1"),
                    expires_at: Some(SystemTime::now() + Duration::from_secs(60)),
                },
                Entry {
                    key: "dead".to_string(),
                    value: bytes("2"),
                    expires_at: Some(SystemTime::now() - Duration::from_secs(60)),
                },
                Entry {
                    key: "eternal".to_string(),
                    value: bytes("3"),
                    expires_at: None,
                },
            ],
        };
        assert_eq!(store.restore(snapshot), 2);
        assert!(store.contains_live("live"));
        assert!(store.contains_live("eternal"));
        assert!(!store.contains_live("dead"));
    }
}
