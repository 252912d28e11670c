//! In-process store for single-node development and tests.
//!
//! Expiry is checked lazily on access against tokio's clock, so tests can
//! drive TTL decay with `tokio::time::pause`/`advance`.

use super::{KvStore, Precondition};
use crate::common::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn holds(map: &BTreeMap<String, Entry>, key: &str, cond: &Precondition) -> bool {
        let current = map.get(key).map(|e| e.value.as_slice());
        match cond {
            Precondition::None => true,
            Precondition::MustNotExist => current.is_none(),
            Precondition::ValueEquals(v) => current == Some(v.as_slice()),
        }
    }

    fn purge_expired(map: &mut BTreeMap<String, Entry>) {
        let now = Instant::now();
        map.retain(|_, e| e.is_live(now));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.map.lock().unwrap();
        Self::purge_expired(&mut map);
        Ok(map.get(key).map(|e| e.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        cond: Precondition,
    ) -> Result<bool> {
        let mut map = self.map.lock().unwrap();
        Self::purge_expired(&mut map);

        if !Self::holds(&map, key, &cond) {
            return Ok(false);
        }

        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str, cond: Precondition) -> Result<bool> {
        let mut map = self.map.lock().unwrap();
        Self::purge_expired(&mut map);

        if !Self::holds(&map, key, &cond) {
            return Ok(false);
        }
        Ok(map.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut map = self.map.lock().unwrap();
        Self::purge_expired(&mut map);

        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }
}
