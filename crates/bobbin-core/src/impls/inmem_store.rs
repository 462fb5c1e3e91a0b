//! InMemoryStore - 開発・テスト用の KeyValueStore
//!
//! # 学習ポイント
//! - BTreeMap による prefix scan（キー順に range を取る）
//! - TTL は読み出し時に遅延評価（期限切れのエントリは見えないだけ）
//! - `pause()` / `resume()` で store の障害を注入できる
//!
//! `Clone` は同じ状態を共有します。複数の App（= 複数プロセス）に同じ store を渡せます。

use crate::domain::StoreError;
use crate::ports::KeyValueStore;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, Entry>,
    paused: bool,
}

impl StoreState {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
    }

    fn live_keys_with_prefix(&self, prefix: &str, now: Instant) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// InMemoryStore は開発用の key-value store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `Unavailable` until [`InMemoryStore::resume`].
    pub fn pause(&self) {
        self.lock_state().paused = true;
    }

    pub fn resume(&self) {
        self.lock_state().paused = false;
    }

    /// Live keys, sorted. Works while paused.
    pub fn keys(&self) -> Vec<String> {
        self.lock_state().live_keys_with_prefix("", Instant::now())
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        // panic したテストが残した poison は無視する
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        let guard = self.lock_state();
        if guard.paused {
            return Err(StoreError::Unavailable("in-memory store is paused".into()));
        }
        Ok(guard)
    }
}

fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.available()?;
        Ok(state
            .live(key, Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(true)
    }

    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        match state.entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = state.entries.remove(key)
                && entry.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        if state.entries.get(key).is_some_and(|entry| entry.value == expected) {
            state.entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.available()?;
        Ok(state.live_keys_with_prefix(prefix, Instant::now()))
    }

    /// 1 回のロックで削除するので原子的
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        let keys: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = state.entries.remove(&key)
                && entry.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        let entry = state.entries.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().map_err(|_| StoreError::NotACounter {
            key: key.to_string(),
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let now = Instant::now();
        state.purge_if_expired(key, now);
        match state.entries.get_mut(key) {
            Some(entry) if entry.value == token => {
                entry.expires_at = Some(now + lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
