//! KeyValueStore port - 共有の durable store
//!
//! Redis のような key-value store に要求する最小の契約です。
//! 値は JSON 文字列で、deferred task / schedule の状態はすべてここに置かれます。
//!
//! # 設計原則
//! - store がプロセス間で共有される唯一の可変状態
//! - 状態遷移は compare-and-set（[`KeyValueStore::set_if_equals`]）で行う
//! - 分散ロックは `set_if_absent` + `delete_if_equals` の組み合わせ

use crate::domain::StoreError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl = None` clears any previous expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// `SET NX`: writes only if `key` does not exist. Returns whether it wrote.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// `SET XX`: writes only if `key` exists, keeping its expiry.
    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Compare-and-set: writes only if the current value equals `expected`.
    async fn set_if_equals(&self, key: &str, expected: &str, value: &str)
    -> Result<bool, StoreError>;

    /// Returns the number of keys that existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Compare-and-delete.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Removes every key under `prefix`.
    ///
    /// The default scans then deletes; adapters that can do it atomically override it.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.scan_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(&keys).await
    }

    /// Atomic counter. A missing key counts from 0.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Sets an expiry on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Exclusive lease: holds `key` with `token` until released or `lease` elapses.
    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        self.set_if_absent(key, token, Some(lease)).await
    }

    /// Releases only if `token` still owns the lock.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.delete_if_equals(key, token).await
    }

    /// Restarts the lease if `token` still owns the lock. `false` once it was lost.
    ///
    /// The default reads then expires; adapters with scripting override it atomically.
    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        if self.get(key).await?.as_deref() != Some(token) {
            return Ok(false);
        }
        self.expire(key, lease).await
    }
}
