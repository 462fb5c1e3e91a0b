//! Resilient decorators - 接続障害をバックオフでリトライする
//!
//! `Unavailable` だけをリトライ対象にします。予算（`max_elapsed`）を使い切ると
//! `Exhausted` に変換され、API の呼び出し側には `BobbinError::Transient` として届きます。
//! step の業務エラーとは区別されます。

use crate::domain::{BrokerError, RetryPolicy, StoreError};
use crate::ports::{KeyValueStore, MessageBroker, Subscription};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Errors the decorators know how to retry.
trait Retryable: std::fmt::Display {
    fn is_unavailable(&self) -> bool;
    fn exhausted(self, attempts: u32, elapsed: Duration) -> Self;
}

impl Retryable for StoreError {
    fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    fn exhausted(self, attempts: u32, elapsed: Duration) -> Self {
        StoreError::Exhausted {
            attempts,
            elapsed,
            last: self.to_string(),
        }
    }
}

impl Retryable for BrokerError {
    fn is_unavailable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }

    fn exhausted(self, attempts: u32, elapsed: Duration) -> Self {
        BrokerError::Exhausted {
            attempts,
            elapsed,
            last: self.to_string(),
        }
    }
}

async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, op_name: &'static str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Err(err) if err.is_unavailable() => {
                let elapsed = started.elapsed();
                if !policy.should_retry(elapsed) {
                    return Err(err.exhausted(attempts, elapsed));
                }
                let delay = policy.next_delay(attempts);
                warn!(op = op_name, attempts, ?delay, error = %err, "infrastructure unavailable, backing off");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// ResilientStore は任意の KeyValueStore を包んでリトライを加える
pub struct ResilientStore {
    inner: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl KeyValueStore for ResilientStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_backoff(&self.policy, "store.get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        with_backoff(&self.policy, "store.set", || self.inner.set(key, value, ttl)).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.set_if_absent", || {
            self.inner.set_if_absent(key, value, ttl)
        })
        .await
    }

    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.set_if_exists", || {
            self.inner.set_if_exists(key, value)
        })
        .await
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.set_if_equals", || {
            self.inner.set_if_equals(key, expected, value)
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        with_backoff(&self.policy, "store.delete", || self.inner.delete(keys)).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.delete_if_equals", || {
            self.inner.delete_if_equals(key, expected)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        with_backoff(&self.policy, "store.scan_prefix", || self.inner.scan_prefix(prefix)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        with_backoff(&self.policy, "store.delete_prefix", || {
            self.inner.delete_prefix(prefix)
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        with_backoff(&self.policy, "store.incr", || self.inner.incr(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.expire", || self.inner.expire(key, ttl)).await
    }

    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.acquire_lock", || {
            self.inner.acquire_lock(key, token, lease)
        })
        .await
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.release_lock", || {
            self.inner.release_lock(key, token)
        })
        .await
    }

    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        with_backoff(&self.policy, "store.renew_lock", || {
            self.inner.renew_lock(key, token, lease)
        })
        .await
    }
}

/// ResilientBroker は publish / subscribe をリトライする
///
/// `recv()` はリトライしません。consumer ループ側で扱います。
pub struct ResilientBroker {
    inner: Arc<dyn MessageBroker>,
    policy: RetryPolicy,
}

impl ResilientBroker {
    pub fn new(inner: Arc<dyn MessageBroker>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl MessageBroker for ResilientBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        with_backoff(&self.policy, "broker.publish", || {
            self.inner.publish(queue, payload.clone())
        })
        .await
    }

    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        with_backoff(&self.policy, "broker.broadcast", || {
            self.inner.broadcast(topic, payload.clone())
        })
        .await
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        with_backoff(&self.policy, "broker.subscribe", || self.inner.subscribe(queue)).await
    }

    async fn subscribe_broadcast(
        &self,
        topic: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        with_backoff(&self.policy, "broker.subscribe_broadcast", || {
            self.inner.subscribe_broadcast(topic)
        })
        .await
    }
}
