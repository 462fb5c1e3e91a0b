//! MessageBroker port - 名前付きキューと fan-out トピック
//!
//! # 配送保証
//! - キュー: competing consumers、at-least-once、consumer の ack が必要
//! - トピック: 全 subscriber に配送（ack 不要、best effort）
//!
//! # Delivery の扱い
//! `recv()` が返す [`Delivery`] は `ack` か `nack` で必ず決着させます。
//! 決着させずに drop した場合はキューに戻ります（プロセスのクラッシュと同じ扱い）。

use crate::domain::BrokerError;
use async_trait::async_trait;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Enqueues onto a named queue.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Fans out to every current subscriber of `topic`.
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Competing consumer on `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Receives every message broadcast on `topic` after this call.
    async fn subscribe_broadcast(&self, topic: &str)
    -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message.
    async fn recv(&mut self) -> Result<Box<dyn Delivery>, BrokerError>;
}

/// One received message.
///
/// `ack` / `nack` は `self: Box<Self>` を消費するため、二重に決着させることはできません。
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// The message was handed out before and not acked.
    fn redelivered(&self) -> bool;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// `requeue = false` drops the message.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}
