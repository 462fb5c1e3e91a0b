//! InMemoryBroker - 開発・テスト用の MessageBroker
//!
//! # 学習ポイント
//! - `Notify` による async な pop 待ち（lost wakeup を避けるため `enable()` してから確認）
//! - Delivery を drop したら再キュー（`Drop` 実装）
//! - `pause()` / `resume()` で broker の障害を注入できる
//!
//! # 障害の模倣
//! pause 中は publish / ack / nack が `Unavailable` になり、新しい配送も止まります。
//! pause 中に ack できなかったメッセージは再配送されます（接続断と同じ）。

use crate::domain::BrokerError;
use crate::ports::{Delivery, MessageBroker, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Message>>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    paused: bool,
    unacked: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    /// publish / requeue / resume で待機中の consumer を起こす
    notify: Notify,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn requeue(&self, queue: &str, payload: Vec<u8>) {
        {
            let mut state = self.lock_state();
            state.unacked = state.unacked.saturating_sub(1);
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_front(Message {
                    payload,
                    redelivered: true,
                });
        }
        self.notify.notify_waiters();
    }

    fn settle(&self) {
        let mut state = self.lock_state();
        state.unacked = state.unacked.saturating_sub(1);
    }
}

/// InMemoryBroker は開発用の broker
///
/// `Clone` は同じ状態を共有します。
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.lock_state().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock_state().paused = false;
        self.inner.notify.notify_waiters();
    }

    /// Ready messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock_state()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Deliveries handed out and not yet settled, across all queues.
    pub fn unacked(&self) -> usize {
        self.inner.lock_state().unacked
    }

    fn available(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.inner.lock_state();
        if state.paused {
            return Err(BrokerError::Unavailable("in-memory broker is paused".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.available()?;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Message {
                    payload,
                    redelivered: false,
                });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.available()?;
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let _state = self.available()?;
        Ok(Box::new(QueueSubscription {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
        }))
    }

    async fn subscribe_broadcast(
        &self,
        topic: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.available()?
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(TopicSubscription {
            topic: topic.to_string(),
            rx,
        }))
    }
}

struct QueueSubscription {
    inner: Arc<Inner>,
    queue: String,
}

impl QueueSubscription {
    fn try_pop(&self) -> Option<Message> {
        let mut state = self.inner.lock_state();
        if state.paused {
            return None;
        }
        let message = state.queues.get_mut(&self.queue)?.pop_front()?;
        state.unacked += 1;
        Some(message)
    }
}

#[async_trait]
impl Subscription for QueueSubscription {
    async fn recv(&mut self) -> Result<Box<dyn Delivery>, BrokerError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop() {
                return Ok(Box::new(QueueDelivery {
                    inner: Arc::clone(&self.inner),
                    queue: self.queue.clone(),
                    message: Some(message),
                }));
            }
            notified.await;
        }
    }
}

struct QueueDelivery {
    inner: Arc<Inner>,
    queue: String,
    /// `None` once settled.
    message: Option<Message>,
}

impl QueueDelivery {
    fn settle_while_available(&mut self) -> Result<Option<Message>, BrokerError> {
        let paused = self.inner.lock_state().paused;
        if paused {
            // 接続断: drop 時に再キューされる
            return Err(BrokerError::Unavailable("in-memory broker is paused".into()));
        }
        Ok(self.message.take())
    }
}

#[async_trait]
impl Delivery for QueueDelivery {
    fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map_or(&[][..], |message| message.payload.as_slice())
    }

    fn redelivered(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|message| message.redelivered)
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        if self.settle_while_available()?.is_some() {
            self.inner.settle();
        }
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if let Some(message) = self.settle_while_available()? {
            if requeue {
                self.inner.requeue(&self.queue, message.payload);
            } else {
                self.inner.settle();
            }
        }
        Ok(())
    }
}

impl Drop for QueueDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.inner.requeue(&self.queue, message.payload);
        }
    }
}

struct TopicSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for TopicSubscription {
    async fn recv(&mut self) -> Result<Box<dyn Delivery>, BrokerError> {
        match self.rx.recv().await {
            Some(payload) => Ok(Box::new(TopicDelivery { payload })),
            None => Err(BrokerError::Closed(self.topic.clone())),
        }
    }
}

/// Fan-out のメッセージは ack 不要
struct TopicDelivery {
    payload: Vec<u8>,
}

#[async_trait]
impl Delivery for TopicDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        false
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, _requeue: bool) -> Result<(), BrokerError> {
        Ok(())
    }
}
