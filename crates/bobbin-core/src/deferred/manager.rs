//! DeferredManager - deferred task の状態機械を駆動する
//!
//! # 全体像
//! ```text
//! start() ──> store: SCHEDULED ──> queue {ns}_SCHEDULED
//!                                        │ consumer (on_created)
//!                                        v
//!                                  {ns}_SUBMIT_TASK   (attempts -= 1)
//!                                        │
//!                                        v
//!                                  {ns}_WORKER        (run: slot / timeout / panic)
//!                                   │            │
//!                                   v            v
//!                       {ns}_DEFERRED_RESULT   {ns}_ERROR_RESULT ── retry ──> SUBMIT_TASK
//!                        (on_result, purge)       │ attempts exhausted
//!                                                 v
//!                                      {ns}_FINISHED_WITH_ERROR (on_finished_with_error, purge)
//!
//! cancel() ──> store: MANUALLY_CANCELLED ──> {ns}_MANUALLY_CANCELLED (purge)
//!          └─> topic {ns}_CANCEL（実行中の run を全プロセスで止める）
//! ```
//!
//! # 設計原則
//! - store のレコードが正。メッセージは「この状態を処理せよ」という通知にすぎない
//! - 遷移は compare-and-set。負けたメッセージは捨てる
//! - メッセージの状態と store の状態が違う場合は古いメッセージ。
//!   再配送されたメッセージなら、前回の処理が次の publish 前に落ちた可能性があるので
//!   store の状態のキューに publish し直す
//! - ワーカー境界ですべてのエラーを [`TaskResultError`] に変換する。
//!   callback のエラーはログに出すだけ

use super::events::TaskEventLog;
use super::handler::DeferredHandler;
use super::registry::HandlerRegistry;
use super::stats::{DeferredStats, DeferredStatsSnapshot};
use super::status::{TaskCounts, TaskStatus};
use super::tracker::{TaskSchedule, TaskTracker, Tracked};
use super::worker::{RunOutcome, WorkerSlots};
use crate::domain::context::merge;
use crate::domain::{
    BobbinError, BobbinResult, BrokerError, DeferredContext, GlobalsContext, StartContext,
    TaskEvent, TaskEventKind, TaskResult, TaskResultError, TaskState, TaskUid,
};
use crate::ports::{Clock, Delivery, IdGenerator, MessageBroker, Ports, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime knobs of the engine.
#[derive(Debug, Clone)]
pub struct DeferredOptions {
    /// Concurrent `run`s per process.
    pub max_workers: usize,
    /// Back-off before requeueing a message this process cannot take right now.
    pub delay_when_requeuing_message: Duration,
    /// Append a `Status` event on every transition.
    pub emit_status_events: bool,
    pub event_ttl: Duration,
}

impl Default for DeferredOptions {
    fn default() -> Self {
        Self {
            max_workers: 100,
            delay_when_requeuing_message: Duration::from_secs(1),
            emit_status_events: false,
            event_ttl: Duration::from_secs(3600),
        }
    }
}

/// Queue payload: "process `task_uid`, which should be in `state`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskMessage {
    task_uid: TaskUid,
    state: TaskState,
    handler_name: String,
}

/// What to do with a delivery after processing.
enum Settle {
    Ack,
    Requeue,
}

/// DeferredManager は deferred task の公開 API と consumer ループ
///
/// `Clone` は同じエンジンを共有します（内部は `Arc`）。
#[derive(Clone)]
pub struct DeferredManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    namespace: String,
    globals: GlobalsContext,
    registry: HandlerRegistry,
    tracker: TaskTracker,
    events: TaskEventLog,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    slots: WorkerSlots,
    stats: DeferredStats,
    options: DeferredOptions,
}

impl DeferredManager {
    /// `namespace` prefixes every queue and store key of this engine.
    pub fn new(
        namespace: impl Into<String>,
        registry: HandlerRegistry,
        globals: GlobalsContext,
        ports: &Ports,
        options: DeferredOptions,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            inner: Arc::new(ManagerInner {
                tracker: TaskTracker::new(Arc::clone(&ports.store), namespace.clone()),
                events: TaskEventLog::new(
                    Arc::clone(&ports.store),
                    namespace.clone(),
                    options.event_ttl,
                ),
                namespace,
                globals,
                registry,
                broker: Arc::clone(&ports.broker),
                clock: Arc::clone(&ports.clock),
                ids: Arc::clone(&ports.ids),
                slots: WorkerSlots::new(options.max_workers),
                stats: DeferredStats::default(),
                options,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn queue_name(&self, state: TaskState) -> String {
        format!("{}_{}", self.inner.namespace, state.as_str())
    }

    fn cancel_topic(&self) -> String {
        format!("{}_CANCEL", self.inner.namespace)
    }

    pub fn registered_handlers(&self) -> Vec<String> {
        self.inner.registry.registered_names()
    }

    // ========================================
    // 公開 API
    // ========================================

    /// Persists a new task in SCHEDULED and enqueues it. Does not wait for it to run.
    pub async fn start(&self, handler_name: &str, start_context: StartContext) -> BobbinResult<TaskUid> {
        let task_uid = self.inner.ids.generate_task_uid();
        self.start_with_uid(handler_name, task_uid, start_context)
            .await?;
        Ok(task_uid)
    }

    /// Like [`DeferredManager::start`] with a caller-chosen uid.
    ///
    /// Idempotent: returns `false` without creating anything if a record for
    /// `task_uid` already exists. A record still in SCHEDULED is re-announced,
    /// in case the first caller died between saving and publishing.
    pub async fn start_with_uid(
        &self,
        handler_name: &str,
        task_uid: TaskUid,
        start_context: StartContext,
    ) -> BobbinResult<bool> {
        let handler = self.handler(handler_name)?;
        let context = merge(&self.inner.globals, &start_context);
        let now = self.inner.clock.now();
        let record = TaskSchedule {
            task_uid,
            handler_name: handler_name.to_string(),
            state: TaskState::Scheduled,
            start_context,
            execution_attempts: handler.get_retries(&context).saturating_add(1),
            timeout_ms: handler
                .get_timeout(&context)
                .map(|timeout| timeout.as_millis() as u64),
            wait_between_attempts_ms: handler.get_wait_between_attempts(&context).as_millis()
                as u64,
            result: None,
            finalizing: false,
            created_at: now,
            time_started: None,
            updated_at: now,
        };

        if !self.inner.tracker.save_new(&record).await? {
            if let Some(existing) = self.inner.tracker.load(task_uid).await?
                && existing.record.state == TaskState::Scheduled
            {
                self.publish_state(&existing.record).await?;
            }
            debug!(%task_uid, handler = handler_name, "task already exists, start is a no-op");
            return Ok(false);
        }

        self.publish_state(&record).await?;
        self.emit_status(task_uid, TaskState::Scheduled).await;
        debug!(%task_uid, handler = handler_name, attempts = record.execution_attempts, "task scheduled");
        Ok(true)
    }

    /// Moves the task to MANUALLY_CANCELLED and stops a running `run` in any process.
    ///
    /// Calls `on_cancelled` here, once. Returns `false` if the task already
    /// finished or is being finalized. A successful `run` whose result is not yet
    /// consumed (DEFERRED_RESULT) counts as finished: its `on_result` still runs.
    pub async fn cancel(&self, task_uid: TaskUid) -> BobbinResult<bool> {
        let cancelled = loop {
            let Some(tracked) = self.inner.tracker.load(task_uid).await? else {
                return Err(BobbinError::TaskNotFound(task_uid.to_string()));
            };
            if tracked.record.finalizing
                || tracked.record.state.is_terminal()
                || tracked.record.state == TaskState::DeferredResult
            {
                return Ok(false);
            }
            let next = tracked
                .record
                .with_state(TaskState::ManuallyCancelled, self.inner.clock.now());
            if let Some(done) = self.inner.tracker.transition(&tracked, next).await? {
                break done;
            }
        };

        self.inner.slots.cancel(task_uid);
        let notice = serde_json::to_vec(&task_uid)?;
        if let Err(err) = self.inner.broker.broadcast(&self.cancel_topic(), notice).await {
            warn!(%task_uid, error = %err, "could not broadcast cancellation");
        }

        let context = self.deferred_context(&cancelled.record);
        if let Ok(handler) = self.handler(&cancelled.record.handler_name)
            && let Err(err) = handler.on_cancelled(task_uid, &context).await
        {
            error!(%task_uid, error = %err, "on_cancelled failed");
        }

        self.publish_state(&cancelled.record).await?;
        self.emit_status(task_uid, TaskState::ManuallyCancelled).await;
        info!(%task_uid, "task cancelled");
        Ok(true)
    }

    /// `true` until the task is purged after its terminal callback.
    pub async fn is_present(&self, task_uid: TaskUid) -> BobbinResult<bool> {
        self.inner.tracker.exists(task_uid).await
    }

    pub async fn get_task_status(&self, task_uid: TaskUid) -> BobbinResult<TaskStatus> {
        match self.inner.tracker.load(task_uid).await? {
            Some(tracked) => Ok(TaskStatus::from(&tracked.record)),
            None => Err(BobbinError::TaskNotFound(task_uid.to_string())),
        }
    }

    /// Every live task of this namespace, oldest first.
    pub async fn list_tasks(&self) -> BobbinResult<Vec<TaskStatus>> {
        let mut tasks: Vec<TaskStatus> = self
            .inner
            .tracker
            .list()
            .await?
            .iter()
            .map(TaskStatus::from)
            .collect();
        tasks.sort_by_key(|task| task.task_uid);
        Ok(tasks)
    }

    pub async fn task_counts(&self) -> BobbinResult<TaskCounts> {
        let records = self.inner.tracker.list().await?;
        Ok(records.iter().map(|record| record.state).collect())
    }

    /// Appends a `Data` event to the task's stream.
    pub async fn publish_task_event(&self, task_uid: TaskUid, data: Value) -> BobbinResult<TaskEvent> {
        if !self.inner.tracker.exists(task_uid).await? {
            return Err(BobbinError::TaskNotFound(task_uid.to_string()));
        }
        self.inner
            .events
            .publish(task_uid, TaskEventKind::Data(data), self.inner.clock.now())
            .await
    }

    /// Events after `last_id`. Streams outlive the task until their TTL expires.
    pub async fn consume_task_events(
        &self,
        task_uid: TaskUid,
        last_id: Option<u64>,
    ) -> BobbinResult<Vec<TaskEvent>> {
        self.inner.events.consume(task_uid, last_id).await
    }

    pub fn stats(&self) -> DeferredStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn workers_in_use(&self) -> usize {
        self.inner.slots.in_use()
    }

    // ========================================
    // consumer ループ
    // ========================================

    /// Subscribes every state queue plus the cancellation topic and spawns their loops.
    pub async fn spawn_consumers(&self, shutdown: CancellationToken) -> BobbinResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(TaskState::ALL.len() + 1);

        let cancel_sub = self
            .inner
            .broker
            .subscribe_broadcast(&self.cancel_topic())
            .await?;
        handles.push(tokio::spawn(
            self.clone().cancel_listener(cancel_sub, shutdown.clone()),
        ));

        for state in TaskState::ALL {
            let sub = self.inner.broker.subscribe(&self.queue_name(state)).await?;
            handles.push(tokio::spawn(
                self.clone().consume_loop(state, sub, shutdown.clone()),
            ));
        }
        info!(namespace = %self.inner.namespace, "deferred consumers started");
        Ok(handles)
    }

    async fn consume_loop(self, state: TaskState, mut sub: Box<dyn Subscription>, shutdown: CancellationToken) {
        let mut in_flight = JoinSet::new();
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                received = sub.recv() => received,
            };
            match received {
                Ok(delivery) => {
                    let this = self.clone();
                    in_flight.spawn(async move { this.process(state, delivery).await });
                }
                Err(BrokerError::Closed(queue)) => {
                    warn!(%queue, "subscription closed, consumer stops");
                    break;
                }
                Err(err) => {
                    warn!(queue = %self.queue_name(state), error = %err, "receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.options.delay_when_requeuing_message) => {}
                    }
                }
            }
        }
        // in-flight の delivery は drop されて再キューされる
        in_flight.shutdown().await;
        debug!(queue = %self.queue_name(state), "consumer stopped");
    }

    async fn cancel_listener(self, mut sub: Box<dyn Subscription>, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = sub.recv() => received,
            };
            match received {
                Ok(delivery) => {
                    match serde_json::from_slice::<TaskUid>(delivery.payload()) {
                        Ok(task_uid) => {
                            if self.inner.slots.cancel(task_uid) {
                                debug!(%task_uid, "stopped running task after cancellation notice");
                            }
                        }
                        Err(err) => warn!(error = %err, "malformed cancellation notice"),
                    }
                    let _ = delivery.ack().await;
                }
                Err(BrokerError::Closed(_)) => break,
                Err(err) => {
                    warn!(error = %err, "cancellation topic receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.options.delay_when_requeuing_message) => {}
                    }
                }
            }
        }
        // このプロセスで実行中のものは放棄（他プロセスに再配送される）
        self.inner.slots.cancel_all();
    }

    async fn process(&self, state: TaskState, delivery: Box<dyn Delivery>) {
        let message: TaskMessage = match serde_json::from_slice(delivery.payload()) {
            Ok(message) => message,
            Err(err) => {
                error!(queue = %self.queue_name(state), error = %err, "dropping malformed message");
                let _ = delivery.nack(false).await;
                return;
            }
        };
        let redelivered = delivery.redelivered();
        let task_uid = message.task_uid;

        let outcome = match state {
            TaskState::Scheduled => self.on_scheduled(&message, redelivered).await,
            TaskState::SubmitTask => self.on_submit_task(&message, redelivered).await,
            TaskState::Worker => self.on_worker(&message, redelivered).await,
            TaskState::DeferredResult => self.on_deferred_result(&message, redelivered).await,
            TaskState::ErrorResult => self.on_error_result(&message, redelivered).await,
            TaskState::FinishedWithError => self.on_finished_with_error(&message, redelivered).await,
            TaskState::ManuallyCancelled => self.on_manually_cancelled(&message).await,
        };

        let settled = match outcome {
            Ok(Settle::Ack) => delivery.ack().await,
            Ok(Settle::Requeue) => delivery.nack(true).await,
            Err(err) if err.is_retryable() => {
                warn!(%task_uid, %state, error = %err, "transient failure, requeueing");
                tokio::time::sleep(self.inner.options.delay_when_requeuing_message).await;
                delivery.nack(true).await
            }
            Err(err) => {
                error!(%task_uid, %state, error = %err, "dropping message");
                delivery.nack(false).await
            }
        };
        if let Err(err) = settled {
            // 決着できなかったメッセージは broker が再配送する
            warn!(%task_uid, %state, error = %err, "could not settle delivery");
        }
    }

    /// Loads the record if it is in the state the message expects.
    async fn load_expected(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Option<Tracked>> {
        let task_uid = message.task_uid;
        let Some(tracked) = self.inner.tracker.load(task_uid).await? else {
            debug!(%task_uid, state = %message.state, "task no longer present, dropping message");
            return Ok(None);
        };
        let persisted = tracked.record.state;
        if persisted == message.state {
            return Ok(Some(tracked));
        }
        if persisted != TaskState::ManuallyCancelled && redelivered {
            info!(%task_uid, expected = %message.state, %persisted, "stale message, re-publishing persisted state");
            self.publish_state(&tracked.record).await?;
        } else {
            debug!(%task_uid, expected = %message.state, %persisted, "stale message dropped");
        }
        Ok(None)
    }

    async fn on_scheduled(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let Some(tracked) = self.load_expected(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };
        let handler = self.handler(&tracked.record.handler_name)?;
        let context = self.deferred_context(&tracked.record);
        if let Err(err) = handler.on_created(message.task_uid, &context).await {
            error!(task_uid = %message.task_uid, error = %err, "on_created failed");
        }

        let next = tracked
            .record
            .with_state(TaskState::SubmitTask, self.inner.clock.now());
        self.advance(&tracked, next).await
    }

    async fn on_submit_task(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let Some(tracked) = self.load_expected(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };
        let mut next = tracked
            .record
            .with_state(TaskState::Worker, self.inner.clock.now());
        next.execution_attempts = next.execution_attempts.saturating_sub(1);
        self.advance(&tracked, next).await
    }

    async fn on_worker(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let task_uid = message.task_uid;
        let Some(permit) = self.inner.slots.try_acquire() else {
            self.inner.stats.record_requeued_no_slot();
            debug!(%task_uid, "no free worker slot, requeueing");
            tokio::time::sleep(self.inner.options.delay_when_requeuing_message).await;
            return Ok(Settle::Requeue);
        };
        let Some(tracked) = self.load_expected(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };
        let handler = self.handler(&tracked.record.handler_name)?;

        let now = self.inner.clock.now();
        let mut started = tracked.record.with_state(TaskState::Worker, now);
        started.time_started = Some(now);
        let Some(started) = self.inner.tracker.transition(&tracked, started).await? else {
            debug!(%task_uid, "task changed before run, dropping message");
            return Ok(Settle::Ack);
        };

        self.inner.stats.record_run();
        debug!(%task_uid, handler = %started.record.handler_name, attempts_left = started.record.execution_attempts, "running task");
        let context = self.deferred_context(&started.record);
        let outcome = self
            .inner
            .slots
            .execute(permit, task_uid, handler, context, started.record.timeout())
            .await;

        let result = match outcome {
            RunOutcome::Cancelled => {
                debug!(%task_uid, "run cancelled, result discarded");
                return Ok(Settle::Ack);
            }
            RunOutcome::Completed(result) => result,
        };
        let next_state = match &result {
            TaskResult::Success { .. } => TaskState::DeferredResult,
            TaskResult::Error { error } => {
                warn!(%task_uid, error = %error, "run failed");
                TaskState::ErrorResult
            }
            TaskResult::Cancelled => return Ok(Settle::Ack),
        };
        let mut next = started.record.with_state(next_state, self.inner.clock.now());
        next.result = Some(result);
        match self.inner.tracker.transition(&started, next).await? {
            Some(done) => {
                self.publish_state(&done.record).await?;
                self.emit_status(task_uid, next_state).await;
            }
            None => debug!(%task_uid, "task cancelled or purged during run, result discarded"),
        }
        Ok(Settle::Ack)
    }

    async fn on_deferred_result(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let Some(claimed) = self.claim_finalization(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };
        let task_uid = message.task_uid;
        let handler = self.handler(&claimed.record.handler_name)?;
        let context = self.deferred_context(&claimed.record);
        let value = match &claimed.record.result {
            Some(TaskResult::Success { value }) => value.clone(),
            _ => Value::Null,
        };
        if let Err(err) = handler.on_result(value, &context).await {
            error!(%task_uid, error = %err, "on_result failed");
        }
        self.inner.tracker.remove(task_uid).await?;
        self.inner.stats.record_result();
        debug!(%task_uid, "task finished");
        Ok(Settle::Ack)
    }

    async fn on_error_result(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let task_uid = message.task_uid;
        let Some(tracked) = self.load_expected(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };

        if tracked.record.execution_attempts == 0 {
            let next = tracked
                .record
                .with_state(TaskState::FinishedWithError, self.inner.clock.now());
            return self.advance(&tracked, next).await;
        }

        tokio::time::sleep(tracked.record.wait_between_attempts()).await;
        // 待っている間に cancel されていないか確認
        let Some(tracked) = self.load_expected(message, false).await? else {
            return Ok(Settle::Ack);
        };
        let mut next = tracked
            .record
            .with_state(TaskState::SubmitTask, self.inner.clock.now());
        next.result = None;
        match self.inner.tracker.transition(&tracked, next).await? {
            Some(done) => {
                info!(%task_uid, attempts_left = done.record.execution_attempts, "Schedule retry attempt for task_uid={task_uid}");
                self.inner.stats.record_retry();
                self.publish_state(&done.record).await?;
                self.emit_status(task_uid, TaskState::SubmitTask).await;
            }
            None => debug!(%task_uid, "task changed while waiting to retry"),
        }
        Ok(Settle::Ack)
    }

    async fn on_finished_with_error(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Settle> {
        let Some(claimed) = self.claim_finalization(message, redelivered).await? else {
            return Ok(Settle::Ack);
        };
        let task_uid = message.task_uid;
        let handler = self.handler(&claimed.record.handler_name)?;
        let context = self.deferred_context(&claimed.record);
        let error = match &claimed.record.result {
            Some(TaskResult::Error { error }) => error.clone(),
            _ => TaskResultError::new(
                crate::domain::FailureKind::Failed,
                "UnknownError",
                "task finished with error but no error was recorded",
            ),
        };
        warn!(%task_uid, error = %error, "task finished with error");
        if let Err(err) = handler.on_finished_with_error(error, &context).await {
            error!(%task_uid, error = %err, "on_finished_with_error failed");
        }
        self.inner.tracker.remove(task_uid).await?;
        self.inner.stats.record_finished_with_error();
        Ok(Settle::Ack)
    }

    async fn on_manually_cancelled(&self, message: &TaskMessage) -> BobbinResult<Settle> {
        let task_uid = message.task_uid;
        if let Some(tracked) = self.inner.tracker.load(task_uid).await?
            && tracked.record.state == TaskState::ManuallyCancelled
        {
            self.inner.tracker.remove(task_uid).await?;
            self.inner.stats.record_cancelled();
            debug!(%task_uid, "cancelled task purged");
        }
        Ok(Settle::Ack)
    }

    /// Marks the record `finalizing` so the terminal callback wins over `cancel`.
    ///
    /// A redelivered message finds it already claimed and runs the callback again.
    async fn claim_finalization(&self, message: &TaskMessage, redelivered: bool) -> BobbinResult<Option<Tracked>> {
        let Some(tracked) = self.load_expected(message, redelivered).await? else {
            return Ok(None);
        };
        if tracked.record.finalizing {
            return Ok(Some(tracked));
        }
        let mut next = tracked.record.clone();
        next.finalizing = true;
        next.updated_at = self.inner.clock.now();
        let claimed = self.inner.tracker.transition(&tracked, next).await?;
        if claimed.is_none() {
            debug!(task_uid = %message.task_uid, "task changed before finalization, dropping message");
        }
        Ok(claimed)
    }

    /// Compare-and-set to `next`, then announce it on `next.state`'s queue.
    async fn advance(&self, current: &Tracked, next: TaskSchedule) -> BobbinResult<Settle> {
        let task_uid = next.task_uid;
        let state = next.state;
        match self.inner.tracker.transition(current, next).await? {
            Some(done) => {
                self.publish_state(&done.record).await?;
                self.emit_status(task_uid, state).await;
                debug!(%task_uid, %state, "task advanced");
            }
            None => debug!(%task_uid, %state, "lost transition race, dropping message"),
        }
        Ok(Settle::Ack)
    }

    async fn publish_state(&self, record: &TaskSchedule) -> BobbinResult<()> {
        let message = TaskMessage {
            task_uid: record.task_uid,
            state: record.state,
            handler_name: record.handler_name.clone(),
        };
        let payload = serde_json::to_vec(&message)?;
        self.inner
            .broker
            .publish(&self.queue_name(record.state), payload)
            .await?;
        Ok(())
    }

    async fn emit_status(&self, task_uid: TaskUid, state: TaskState) {
        if !self.inner.options.emit_status_events {
            return;
        }
        if let Err(err) = self
            .inner
            .events
            .publish(task_uid, TaskEventKind::Status(state), self.inner.clock.now())
            .await
        {
            warn!(%task_uid, %state, error = %err, "could not record status event");
        }
    }

    fn handler(&self, name: &str) -> BobbinResult<Arc<dyn DeferredHandler>> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| BobbinError::HandlerNotFound(name.to_string()))
    }

    fn deferred_context(&self, record: &TaskSchedule) -> DeferredContext {
        merge(&self.inner.globals, &record.start_context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BoxError;
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        runs: AtomicU32,
        results: AtomicU32,
        errors: AtomicU32,
        fail_first: u32,
        retries: u32,
    }

    #[async_trait]
    impl DeferredHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn get_retries(&self, _context: &DeferredContext) -> u32 {
            self.retries
        }

        async fn run(&self, context: &DeferredContext) -> Result<Value, BoxError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= self.fail_first {
                return Err(format!("attempt {run} failed").into());
            }
            Ok(json!({"echo": context.get("x").cloned().unwrap_or(Value::Null)}))
        }

        async fn on_result(&self, _result: Value, _context: &DeferredContext) -> Result<(), BoxError> {
            self.results.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_finished_with_error(
            &self,
            _error: TaskResultError,
            _context: &DeferredContext,
        ) -> Result<(), BoxError> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(handler: Arc<Counting>, store: &InMemoryStore) -> DeferredManager {
        let ports = Ports {
            store: Arc::new(store.clone()),
            broker: Arc::new(InMemoryBroker::new()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        };
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        DeferredManager::new("test", registry, Map::new(), &ports, DeferredOptions::default())
    }

    async fn wait_until_gone(manager: &DeferredManager, uid: TaskUid) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.is_present(uid).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not finish");
    }

    #[tokio::test]
    async fn queue_names_are_namespaced() {
        let manager = manager(Arc::new(Counting::default()), &InMemoryStore::new());
        assert_eq!(manager.queue_name(TaskState::SubmitTask), "test_SUBMIT_TASK");
    }

    #[tokio::test]
    async fn start_is_non_blocking_and_present_until_result() {
        let handler = Arc::new(Counting::default());
        let store = InMemoryStore::new();
        let manager = manager(Arc::clone(&handler), &store);

        let uid = manager.start("counting", Map::new()).await.unwrap();
        assert!(manager.is_present(uid).await.unwrap());
        assert_eq!(
            manager.get_task_status(uid).await.unwrap().state,
            TaskState::Scheduled
        );

        let shutdown = CancellationToken::new();
        manager.spawn_consumers(shutdown.clone()).await.unwrap();
        wait_until_gone(&manager, uid).await;
        shutdown.cancel();

        assert_eq!(handler.results.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_is_rejected() {
        let manager = manager(Arc::new(Counting::default()), &InMemoryStore::new());
        let err = manager.start("missing", Map::new()).await.unwrap_err();
        assert!(matches!(err, BobbinError::HandlerNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn start_with_uid_is_idempotent() {
        let manager = manager(Arc::new(Counting::default()), &InMemoryStore::new());
        let uid = TaskUid::from_ulid(ulid::Ulid::new());

        assert!(manager.start_with_uid("counting", uid, Map::new()).await.unwrap());
        assert!(!manager.start_with_uid("counting", uid, Map::new()).await.unwrap());
        assert_eq!(manager.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let handler = Arc::new(Counting {
            fail_first: 2,
            retries: 3,
            ..Counting::default()
        });
        let store = InMemoryStore::new();
        let manager = manager(Arc::clone(&handler), &store);
        let shutdown = CancellationToken::new();
        manager.spawn_consumers(shutdown.clone()).await.unwrap();

        let uid = manager.start("counting", Map::new()).await.unwrap();
        wait_until_gone(&manager, uid).await;
        shutdown.cancel();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert_eq!(handler.results.load(Ordering::SeqCst), 1);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().retries_scheduled, 2);
    }

    #[tokio::test]
    async fn cancel_before_run_skips_everything() {
        let handler = Arc::new(Counting::default());
        let store = InMemoryStore::new();
        let manager = manager(Arc::clone(&handler), &store);

        let uid = manager.start("counting", Map::new()).await.unwrap();
        assert!(manager.cancel(uid).await.unwrap());
        assert!(!manager.cancel(uid).await.unwrap());

        let shutdown = CancellationToken::new();
        manager.spawn_consumers(shutdown.clone()).await.unwrap();
        wait_until_gone(&manager, uid).await;
        shutdown.cancel();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(handler.results.load(Ordering::SeqCst), 0);
        assert!(matches!(
            manager.cancel(uid).await,
            Err(BobbinError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn produced_result_is_not_cancelled() {
        let handler = Arc::new(Counting::default());
        let store = InMemoryStore::new();
        let manager = manager(Arc::clone(&handler), &store);

        let uid = manager.start("counting", Map::new()).await.unwrap();
        let tracked = manager.inner.tracker.load(uid).await.unwrap().unwrap();
        let mut produced = tracked.record.with_state(TaskState::DeferredResult, chrono::Utc::now());
        produced.result = Some(TaskResult::Success { value: json!(1) });
        manager
            .inner
            .tracker
            .transition(&tracked, produced)
            .await
            .unwrap()
            .unwrap();

        assert!(!manager.cancel(uid).await.unwrap());
        assert_eq!(
            manager.get_task_status(uid).await.unwrap().state,
            TaskState::DeferredResult
        );

        // 結果は on_result まで届く
        let shutdown = CancellationToken::new();
        manager.spawn_consumers(shutdown.clone()).await.unwrap();
        let tracked = manager.inner.tracker.load(uid).await.unwrap().unwrap();
        manager.publish_state(&tracked.record).await.unwrap();
        wait_until_gone(&manager, uid).await;
        shutdown.cancel();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(handler.results.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn task_events_round_trip() {
        let store = InMemoryStore::new();
        let manager = manager(Arc::new(Counting::default()), &store);
        let uid = manager.start("counting", Map::new()).await.unwrap();

        let first = manager
            .publish_task_event(uid, json!({"progress": 10}))
            .await
            .unwrap();
        manager
            .publish_task_event(uid, json!({"progress": 20}))
            .await
            .unwrap();

        let newer = manager.consume_task_events(uid, Some(first.id)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].kind, TaskEventKind::Data(json!({"progress": 20})));
    }

    #[tokio::test]
    async fn counts_group_live_tasks_by_state() {
        let store = InMemoryStore::new();
        let manager = manager(Arc::new(Counting::default()), &store);
        manager.start("counting", Map::new()).await.unwrap();
        manager.start("counting", Map::new()).await.unwrap();

        let counts = manager.task_counts().await.unwrap();
        assert_eq!(counts.scheduled, 2);
        assert_eq!(counts.total(), 2);
    }
}
