//! Scheduler - operation を StepGroup 単位で前進 / 巻き戻しする
//!
//! # 全体像
//! ```text
//! start_operation ──> ScheduleRecord（CREATING, group 0）──> {ns}_schedule_events
//!
//! event consumer（任意のプロセス）:
//!   lock(schedule) ─> advance ─> unlock
//!     CREATING : group の step を投入 → 全員終了を待つ → 全成功なら次の group
//!                失敗 / cancel / mark_for_removal なら REVERTING へ
//!     REVERTING: 作成済みの step だけ revert → 前の group へ → group 0 を越えたら REVERTED
//!     終端     : 連鎖 operation を開始 → purge → outcome を broadcast
//! ```
//!
//! step の完了は StepRunner が `{ns}_schedule_events` に通知するので、
//! advance は「今の状態から進められるところまで進めて戻る」だけです（ブロックしない）。
//!
//! # 設計原則
//! - ScheduleRecord は store が正。advance は何度呼ばれても同じ結果に収束する
//! - schedule ごとの排他ロックを持っている間だけ ScheduleRecord を書く
//! - ロックが取れなければ transient エラー。イベントは少し待って再キューされる
//! - recovery worker が非終端の schedule を定期的に再投入する（プロセスが落ちても進む）

use super::operation::{Operation, OperationToStart, StartOptions};
use super::outcome::{OutcomeCache, ScheduleOutcome};
use super::registry::OperationRegistry;
use super::runner::{STEP_HANDLER_NAME, ScheduleEvent, StepTaskContext};
use super::status::OperationStatus;
use super::step::Step;
use super::store::{ScheduleRecord, ScheduleStore, StepFailure, StepKey, StepRecord};
use crate::deferred::DeferredManager;
use crate::domain::context::{OPERATION_NAME_KEY, SCHEDULE_ID_KEY, merge, missing_keys, select};
use crate::domain::{
    BobbinError, BobbinResult, BrokerError, FailureKind, OperationContext, RegistrationError,
    ScheduleDirection, ScheduleId, ScheduleState, StepStatus, TaskResultError,
};
use crate::ports::{Clock, Delivery, IdGenerator, MessageBroker, Ports, Subscription};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Runtime knobs of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Lease of the per-schedule lock; a crashed holder blocks the schedule at most this long.
    pub lock_lease: Duration,
    pub lock_retry_delay: Duration,
    pub recovery_interval: Duration,
    pub outcome_cache_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(30),
            lock_retry_delay: Duration::from_millis(100),
            recovery_interval: Duration::from_secs(5),
            outcome_cache_size: 1024,
        }
    }
}

/// What `advance` should do after one direction step.
enum Progress {
    /// The record moved on; look at it again.
    Continue,
    /// Waiting for step tasks or a timer; a later event resumes it.
    Wait,
}

/// The held schedule lock. Every record write renews it first.
struct Lease {
    schedule_id: ScheduleId,
    token: String,
}

/// How long `wait_for_outcome` waits for the broadcast of a schedule that is
/// neither in the store nor in the outcome cache before giving up on it.
const MISSING_OUTCOME_GRACE: Duration = Duration::from_secs(2);

/// Scheduler は generic saga scheduler の公開 API と consumer ループ
///
/// `Clone` は同じ scheduler を共有します。
pub struct Scheduler<A>
where
    A: Send + Sync + 'static,
{
    inner: Arc<SchedulerInner<A>>,
}

impl<A> Clone for Scheduler<A>
where
    A: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SchedulerInner<A>
where
    A: Send + Sync + 'static,
{
    namespace: String,
    operations: Arc<OperationRegistry<A>>,
    store: Arc<ScheduleStore>,
    deferred: DeferredManager,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    outcomes: OutcomeCache,
    options: SchedulerOptions,
    /// Stops delayed events (repeat timers) when the process shuts down.
    shutdown: CancellationToken,
}

/// Queue carrying [`ScheduleEvent`]s.
pub fn events_queue(namespace: &str) -> String {
    format!("{namespace}_schedule_events")
}

fn outcomes_topic(namespace: &str) -> String {
    format!("{namespace}_schedule_outcomes")
}

impl<A> Scheduler<A>
where
    A: Send + Sync + 'static,
{
    pub fn new(
        namespace: impl Into<String>,
        operations: Arc<OperationRegistry<A>>,
        store: Arc<ScheduleStore>,
        deferred: DeferredManager,
        ports: &Ports,
        options: SchedulerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                namespace: namespace.into(),
                operations,
                store,
                deferred,
                broker: Arc::clone(&ports.broker),
                clock: Arc::clone(&ports.clock),
                ids: Arc::clone(&ports.ids),
                outcomes: OutcomeCache::new(options.outcome_cache_size),
                options,
                shutdown,
            }),
        }
    }

    pub fn operations(&self) -> &OperationRegistry<A> {
        &self.inner.operations
    }

    // ========================================
    // 公開 API
    // ========================================

    /// Low-level start: no chaining.
    pub async fn create(&self, operation_name: &str, initial_context: OperationContext) -> BobbinResult<ScheduleId> {
        self.start_operation(operation_name, initial_context, StartOptions::default())
            .await
    }

    /// Persists a new schedule and enqueues its first advancement. Returns immediately.
    pub async fn start_operation(
        &self,
        operation_name: &str,
        initial_context: OperationContext,
        options: StartOptions,
    ) -> BobbinResult<ScheduleId> {
        for next in [&options.on_create_completed, &options.on_undo_completed]
            .into_iter()
            .flatten()
        {
            if !self.inner.operations.contains(&next.operation_name) {
                return Err(BobbinError::OperationNotFound(next.operation_name.clone()));
            }
        }
        let schedule_id = self.inner.ids.generate_schedule_id();
        self.create_with_id(schedule_id, operation_name, initial_context, options)
            .await?;
        Ok(schedule_id)
    }

    /// Idempotent on `schedule_id`: an existing record is only re-announced.
    async fn create_with_id(
        &self,
        schedule_id: ScheduleId,
        operation_name: &str,
        initial_context: OperationContext,
        options: StartOptions,
    ) -> BobbinResult<()> {
        let operation = self.operation(operation_name)?;
        let missing = missing_keys(
            &initial_context,
            operation
                .initial_context_required_keys()
                .iter()
                .map(String::as_str),
        );
        if !missing.is_empty() {
            return Err(BobbinError::InvalidContext(format!(
                "operation '{operation_name}' requires initial keys {missing:?}"
            )));
        }

        let mut record = ScheduleRecord::new(
            schedule_id,
            operation_name,
            initial_context,
            self.inner.clock.now(),
        );
        record.on_create_completed = options.on_create_completed;
        record.on_undo_completed = options.on_undo_completed;
        if self.inner.store.create(&record).await? {
            info!(%schedule_id, operation = operation_name, "schedule created");
        }
        self.enqueue(schedule_id, operation_name).await
    }

    /// Stops the schedule: in-flight create hooks are cancelled, then everything created is reverted.
    ///
    /// Idempotent while reverting. Refused while a step waits for manual intervention.
    pub async fn cancel(&self, schedule_id: ScheduleId) -> BobbinResult<()> {
        let record = self.load_live(schedule_id).await?;
        let operation = self.operation(&record.operation_name)?;
        if !operation.is_cancellable() {
            return Err(BobbinError::NotCancellable(record.operation_name));
        }
        let record = self
            .update_locked(schedule_id, |record| {
                if record.state == ScheduleState::Creating {
                    record.cancel_requested = true;
                }
            })
            .await?;
        if record.state == ScheduleState::WaitingManualIntervention {
            return Err(BobbinError::CannotCancelWhileWaitingForManualIntervention(
                schedule_id.to_string(),
            ));
        }
        info!(%schedule_id, operation = %record.operation_name, "schedule cancellation requested");
        self.enqueue(schedule_id, &record.operation_name).await
    }

    /// Like [`Scheduler::cancel`] but lets in-flight hooks finish. Also stops a repeating group.
    pub async fn mark_for_removal(&self, schedule_id: ScheduleId) -> BobbinResult<()> {
        let record = self
            .update_locked(schedule_id, |record| {
                if record.state == ScheduleState::Creating {
                    record.removal_requested = true;
                }
            })
            .await?;
        if record.state == ScheduleState::WaitingManualIntervention {
            return Err(BobbinError::CannotCancelWhileWaitingForManualIntervention(
                schedule_id.to_string(),
            ));
        }
        info!(%schedule_id, operation = %record.operation_name, "schedule marked for removal");
        self.enqueue(schedule_id, &record.operation_name).await
    }

    /// Re-runs a create hook parked by [`Step::wait_for_manual_intervention`].
    ///
    /// The schedule goes back to `Creating`; a step that fails again parks it again.
    pub async fn restart_step_stuck_in_manual_intervention(
        &self,
        schedule_id: ScheduleId,
        step_name: &str,
    ) -> BobbinResult<()> {
        let not_waiting = || BobbinError::StepNotWaitingForManualIntervention {
            schedule: schedule_id.to_string(),
            step: step_name.to_string(),
        };
        let lease = self.acquire_waiting(schedule_id).await?;
        let result = async {
            let mut record = self.load_live(schedule_id).await?;
            if record.state != ScheduleState::WaitingManualIntervention {
                return Err(not_waiting());
            }
            let key = step_key(&record, ScheduleDirection::Creating, record.group_index, step_name);
            let parked = self
                .inner
                .store
                .load_step(&key)
                .await?
                .is_some_and(|step| step.requires_manual_intervention && step.status == StepStatus::Failed);
            if !parked {
                return Err(not_waiting());
            }
            self.reset_step(&key).await?;
            record.state = ScheduleState::Creating;
            record.failure = None;
            self.save(&lease, &mut record).await?;
            Ok::<_, BobbinError>(record)
        }
        .await;
        self.release(lease).await;

        let record = result?;
        info!(%schedule_id, step = step_name, "step restarted after manual intervention");
        self.enqueue(schedule_id, &record.operation_name).await
    }

    /// Re-runs the failed revert hook of a `RevertFailed` schedule; reverting continues from there.
    pub async fn restart_step_stuck_during_revert(
        &self,
        schedule_id: ScheduleId,
        step_name: &str,
    ) -> BobbinResult<()> {
        let not_failed = || BobbinError::StepNotInErrorState {
            schedule: schedule_id.to_string(),
            step: step_name.to_string(),
        };
        let lease = self.acquire_waiting(schedule_id).await?;
        let result = async {
            let mut record = self.load_live(schedule_id).await?;
            if record.state != ScheduleState::RevertFailed {
                return Err(not_failed());
            }
            let key = step_key(&record, ScheduleDirection::Reverting, record.group_index, step_name);
            let failed = self
                .inner
                .store
                .load_step(&key)
                .await?
                .is_some_and(|step| matches!(step.status, StepStatus::Failed | StepStatus::Cancelled));
            if !failed {
                return Err(not_failed());
            }
            self.reset_step(&key).await?;
            record.state = ScheduleState::Reverting;
            record.failure = None;
            self.save(&lease, &mut record).await?;
            Ok::<_, BobbinError>(record)
        }
        .await;
        self.release(lease).await;

        let record = result?;
        info!(%schedule_id, step = step_name, "revert step restarted");
        self.enqueue(schedule_id, &record.operation_name).await
    }

    /// Follow-up started when this schedule finishes creating.
    pub async fn register_to_start_after_create(
        &self,
        schedule_id: ScheduleId,
        next: OperationToStart,
    ) -> BobbinResult<()> {
        self.operation(&next.operation_name)?;
        self.update_locked(schedule_id, move |record| {
            record.on_create_completed = Some(next.clone());
        })
        .await?;
        Ok(())
    }

    /// Follow-up started when this schedule finishes reverting.
    pub async fn register_to_start_after_undo(
        &self,
        schedule_id: ScheduleId,
        next: OperationToStart,
    ) -> BobbinResult<()> {
        self.operation(&next.operation_name)?;
        self.update_locked(schedule_id, move |record| {
            record.on_undo_completed = Some(next.clone());
        })
        .await?;
        Ok(())
    }

    /// Live record first, then the outcome cache for purged schedules.
    pub async fn get_status(&self, schedule_id: ScheduleId) -> BobbinResult<OperationStatus> {
        if let Some(record) = self.inner.store.load(schedule_id).await? {
            return Ok(OperationStatus::from(&record));
        }
        self.inner
            .outcomes
            .get(schedule_id)
            .map(OperationStatus::from)
            .ok_or_else(|| BobbinError::ScheduleNotFound(schedule_id.to_string()))
    }

    /// Resolves when the schedule reaches `Finished`, `Reverted` or `RevertFailed`.
    ///
    /// A schedule that is neither stored nor cached (unknown, or its outcome was evicted)
    /// fails with `ScheduleNotFound` once a short grace period for the broadcast elapses.
    pub async fn wait_for_outcome(&self, schedule_id: ScheduleId) -> BobbinResult<ScheduleOutcome> {
        let mut missing_since: Option<tokio::time::Instant> = None;
        loop {
            let changed = self.inner.outcomes.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let recheck = match self.inner.store.load(schedule_id).await? {
                Some(record) if record.state == ScheduleState::RevertFailed => {
                    return Ok(ScheduleOutcome::from(&record));
                }
                Some(_) => {
                    missing_since = None;
                    self.inner.options.recovery_interval
                }
                None => match self.inner.outcomes.get(schedule_id) {
                    Some(outcome) if outcome.state != ScheduleState::RevertFailed => return Ok(outcome),
                    // RevertFailed のまま消えた = 再開された revert の結果がまだ届いていない
                    Some(_) => self.inner.options.recovery_interval,
                    None => {
                        let since = *missing_since.get_or_insert_with(tokio::time::Instant::now);
                        let left = MISSING_OUTCOME_GRACE.saturating_sub(since.elapsed());
                        if left.is_zero() {
                            return Err(BobbinError::ScheduleNotFound(schedule_id.to_string()));
                        }
                        left
                    }
                },
            };
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(recheck) => {}
            }
        }
    }

    /// Every schedule still in the store, oldest first.
    pub async fn list_schedules(&self) -> BobbinResult<Vec<OperationStatus>> {
        let mut records = self.inner.store.list().await?;
        records.sort_by_key(|record| record.schedule_id);
        Ok(records.iter().map(OperationStatus::from).collect())
    }

    /// Refuses while a non-terminal schedule still runs the operation.
    ///
    /// The store is checked again after the operation left this process's registry, and the
    /// operation is put back if a schedule appeared in between. Other processes keep their own
    /// registries, so across processes this stays best-effort: unregister everywhere.
    pub async fn unregister_operation(&self, operation_name: &str) -> BobbinResult<()> {
        self.ensure_unused(operation_name).await?;
        let operation = self
            .inner
            .operations
            .unregister(operation_name)
            .ok_or_else(|| BobbinError::OperationNotFound(operation_name.to_string()))?;
        if let Err(err) = self.ensure_unused(operation_name).await {
            self.inner.operations.reinstate(operation_name, operation);
            warn!(operation = operation_name, error = %err, "operation put back, a schedule started while unregistering");
            return Err(err);
        }
        info!(operation = operation_name, "operation unregistered");
        Ok(())
    }

    async fn ensure_unused(&self, operation_name: &str) -> BobbinResult<()> {
        let in_use = self
            .inner
            .store
            .list()
            .await?
            .iter()
            .filter(|record| record.operation_name == operation_name && !record.state.is_terminal())
            .count();
        if in_use > 0 {
            return Err(RegistrationError::OperationInUse {
                operation: operation_name.to_string(),
                schedules: in_use,
            }
            .into());
        }
        Ok(())
    }

    // ========================================
    // ループ
    // ========================================

    /// Spawns the event consumer, the outcome listener and the recovery worker.
    pub async fn spawn_workers(&self, shutdown: CancellationToken) -> BobbinResult<Vec<JoinHandle<()>>> {
        let events = self
            .inner
            .broker
            .subscribe(&events_queue(&self.inner.namespace))
            .await?;
        let outcomes = self
            .inner
            .broker
            .subscribe_broadcast(&outcomes_topic(&self.inner.namespace))
            .await?;
        Ok(vec![
            tokio::spawn(self.clone().event_loop(events, shutdown.clone())),
            tokio::spawn(self.clone().outcome_loop(outcomes, shutdown.clone())),
            tokio::spawn(self.clone().recovery_loop(shutdown)),
        ])
    }

    async fn event_loop(self, mut sub: Box<dyn Subscription>, shutdown: CancellationToken) {
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
                    in_flight.spawn(async move { this.process_event(delivery).await });
                }
                Err(BrokerError::Closed(_)) => break,
                Err(err) => {
                    warn!(error = %err, "schedule event receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.options.lock_retry_delay) => {}
                    }
                }
            }
        }
        in_flight.shutdown().await;
        debug!("schedule event consumer stopped");
    }

    async fn process_event(&self, delivery: Box<dyn Delivery>) {
        let event: ScheduleEvent = match serde_json::from_slice(delivery.payload()) {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "dropping malformed schedule event");
                let _ = delivery.nack(false).await;
                return;
            }
        };
        let schedule_id = event.schedule_id;
        let settled = match self.handle_event(schedule_id).await {
            Ok(()) => delivery.ack().await,
            Err(BobbinError::ScheduleLockNotAcquired(_)) => {
                debug!(%schedule_id, "schedule locked elsewhere, retrying later");
                tokio::time::sleep(self.inner.options.lock_retry_delay).await;
                delivery.nack(true).await
            }
            Err(err) if err.is_retryable() => {
                warn!(%schedule_id, error = %err, "transient failure while advancing schedule");
                tokio::time::sleep(self.inner.options.lock_retry_delay).await;
                delivery.nack(true).await
            }
            Err(err) => {
                error!(%schedule_id, operation = %event.operation_name, error = %err, "cannot advance schedule, dropping event");
                delivery.nack(false).await
            }
        };
        if let Err(err) = settled {
            warn!(%schedule_id, error = %err, "could not settle schedule event");
        }
    }

    async fn outcome_loop(self, mut sub: Box<dyn Subscription>, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = sub.recv() => received,
            };
            match received {
                Ok(delivery) => {
                    match serde_json::from_slice::<ScheduleOutcome>(delivery.payload()) {
                        Ok(outcome) => self.inner.outcomes.insert(outcome),
                        Err(err) => warn!(error = %err, "malformed schedule outcome"),
                    }
                    let _ = delivery.ack().await;
                }
                Err(BrokerError::Closed(_)) => break,
                Err(err) => {
                    warn!(error = %err, "outcome topic receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.options.lock_retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn recovery_loop(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.options.recovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.recover().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "re-enqueued unfinished schedules"),
                Err(err) => warn!(error = %err, "schedule recovery pass failed"),
            }
        }
    }

    /// Re-enqueues every schedule that can still make progress.
    pub async fn recover(&self) -> BobbinResult<usize> {
        let now = self.inner.clock.now();
        let mut count = 0;
        for record in self.inner.store.list().await? {
            // 手動で再開されるまで止まっている
            if matches!(
                record.state,
                ScheduleState::RevertFailed | ScheduleState::WaitingManualIntervention
            ) {
                continue;
            }
            // repeat 待ちはタイマーを持つプロセスに任せる（期限を過ぎたら拾う）
            if !record.stop_requested()
                && record.repeat_not_before.is_some_and(|not_before| not_before > now)
            {
                continue;
            }
            self.enqueue(record.schedule_id, &record.operation_name)
                .await?;
            count += 1;
        }
        Ok(count)
    }

    // ========================================
    // advance
    // ========================================

    async fn handle_event(&self, schedule_id: ScheduleId) -> BobbinResult<()> {
        let Some(lease) = self.acquire(schedule_id).await? else {
            return Err(BobbinError::ScheduleLockNotAcquired(schedule_id.to_string()));
        };
        let result = self.advance(&lease).await;
        self.release(lease).await;
        result
    }

    async fn advance(&self, lease: &Lease) -> BobbinResult<()> {
        let schedule_id = lease.schedule_id;
        let Some(mut record) = self.inner.store.load(schedule_id).await? else {
            debug!(%schedule_id, "schedule no longer present");
            return Ok(());
        };
        match record.state {
            ScheduleState::RevertFailed | ScheduleState::WaitingManualIntervention => return Ok(()),
            // 前回 purge の前に落ちた
            ScheduleState::Finished | ScheduleState::Reverted => {
                let state = record.state;
                return self.finalize(lease, &mut record, state).await;
            }
            ScheduleState::Creating | ScheduleState::Reverting => {}
        }
        let operation = self.operation(&record.operation_name)?;

        loop {
            let progress = match record.direction {
                ScheduleDirection::Creating => self.advance_create(lease, &operation, &mut record).await?,
                ScheduleDirection::Reverting => self.advance_revert(lease, &operation, &mut record).await?,
            };
            if let Progress::Wait = progress {
                return Ok(());
            }
        }
    }

    async fn advance_create(
        &self,
        lease: &Lease,
        operation: &Operation<A>,
        record: &mut ScheduleRecord,
    ) -> BobbinResult<Progress> {
        let index = record.group_index;
        let Some(group) = operation.group(index) else {
            self.finalize(lease, record, ScheduleState::Finished).await?;
            return Ok(Progress::Wait);
        };

        if let Some(not_before) = record.repeat_not_before
            && !record.stop_requested()
        {
            let now = self.inner.clock.now();
            if not_before > now {
                let delay = (not_before - now).to_std().unwrap_or_default();
                self.enqueue_after(record, delay);
                return Ok(Progress::Wait);
            }
            record.repeat_not_before = None;
            self.save(lease, record).await?;
        }

        let mut steps = Vec::with_capacity(group.steps().len());
        for step in group.steps() {
            let name = step.name();
            let key = step_key(record, ScheduleDirection::Creating, index, &name);
            let current = match self.inner.store.load_step(&key).await? {
                None if record.stop_requested() => None,
                None => Some(self.start_step(record, step.as_ref(), &key).await?),
                Some(existing) if needs_submit(&existing) => {
                    Some(self.start_step(record, step.as_ref(), &key).await?)
                }
                Some(existing) => Some(existing),
            };
            steps.push((name, current));
        }

        if record.cancel_requested {
            steps = self.cancel_in_flight(record, index, steps).await?;
        }

        if steps
            .iter()
            .any(|(_, step)| step.as_ref().is_some_and(|s| !s.status.is_done()))
        {
            return Ok(Progress::Wait);
        }

        let mut failure = None;
        for (name, step) in &steps {
            let Some(step) = step else { continue };
            match step.status {
                StepStatus::Success => {
                    if let Some(provided) = &step.provided {
                        record.operation_context = merge(&record.operation_context, provided);
                    }
                    record
                        .created_steps
                        .insert(ScheduleRecord::step_ref(index, name));
                }
                StepStatus::Failed | StepStatus::Cancelled
                    if failure.is_none()
                        && (step.status == StepStatus::Failed || !record.stop_requested()) =>
                {
                    failure = Some(create_failure(group.label(index), name, step));
                }
                _ => {}
            }
        }

        // operator を待つ step が失敗したら revert せずに止まる
        let parked: Vec<(&String, &StepRecord)> = steps
            .iter()
            .filter_map(|(name, step)| step.as_ref().map(|step| (name, step)))
            .filter(|(name, step)| {
                step.status == StepStatus::Failed
                    && group
                        .find(name)
                        .is_some_and(|hook| hook.wait_for_manual_intervention())
            })
            .collect();
        if !parked.is_empty() && !record.stop_requested() {
            for (name, _) in &parked {
                let key = step_key(record, ScheduleDirection::Creating, index, name);
                self.inner
                    .store
                    .update_step(&key, |step| {
                        if step.requires_manual_intervention {
                            return false;
                        }
                        step.requires_manual_intervention = true;
                        true
                    })
                    .await?;
            }
            let names: Vec<&str> = parked.iter().map(|(name, _)| name.as_str()).collect();
            let (name, step) = parked[0];
            record.failure = Some(create_failure(group.label(index), name, step));
            record.state = ScheduleState::WaitingManualIntervention;
            self.save(lease, record).await?;
            warn!(schedule_id = %record.schedule_id, group = %group.label(index), steps = ?names, "create failed, waiting for manual intervention");
            return Ok(Progress::Wait);
        }

        if failure.is_some() || record.stop_requested() {
            if let Some(failure) = &failure {
                warn!(schedule_id = %record.schedule_id, group = %failure.group, step = %failure.step, error = %failure.error, "step failed, reverting schedule");
            } else {
                info!(schedule_id = %record.schedule_id, "schedule stopped, reverting");
            }
            if record.failure.is_none() {
                record.failure = failure;
            }
            record.direction = ScheduleDirection::Reverting;
            record.state = ScheduleState::Reverting;
            record.repeat_not_before = None;
            self.save(lease, record).await?;
            return Ok(Progress::Continue);
        }

        if let Some(wait) = group.wait_before_repeat() {
            self.inner
                .store
                .clear_group_steps(record.schedule_id, ScheduleDirection::Creating, index)
                .await?;
            record.repeat_not_before =
                Some(self.inner.clock.now() + chrono::Duration::from_std(wait).unwrap_or_default());
            self.save(lease, record).await?;
            debug!(schedule_id = %record.schedule_id, group = %group.label(index), ?wait, "repeating group scheduled");
            self.enqueue_after(record, wait);
            return Ok(Progress::Wait);
        }

        debug!(schedule_id = %record.schedule_id, group = %group.label(index), "group created");
        record.group_index += 1;
        self.save(lease, record).await?;
        Ok(Progress::Continue)
    }

    async fn advance_revert(
        &self,
        lease: &Lease,
        operation: &Operation<A>,
        record: &mut ScheduleRecord,
    ) -> BobbinResult<Progress> {
        let last = operation.groups().len().saturating_sub(1);
        if record.group_index > last {
            record.group_index = last;
        }
        let index = record.group_index;
        let Some(group) = operation.group(index) else {
            self.finalize(lease, record, ScheduleState::Reverted).await?;
            return Ok(Progress::Wait);
        };

        let created: Vec<&Arc<dyn Step<A>>> = group
            .steps()
            .iter()
            .filter(|step| {
                record
                    .created_steps
                    .contains(&ScheduleRecord::step_ref(index, &step.name()))
            })
            .collect();
        if created.is_empty() {
            return self.previous_group(lease, record).await;
        }

        let mut steps = Vec::with_capacity(created.len());
        for step in created {
            let name = step.name();
            let key = step_key(record, ScheduleDirection::Reverting, index, &name);
            let current = match self.inner.store.load_step(&key).await? {
                Some(existing) if !needs_submit(&existing) => existing,
                _ => self.start_step(record, step.as_ref(), &key).await?,
            };
            steps.push((name, current));
        }

        if steps.iter().any(|(_, step)| !step.status.is_done()) {
            return Ok(Progress::Wait);
        }

        if let Some((name, failed)) = steps
            .iter()
            .find(|(_, step)| step.status != StepStatus::Success)
        {
            let failure = StepFailure {
                group: group.label(index),
                step: name.clone(),
                direction: ScheduleDirection::Reverting,
                error: failed.error.clone().unwrap_or_else(|| {
                    TaskResultError::new(FailureKind::Failed, "Cancelled", "revert was cancelled")
                }),
            };
            error!(schedule_id = %record.schedule_id, group = %failure.group, step = %failure.step, error = %failure.error, "revert failed, schedule parked");
            record.failure = Some(failure);
            record.state = ScheduleState::RevertFailed;
            self.save(lease, record).await?;
            self.publish_outcome(ScheduleOutcome::from(&*record)).await;
            return Ok(Progress::Wait);
        }

        for (name, step) in &steps {
            if let Some(provided) = &step.provided {
                record.operation_context = merge(&record.operation_context, provided);
            }
            record
                .created_steps
                .remove(&ScheduleRecord::step_ref(index, name));
        }
        debug!(schedule_id = %record.schedule_id, group = %group.label(index), "group reverted");
        self.previous_group(lease, record).await
    }

    async fn previous_group(&self, lease: &Lease, record: &mut ScheduleRecord) -> BobbinResult<Progress> {
        if record.group_index == 0 {
            self.finalize(lease, record, ScheduleState::Reverted).await?;
            return Ok(Progress::Wait);
        }
        record.group_index -= 1;
        self.save(lease, record).await?;
        Ok(Progress::Continue)
    }

    /// Creates the step record (if needed) and submits its deferred task exactly once.
    async fn start_step(&self, record: &ScheduleRecord, step: &dyn Step<A>, key: &StepKey<'_>) -> BobbinResult<StepRecord> {
        let current = match self.inner.store.load_step(key).await? {
            Some(existing) => existing,
            None => {
                let fresh = StepRecord::scheduled(self.inner.ids.generate_task_uid());
                if self.inner.store.create_step(key, &fresh).await? {
                    fresh
                } else {
                    self.inner
                        .store
                        .load_step(key)
                        .await?
                        .unwrap_or(fresh)
                }
            }
        };
        if !needs_submit(&current) {
            return Ok(current);
        }
        let task_uid = current.task_uid;

        let (requires, policy) = match key.direction {
            ScheduleDirection::Creating => (step.create_requires(), step.create_policy()),
            ScheduleDirection::Reverting => (step.revert_requires(), step.revert_policy()),
        };
        let mut required = select(&record.operation_context, requires.iter().copied());
        required.insert(SCHEDULE_ID_KEY.to_string(), json!(record.schedule_id.to_string()));
        required.insert(OPERATION_NAME_KEY.to_string(), json!(record.operation_name));
        let missing = missing_keys(&required, requires.iter().copied());
        if !missing.is_empty() {
            let error = TaskResultError::new(
                FailureKind::Failed,
                "InvalidContext",
                format!("missing required keys {missing:?}"),
            );
            warn!(schedule_id = %record.schedule_id, step = %key.step_name, error = %error, "step cannot start");
            self.inner
                .store
                .update_step(key, |step| {
                    if step.task_uid != task_uid || step.status.is_done() {
                        return false;
                    }
                    step.status = StepStatus::Failed;
                    step.error = Some(error.clone());
                    true
                })
                .await?;
            return Ok(self.inner.store.load_step(key).await?.unwrap_or(current));
        }

        let task = StepTaskContext {
            schedule_id: record.schedule_id,
            operation_name: record.operation_name.clone(),
            group_index: key.group_index,
            step_name: key.step_name.to_string(),
            direction: key.direction,
            task_uid,
            required,
            policy,
        };
        self.inner
            .deferred
            .start_with_uid(STEP_HANDLER_NAME, task_uid, task.to_start_context()?)
            .await?;
        self.inner
            .store
            .update_step(key, |step| {
                if step.task_uid != task_uid || !needs_submit(step) {
                    return false;
                }
                step.deferred_created = true;
                true
            })
            .await?;
        debug!(schedule_id = %record.schedule_id, step = %key.step_name, direction = %key.direction, %task_uid, "step submitted");
        Ok(self.inner.store.load_step(key).await?.unwrap_or(current))
    }

    /// Cancels the deferred task of every unfinished step and returns the refreshed records.
    async fn cancel_in_flight(
        &self,
        record: &ScheduleRecord,
        index: usize,
        steps: Vec<(String, Option<StepRecord>)>,
    ) -> BobbinResult<Vec<(String, Option<StepRecord>)>> {
        let mut refreshed = Vec::with_capacity(steps.len());
        for (name, step) in steps {
            let step = match step {
                Some(step) if !step.status.is_done() => step,
                other => {
                    refreshed.push((name, other));
                    continue;
                }
            };
            let key = step_key(record, ScheduleDirection::Creating, index, &name);
            let task_uid = step.task_uid;
            match self.inner.deferred.cancel(task_uid).await {
                Ok(true) => debug!(schedule_id = %record.schedule_id, step = %name, %task_uid, "step task cancelled"),
                // run はもう終わっている。step は結果の callback で決着する
                Ok(false) => debug!(schedule_id = %record.schedule_id, step = %name, %task_uid, "step already produced its result"),
                Err(BobbinError::TaskNotFound(_)) => {
                    self.inner
                        .store
                        .update_step(&key, |step| {
                            if step.task_uid != task_uid || step.status.is_done() {
                                return false;
                            }
                            step.status = StepStatus::Cancelled;
                            true
                        })
                        .await?;
                }
                Err(err) => return Err(err),
            }
            let current = self.inner.store.load_step(&key).await?;
            refreshed.push((name, current));
        }
        Ok(refreshed)
    }

    /// Persists the terminal state, starts the chained operation, purges and announces.
    async fn finalize(&self, lease: &Lease, record: &mut ScheduleRecord, state: ScheduleState) -> BobbinResult<()> {
        let schedule_id = record.schedule_id;
        record.state = state;
        let chained = match state {
            ScheduleState::Finished => record.on_create_completed.clone(),
            ScheduleState::Reverted => record.on_undo_completed.clone(),
            _ => None,
        };
        if chained.is_some() && record.follow_up.is_none() {
            record.follow_up = Some(self.inner.ids.generate_schedule_id());
        }
        self.save(lease, record).await?;

        if let (Some(next), Some(follow_up)) = (chained, record.follow_up) {
            match self
                .create_with_id(
                    follow_up,
                    &next.operation_name,
                    next.initial_context,
                    StartOptions::default(),
                )
                .await
            {
                Ok(()) => info!(%schedule_id, %follow_up, operation = %next.operation_name, "chained operation started"),
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => error!(%schedule_id, operation = %next.operation_name, error = %err, "chained operation could not start"),
            }
        }

        let outcome = ScheduleOutcome::from(&*record);
        self.inner.store.purge(schedule_id).await?;
        info!(%schedule_id, operation = %record.operation_name, state = ?state, "schedule finished");
        self.publish_outcome(outcome).await;
        Ok(())
    }

    async fn publish_outcome(&self, outcome: ScheduleOutcome) {
        self.inner.outcomes.insert(outcome.clone());
        let payload = match serde_json::to_vec(&outcome) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not encode schedule outcome");
                return;
            }
        };
        if let Err(err) = self
            .inner
            .broker
            .broadcast(&outcomes_topic(&self.inner.namespace), payload)
            .await
        {
            warn!(schedule_id = %outcome.schedule_id, error = %err, "could not broadcast schedule outcome");
        }
    }

    // ========================================
    // helpers
    // ========================================

    async fn enqueue(&self, schedule_id: ScheduleId, operation_name: &str) -> BobbinResult<()> {
        let event = ScheduleEvent {
            schedule_id,
            operation_name: operation_name.to_string(),
        };
        self.inner
            .broker
            .publish(&events_queue(&self.inner.namespace), serde_json::to_vec(&event)?)
            .await?;
        Ok(())
    }

    /// Enqueues an event after `delay` unless the process shuts down first.
    fn enqueue_after(&self, record: &ScheduleRecord, delay: Duration) {
        let this = self.clone();
        let schedule_id = record.schedule_id;
        let operation_name = record.operation_name.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = this.enqueue(schedule_id, &operation_name).await {
                        warn!(%schedule_id, error = %err, "could not enqueue delayed schedule event");
                    }
                }
            }
        });
    }

    /// Renews the lease, then overwrites the record. A lost lease skips the write.
    async fn save(&self, lease: &Lease, record: &mut ScheduleRecord) -> BobbinResult<()> {
        let schedule_id = lease.schedule_id;
        if !self
            .inner
            .store
            .renew(schedule_id, &lease.token, self.inner.options.lock_lease)
            .await?
        {
            warn!(%schedule_id, "schedule lock lease expired, record not saved");
            return Err(BobbinError::ScheduleLockLost(schedule_id.to_string()));
        }
        record.updated_at = self.inner.clock.now();
        self.inner.store.save(record).await
    }

    /// Fresh task uid and status so the next advance submits the hook again.
    async fn reset_step(&self, key: &StepKey<'_>) -> BobbinResult<()> {
        let task_uid = self.inner.ids.generate_task_uid();
        self.inner
            .store
            .update_step(key, |step| {
                *step = StepRecord::scheduled(task_uid);
                true
            })
            .await?;
        Ok(())
    }

    fn operation(&self, name: &str) -> BobbinResult<Arc<Operation<A>>> {
        self.inner
            .operations
            .get(name)
            .ok_or_else(|| BobbinError::OperationNotFound(name.to_string()))
    }

    async fn load_live(&self, schedule_id: ScheduleId) -> BobbinResult<ScheduleRecord> {
        self.inner
            .store
            .load(schedule_id)
            .await?
            .ok_or_else(|| BobbinError::ScheduleNotFound(schedule_id.to_string()))
    }

    /// One attempt at the schedule lock.
    async fn acquire(&self, schedule_id: ScheduleId) -> BobbinResult<Option<Lease>> {
        let token = Ulid::new().to_string();
        let locked = self
            .inner
            .store
            .lock(schedule_id, &token, self.inner.options.lock_lease)
            .await?;
        Ok(locked.then_some(Lease { schedule_id, token }))
    }

    /// Retries the schedule lock until one lease length has passed.
    async fn acquire_waiting(&self, schedule_id: ScheduleId) -> BobbinResult<Lease> {
        let deadline = tokio::time::Instant::now() + self.inner.options.lock_lease;
        loop {
            if let Some(lease) = self.acquire(schedule_id).await? {
                return Ok(lease);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BobbinError::ScheduleLockNotAcquired(schedule_id.to_string()));
            }
            tokio::time::sleep(self.inner.options.lock_retry_delay).await;
        }
    }

    async fn release(&self, lease: Lease) {
        if let Err(err) = self.inner.store.unlock(lease.schedule_id, &lease.token).await {
            warn!(schedule_id = %lease.schedule_id, error = %err, "could not release schedule lock");
        }
    }

    /// Read-modify-write of the record under the schedule lock.
    async fn update_locked<F>(&self, schedule_id: ScheduleId, mut update: F) -> BobbinResult<ScheduleRecord>
    where
        F: FnMut(&mut ScheduleRecord) + Send,
    {
        let lease = self.acquire_waiting(schedule_id).await?;
        let result = async {
            let mut record = self.load_live(schedule_id).await?;
            update(&mut record);
            self.save(&lease, &mut record).await?;
            Ok::<_, BobbinError>(record)
        }
        .await;
        self.release(lease).await;
        result
    }
}

fn step_key<'a>(
    record: &ScheduleRecord,
    direction: ScheduleDirection,
    group_index: usize,
    step_name: &'a str,
) -> StepKey<'a> {
    StepKey {
        schedule_id: record.schedule_id,
        direction,
        group_index,
        step_name,
    }
}

/// Created but its deferred task may not have been submitted yet.
fn needs_submit(step: &StepRecord) -> bool {
    step.status == StepStatus::Scheduled && !step.deferred_created
}

fn create_failure(group: String, step_name: &str, step: &StepRecord) -> StepFailure {
    StepFailure {
        group,
        step: step_name.to_string(),
        direction: ScheduleDirection::Creating,
        error: step.error.clone().unwrap_or_else(|| {
            TaskResultError::new(FailureKind::Failed, "Cancelled", "step was cancelled")
        }),
    }
}

impl<A> std::fmt::Debug for Scheduler<A>
where
    A: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("namespace", &self.inner.namespace)
            .field("operations", &self.inner.operations.names())
            .finish()
    }
}
