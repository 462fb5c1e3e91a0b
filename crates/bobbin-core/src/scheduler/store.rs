//! ScheduleStore - schedule の永続化
//!
//! # キー構成
//! ```text
//! {ns}:schedule:{id}                                 ScheduleRecord
//! {ns}:schedule:{id}:step:{dir}:{group}:{step}       StepRecord
//! {ns}:schedule:{id}:lock                            排他ロック（lease 付き）
//! ```
//! schedule に属するキーはすべて `{ns}:schedule:{id}` で始まるので、
//! 終端に達したら `delete_prefix` 1 回で消せます。
//!
//! # 設計原則
//! - ScheduleRecord の書き込みはロックを持つプロセスだけ
//! - StepRecord は step runner（任意のプロセス）も書くので compare-and-set で更新する

use crate::domain::{
    BobbinResult, OperationContext, OperationName, ProvidedOperationContext, ScheduleDirection,
    ScheduleId, ScheduleState, StepStatus, TaskResultError, TaskUid,
};
use crate::ports::KeyValueStore;
use crate::scheduler::operation::OperationToStart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Which step failed and why; attached to the schedule for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub group: String,
    pub step: String,
    pub direction: ScheduleDirection,
    pub error: TaskResultError,
}

/// ScheduleRecord は 1 つの schedule の進捗（source of truth）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
    pub operation_context: OperationContext,
    pub group_index: usize,
    pub direction: ScheduleDirection,
    pub state: ScheduleState,
    /// In-flight create hooks are cancelled, then the schedule reverts.
    pub cancel_requested: bool,
    /// In-flight hooks finish, then the schedule reverts.
    pub removal_requested: bool,
    /// `"{group}:{step}"` of every step whose create hook succeeded and is not yet reverted.
    pub created_steps: BTreeSet<String>,
    pub failure: Option<StepFailure>,
    pub on_create_completed: Option<OperationToStart>,
    pub on_undo_completed: Option<OperationToStart>,
    /// Id reserved for the chained follow-up, so re-running the finalization does not start it twice.
    pub follow_up: Option<ScheduleId>,
    /// A repeating group waits until this instant before its next run.
    pub repeat_not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn new(
        schedule_id: ScheduleId,
        operation_name: impl Into<OperationName>,
        operation_context: OperationContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_id,
            operation_name: operation_name.into(),
            operation_context,
            group_index: 0,
            direction: ScheduleDirection::Creating,
            state: ScheduleState::Creating,
            cancel_requested: false,
            removal_requested: false,
            created_steps: BTreeSet::new(),
            failure: None,
            on_create_completed: None,
            on_undo_completed: None,
            follow_up: None,
            repeat_not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel_requested || self.removal_requested
    }

    pub fn step_ref(group_index: usize, step_name: &str) -> String {
        format!("{group_index}:{step_name}")
    }
}

/// StepRecord は 1 つの hook 実行（= 1 つの deferred task）の状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_uid: TaskUid,
    /// The deferred task was submitted; re-submission is skipped.
    pub deferred_created: bool,
    pub status: StepStatus,
    pub provided: Option<ProvidedOperationContext>,
    pub error: Option<TaskResultError>,
    /// Failed create hook parked until an operator restarts it.
    #[serde(default)]
    pub requires_manual_intervention: bool,
}

impl StepRecord {
    pub fn scheduled(task_uid: TaskUid) -> Self {
        Self {
            task_uid,
            deferred_created: false,
            status: StepStatus::Scheduled,
            provided: None,
            error: None,
            requires_manual_intervention: false,
        }
    }
}

/// Address of one hook run inside a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepKey<'a> {
    pub schedule_id: ScheduleId,
    pub direction: ScheduleDirection,
    pub group_index: usize,
    pub step_name: &'a str,
}

pub struct ScheduleStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl ScheduleStore {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn list_prefix(&self) -> String {
        format!("{}:schedule:", self.namespace)
    }

    /// Every key of the schedule starts with this.
    pub fn schedule_prefix(&self, schedule_id: ScheduleId) -> String {
        format!("{}:schedule:{}", self.namespace, schedule_id)
    }

    pub fn record_key(&self, schedule_id: ScheduleId) -> String {
        self.schedule_prefix(schedule_id)
    }

    fn lock_key(&self, schedule_id: ScheduleId) -> String {
        format!("{}:lock", self.schedule_prefix(schedule_id))
    }

    fn group_steps_prefix(&self, schedule_id: ScheduleId, direction: ScheduleDirection, group_index: usize) -> String {
        format!(
            "{}:step:{}:{}:",
            self.schedule_prefix(schedule_id),
            direction.as_str(),
            group_index
        )
    }

    fn step_key(&self, key: &StepKey<'_>) -> String {
        format!(
            "{}{}",
            self.group_steps_prefix(key.schedule_id, key.direction, key.group_index),
            key.step_name
        )
    }

    /// Returns `false` if the id is taken.
    pub async fn create(&self, record: &ScheduleRecord) -> BobbinResult<bool> {
        let raw = serde_json::to_string(record)?;
        Ok(self
            .store
            .set_if_absent(&self.record_key(record.schedule_id), &raw, None)
            .await?)
    }

    pub async fn load(&self, schedule_id: ScheduleId) -> BobbinResult<Option<ScheduleRecord>> {
        match self.store.get(&self.record_key(schedule_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Overwrites the record. Only the lock holder calls this.
    pub async fn save(&self, record: &ScheduleRecord) -> BobbinResult<()> {
        let raw = serde_json::to_string(record)?;
        self.store
            .set(&self.record_key(record.schedule_id), &raw, None)
            .await?;
        Ok(())
    }

    pub async fn load_step(&self, key: &StepKey<'_>) -> BobbinResult<Option<StepRecord>> {
        match self.store.get(&self.step_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Writes a fresh step record. Returns `false` if one already exists.
    pub async fn create_step(&self, key: &StepKey<'_>, record: &StepRecord) -> BobbinResult<bool> {
        let raw = serde_json::to_string(record)?;
        Ok(self
            .store
            .set_if_absent(&self.step_key(key), &raw, None)
            .await?)
    }

    /// Compare-and-set loop over an existing step record.
    ///
    /// `update` returns `false` to leave the record unchanged.
    /// Returns whether a write happened; a missing record is never recreated.
    pub async fn update_step<F>(&self, key: &StepKey<'_>, mut update: F) -> BobbinResult<bool>
    where
        F: FnMut(&mut StepRecord) -> bool + Send,
    {
        let step_key = self.step_key(key);
        loop {
            let Some(raw) = self.store.get(&step_key).await? else {
                return Ok(false);
            };
            let mut record: StepRecord = serde_json::from_str(&raw)?;
            if !update(&mut record) {
                return Ok(false);
            }
            let next = serde_json::to_string(&record)?;
            if self.store.set_if_equals(&step_key, &raw, &next).await? {
                return Ok(true);
            }
        }
    }

    /// Drops the step records of one group (a repeating group's next run starts clean).
    pub async fn clear_group_steps(
        &self,
        schedule_id: ScheduleId,
        direction: ScheduleDirection,
        group_index: usize,
    ) -> BobbinResult<usize> {
        Ok(self
            .store
            .delete_prefix(&self.group_steps_prefix(schedule_id, direction, group_index))
            .await?)
    }

    /// Removes every key of the schedule, its lock included.
    pub async fn purge(&self, schedule_id: ScheduleId) -> BobbinResult<usize> {
        Ok(self
            .store
            .delete_prefix(&self.schedule_prefix(schedule_id))
            .await?)
    }

    /// Ids of every schedule record in the namespace.
    pub async fn list_ids(&self) -> BobbinResult<Vec<ScheduleId>> {
        let prefix = self.list_prefix();
        let keys = self.store.scan_prefix(&prefix).await?;
        Ok(keys
            .iter()
            .map(|key| &key[prefix.len()..])
            .filter(|rest| !rest.contains(':'))
            .filter_map(|rest| rest.parse().ok())
            .collect())
    }

    pub async fn list(&self) -> BobbinResult<Vec<ScheduleRecord>> {
        let mut records = Vec::new();
        for schedule_id in self.list_ids().await? {
            if let Some(record) = self.load(schedule_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn lock(&self, schedule_id: ScheduleId, token: &str, lease: Duration) -> BobbinResult<bool> {
        Ok(self
            .store
            .acquire_lock(&self.lock_key(schedule_id), token, lease)
            .await?)
    }

    pub async fn unlock(&self, schedule_id: ScheduleId, token: &str) -> BobbinResult<bool> {
        Ok(self
            .store
            .release_lock(&self.lock_key(schedule_id), token)
            .await?)
    }

    /// Extends the lease. `false` means another process may own the schedule now.
    pub async fn renew(&self, schedule_id: ScheduleId, token: &str, lease: Duration) -> BobbinResult<bool> {
        Ok(self
            .store
            .renew_lock(&self.lock_key(schedule_id), token, lease)
            .await?)
    }
}
