//! TaskTracker - deferred task のレコードを store に保存する
//!
//! # キー
//! - `{namespace}:task:{task_uid}` → [`TaskSchedule`]（JSON）
//!
//! # 設計原則
//! - 新規作成は `set_if_absent`（同じ uid の二重投入は no-op）
//! - 状態遷移は読み出した生の値との compare-and-set
//!   （cancel と worker の結果書き込みが競合しても、どちらか一方だけが勝つ）

use crate::domain::{
    BobbinError, BobbinResult, StartContext, TaskResult, TaskState, TaskUid,
};
use crate::ports::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// TaskSchedule は 1 つの deferred task の永続レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub task_uid: TaskUid,
    pub handler_name: String,
    pub state: TaskState,
    pub start_context: StartContext,

    /// Remaining `run` attempts (`retries + 1` at creation, decremented on SUBMIT_TASK).
    pub execution_attempts: u32,
    pub timeout_ms: Option<u64>,
    pub wait_between_attempts_ms: u64,

    pub result: Option<TaskResult>,

    /// Set once a terminal callback has been claimed; cancellation no longer applies.
    #[serde(default)]
    pub finalizing: bool,

    pub created_at: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSchedule {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_between_attempts(&self) -> Duration {
        Duration::from_millis(self.wait_between_attempts_ms)
    }

    /// Copy with a new state and `updated_at`.
    pub fn with_state(&self, state: TaskState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// A record together with the raw value it was read from.
#[derive(Debug, Clone)]
pub struct Tracked {
    pub record: TaskSchedule,
    raw: String,
}

pub struct TaskTracker {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn key(&self, task_uid: TaskUid) -> String {
        format!("{}:task:{}", self.namespace, task_uid)
    }

    fn prefix(&self) -> String {
        format!("{}:task:", self.namespace)
    }

    /// Returns `false` if a record for the uid already exists.
    pub async fn save_new(&self, record: &TaskSchedule) -> BobbinResult<bool> {
        let raw = serde_json::to_string(record)?;
        Ok(self
            .store
            .set_if_absent(&self.key(record.task_uid), &raw, None)
            .await?)
    }

    pub async fn load(&self, task_uid: TaskUid) -> BobbinResult<Option<Tracked>> {
        let Some(raw) = self.store.get(&self.key(task_uid)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)?;
        Ok(Some(Tracked { record, raw }))
    }

    pub async fn exists(&self, task_uid: TaskUid) -> BobbinResult<bool> {
        Ok(self.store.get(&self.key(task_uid)).await?.is_some())
    }

    /// Compare-and-set against `current`. `None` means someone else changed the record first.
    pub async fn transition(
        &self,
        current: &Tracked,
        next: TaskSchedule,
    ) -> BobbinResult<Option<Tracked>> {
        let raw = serde_json::to_string(&next)?;
        let swapped = self
            .store
            .set_if_equals(&self.key(next.task_uid), &current.raw, &raw)
            .await?;
        Ok(swapped.then_some(Tracked { record: next, raw }))
    }

    pub async fn remove(&self, task_uid: TaskUid) -> BobbinResult<()> {
        self.store.delete(&[self.key(task_uid)]).await?;
        Ok(())
    }

    /// Every task record in the namespace. Records deleted mid-scan are skipped.
    pub async fn list(&self) -> BobbinResult<Vec<TaskSchedule>> {
        let keys = self.store.scan_prefix(&self.prefix()).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store.get(&key).await? {
                records.push(serde_json::from_str(&raw).map_err(BobbinError::from)?);
            }
        }
        Ok(records)
    }
}
