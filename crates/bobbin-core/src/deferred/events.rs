//! TaskEventLog - task ごとのイベントストリーム（store 上に保存）
//!
//! # キー
//! - `{namespace}:events:{task_uid}:seq` → 連番カウンタ
//! - `{namespace}:events:{task_uid}:{seq:020}` → [`TaskEvent`]（JSON）
//!
//! すべてのキーに TTL を付けるので、task が purge されたあとも
//! しばらくは読めて、最終的には消えます。

use crate::domain::{BobbinResult, TaskEvent, TaskEventKind, TaskUid};
use crate::ports::KeyValueStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub struct TaskEventLog {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    ttl: Duration,
}

impl TaskEventLog {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
        }
    }

    fn prefix(&self, task_uid: TaskUid) -> String {
        format!("{}:events:{}:", self.namespace, task_uid)
    }

    pub async fn publish(
        &self,
        task_uid: TaskUid,
        kind: TaskEventKind,
        now: DateTime<Utc>,
    ) -> BobbinResult<TaskEvent> {
        let prefix = self.prefix(task_uid);
        let seq_key = format!("{prefix}seq");
        let id = self.store.incr(&seq_key).await?.max(0) as u64;
        self.store.expire(&seq_key, self.ttl).await?;

        let event = TaskEvent {
            id,
            task_uid,
            kind,
            created_at: now,
        };
        let raw = serde_json::to_string(&event)?;
        self.store
            .set(&format!("{prefix}{id:020}"), &raw, Some(self.ttl))
            .await?;
        Ok(event)
    }

    /// Events with `id > last_id`, oldest first.
    pub async fn consume(
        &self,
        task_uid: TaskUid,
        last_id: Option<u64>,
    ) -> BobbinResult<Vec<TaskEvent>> {
        let prefix = self.prefix(task_uid);
        let after = last_id.unwrap_or(0);
        let keys = self.store.scan_prefix(&prefix).await?;

        let mut events = Vec::new();
        for key in keys {
            let Ok(id) = key[prefix.len()..].parse::<u64>() else {
                continue;
            };
            if id <= after {
                continue;
            }
            if let Some(raw) = self.store.get(&key).await? {
                events.push(serde_json::from_str::<TaskEvent>(&raw)?);
            }
        }
        events.sort_by_key(|event| event.id);
        Ok(events)
    }
}
