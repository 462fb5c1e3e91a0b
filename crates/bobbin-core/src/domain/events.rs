//! Task events - task ごとの補助イベントストリーム
//!
//! handler は実行中に `Data` イベントを publish でき、エンジンは設定に応じて
//! 状態遷移ごとに `Status` イベントを追加します。
//! 読み手は `last_id` カーソルで途中から再開できます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::TaskUid;
use super::state::TaskState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventKind {
    Data(Value),
    Status(TaskState),
}

/// One entry of a task's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonic per task; pass the last seen value as the `last_id` cursor.
    pub id: u64,
    pub task_uid: TaskUid,
    pub kind: TaskEventKind,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    #[test]
    fn event_kinds_are_tagged() {
        let event = TaskEvent {
            id: 3,
            task_uid: TaskUid::from_ulid(Ulid::new()),
            kind: TaskEventKind::Status(TaskState::Worker),
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], json!({"type": "STATUS", "payload": "WORKER"}));

        let data = serde_json::to_value(TaskEventKind::Data(json!({"progress": 0.5}))).unwrap();
        assert_eq!(data["type"], "DATA");
    }
}
