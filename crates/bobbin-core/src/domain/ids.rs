//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! TaskUid と ScheduleId は ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//! Phantom type パターンで実装を共有しつつ、型としては区別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: 複数プロセスが調整なしで生成できる（Store のキーが衝突しない）
//!
//! ## 文字列表現
//! Store のキーやログでは `task-01H...` / `schedule-01H...` のようにプレフィックス付きで表示します。
//! serde ではプレフィックスなしの ULID 文字列としてシリアライズします。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "schedule-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "task-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// コンパイル時に型安全性を提供します。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// ParseIdError は文字列から ID への変換エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{input}': expected '{prefix}<ulid>'")]
pub struct ParseIdError {
    pub input: String,
    pub prefix: &'static str,
}

/// プレフィックス付き（Display 形式）とプレフィックスなし（serde 形式）の両方を受け付ける
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                input: s.to_string(),
                prefix: T::prefix(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Deferred task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Schedule（Operation の実行インスタンス）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Schedule {}

impl IdMarker for Schedule {
    fn prefix() -> &'static str {
        "schedule-"
    }
}

// ========================================
// Type Alias（使いやすさのため）
// ========================================

/// Identifier of one deferred-task instance.
pub type TaskUid = Id<Task>;

/// Identifier of one Operation execution (a schedule).
pub type ScheduleId = Id<Schedule>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let task = TaskUid::from_ulid(ulid1);
        let schedule = ScheduleId::from_ulid(ulid2);

        assert_eq!(task.as_ulid(), ulid1);
        assert_eq!(schedule.as_ulid(), ulid2);

        assert!(task.to_string().starts_with("task-"));
        assert!(schedule.to_string().starts_with("schedule-"));

        // let _: TaskUid = schedule; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = ScheduleId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = ScheduleId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id3 = ScheduleId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id2 < id3);
    }

    #[test]
    fn ids_serialize_as_bare_ulid_string() {
        let ulid = Ulid::new();
        let task_uid = TaskUid::from_ulid(ulid);

        let serialized = serde_json::to_string(&task_uid).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));

        let deserialized: TaskUid = serde_json::from_str(&serialized).unwrap();
        assert_eq!(task_uid, deserialized);
    }

    #[test]
    fn parse_accepts_display_form_and_bare_ulid() {
        let id = ScheduleId::from_ulid(Ulid::new());

        let from_display: ScheduleId = id.to_string().parse().unwrap();
        let from_bare: ScheduleId = id.as_ulid().to_string().parse().unwrap();

        assert_eq!(from_display, id);
        assert_eq!(from_bare, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "schedule-not-a-ulid".parse::<ScheduleId>().unwrap_err();
        assert_eq!(err.prefix, "schedule-");
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<TaskUid>(), size_of::<Ulid>());
        assert_eq!(size_of::<ScheduleId>(), size_of::<Ulid>());
    }
}
