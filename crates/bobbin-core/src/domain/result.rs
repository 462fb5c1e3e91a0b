//! Task results that cross the queue boundary.
//!
//! handler のエラーオブジェクトそのものはプロセスの外に出しません。
//! 分類（kind）・型名・メッセージだけを [`TaskResultError`] に写して store に保存します。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// How a `run` ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `run` returned an error.
    Failed,
    /// `run` exceeded its timeout.
    Timeout,
    /// `run` panicked.
    Panicked,
}

/// TaskResultError は失敗の分類（型名 + メッセージ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultError {
    pub kind: FailureKind,
    pub error_type: String,
    pub message: String,
}

impl TaskResultError {
    pub fn new(kind: FailureKind, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Classifies an error returned by a handler.
    ///
    /// The type name is recovered from the error's `Debug` output
    /// (`MyError { .. }` / `Variant(..)`); plain string errors become `"Error"`.
    pub fn from_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Self {
        Self::new(FailureKind::Failed, error_type_of(err), err.to_string())
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            "TimeoutError",
            format!("run did not finish within {after:?}"),
        )
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Panicked, "Panic", message)
    }
}

impl fmt::Display for TaskResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for TaskResultError {}

fn error_type_of(err: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    if let Some(known) = err.downcast_ref::<TaskResultError>() {
        return known.error_type.clone();
    }
    let debug = format!("{err:?}");
    let ident: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        "Error".to_string()
    } else {
        ident
    }
}

/// TaskResult は `run` の結果（store に保存される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Success { value: Value },
    Error { error: TaskResultError },
    Cancelled,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }
}
