//! DeferredHandler - deferred task の実装側 trait
//!
//! # ライフサイクル
//! 1. `on_created`: SCHEDULED を消費したとき（1 回、再配送時は再度呼ばれうる）
//! 2. `run`: WORKER で実行（リトライごとに 1 回）
//! 3. 終端で `on_result` / `on_finished_with_error` / `on_cancelled` のどれか 1 つ
//!
//! # 使用例
//! ```ignore
//! struct Resize;
//!
//! #[async_trait]
//! impl DeferredHandler for Resize {
//!     fn name(&self) -> &str {
//!         "images.resize"
//!     }
//!
//!     fn get_retries(&self, _ctx: &DeferredContext) -> u32 {
//!         3
//!     }
//!
//!     async fn run(&self, ctx: &DeferredContext) -> Result<Value, BoxError> {
//!         Ok(json!({"resized": ctx["path"]}))
//!     }
//! }
//! ```

use crate::domain::{BoxError, DeferredContext, TaskResultError, TaskUid};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// DeferredHandler は名前付きの unit of work
///
/// `run` が返したエラーはワーカー境界で [`TaskResultError`] に変換されます。
/// callback（`on_*`）のエラーはログに出るだけで、状態遷移には影響しません。
///
/// # Object Safety
/// - `Arc<dyn DeferredHandler>` として registry に格納する
#[async_trait]
pub trait DeferredHandler: Send + Sync + 'static {
    /// Registry key. Unique per manager.
    fn name(&self) -> &str;

    /// Extra attempts after the first `run`.
    fn get_retries(&self, _context: &DeferredContext) -> u32 {
        0
    }

    /// `None` means no timeout.
    fn get_timeout(&self, _context: &DeferredContext) -> Option<Duration> {
        None
    }

    fn get_wait_between_attempts(&self, _context: &DeferredContext) -> Duration {
        Duration::ZERO
    }

    async fn on_created(&self, _task_uid: TaskUid, _context: &DeferredContext) -> Result<(), BoxError> {
        Ok(())
    }

    async fn run(&self, context: &DeferredContext) -> Result<Value, BoxError>;

    async fn on_result(&self, _result: Value, _context: &DeferredContext) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_finished_with_error(
        &self,
        _error: TaskResultError,
        _context: &DeferredContext,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once, in the process that requested the cancellation.
    async fn on_cancelled(&self, _task_uid: TaskUid, _context: &DeferredContext) -> Result<(), BoxError> {
        Ok(())
    }
}
