//! Worker slots - プロセスごとの実行枠と `run` の実行
//!
//! # 学習ポイント
//! - `Semaphore` で同時実行数を制限（`try_acquire_owned` で空きがなければ即座に諦める）
//! - `run` は専用の tokio task で実行するので、panic も捕捉できる
//! - `tokio::select!` で「完了 / タイムアウト / キャンセル」を競合させる
//! - `CancellationToken` を uid ごとに保持し、別プロセスからのキャンセル通知で止める

use super::handler::DeferredHandler;
use crate::domain::{DeferredContext, TaskResult, TaskResultError, TaskUid};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(TaskResult),
    /// Cancelled while running; the result must be discarded.
    Cancelled,
}

pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    running: Mutex<HashMap<TaskUid, CancellationToken>>,
}

impl WorkerSlots {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when every slot is busy.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn in_use(&self) -> usize {
        self.max_workers - self.semaphore.available_permits()
    }

    /// Cancels a run of `task_uid` in this process. Returns whether one was running.
    pub fn cancel(&self, task_uid: TaskUid) -> bool {
        match self.lock_running().get(&task_uid) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels everything running in this process.
    pub fn cancel_all(&self) {
        for token in self.lock_running().values() {
            token.cancel();
        }
    }

    /// Runs the handler under `timeout`. Holds `permit` until done.
    pub async fn execute(
        &self,
        _permit: OwnedSemaphorePermit,
        task_uid: TaskUid,
        handler: Arc<dyn DeferredHandler>,
        context: DeferredContext,
        timeout: Option<Duration>,
    ) -> RunOutcome {
        let token = CancellationToken::new();
        self.lock_running().insert(task_uid, token.clone());
        let _registration = Registration {
            slots: self,
            task_uid,
        };

        let mut handle = tokio::spawn(async move { handler.run(&context).await });
        let _abort = AbortOnDrop(handle.abort_handle());

        tokio::select! {
            _ = token.cancelled() => RunOutcome::Cancelled,
            _ = sleep_or_pending(timeout) => {
                // timeout が None なら到達しない
                let after = timeout.unwrap_or_default();
                RunOutcome::Completed(TaskResult::Error {
                    error: TaskResultError::timeout(after),
                })
            }
            joined = &mut handle => match joined {
                Ok(Ok(value)) => RunOutcome::Completed(TaskResult::Success { value }),
                Ok(Err(err)) => RunOutcome::Completed(TaskResult::Error {
                    error: TaskResultError::from_error(err.as_ref()),
                }),
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    RunOutcome::Completed(TaskResult::Error {
                        error: TaskResultError::panicked(message),
                    })
                }
                Err(_) => RunOutcome::Cancelled,
            },
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<TaskUid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the token when the execution ends or is dropped.
struct Registration<'a> {
    slots: &'a WorkerSlots,
    task_uid: TaskUid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.slots.lock_running().remove(&self.task_uid);
    }
}

/// 呼び出し側の future が drop されたら（shutdown）、`run` も止める
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "run panicked".to_string()
}
