//! App - アプリケーション層
//!
//! ports・deferred エンジン・scheduler を組み合わせて 1 プロセス分のランタイムにします。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 登録・検証・ワイヤリング
//! - **App**: バックグラウンドループの起動と停止
//! - **BobbinConfig**: TOML から読む設定
//! - **AppStatus**: 状態のスナップショット
//!
//! 同じ store / broker を共有する App を複数作ると、複数プロセス構成と同じように振る舞います。

pub mod builder;
pub mod config;
pub mod status;

pub use self::builder::{AppBuilder, BuildError};
pub use self::config::{BobbinConfig, ConfigError};
pub use self::status::AppStatus;

use crate::deferred::DeferredManager;
use crate::domain::BobbinResult;
use crate::scheduler::Scheduler;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// App は 1 プロセス分のランタイム
pub struct App<A>
where
    A: Send + Sync + 'static,
{
    config: config::BobbinConfig,
    deferred: DeferredManager,
    scheduler: Scheduler<A>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<A> App<A>
where
    A: Send + Sync + 'static,
{
    pub(crate) fn new(
        config: config::BobbinConfig,
        deferred: DeferredManager,
        scheduler: Scheduler<A>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            deferred,
            scheduler,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the deferred consumers, the schedule event consumer, the outcome listener
    /// and the recovery worker.
    pub async fn start(&self) -> BobbinResult<()> {
        let mut spawned = self.deferred.spawn_consumers(self.shutdown.clone()).await?;
        spawned.extend(self.scheduler.spawn_workers(self.shutdown.clone()).await?);
        let count = spawned.len();
        self.lock_handles().extend(spawned);
        info!(namespace = %self.config.namespace, loops = count, "app started");
        Ok(())
    }

    /// Stops every loop. Work in flight is abandoned; its messages are redelivered to other processes.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(namespace = %self.config.namespace, "app stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn deferred(&self) -> &DeferredManager {
        &self.deferred
    }

    pub fn scheduler(&self) -> &Scheduler<A> {
        &self.scheduler
    }

    pub fn config(&self) -> &config::BobbinConfig {
        &self.config
    }

    /// Snapshot of handlers, operations, task counts and live schedules.
    pub async fn status(&self) -> BobbinResult<AppStatus> {
        let tasks = self.deferred.task_counts().await?;
        let schedules = self.scheduler.list_schedules().await?;
        Ok(AppStatus {
            namespace: self.config.namespace.clone(),
            handlers: self.deferred.registered_handlers(),
            operations: self.scheduler.operations().names(),
            workers_in_use: self.deferred.workers_in_use(),
            deferred: self.deferred.stats(),
            tasks,
            live_schedules: schedules.len(),
        })
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
