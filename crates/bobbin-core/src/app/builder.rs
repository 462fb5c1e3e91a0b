//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - store / broker は build 時に Resilient ラッパーで包む

use super::App;
use super::config::BobbinConfig;
use crate::deferred::{DeferredHandler, DeferredManager, DeferredOptions, HandlerRegistry};
use crate::domain::{GlobalsContext, RegistrationError, RetryPolicy};
use crate::ports::{
    Clock, IdGenerator, KeyValueStore, MessageBroker, Ports, ResilientBroker, ResilientStore,
    SystemClock, UlidGenerator,
};
use crate::scheduler::{
    Operation, OperationRegistry, ScheduleStore, Scheduler, SchedulerOptions, StepRunner,
    events_queue,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(platform, store, broker)
///     .config(config)
///     .register_operation("deploy", deploy_operation())?
///     .expect_operations(&["deploy"])
///     .build()?;
/// app.start().await?;
/// ```
///
/// # Fail-fast 設計
/// - register_* は重複と context key の依存を登録時に検証する
/// - expect_operations() で期待される operation 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct AppBuilder<A>
where
    A: Send + Sync + 'static,
{
    app: Arc<A>,
    store: Arc<dyn KeyValueStore>,
    broker: Arc<dyn MessageBroker>,
    config: BobbinConfig,
    globals: GlobalsContext,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    handlers: HandlerRegistry,
    operations: OperationRegistry<A>,
    expected_operations: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing operations: {0:?}. These operations were expected but not registered.")]
    MissingOperations(Vec<String>),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

impl<A> AppBuilder<A>
where
    A: Send + Sync + 'static,
{
    /// `app` is handed to every step hook; the core never looks inside.
    pub fn new(app: A, store: Arc<dyn KeyValueStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            app: Arc::new(app),
            store,
            broker,
            config: BobbinConfig::default(),
            globals: GlobalsContext::new(),
            clock: Arc::new(SystemClock),
            ids: None,
            handlers: HandlerRegistry::new(),
            operations: OperationRegistry::new(),
            expected_operations: None,
        }
    }

    pub fn config(mut self, config: BobbinConfig) -> Self {
        self.config = config;
        self
    }

    /// Process-wide context merged into every deferred task's context.
    pub fn globals(mut self, globals: GlobalsContext) -> Self {
        self.globals = globals;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to ULIDs from the configured clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler を登録
    pub fn register_handler<H: DeferredHandler>(mut self, handler: H) -> Result<Self, RegistrationError> {
        self.handlers.register(Arc::new(handler))?;
        Ok(self)
    }

    /// Operation を検証して登録
    pub fn register_operation(
        self,
        name: impl Into<String>,
        operation: Operation<A>,
    ) -> Result<Self, RegistrationError> {
        self.operations.register(name, operation)?;
        Ok(self)
    }

    /// 期待される operation 名のリストを設定
    pub fn expect_operations(mut self, names: &[&str]) -> Self {
        self.expected_operations = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - expect_operations() で設定された operation が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingOperations を返す
    pub fn build(self) -> Result<App<A>, BuildError> {
        if let Some(expected) = &self.expected_operations {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.operations.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOperations(missing));
            }
        }

        let namespace = self.config.namespace.clone();
        let policy = RetryPolicy::from(&self.config.transport);
        let ids = self
            .ids
            .unwrap_or_else(|| -> Arc<dyn IdGenerator> {
                Arc::new(UlidGenerator::new(Arc::clone(&self.clock)))
            });
        let ports = Ports {
            store: Arc::new(ResilientStore::new(self.store, policy.clone())),
            broker: Arc::new(ResilientBroker::new(self.broker, policy)),
            clock: self.clock,
            ids,
        };

        let operations = Arc::new(self.operations);
        let schedules = Arc::new(ScheduleStore::new(Arc::clone(&ports.store), namespace.clone()));
        let mut handlers = self.handlers;
        handlers.register(Arc::new(StepRunner::new(
            self.app,
            Arc::clone(&operations),
            Arc::clone(&schedules),
            Arc::clone(&ports.broker),
            events_queue(&namespace),
        )))?;

        let deferred = DeferredManager::new(
            namespace.clone(),
            handlers,
            self.globals,
            &ports,
            DeferredOptions::from(&self.config.deferred),
        );
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(
            namespace,
            operations,
            schedules,
            deferred.clone(),
            &ports,
            SchedulerOptions::from(&self.config.scheduler),
            shutdown.clone(),
        );
        Ok(App::new(self.config, deferred, scheduler, shutdown))
    }
}
