//! StepRunner - step の hook を deferred task として実行する handler
//!
//! # 流れ
//! ```text
//! Scheduler ──start_with_uid──> DeferredManager ──run──> StepRunner::run ──> Step::create / revert
//!                                                     │
//!       on_result / on_finished_with_error / on_cancelled
//!                                                     v
//!                                StepRecord を更新 ──> {ns}_schedule_events に通知
//! ```
//!
//! # 設計原則
//! - hook に渡す required context は投入時のスナップショット（リトライしても同じ入力）
//! - StepRecord は `task_uid` が一致するときだけ更新する（repeat で作り直された step を汚さない）
//! - StepRunner は Scheduler に依存しない（通知はキュー経由）

use super::registry::OperationRegistry;
use super::step::HookPolicy;
use super::store::{ScheduleStore, StepKey};
use crate::deferred::DeferredHandler;
use crate::domain::{
    BoxError, DeferredContext, OperationName, RequiredOperationContext, ScheduleDirection,
    ScheduleId, StartContext, StepStatus, TaskResultError, TaskUid,
};
use crate::ports::MessageBroker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Handler name under which step hooks run.
pub const STEP_HANDLER_NAME: &str = "bobbin.scheduler.step";

const STEP_CONTEXT_KEY: &str = "bobbin_step";

/// Message on `{ns}_schedule_events`: "look at this schedule again".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
}

/// Everything one hook run needs, stored in the deferred task's start context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskContext {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
    pub group_index: usize,
    pub step_name: String,
    pub direction: ScheduleDirection,
    pub task_uid: TaskUid,
    pub required: RequiredOperationContext,
    pub policy: HookPolicy,
}

impl StepTaskContext {
    pub fn to_start_context(&self) -> Result<StartContext, serde_json::Error> {
        let mut context = StartContext::new();
        context.insert(STEP_CONTEXT_KEY.to_string(), serde_json::to_value(self)?);
        Ok(context)
    }

    pub fn from_context(context: &DeferredContext) -> Result<Self, BoxError> {
        let raw = context
            .get(STEP_CONTEXT_KEY)
            .ok_or("deferred context carries no step description")?;
        Ok(serde_json::from_value(raw.clone())?)
    }

    fn key(&self) -> StepKey<'_> {
        StepKey {
            schedule_id: self.schedule_id,
            direction: self.direction,
            group_index: self.group_index,
            step_name: &self.step_name,
        }
    }
}

pub struct StepRunner<A>
where
    A: Send + Sync + 'static,
{
    app: Arc<A>,
    operations: Arc<OperationRegistry<A>>,
    store: Arc<ScheduleStore>,
    broker: Arc<dyn MessageBroker>,
    events_queue: String,
}

impl<A> StepRunner<A>
where
    A: Send + Sync + 'static,
{
    pub fn new(
        app: Arc<A>,
        operations: Arc<OperationRegistry<A>>,
        store: Arc<ScheduleStore>,
        broker: Arc<dyn MessageBroker>,
        events_queue: impl Into<String>,
    ) -> Self {
        Self {
            app,
            operations,
            store,
            broker,
            events_queue: events_queue.into(),
        }
    }

    fn policy(context: &DeferredContext) -> HookPolicy {
        StepTaskContext::from_context(context)
            .map(|step| step.policy)
            .unwrap_or_default()
    }

    /// Writes the final status if the record still belongs to this run, then wakes the scheduler.
    async fn settle(
        &self,
        step: &StepTaskContext,
        status: StepStatus,
        provided: Option<RequiredOperationContext>,
        error: Option<TaskResultError>,
    ) -> Result<(), BoxError> {
        let task_uid = step.task_uid;
        let written = self
            .store
            .update_step(&step.key(), |record| {
                if record.task_uid != task_uid || record.status.is_done() {
                    return false;
                }
                record.status = status;
                record.provided = provided.clone();
                record.error = error.clone();
                true
            })
            .await?;
        if !written {
            debug!(schedule_id = %step.schedule_id, step = %step.step_name, "step record gone or superseded");
        }

        let event = ScheduleEvent {
            schedule_id: step.schedule_id,
            operation_name: step.operation_name.clone(),
        };
        self.broker
            .publish(&self.events_queue, serde_json::to_vec(&event)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<A> DeferredHandler for StepRunner<A>
where
    A: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        STEP_HANDLER_NAME
    }

    fn get_retries(&self, context: &DeferredContext) -> u32 {
        Self::policy(context).retries
    }

    fn get_timeout(&self, context: &DeferredContext) -> Option<Duration> {
        Self::policy(context).timeout
    }

    fn get_wait_between_attempts(&self, context: &DeferredContext) -> Duration {
        Self::policy(context).wait_between_attempts
    }

    async fn run(&self, context: &DeferredContext) -> Result<Value, BoxError> {
        let step = StepTaskContext::from_context(context)?;
        let task_uid = step.task_uid;

        let current = self
            .store
            .update_step(&step.key(), |record| {
                if record.task_uid != task_uid || record.status.is_done() {
                    return false;
                }
                record.status = StepStatus::Running;
                true
            })
            .await?;
        if !current && self.store.load_step(&step.key()).await?.is_none_or(|r| r.task_uid != task_uid) {
            debug!(schedule_id = %step.schedule_id, step = %step.step_name, "stale step run skipped");
            return Ok(Value::Null);
        }

        let hook = self
            .operations
            .get_step(&step.operation_name, step.group_index, &step.step_name)
            .ok_or_else(|| {
                format!(
                    "step '{}' of operation '{}' is not registered",
                    step.step_name, step.operation_name
                )
            })?;

        debug!(schedule_id = %step.schedule_id, step = %step.step_name, direction = %step.direction, "running step hook");
        let (provided, declared) = match step.direction {
            ScheduleDirection::Creating => (
                hook.create(&self.app, step.required.clone()).await?,
                hook.create_provides(),
            ),
            ScheduleDirection::Reverting => (
                hook.revert(&self.app, step.required.clone()).await?,
                hook.revert_provides(),
            ),
        };

        let provided = provided.unwrap_or_default();
        let got: BTreeSet<&str> = provided.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = declared.iter().copied().collect();
        if got != expected {
            return Err(format!(
                "step '{}' ({}) provided keys {:?}, declared {:?}",
                step.step_name, step.direction, got, expected
            )
            .into());
        }
        Ok(Value::Object(provided))
    }

    async fn on_result(&self, result: Value, context: &DeferredContext) -> Result<(), BoxError> {
        let step = StepTaskContext::from_context(context)?;
        let provided = match result {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self.settle(&step, StepStatus::Success, provided, None).await
    }

    async fn on_finished_with_error(
        &self,
        error: TaskResultError,
        context: &DeferredContext,
    ) -> Result<(), BoxError> {
        let step = StepTaskContext::from_context(context)?;
        warn!(schedule_id = %step.schedule_id, step = %step.step_name, direction = %step.direction, error = %error, "step hook failed");
        self.settle(&step, StepStatus::Failed, None, Some(error)).await
    }

    async fn on_cancelled(&self, _task_uid: TaskUid, context: &DeferredContext) -> Result<(), BoxError> {
        let step = StepTaskContext::from_context(context)?;
        self.settle(&step, StepStatus::Cancelled, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProvidedOperationContext;
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::scheduler::group::StepGroup;
    use crate::scheduler::operation::Operation;
    use crate::scheduler::step::{Step, step};
    use crate::scheduler::store::StepRecord;
    use serde_json::{Map, json};
    use ulid::Ulid;

    struct Echo {
        provides: &'static [&'static str],
    }

    #[async_trait]
    impl Step<()> for Echo {
        fn name(&self) -> String {
            "echo".into()
        }

        fn create_requires(&self) -> &[&'static str] {
            &["input"]
        }

        fn create_provides(&self) -> &[&'static str] {
            self.provides
        }

        async fn create(
            &self,
            _app: &(),
            context: RequiredOperationContext,
        ) -> Result<Option<ProvidedOperationContext>, BoxError> {
            let mut provided = Map::new();
            provided.insert("output".into(), context["input"].clone());
            Ok(Some(provided))
        }
    }

    struct Fixture {
        runner: StepRunner<()>,
        store: Arc<ScheduleStore>,
        broker: InMemoryBroker,
    }

    fn fixture(provides: &'static [&'static str]) -> Fixture {
        let operations = Arc::new(OperationRegistry::new());
        operations
            .register(
                "op",
                Operation::new(vec![StepGroup::single(step(Echo { provides }))])
                    .with_initial_context_keys(["input"]),
            )
            .unwrap();
        let store = Arc::new(ScheduleStore::new(Arc::new(InMemoryStore::new()), "ns"));
        let broker = InMemoryBroker::new();
        let runner = StepRunner::new(
            Arc::new(()),
            operations,
            Arc::clone(&store),
            Arc::new(broker.clone()),
            "ns_schedule_events",
        );
        Fixture {
            runner,
            store,
            broker,
        }
    }

    fn task() -> StepTaskContext {
        let mut required = Map::new();
        required.insert("input".into(), json!(7));
        StepTaskContext {
            schedule_id: ScheduleId::from_ulid(Ulid::new()),
            operation_name: "op".into(),
            group_index: 0,
            step_name: "echo".into(),
            direction: ScheduleDirection::Creating,
            task_uid: TaskUid::from_ulid(Ulid::new()),
            required,
            policy: HookPolicy::default().with_retries(2),
        }
    }

    #[tokio::test]
    async fn policy_comes_from_the_context() {
        let fixture = fixture(&["output"]);
        let context = task().to_start_context().unwrap();

        assert_eq!(fixture.runner.get_retries(&context), 2);
        assert_eq!(fixture.runner.get_retries(&Map::new()), 0);
    }

    #[tokio::test]
    async fn run_marks_running_and_returns_provided() {
        let fixture = fixture(&["output"]);
        let task = task();
        fixture
            .store
            .create_step(&task.key(), &StepRecord::scheduled(task.task_uid))
            .await
            .unwrap();

        let value = fixture
            .runner
            .run(&task.to_start_context().unwrap())
            .await
            .unwrap();

        assert_eq!(value, json!({"output": 7}));
        assert_eq!(
            fixture.store.load_step(&task.key()).await.unwrap().unwrap().status,
            StepStatus::Running
        );
    }

    #[tokio::test]
    async fn undeclared_keys_are_an_error() {
        let fixture = fixture(&[]);
        let task = task();
        fixture
            .store
            .create_step(&task.key(), &StepRecord::scheduled(task.task_uid))
            .await
            .unwrap();

        let err = fixture
            .runner
            .run(&task.to_start_context().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provided keys"));
    }

    #[tokio::test]
    async fn result_is_recorded_and_scheduler_notified() {
        let fixture = fixture(&["output"]);
        let task = task();
        fixture
            .store
            .create_step(&task.key(), &StepRecord::scheduled(task.task_uid))
            .await
            .unwrap();

        fixture
            .runner
            .on_result(json!({"output": 7}), &task.to_start_context().unwrap())
            .await
            .unwrap();

        let record = fixture.store.load_step(&task.key()).await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(record.provided.unwrap()["output"], json!(7));
        assert_eq!(fixture.broker.queue_len("ns_schedule_events"), 1);
    }

    #[tokio::test]
    async fn superseded_record_is_left_alone() {
        let fixture = fixture(&["output"]);
        let task = task();
        let other = TaskUid::from_ulid(Ulid::new());
        fixture
            .store
            .create_step(&task.key(), &StepRecord::scheduled(other))
            .await
            .unwrap();

        let value = fixture
            .runner
            .run(&task.to_start_context().unwrap())
            .await
            .unwrap();
        assert_eq!(value, Value::Null);

        fixture
            .runner
            .on_cancelled(task.task_uid, &task.to_start_context().unwrap())
            .await
            .unwrap();
        let record = fixture.store.load_step(&task.key()).await.unwrap().unwrap();
        assert_eq!(record.task_uid, other);
        assert_eq!(record.status, StepStatus::Scheduled);
    }
}
