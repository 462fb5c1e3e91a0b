//! Scheduler scenarios on shared in-memory infrastructure.
//!
//! 各 App は同じ store / broker を共有する別プロセスとして扱います。

use async_trait::async_trait;
use bobbin_core::domain::{
    BobbinError, BoxError, ProvidedOperationContext, RequiredOperationContext, ScheduleDirection,
    ScheduleId, ScheduleState,
};
use bobbin_core::impls::{InMemoryBroker, InMemoryStore};
use bobbin_core::scheduler::{
    HookPolicy, Operation, OperationToStart, ScheduleOutcome, StartOptions, Step, StepGroup, step,
};
use bobbin_core::{App, AppBuilder, BobbinConfig};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEPLOY: &str = "deploy";

/// App value: one journal per schedule.
#[derive(Clone, Default)]
struct Platform {
    journal: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl Platform {
    fn record(&self, context: &RequiredOperationContext, entry: String) {
        let schedule = schedule_of(context);
        self.journal.lock().unwrap().entry(schedule).or_default().push(entry);
    }

    /// First occurrence of every entry; duplicate runs after a crash are folded.
    fn order(&self, schedule_id: ScheduleId) -> Vec<String> {
        let journal = self.journal.lock().unwrap();
        let mut seen = HashSet::new();
        journal
            .get(&schedule_id.to_string())
            .into_iter()
            .flatten()
            .filter(|entry| seen.insert(entry.to_string()))
            .cloned()
            .collect()
    }

    fn bump(&self, context: &RequiredOperationContext, step: &str) -> u32 {
        let key = format!("{}:{step}", schedule_of(context));
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key).or_default();
        *count += 1;
        *count
    }
}

fn schedule_of(context: &RequiredOperationContext) -> String {
    context
        .get("schedule_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Succeed,
    FailCreate,
    FailRevert,
    /// Fails the first `n` create attempts of every schedule.
    Flaky(u32),
    /// Fails the first `n` revert attempts of every schedule.
    FlakyRevert(u32),
    /// Create never returns on its own.
    Hang,
}

struct Journaled {
    name: &'static str,
    behaviour: Behaviour,
    work: Duration,
    retries: u32,
    manual: bool,
    provides: &'static [&'static str],
    requires: &'static [&'static str],
}

impl Journaled {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            behaviour: Behaviour::Succeed,
            work: Duration::from_millis(5),
            retries: 0,
            manual: false,
            provides: &[],
            requires: &[],
        }
    }

    fn behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// A failed create parks the schedule until an operator restarts the step.
    fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    fn provides(mut self, keys: &'static [&'static str]) -> Self {
        self.provides = keys;
        self
    }

    fn requires(mut self, keys: &'static [&'static str]) -> Self {
        self.requires = keys;
        self
    }
}

#[async_trait]
impl Step<Platform> for Journaled {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn create_requires(&self) -> &[&'static str] {
        self.requires
    }

    fn create_provides(&self) -> &[&'static str] {
        self.provides
    }

    fn create_policy(&self) -> HookPolicy {
        HookPolicy::default()
            .with_retries(self.retries)
            .with_wait_between_attempts(Duration::from_millis(5))
    }

    fn revert_policy(&self) -> HookPolicy {
        HookPolicy::default().with_wait_between_attempts(Duration::from_millis(5))
    }

    fn wait_for_manual_intervention(&self) -> bool {
        self.manual
    }

    async fn create(
        &self,
        app: &Platform,
        context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        tokio::time::sleep(self.work).await;
        match self.behaviour {
            Behaviour::FailCreate => {
                app.record(&context, format!("create({})", self.name));
                return Err(format!("{} exploded", self.name).into());
            }
            Behaviour::Flaky(failures) => {
                if app.bump(&context, self.name) <= failures {
                    return Err("not yet".into());
                }
            }
            Behaviour::Hang => {
                app.record(&context, format!("create({})", self.name));
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Behaviour::Succeed | Behaviour::FailRevert | Behaviour::FlakyRevert(_) => {}
        }
        app.record(&context, format!("create({})", self.name));
        let provided = self
            .provides
            .iter()
            .map(|key| (key.to_string(), json!(format!("{}:{key}", self.name))))
            .collect();
        Ok(Some(provided))
    }

    async fn revert(
        &self,
        app: &Platform,
        context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        tokio::time::sleep(self.work).await;
        app.record(&context, format!("revert({})", self.name));
        match self.behaviour {
            Behaviour::FailRevert => Err(format!("{} refused to go away", self.name).into()),
            Behaviour::FlakyRevert(failures) if app.bump(&context, &format!("revert:{}", self.name)) <= failures => {
                Err(format!("{} is still attached", self.name).into())
            }
            _ => Ok(None),
        }
    }
}

/// `[Single(S1), Parallel(S2, S3), Single(S4)]`
fn diamond(s3: Behaviour) -> Operation<Platform> {
    Operation::new(vec![
        StepGroup::single(step(Journaled::new("S1").provides(&["network"]))),
        StepGroup::parallel([
            step(Journaled::new("S2").requires(&["network"])),
            step(Journaled::new("S3").requires(&["network"]).behaviour(s3)),
        ]),
        StepGroup::single(step(Journaled::new("S4"))),
    ])
}

fn test_config() -> BobbinConfig {
    let mut config = BobbinConfig::default();
    config.namespace = "it".to_string();
    config.scheduler.lock_lease_ms = 300;
    config.scheduler.lock_retry_delay_ms = 5;
    config.scheduler.recovery_interval_ms = 50;
    config.transport.base_delay_ms = 5;
    config.transport.max_delay_ms = 50;
    config
}

struct Cluster {
    platform: Platform,
    store: InMemoryStore,
    broker: InMemoryBroker,
    operations: Vec<(&'static str, fn() -> Operation<Platform>)>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            platform: Platform::default(),
            store: InMemoryStore::new(),
            broker: InMemoryBroker::new(),
            operations: Vec::new(),
        }
    }

    /// Every process registers the same operations.
    fn operation(mut self, name: &'static str, make: fn() -> Operation<Platform>) -> Self {
        self.operations.push((name, make));
        self
    }

    fn process(&self) -> App<Platform> {
        let mut builder = AppBuilder::new(
            self.platform.clone(),
            Arc::new(self.store.clone()),
            Arc::new(self.broker.clone()),
        )
        .config(test_config());
        for (name, operation) in &self.operations {
            builder = builder.register_operation(*name, operation()).unwrap();
        }
        builder.build().unwrap()
    }

    async fn started(&self) -> App<Platform> {
        let app = self.process();
        app.start().await.unwrap();
        app
    }

    async fn store_drained(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !self.store.keys().iter().all(|key| !key.contains(":schedule:")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("keys left behind: {:?}", self.store.keys()));
    }
}

async fn outcome(app: &App<Platform>, schedule_id: ScheduleId) -> ScheduleOutcome {
    tokio::time::timeout(Duration::from_secs(10), app.scheduler().wait_for_outcome(schedule_id))
        .await
        .expect("schedule never settled")
        .unwrap()
}

fn assert_diamond_created(order: &[String]) {
    assert_eq!(order[0], "create(S1)");
    let middle: HashSet<&str> = order[1..3].iter().map(String::as_str).collect();
    assert_eq!(middle, HashSet::from(["create(S2)", "create(S3)"]));
    assert_eq!(order[3], "create(S4)");
    assert_eq!(order.len(), 4);
}

fn assert_diamond_reverted(order: &[String]) {
    assert_eq!(order[0], "create(S1)");
    let middle: HashSet<&str> = order[1..3].iter().map(String::as_str).collect();
    assert_eq!(middle, HashSet::from(["create(S2)", "create(S3)"]));
    assert_eq!(&order[3..], ["revert(S2)", "revert(S1)"]);
}

#[tokio::test]
async fn diamond_creates_in_group_order_and_leaves_no_keys() {
    let cluster = Cluster::new().operation(DEPLOY, || diamond(Behaviour::Succeed));
    let app = cluster.started().await;

    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Finished);
    assert_eq!(outcome.operation_context.get("network"), Some(&json!("S1:network")));
    assert_diamond_created(&cluster.platform.order(id));
    cluster.store_drained().await;
    assert_eq!(app.scheduler().get_status(id).await.unwrap().state, ScheduleState::Finished);
    app.shutdown().await;
}

#[tokio::test]
async fn failing_parallel_step_reverts_only_what_was_created() {
    let cluster = Cluster::new().operation(DEPLOY, || diamond(Behaviour::FailCreate));
    let app = cluster.started().await;

    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Reverted);
    let failure = outcome.failure.expect("failure attached");
    assert_eq!(failure.step, "S3");
    assert_eq!(failure.direction, ScheduleDirection::Creating);
    assert_eq!(failure.error.message, "S3 exploded");

    let order = cluster.platform.order(id);
    assert_diamond_reverted(&order);
    assert!(!order.contains(&"create(S4)".to_string()));
    assert!(!order.contains(&"revert(S3)".to_string()));
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn missing_initial_key_is_rejected_before_anything_is_stored() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        diamond(Behaviour::Succeed).with_initial_context_keys(["owner"])
    });
    let app = cluster.process();

    let err = app.scheduler().create(DEPLOY, Map::new()).await.unwrap_err();
    assert!(matches!(err, BobbinError::InvalidContext(_)));
    assert!(cluster.store.is_empty());

    let unknown = app.scheduler().create("nope", Map::new()).await.unwrap_err();
    assert!(matches!(unknown, BobbinError::OperationNotFound(_)));
}

#[tokio::test]
async fn follow_up_starts_after_create_completes() {
    let cluster = Cluster::new()
        .operation(DEPLOY, || diamond(Behaviour::Succeed))
        .operation("notify", || {
            Operation::new(vec![StepGroup::single(step(
                Journaled::new("Mail").requires(&["who"]),
            ))])
            .with_initial_context_keys(["who"])
        });
    let app = cluster.started().await;

    let mut next_context = Map::new();
    next_context.insert("who".to_string(), json!("ops"));
    let id = app
        .scheduler()
        .start_operation(
            DEPLOY,
            Map::new(),
            StartOptions::default().on_create_completed(OperationToStart::new("notify", next_context)),
        )
        .await
        .unwrap();

    let first = outcome(&app, id).await;
    let follow_up = first.follow_up.expect("follow-up started");
    let second = outcome(&app, follow_up).await;

    assert_eq!(second.state, ScheduleState::Finished);
    assert_eq!(second.operation_name, "notify");
    assert_eq!(cluster.platform.order(follow_up), ["create(Mail)"]);
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn cancel_interrupts_running_create_and_reverts() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("S1"))),
            StepGroup::single(step(Journaled::new("Slow").behaviour(Behaviour::Hang))),
        ])
    });
    let app = cluster.started().await;

    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cluster.platform.order(id).contains(&"create(Slow)".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("slow step never started");

    app.scheduler().cancel(id).await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Reverted);
    assert!(outcome.failure.is_none());
    assert_eq!(
        cluster.platform.order(id),
        ["create(S1)", "create(Slow)", "revert(S1)"]
    );
    app.shutdown().await;
}

#[tokio::test]
async fn not_cancellable_operation_refuses_cancel() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![StepGroup::single(step(Journaled::new("S1")))]).cancellable(false)
    });
    let app = cluster.process();
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    assert!(matches!(
        app.scheduler().cancel(id).await,
        Err(BobbinError::NotCancellable(_))
    ));
}

#[tokio::test]
async fn repeating_monitor_runs_until_marked_for_removal() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("Start"))),
            StepGroup::repeating(step(Journaled::new("Monitor")), Duration::from_millis(20)),
        ])
    });
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    let journal = Arc::clone(&cluster.platform.journal);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let runs = journal
                .lock()
                .unwrap()
                .get(&id.to_string())
                .map_or(0, |entries| entries.iter().filter(|e| *e == "create(Monitor)").count());
            if runs >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("monitor did not repeat");

    app.scheduler().mark_for_removal(id).await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Reverted);
    let order = cluster.platform.order(id);
    assert_eq!(
        &order[order.len() - 2..],
        ["revert(Monitor)", "revert(Start)"]
    );
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn repeating_parallel_group_reruns_every_step() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("Start"))),
            StepGroup::parallel([step(Journaled::new("Cpu")), step(Journaled::new("Disk"))])
                .repeat_every(Duration::from_millis(20)),
        ])
    });
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    let runs = |entry: &str| {
        cluster
            .platform
            .journal
            .lock()
            .unwrap()
            .get(&id.to_string())
            .map_or(0, |entries| entries.iter().filter(|e| *e == entry).count())
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while runs("create(Cpu)") < 3 || runs("create(Disk)") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("parallel group did not repeat");

    app.scheduler().mark_for_removal(id).await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Reverted);
    let order = cluster.platform.order(id);
    let reverted: HashSet<&str> = order[order.len() - 3..order.len() - 1].iter().map(String::as_str).collect();
    assert_eq!(reverted, HashSet::from(["revert(Cpu)", "revert(Disk)"]));
    assert_eq!(order[order.len() - 1], "revert(Start)");
    cluster.store_drained().await;
    app.shutdown().await;
}

async fn settles_in(app: &App<Platform>, schedule_id: ScheduleId, state: ScheduleState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.scheduler().get_status(schedule_id).await.unwrap().state != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{schedule_id} never reached {state:?}"));
}

#[tokio::test]
async fn failed_manual_step_waits_for_an_operator_then_finishes() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("S1"))),
            StepGroup::single(step(Journaled::new("Firmware").behaviour(Behaviour::Flaky(1)).manual())),
            StepGroup::single(step(Journaled::new("S3"))),
        ])
    });
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    settles_in(&app, id, ScheduleState::WaitingManualIntervention).await;
    let status = app.scheduler().get_status(id).await.unwrap();
    assert_eq!(status.group_index, Some(1));
    assert_eq!(status.failure.as_ref().expect("failure attached").step, "Firmware");
    assert!(!status.is_terminal());

    assert!(matches!(
        app.scheduler().cancel(id).await,
        Err(BobbinError::CannotCancelWhileWaitingForManualIntervention(_))
    ));
    assert!(matches!(
        app.scheduler().mark_for_removal(id).await,
        Err(BobbinError::CannotCancelWhileWaitingForManualIntervention(_))
    ));
    assert!(matches!(
        app.scheduler().restart_step_stuck_in_manual_intervention(id, "S1").await,
        Err(BobbinError::StepNotWaitingForManualIntervention { .. })
    ));
    // recovery は止まっている schedule を動かさない
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        app.scheduler().get_status(id).await.unwrap().state,
        ScheduleState::WaitingManualIntervention
    );
    assert_eq!(cluster.platform.order(id), ["create(S1)"]);

    app.scheduler()
        .restart_step_stuck_in_manual_intervention(id, "Firmware")
        .await
        .unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Finished);
    assert!(outcome.failure.is_none());
    assert_eq!(
        cluster.platform.order(id),
        ["create(S1)", "create(Firmware)", "create(S3)"]
    );
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn restart_is_refused_for_a_schedule_that_is_not_stuck() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![StepGroup::single(step(Journaled::new("S1")))])
    });
    let app = cluster.process();
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    assert!(matches!(
        app.scheduler().restart_step_stuck_in_manual_intervention(id, "S1").await,
        Err(BobbinError::StepNotWaitingForManualIntervention { .. })
    ));
    assert!(matches!(
        app.scheduler().restart_step_stuck_during_revert(id, "S1").await,
        Err(BobbinError::StepNotInErrorState { .. })
    ));
    assert_eq!(
        app.scheduler().get_status(id).await.unwrap().state,
        ScheduleState::Creating
    );
}

#[tokio::test]
async fn revert_failed_schedule_resumes_after_the_step_is_restarted() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("Base"))),
            StepGroup::single(step(Journaled::new("Disk").behaviour(Behaviour::FlakyRevert(1)))),
            StepGroup::single(step(Journaled::new("Broken").behaviour(Behaviour::FailCreate))),
        ])
    });
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    let parked = outcome(&app, id).await;
    assert_eq!(parked.state, ScheduleState::RevertFailed);
    assert_eq!(parked.failure.expect("revert failure attached").step, "Disk");
    assert!(matches!(
        app.scheduler().restart_step_stuck_during_revert(id, "Base").await,
        Err(BobbinError::StepNotInErrorState { .. })
    ));

    app.scheduler().restart_step_stuck_during_revert(id, "Disk").await.unwrap();
    let outcome = outcome(&app, id).await;

    assert_eq!(outcome.state, ScheduleState::Reverted);
    let order = cluster.platform.order(id);
    assert_eq!(
        &order[order.len() - 2..],
        ["revert(Disk)", "revert(Base)"]
    );
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn failed_revert_parks_the_schedule_with_its_keys() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("Stubborn").behaviour(Behaviour::FailRevert))),
            StepGroup::single(step(Journaled::new("Broken").behaviour(Behaviour::FailCreate))),
        ])
    });
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    let outcome = outcome(&app, id).await;
    assert_eq!(outcome.state, ScheduleState::RevertFailed);
    let failure = outcome.failure.expect("revert failure attached");
    assert_eq!(failure.step, "Stubborn");
    assert_eq!(failure.direction, ScheduleDirection::Reverting);

    let status = app.scheduler().get_status(id).await.unwrap();
    assert_eq!(status.state, ScheduleState::RevertFailed);
    assert!(cluster.store.keys().iter().any(|key| key.contains(&id.to_string())));
    app.shutdown().await;
}

#[tokio::test]
async fn broker_and_store_outages_converge_to_the_same_order() {
    let cluster = Cluster::new().operation(DEPLOY, || diamond(Behaviour::FailCreate));
    let app = cluster.started().await;
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(8)).await;
    cluster.broker.pause();
    tokio::time::sleep(Duration::from_millis(40)).await;
    cluster.broker.resume();
    tokio::time::sleep(Duration::from_millis(8)).await;
    cluster.store.pause();
    tokio::time::sleep(Duration::from_millis(40)).await;
    cluster.store.resume();

    let outcome = outcome(&app, id).await;
    assert_eq!(outcome.state, ScheduleState::Reverted);
    assert_diamond_reverted(&cluster.platform.order(id));
    cluster.store_drained().await;
    app.shutdown().await;
}

#[tokio::test]
async fn killed_process_is_resumed_by_its_replacement() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![
            StepGroup::single(step(Journaled::new("S1").provides(&["network"]).work(Duration::from_millis(30)))),
            StepGroup::parallel([
                step(Journaled::new("S2").requires(&["network"]).work(Duration::from_millis(30))),
                step(Journaled::new("S3").requires(&["network"]).work(Duration::from_millis(30))),
            ]),
            StepGroup::single(step(Journaled::new("S4").work(Duration::from_millis(30)))),
        ])
    });
    let doomed = cluster.started().await;
    let id = doomed.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    doomed.shutdown().await;
    assert!(doomed.is_shut_down());

    let replacement = cluster.started().await;
    let outcome = outcome(&replacement, id).await;

    assert_eq!(outcome.state, ScheduleState::Finished);
    assert_diamond_created(&cluster.platform.order(id));
    cluster.store_drained().await;
    replacement.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_operations_across_five_processes() {
    let cluster = Cluster::new().operation(DEPLOY, || {
        Operation::new(vec![StepGroup::single(step(
            Journaled::new("Monitor").behaviour(Behaviour::Flaky(2)).retries(3),
        ))])
    });
    let mut apps = Vec::new();
    for _ in 0..5 {
        apps.push(cluster.started().await);
    }

    let mut ids = Vec::new();
    for index in 0..100 {
        let app = &apps[index % apps.len()];
        ids.push(app.scheduler().create(DEPLOY, Map::new()).await.unwrap());
    }

    let waits = ids.iter().map(|id| {
        let scheduler = apps[4].scheduler().clone();
        let id = *id;
        async move {
            tokio::time::timeout(Duration::from_secs(30), scheduler.wait_for_outcome(id))
                .await
                .expect("schedule never settled")
                .unwrap()
        }
    });
    let mut finished = 0;
    for waited in waits {
        if waited.await.state == ScheduleState::Finished {
            finished += 1;
        }
    }
    assert_eq!(finished, 100);

    let (results, errors) = apps.iter().fold((0, 0), |(results, errors), app| {
        let stats = app.deferred().stats();
        (results + stats.results, errors + stats.finished_with_error)
    });
    assert_eq!(results, 100);
    assert_eq!(errors, 0);

    let created = ids
        .iter()
        .filter(|id| cluster.platform.order(**id) == ["create(Monitor)"])
        .count();
    assert_eq!(created, 100);

    cluster.store_drained().await;
    for app in &apps {
        app.shutdown().await;
    }
}

#[tokio::test]
async fn unregister_waits_until_no_schedule_uses_the_operation() {
    let cluster = Cluster::new().operation(DEPLOY, || diamond(Behaviour::Succeed));
    let app = cluster.process();
    let id = app.scheduler().create(DEPLOY, Map::new()).await.unwrap();

    assert!(app.scheduler().unregister_operation(DEPLOY).await.is_err());

    app.start().await.unwrap();
    outcome(&app, id).await;
    cluster.store_drained().await;

    app.scheduler().unregister_operation(DEPLOY).await.unwrap();
    assert!(!app.scheduler().operations().contains(DEPLOY));
    app.shutdown().await;
}
