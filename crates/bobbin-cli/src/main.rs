//! bobbin - demo driver
//!
//! in-memory の store / broker の上に N 個のプロセス（App）を立て、
//! `[Single(S1), Parallel(S2, S3), Single(S4)]` の operation を流して
//! 観測した create / revert の順序と最終状態を表示します。
//!
//! ```text
//! RUST_LOG=bobbin_core=debug bobbin demo --fail-step S3
//! bobbin demo --processes 5 --operations 100
//! bobbin demo --processes 2 --crash-after-ms 50
//! ```

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use bobbin_core::domain::{BoxError, ProvidedOperationContext, RequiredOperationContext, ScheduleId};
use bobbin_core::impls::{InMemoryBroker, InMemoryStore};
use bobbin_core::scheduler::{HookPolicy, Operation, ScheduleOutcome, StartOptions, Step, StepGroup, step};
use bobbin_core::{App, AppBuilder, BobbinConfig};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OPERATION: &str = "demo";

#[derive(Parser)]
#[command(name = "bobbin", version, about = "Deferred tasks and compensating workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the S1 -> (S2 | S3) -> S4 operation on in-memory infrastructure.
    Demo(DemoArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Step whose create hook fails (S1..S4).
    #[arg(long)]
    fail_step: Option<String>,

    /// Number of processes sharing the store and broker.
    #[arg(long, default_value_t = 1)]
    processes: usize,

    /// Number of operations started concurrently.
    #[arg(long, default_value_t = 1)]
    operations: usize,

    /// Kill process 0 after this delay, then start a replacement.
    #[arg(long)]
    crash_after_ms: Option<u64>,

    /// Optional TOML config; the demo shortens lock lease and recovery interval on top of it.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// App value handed to every step.
#[derive(Clone, Default)]
struct Platform {
    journal: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    fail_step: Option<String>,
}

impl Platform {
    fn record(&self, context: &RequiredOperationContext, entry: String) {
        let schedule = context
            .get("schedule_id")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        let mut journal = self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        journal.entry(schedule).or_default().push(entry);
    }

    fn journal(&self, schedule_id: ScheduleId) -> Vec<String> {
        let journal = self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        journal.get(&schedule_id.to_string()).cloned().unwrap_or_default()
    }
}

struct DemoStep {
    name: &'static str,
    provides: &'static [&'static str],
    requires: &'static [&'static str],
    work: Duration,
}

#[async_trait]
impl Step<Platform> for DemoStep {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn create_requires(&self) -> &[&'static str] {
        self.requires
    }

    fn create_provides(&self) -> &[&'static str] {
        self.provides
    }

    fn revert_requires(&self) -> &[&'static str] {
        self.provides
    }

    fn create_policy(&self) -> HookPolicy {
        HookPolicy::default()
            .with_retries(1)
            .with_wait_between_attempts(Duration::from_millis(20))
    }

    fn revert_policy(&self) -> HookPolicy {
        HookPolicy::default().with_retries(3)
    }

    async fn create(
        &self,
        app: &Platform,
        context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        tokio::time::sleep(self.work).await;
        app.record(&context, format!("create({})", self.name));
        if app.fail_step.as_deref() == Some(self.name) {
            return Err(format!("{} refused to start", self.name).into());
        }
        let provided: ProvidedOperationContext = self
            .provides
            .iter()
            .map(|key| (key.to_string(), json!(format!("{}-{}", self.name, key))))
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
        Ok(None)
    }
}

fn demo_operation() -> Operation<Platform> {
    let work = Duration::from_millis(10);
    Operation::new(vec![
        StepGroup::single(step(DemoStep {
            name: "S1",
            provides: &["network_id"],
            requires: &[],
            work,
        })),
        StepGroup::parallel([
            step(DemoStep {
                name: "S2",
                provides: &["volume_id"],
                requires: &["network_id"],
                work,
            }),
            step(DemoStep {
                name: "S3",
                provides: &["service_id"],
                requires: &["network_id", "owner"],
                work,
            }),
        ]),
        StepGroup::single(step(DemoStep {
            name: "S4",
            provides: &[],
            requires: &["volume_id", "service_id"],
            work,
        })),
    ])
    .with_initial_context_keys(["owner"])
}

fn process(
    platform: &Platform,
    config: &BobbinConfig,
    store: &InMemoryStore,
    broker: &InMemoryBroker,
) -> Result<App<Platform>> {
    let app = AppBuilder::new(platform.clone(), Arc::new(store.clone()), Arc::new(broker.clone()))
        .config(config.clone())
        .register_operation(OPERATION, demo_operation())?
        .expect_operations(&[OPERATION])
        .build()?;
    Ok(app)
}

async fn demo(args: DemoArgs) -> Result<()> {
    ensure!(args.processes >= 1, "--processes must be at least 1");
    ensure!(
        args.crash_after_ms.is_none() || args.processes >= 2,
        "--crash-after-ms needs at least two processes: one is killed, another reports outcomes"
    );

    let mut config = match &args.config {
        Some(path) => BobbinConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => BobbinConfig::default(),
    };
    config.scheduler.lock_lease_ms = config.scheduler.lock_lease_ms.min(1_000);
    config.scheduler.recovery_interval_ms = config.scheduler.recovery_interval_ms.min(250);

    let platform = Platform {
        fail_step: args.fail_step.clone(),
        ..Platform::default()
    };
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();

    let mut apps = Vec::with_capacity(args.processes);
    for _ in 0..args.processes {
        let app = process(&platform, &config, &store, &broker)?;
        app.start().await?;
        apps.push(app);
    }
    info!(processes = apps.len(), "processes started");

    let mut schedules = Vec::with_capacity(args.operations);
    for index in 0..args.operations {
        let app = &apps[index % apps.len()];
        let mut initial = Map::new();
        initial.insert("owner".to_string(), json!(format!("user-{index}")));
        let schedule_id = app
            .scheduler()
            .start_operation(OPERATION, initial, StartOptions::default())
            .await?;
        schedules.push(schedule_id);
    }

    let observer = apps.len() - 1;
    if let Some(delay) = args.crash_after_ms {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        warn!("killing process 0");
        apps[0].shutdown().await;
        let replacement = process(&platform, &config, &store, &broker)?;
        replacement.start().await?;
        apps[0] = replacement;
        info!("process 0 restarted");
    }

    let waits = schedules.iter().map(|schedule_id| {
        let scheduler = apps[observer].scheduler().clone();
        let schedule_id = *schedule_id;
        async move {
            tokio::time::timeout(Duration::from_secs(60), scheduler.wait_for_outcome(schedule_id))
                .await
                .with_context(|| format!("{schedule_id} did not settle"))?
                .map_err(anyhow::Error::from)
        }
    });
    let outcomes: Vec<ScheduleOutcome> = futures::future::try_join_all(waits).await?;

    for outcome in &outcomes {
        println!(
            "{}: {:?} {}",
            outcome.schedule_id,
            outcome.state,
            platform.journal(outcome.schedule_id).join(" -> ")
        );
        if let Some(failure) = &outcome.failure {
            println!("    failed at {} ({}): {}", failure.step, failure.group, failure.error.message);
        }
    }

    let status = apps[observer].status().await?;
    println!("{status}");
    println!("store keys left: {}", store.len());

    for app in &apps {
        app.shutdown().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Demo(args) => demo(args).await,
    }
}
