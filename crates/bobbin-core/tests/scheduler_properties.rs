//! Property-based tests for the scheduler's ordering guarantees.
//!
//! ランダムな Single / Parallel の組み合わせと失敗位置で operation を流し、
//! create が group 順に進み、revert が作れたものだけを逆順に戻すことを確かめます。

#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use bobbin_core::domain::{BoxError, ProvidedOperationContext, RequiredOperationContext, ScheduleState};
use bobbin_core::impls::{InMemoryBroker, InMemoryStore};
use bobbin_core::scheduler::{Operation, Step, StepGroup, step};
use bobbin_core::{AppBuilder, BobbinConfig};
use proptest::prelude::*;
use serde_json::Map;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

/// Group sizes plus the `(group, step)` whose create fails, if any.
#[derive(Debug, Clone)]
struct Shape {
    groups: Vec<usize>,
    fail_at: Option<(usize, usize)>,
}

impl Shape {
    fn name(group: usize, index: usize) -> String {
        format!("g{group}s{index}")
    }

    fn group_of(name: &str) -> usize {
        name[1..name.find('s').unwrap()].parse().unwrap()
    }

    /// Steps whose create is expected to succeed.
    fn created(&self) -> BTreeSet<String> {
        let last = self.fail_at.map_or(self.groups.len(), |(group, _)| group + 1);
        let mut created = BTreeSet::new();
        for (group, size) in self.groups.iter().enumerate().take(last) {
            for index in 0..*size {
                if self.fail_at != Some((group, index)) {
                    created.insert(Self::name(group, index));
                }
            }
        }
        created
    }

    fn operation(&self, journal: &Journal) -> Operation<()> {
        let groups = self
            .groups
            .iter()
            .enumerate()
            .map(|(group, size)| {
                let mut steps = (0..*size).map(|index| {
                    step::<(), _>(Recorded {
                        name: Self::name(group, index),
                        fails: self.fail_at == Some((group, index)),
                        journal: Arc::clone(journal),
                    })
                });
                if *size == 1 {
                    StepGroup::single(steps.next().unwrap())
                } else {
                    StepGroup::parallel(steps)
                }
            })
            .collect();
        Operation::new(groups)
    }
}

fn arb_shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(1usize..=3, 1..=4)
        .prop_flat_map(|groups| {
            let sizes = groups.clone();
            let fail_at = prop::option::of(
                (0..groups.len()).prop_flat_map(move |group| (Just(group), 0..sizes[group])),
            );
            (Just(groups), fail_at)
        })
        .prop_map(|(groups, fail_at)| Shape { groups, fail_at })
}

struct Recorded {
    name: String,
    fails: bool,
    journal: Journal,
}

#[async_trait]
impl Step<()> for Recorded {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn create(
        &self,
        _app: &(),
        _context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.fails {
            return Err(format!("{} failed", self.name).into());
        }
        self.journal.lock().unwrap().push(format!("create:{}", self.name));
        Ok(None)
    }

    async fn revert(
        &self,
        _app: &(),
        _context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        self.journal.lock().unwrap().push(format!("revert:{}", self.name));
        Ok(None)
    }
}

struct Run {
    state: ScheduleState,
    journal: Vec<String>,
    leftover: Vec<String>,
}

fn run(shape: &Shape) -> Run {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let journal = Journal::default();
        let store = InMemoryStore::new();
        let mut config = BobbinConfig::default();
        config.namespace = "prop".to_string();
        config.scheduler.lock_retry_delay_ms = 2;
        config.scheduler.recovery_interval_ms = 50;

        let app = AppBuilder::new((), Arc::new(store.clone()), Arc::new(InMemoryBroker::new()))
            .config(config)
            .register_operation("shape", shape.operation(&journal))
            .unwrap()
            .build()
            .unwrap();
        app.start().await.unwrap();

        let id = app.scheduler().create("shape", Map::new()).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), app.scheduler().wait_for_outcome(id))
            .await
            .expect("schedule never settled")
            .unwrap();
        let leftover = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let left: Vec<String> = store.keys().into_iter().filter(|key| key.contains(":schedule:")).collect();
                if left.is_empty() {
                    return left;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| store.keys());
        app.shutdown().await;

        let journal = journal.lock().unwrap().clone();
        Run {
            state: outcome.state,
            journal,
            leftover,
        }
    })
}

fn entries<'a>(journal: &'a [String], prefix: &str) -> Vec<&'a str> {
    journal.iter().filter_map(|entry| entry.strip_prefix(prefix)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Creates advance group by group; a failure reverts exactly what was created, newest group first.
    #[test]
    fn revert_mirrors_the_created_groups(shape in arb_shape()) {
        let run = run(&shape);
        let expected = shape.created();

        let creates = entries(&run.journal, "create:");
        let reverts = entries(&run.journal, "revert:");
        let create_groups: Vec<usize> = creates.iter().map(|name| Shape::group_of(name)).collect();
        let revert_groups: Vec<usize> = reverts.iter().map(|name| Shape::group_of(name)).collect();

        prop_assert!(create_groups.windows(2).all(|pair| pair[0] <= pair[1]), "creates out of order: {:?}", creates);
        prop_assert_eq!(creates.iter().map(|name| name.to_string()).collect::<BTreeSet<_>>(), expected.clone());

        match shape.fail_at {
            None => {
                prop_assert_eq!(run.state, ScheduleState::Finished);
                prop_assert!(reverts.is_empty());
            }
            Some(_) => {
                prop_assert_eq!(run.state, ScheduleState::Reverted);
                prop_assert!(revert_groups.windows(2).all(|pair| pair[0] >= pair[1]), "reverts out of order: {:?}", reverts);
                prop_assert_eq!(reverts.iter().map(|name| name.to_string()).collect::<BTreeSet<_>>(), expected);
                let first_revert = run.journal.iter().position(|entry| entry.starts_with("revert:"));
                let last_create = run.journal.iter().rposition(|entry| entry.starts_with("create:"));
                if let (Some(first_revert), Some(last_create)) = (first_revert, last_create) {
                    prop_assert!(last_create < first_revert);
                }
            }
        }
        prop_assert!(run.leftover.is_empty(), "keys left behind: {:?}", run.leftover);
    }
}
