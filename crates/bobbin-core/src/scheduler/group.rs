//! StepGroup - 前進 / 後退の原子単位

use super::step::Step;
use std::sync::Arc;
use std::time::Duration;

/// StepGroup は step をまとめた実行単位
///
/// - `Single`: 1 つの step
/// - `Parallel`: 2 つ以上の step を同時に投入し、全員の終了を待つ
///
/// どちらも `repeat` を持てば、全員が成功するたびに `repeat` だけ待って
/// group ごと再実行し続ける（監視用）。
pub enum StepGroup<A>
where
    A: Send + Sync + 'static,
{
    Single {
        step: Arc<dyn Step<A>>,
        repeat: Option<Duration>,
    },
    Parallel {
        steps: Vec<Arc<dyn Step<A>>>,
        repeat: Option<Duration>,
    },
}

impl<A> StepGroup<A>
where
    A: Send + Sync + 'static,
{
    pub fn single(step: Arc<dyn Step<A>>) -> Self {
        StepGroup::Single { step, repeat: None }
    }

    /// Re-runs `step` `wait` after each success until the schedule is stopped.
    pub fn repeating(step: Arc<dyn Step<A>>, wait: Duration) -> Self {
        Self::single(step).repeat_every(wait)
    }

    pub fn parallel(steps: impl IntoIterator<Item = Arc<dyn Step<A>>>) -> Self {
        StepGroup::Parallel {
            steps: steps.into_iter().collect(),
            repeat: None,
        }
    }

    /// Makes the group repeat, pausing `wait` between two runs.
    pub fn repeat_every(self, wait: Duration) -> Self {
        match self {
            StepGroup::Single { step, .. } => StepGroup::Single {
                step,
                repeat: Some(wait),
            },
            StepGroup::Parallel { steps, .. } => StepGroup::Parallel {
                steps,
                repeat: Some(wait),
            },
        }
    }

    pub fn steps(&self) -> &[Arc<dyn Step<A>>] {
        match self {
            StepGroup::Single { step, .. } => std::slice::from_ref(step),
            StepGroup::Parallel { steps, .. } => steps,
        }
    }

    /// Pause before the next run, `None` for a group that runs once.
    pub fn wait_before_repeat(&self) -> Option<Duration> {
        match self {
            StepGroup::Single { repeat, .. } | StepGroup::Parallel { repeat, .. } => *repeat,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.wait_before_repeat().is_some()
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, StepGroup::Parallel { .. })
    }

    pub fn find(&self, step_name: &str) -> Option<&Arc<dyn Step<A>>> {
        self.steps().iter().find(|step| step.name() == step_name)
    }

    /// Display name: position plus `S`/`P`, and `R` when repeating (e.g. `0S`, `1P`, `2SR`, `3PR`).
    pub fn label(&self, index: usize) -> String {
        let kind = if self.is_parallel() { "P" } else { "S" };
        let repeat = if self.is_repeating() { "R" } else { "" };
        format!("{index}{kind}{repeat}")
    }
}

impl<A> std::fmt::Debug for StepGroup<A>
where
    A: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.steps().iter().map(|step| step.name()).collect();
        f.debug_struct("StepGroup")
            .field("parallel", &self.is_parallel())
            .field("repeat", &self.wait_before_repeat())
            .field("steps", &names)
            .finish()
    }
}
