//! Operation - 順序付きの StepGroup 列と、その登録時検証
//!
//! # 検証ルール
//! - group が 1 つ以上ある
//! - parallel group は 2 step 以上
//! - repeat できるのは最後の group だけ（single / parallel どちらでも）
//! - repeat する group の step は manual intervention を待てない（永久に止まるため）
//! - step 名は operation 内で一意
//! - 予約キー（`schedule_id`, `operation_name`）を provide しない
//! - 同じ方向で同じキーを 2 つの step が provide しない
//! - create の required key は「初期キー + 予約キー + それより前の group の create provides」で満たされる
//! - revert の required key は「初期キー + 予約キー + それより前の group の create provides
//!   + その step 自身の create provides」で満たされる

use super::group::StepGroup;
use crate::domain::context::{RESERVED_KEYS, is_reserved};
use crate::domain::{OperationContext, OperationName, RegistrationError, ScheduleDirection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Operation は名前付きで登録されるワークフロー
pub struct Operation<A>
where
    A: Send + Sync + 'static,
{
    groups: Vec<StepGroup<A>>,
    initial_context_required_keys: BTreeSet<String>,
    is_cancellable: bool,
}

impl<A> Operation<A>
where
    A: Send + Sync + 'static,
{
    pub fn new(groups: Vec<StepGroup<A>>) -> Self {
        Self {
            groups,
            initial_context_required_keys: BTreeSet::new(),
            is_cancellable: true,
        }
    }

    /// Keys `start_operation` must find in the initial context.
    pub fn with_initial_context_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_context_required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn cancellable(mut self, is_cancellable: bool) -> Self {
        self.is_cancellable = is_cancellable;
        self
    }

    pub fn groups(&self) -> &[StepGroup<A>] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&StepGroup<A>> {
        self.groups.get(index)
    }

    pub fn initial_context_required_keys(&self) -> &BTreeSet<String> {
        &self.initial_context_required_keys
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_cancellable
    }

    /// Checks the structural and context-key rules. Called on registration.
    pub fn validate(&self, name: &str) -> Result<(), RegistrationError> {
        let operation = name.to_string();
        if self.groups.is_empty() {
            return Err(RegistrationError::EmptyOperation(operation));
        }

        let last = self.groups.len() - 1;
        let mut names = HashSet::new();
        for (index, group) in self.groups.iter().enumerate() {
            if group.is_parallel() && group.steps().len() < 2 {
                return Err(RegistrationError::ParallelGroupTooSmall {
                    operation,
                    group: group.label(index),
                });
            }
            if group.is_repeating() && index != last {
                return Err(RegistrationError::RepeatNotLast {
                    operation,
                    group: group.label(index),
                });
            }
            if group.is_repeating()
                && let Some(step) = group
                    .steps()
                    .iter()
                    .find(|step| step.wait_for_manual_intervention())
            {
                return Err(RegistrationError::ManualInterventionInRepeatingGroup {
                    operation,
                    group: group.label(index),
                    step: step.name(),
                });
            }
            for step in group.steps() {
                let step_name = step.name();
                if !names.insert(step_name.clone()) {
                    return Err(RegistrationError::DuplicateStepName {
                        operation,
                        step: step_name,
                    });
                }
            }
        }

        self.check_provides(&operation, ScheduleDirection::Creating)?;
        self.check_provides(&operation, ScheduleDirection::Reverting)?;
        self.check_requires(&operation)
    }

    fn check_provides(&self, operation: &str, direction: ScheduleDirection) -> Result<(), RegistrationError> {
        let mut provided = HashSet::new();
        for step in self.groups.iter().flat_map(StepGroup::steps) {
            let keys = match direction {
                ScheduleDirection::Creating => step.create_provides(),
                ScheduleDirection::Reverting => step.revert_provides(),
            };
            for key in keys {
                if is_reserved(key) {
                    return Err(RegistrationError::ReservedKeyProvided {
                        operation: operation.to_string(),
                        step: step.name(),
                        key: key.to_string(),
                    });
                }
                if !provided.insert(*key) {
                    return Err(RegistrationError::KeyProvidedTwice {
                        operation: operation.to_string(),
                        step: step.name(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_requires(&self, operation: &str) -> Result<(), RegistrationError> {
        let mut available: HashSet<&str> = self
            .initial_context_required_keys
            .iter()
            .map(String::as_str)
            .chain(RESERVED_KEYS)
            .collect();

        for group in &self.groups {
            for step in group.steps() {
                for key in step.create_requires() {
                    if !available.contains(key) {
                        return Err(missing(operation, &step.name(), ScheduleDirection::Creating, key));
                    }
                }
                let own = step.create_provides();
                for key in step.revert_requires() {
                    if !available.contains(key) && !own.contains(key) {
                        return Err(missing(operation, &step.name(), ScheduleDirection::Reverting, key));
                    }
                }
            }
            // 次の group からは、この group の provide がすべて使える
            for step in group.steps() {
                available.extend(step.create_provides().iter().copied());
            }
        }
        Ok(())
    }
}

fn missing(operation: &str, step: &str, direction: ScheduleDirection, key: &str) -> RegistrationError {
    RegistrationError::MissingRequiredKey {
        operation: operation.to_string(),
        step: step.to_string(),
        direction: direction.as_str().to_string(),
        key: key.to_string(),
    }
}

impl<A> std::fmt::Debug for Operation<A>
where
    A: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("groups", &self.groups)
            .field("initial_context_required_keys", &self.initial_context_required_keys)
            .field("is_cancellable", &self.is_cancellable)
            .finish()
    }
}

/// A follow-up operation started when a schedule finishes creating or undoing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationToStart {
    pub operation_name: OperationName,
    pub initial_context: OperationContext,
}

impl OperationToStart {
    pub fn new(operation_name: impl Into<OperationName>, initial_context: OperationContext) -> Self {
        Self {
            operation_name: operation_name.into(),
            initial_context,
        }
    }
}

/// Chaining options of `start_operation`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    pub on_create_completed: Option<OperationToStart>,
    pub on_undo_completed: Option<OperationToStart>,
}

impl StartOptions {
    pub fn on_create_completed(mut self, next: OperationToStart) -> Self {
        self.on_create_completed = Some(next);
        self
    }

    pub fn on_undo_completed(mut self, next: OperationToStart) -> Self {
        self.on_undo_completed = Some(next);
        self
    }
}
