//! State - deferred task と schedule の状態
//!
//! # TaskState（deferred task の状態機械）
//! ```text
//! SCHEDULED -> SUBMIT_TASK -> WORKER -> DEFERRED_RESULT -> (on_result) -> purge
//!                   ^            |
//!                   |            v
//!                   +------ ERROR_RESULT -> FINISHED_WITH_ERROR -> (on_finished_with_error) -> purge
//!
//! 非終端の任意の状態 -> MANUALLY_CANCELLED -> purge
//! ```
//! 状態ごとに 1 つのキューがあり、状態遷移 = 次の状態のキューへの再 publish です。

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskState は deferred task の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Scheduled,
    SubmitTask,
    Worker,
    DeferredResult,
    ErrorResult,
    FinishedWithError,
    ManuallyCancelled,
}

impl TaskState {
    /// Every state, in pipeline order. One queue per entry.
    pub const ALL: [TaskState; 7] = [
        TaskState::Scheduled,
        TaskState::SubmitTask,
        TaskState::Worker,
        TaskState::DeferredResult,
        TaskState::ErrorResult,
        TaskState::FinishedWithError,
        TaskState::ManuallyCancelled,
    ];

    /// Suffix used for the state's queue name (`{namespace}_{suffix}`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "SCHEDULED",
            TaskState::SubmitTask => "SUBMIT_TASK",
            TaskState::Worker => "WORKER",
            TaskState::DeferredResult => "DEFERRED_RESULT",
            TaskState::ErrorResult => "ERROR_RESULT",
            TaskState::FinishedWithError => "FINISHED_WITH_ERROR",
            TaskState::ManuallyCancelled => "MANUALLY_CANCELLED",
        }
    }

    /// 終端状態か（これ以降キャンセルできない）
    ///
    /// DEFERRED_RESULT は `on_result` が消費して purge された時点で終端になるので、
    /// ここでは非終端として扱う。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::FinishedWithError | TaskState::ManuallyCancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which hook a schedule is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleDirection {
    Creating,
    Reverting,
}

impl ScheduleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleDirection::Creating => "create",
            ScheduleDirection::Reverting => "revert",
        }
    }
}

impl fmt::Display for ScheduleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ScheduleState は呼び出し側から見える schedule の状態
///
/// - `Creating` → `Finished`
/// - `Creating` → `Reverting` → `Reverted`
/// - `Creating` → `WaitingManualIntervention` → `Creating`（失敗した step を手動で再開）
/// - revert hook が失敗した場合のみ `RevertFailed`（store に残り、手動で再開するまで止まる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    Creating,
    /// A create hook of a step that asks for an operator failed; nothing runs until it is restarted.
    WaitingManualIntervention,
    Reverting,
    Finished,
    Reverted,
    RevertFailed,
}

impl ScheduleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleState::Finished | ScheduleState::Reverted | ScheduleState::RevertFailed
        )
    }
}

/// Progress of one step hook inside a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Scheduled,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Scheduled, "SCHEDULED", false)]
    #[case(TaskState::SubmitTask, "SUBMIT_TASK", false)]
    #[case(TaskState::Worker, "WORKER", false)]
    #[case(TaskState::DeferredResult, "DEFERRED_RESULT", false)]
    #[case(TaskState::ErrorResult, "ERROR_RESULT", false)]
    #[case(TaskState::FinishedWithError, "FINISHED_WITH_ERROR", true)]
    #[case(TaskState::ManuallyCancelled, "MANUALLY_CANCELLED", true)]
    fn task_state_names_match_serde(
        #[case] state: TaskState,
        #[case] name: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(state.as_str(), name);
        assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{name}\""));
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn one_queue_suffix_per_state() {
        let mut names: Vec<_> = TaskState::ALL.iter().map(TaskState::as_str).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), TaskState::ALL.len());
    }

    #[rstest]
    #[case(ScheduleState::Creating, false)]
    #[case(ScheduleState::WaitingManualIntervention, false)]
    #[case(ScheduleState::Reverting, false)]
    #[case(ScheduleState::Finished, true)]
    #[case(ScheduleState::Reverted, true)]
    #[case(ScheduleState::RevertFailed, true)]
    fn schedule_state_terminality(#[case] state: ScheduleState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn step_status_done() {
        assert!(!StepStatus::Scheduled.is_done());
        assert!(!StepStatus::Running.is_done());
        assert!(StepStatus::Success.is_done());
        assert!(StepStatus::Failed.is_done());
        assert!(StepStatus::Cancelled.is_done());
    }
}
