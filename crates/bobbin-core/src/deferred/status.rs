//! Status views of deferred tasks.

use super::tracker::TaskSchedule;
use crate::domain::{TaskResult, TaskState, TaskUid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TaskStatus は `get_task_status` / `list_tasks` が返すビュー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_uid: TaskUid,
    pub handler_name: String,
    pub state: TaskState,
    pub attempts_left: u32,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskSchedule> for TaskStatus {
    fn from(record: &TaskSchedule) -> Self {
        Self {
            task_uid: record.task_uid,
            handler_name: record.handler_name.clone(),
            state: record.state,
            attempts_left: record.execution_attempts,
            result: record.result.clone(),
            created_at: record.created_at,
            time_started: record.time_started,
            updated_at: record.updated_at,
        }
    }
}

/// Number of live task records per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub scheduled: usize,
    pub submit_task: usize,
    pub worker: usize,
    pub deferred_result: usize,
    pub error_result: usize,
    pub finished_with_error: usize,
    pub manually_cancelled: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Scheduled => &mut self.scheduled,
            TaskState::SubmitTask => &mut self.submit_task,
            TaskState::Worker => &mut self.worker,
            TaskState::DeferredResult => &mut self.deferred_result,
            TaskState::ErrorResult => &mut self.error_result,
            TaskState::FinishedWithError => &mut self.finished_with_error,
            TaskState::ManuallyCancelled => &mut self.manually_cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.scheduled
            + self.submit_task
            + self.worker
            + self.deferred_result
            + self.error_result
            + self.finished_with_error
            + self.manually_cancelled
    }
}

impl FromIterator<TaskState> for TaskCounts {
    fn from_iter<I: IntoIterator<Item = TaskState>>(iter: I) -> Self {
        let mut counts = TaskCounts::default();
        for state in iter {
            counts.add(state);
        }
        counts
    }
}
