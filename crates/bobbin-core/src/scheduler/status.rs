//! OperationStatus - `get_status` のビュー

use super::outcome::ScheduleOutcome;
use super::store::{ScheduleRecord, StepFailure};
use crate::domain::{OperationContext, OperationName, ScheduleDirection, ScheduleId, ScheduleState};
use serde::{Deserialize, Serialize};

/// OperationStatus は呼び出し側から見た schedule の状態
///
/// 終端に達して purge された schedule は outcome キャッシュから作られ、
/// `group_index` などの進捗は `None` になります。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
    pub state: ScheduleState,
    pub direction: Option<ScheduleDirection>,
    pub group_index: Option<usize>,
    pub operation_context: OperationContext,
    pub failure: Option<StepFailure>,
    pub stop_requested: bool,
    pub follow_up: Option<ScheduleId>,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl From<&ScheduleRecord> for OperationStatus {
    fn from(record: &ScheduleRecord) -> Self {
        Self {
            schedule_id: record.schedule_id,
            operation_name: record.operation_name.clone(),
            state: record.state,
            direction: Some(record.direction),
            group_index: Some(record.group_index),
            operation_context: record.operation_context.clone(),
            failure: record.failure.clone(),
            stop_requested: record.stop_requested(),
            follow_up: record.follow_up,
        }
    }
}

impl From<ScheduleOutcome> for OperationStatus {
    fn from(outcome: ScheduleOutcome) -> Self {
        Self {
            schedule_id: outcome.schedule_id,
            operation_name: outcome.operation_name,
            state: outcome.state,
            direction: None,
            group_index: None,
            operation_context: outcome.operation_context,
            failure: outcome.failure,
            stop_requested: false,
            follow_up: outcome.follow_up,
        }
    }
}
