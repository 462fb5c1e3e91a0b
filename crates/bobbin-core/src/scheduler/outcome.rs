//! Outcomes - 終端に達した schedule の結果
//!
//! schedule のキーは終端で purge されるので、結果は topic で全プロセスに配り、
//! 各プロセスが直近のものを保持します（`get_status` / `wait_for_outcome` 用）。

use super::store::{ScheduleRecord, StepFailure};
use crate::domain::{OperationContext, OperationName, ScheduleId, ScheduleState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Final state of a schedule plus what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
    pub state: ScheduleState,
    pub operation_context: OperationContext,
    pub failure: Option<StepFailure>,
    /// Schedule started by the chain, if any.
    pub follow_up: Option<ScheduleId>,
}

impl From<&ScheduleRecord> for ScheduleOutcome {
    fn from(record: &ScheduleRecord) -> Self {
        Self {
            schedule_id: record.schedule_id,
            operation_name: record.operation_name.clone(),
            state: record.state,
            operation_context: record.operation_context.clone(),
            failure: record.failure.clone(),
            follow_up: record.follow_up,
        }
    }
}

/// Bounded, insertion-ordered cache. The oldest outcome is evicted first.
pub struct OutcomeCache {
    capacity: usize,
    entries: Mutex<Entries>,
    notify: Notify,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<ScheduleId, ScheduleOutcome>,
    order: VecDeque<ScheduleId>,
}

impl OutcomeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
            notify: Notify::new(),
        }
    }

    pub fn insert(&self, outcome: ScheduleOutcome) {
        {
            let mut entries = self.lock();
            let id = outcome.schedule_id;
            if entries.by_id.insert(id, outcome).is_none() {
                entries.order.push_back(id);
            }
            while entries.order.len() > self.capacity {
                if let Some(evicted) = entries.order.pop_front() {
                    entries.by_id.remove(&evicted);
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub fn get(&self, schedule_id: ScheduleId) -> Option<ScheduleOutcome> {
        self.lock().by_id.get(&schedule_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes on the next insert. `enable()` it before checking, or an insert can slip by.
    pub fn changed(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
