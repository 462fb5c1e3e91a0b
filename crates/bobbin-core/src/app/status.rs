//! Status - App のスナップショット

use crate::deferred::{DeferredStatsSnapshot, TaskCounts};
use serde::Serialize;
use std::fmt;

/// AppStatus は 1 プロセスから見た状態
///
/// # 使用例
/// ```ignore
/// let status = app.status().await?;
/// println!("{status}");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStatus {
    pub namespace: String,
    pub handlers: Vec<String>,
    pub operations: Vec<String>,
    pub workers_in_use: usize,
    /// Counters of this process only.
    pub deferred: DeferredStatsSnapshot,
    /// Live task records across all processes.
    pub tasks: TaskCounts,
    pub live_schedules: usize,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "namespace: {}", self.namespace)?;
        writeln!(f, "operations: {}", self.operations.join(", "))?;
        writeln!(
            f,
            "tasks: {} live ({} running here), {} runs, {} retries, {} results, {} failed, {} cancelled",
            self.tasks.total(),
            self.workers_in_use,
            self.deferred.runs,
            self.deferred.retries_scheduled,
            self.deferred.results,
            self.deferred.finished_with_error,
            self.deferred.cancelled,
        )?;
        write!(f, "schedules: {} live", self.live_schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_summarises() {
        let status = AppStatus {
            namespace: "ns".into(),
            handlers: vec!["ping".into()],
            operations: vec!["deploy".into(), "teardown".into()],
            workers_in_use: 1,
            deferred: DeferredStatsSnapshot::default(),
            tasks: TaskCounts::default(),
            live_schedules: 2,
        };
        let text = status.to_string();
        assert!(text.contains("operations: deploy, teardown"));
        assert!(text.ends_with("schedules: 2 live"));
    }
}
