//! Errors - エラー型と分類
//!
//! # レイヤーごとのエラー
//! - [`StoreError`] / [`BrokerError`]: インフラ（port）のエラー
//! - [`RegistrationError`]: 登録時の検証エラー（重複、context key の依存不足）
//! - [`BobbinError`]: 呼び出し側 API が返すエラー
//!
//! step / handler 内部のエラーは [`BoxError`] として返され、worker 境界で
//! シリアライズ可能な [`crate::domain::TaskResultError`] に変換されます。
//! BobbinError に混ざることはありません。

use std::time::Duration;

/// Error type returned by step hooks and deferred handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（store / broker の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// StoreError は KeyValueStore の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connectivity lost; retrying may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Retries gave up after `elapsed`.
    #[error("store unavailable for {elapsed:?} ({attempts} attempts): {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },

    #[error("store value for '{key}' is not a counter")]
    NotACounter { key: String },

    #[error("store operation failed: {0}")]
    Other(String),
}

/// BrokerError は MessageBroker の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker unavailable for {elapsed:?} ({attempts} attempts): {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },

    /// The subscription's source went away (broker dropped).
    #[error("subscription to '{0}' closed")]
    Closed(String),

    #[error("broker operation failed: {0}")]
    Other(String),
}

/// RegistrationError は handler / operation 登録時のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("deferred handler '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("operation '{0}' has no step groups")]
    EmptyOperation(String),

    #[error("operation '{operation}': parallel group {group} needs at least 2 steps")]
    ParallelGroupTooSmall { operation: String, group: String },

    #[error("operation '{operation}': only the last group may repeat (group {group})")]
    RepeatNotLast { operation: String, group: String },

    #[error("operation '{operation}': step '{step}' in repeating group {group} cannot wait for manual intervention")]
    ManualInterventionInRepeatingGroup {
        operation: String,
        group: String,
        step: String,
    },

    #[error("operation '{operation}': step name '{step}' is used more than once")]
    DuplicateStepName { operation: String, step: String },

    #[error("operation '{operation}': step '{step}' provides reserved key '{key}'")]
    ReservedKeyProvided {
        operation: String,
        step: String,
        key: String,
    },

    #[error("operation '{operation}': key '{key}' provided by step '{step}' is already provided by another step")]
    KeyProvidedTwice {
        operation: String,
        step: String,
        key: String,
    },

    #[error("operation '{operation}': step '{step}' ({direction}) requires key '{key}' which no earlier step provides")]
    MissingRequiredKey {
        operation: String,
        step: String,
        direction: String,
        key: String,
    },

    #[error("operation '{operation}' is still used by {schedules} schedule(s)")]
    OperationInUse { operation: String, schedules: usize },
}

/// BobbinError は呼び出し側 API のエラー
#[derive(Debug, thiserror::Error)]
pub enum BobbinError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("schedule {0} not found")]
    ScheduleNotFound(String),

    #[error("operation '{0}' is not registered")]
    OperationNotFound(String),

    #[error("deferred handler '{0}' is not registered")]
    HandlerNotFound(String),

    #[error("operation '{0}' cannot be cancelled")]
    NotCancellable(String),

    /// Restart the parked step instead.
    #[error("schedule {0} is waiting for manual intervention and cannot be cancelled")]
    CannotCancelWhileWaitingForManualIntervention(String),

    #[error("step '{step}' of schedule {schedule} is not waiting for manual intervention")]
    StepNotWaitingForManualIntervention { schedule: String, step: String },

    #[error("step '{step}' of schedule {schedule} has no failed revert to restart")]
    StepNotInErrorState { schedule: String, step: String },

    /// Another process is advancing the schedule; retry later.
    #[error("lock for schedule {0} is held by another process")]
    ScheduleLockNotAcquired(String),

    /// The lease ran out mid-advance; the write was skipped and the schedule is retried.
    #[error("lock for schedule {0} expired before the record was saved")]
    ScheduleLockLost(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Broker(BrokerError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Store or broker stayed unreachable past the retry budget.
    #[error("infrastructure unavailable: {0}")]
    Transient(String),
}

impl BobbinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BobbinError::ScheduleLockNotAcquired(_) | BobbinError::ScheduleLockLost(_) => {
                ErrorKind::Transient
            }
            BobbinError::Transient(_) | BobbinError::Store(_) | BobbinError::Broker(_) => {
                ErrorKind::Infrastructure
            }
            BobbinError::Registration(_)
            | BobbinError::TaskNotFound(_)
            | BobbinError::ScheduleNotFound(_)
            | BobbinError::OperationNotFound(_)
            | BobbinError::HandlerNotFound(_)
            | BobbinError::NotCancellable(_)
            | BobbinError::CannotCancelWhileWaitingForManualIntervention(_)
            | BobbinError::StepNotWaitingForManualIntervention { .. }
            | BobbinError::StepNotInErrorState { .. }
            | BobbinError::InvalidContext(_)
            | BobbinError::Codec(_) => ErrorKind::Permanent,
        }
    }

    /// Retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}

impl From<StoreError> for BobbinError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Exhausted { .. } => BobbinError::Transient(err.to_string()),
            other => BobbinError::Store(other),
        }
    }
}

impl From<BrokerError> for BobbinError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Exhausted { .. } => BobbinError::Transient(err.to_string()),
            other => BobbinError::Broker(other),
        }
    }
}

pub type BobbinResult<T> = Result<T, BobbinError>;
