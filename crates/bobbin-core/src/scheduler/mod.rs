//! Scheduler - 補償付き（saga）ワークフローの実行
//!
//! - **step / group / operation**: ワークフローの定義と登録時検証
//! - **registry**: operation 名 → Operation
//! - **store**: schedule と step の永続化（キーは schedule ごとの prefix 配下）
//! - **runner**: step の hook を deferred task として実行する handler
//! - **core**: event consumer / recovery worker と公開 API
//! - **outcome / status**: 呼び出し側に見せる結果

pub mod core;
pub mod group;
pub mod operation;
pub mod outcome;
pub mod registry;
pub mod runner;
pub mod status;
pub mod step;
pub mod store;

pub use self::core::{Scheduler, SchedulerOptions, events_queue};
pub use self::group::StepGroup;
pub use self::operation::{Operation, OperationToStart, StartOptions};
pub use self::outcome::ScheduleOutcome;
pub use self::registry::OperationRegistry;
pub use self::runner::{STEP_HANDLER_NAME, StepRunner};
pub use self::status::OperationStatus;
pub use self::step::{HookPolicy, Step, step};
pub use self::store::{ScheduleStore, StepFailure};
