//! Domain model (IDs, contexts, states, results, errors, events).

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod result;
pub mod retry;
pub mod state;

pub use self::context::{
    ContextMap, DeferredContext, GlobalsContext, OperationContext, OperationName,
    ProvidedOperationContext, RequiredOperationContext, StartContext, StepName,
};
pub use self::errors::{
    BobbinError, BobbinResult, BoxError, BrokerError, ErrorKind, RegistrationError, StoreError,
};
pub use self::events::{TaskEvent, TaskEventKind};
pub use self::ids::{ScheduleId, TaskUid};
pub use self::result::{FailureKind, TaskResult, TaskResultError};
pub use self::retry::RetryPolicy;
pub use self::state::{ScheduleDirection, ScheduleState, StepStatus, TaskState};
