//! Domain model (ids, events, task records, retry and dead-letter values).

pub mod ids;
pub mod event;
pub mod state;
pub mod task;
pub mod retry;
pub mod decision;
pub mod outcome;
pub mod dead_letter;
pub mod errors;

pub use self::ids::MessageId;
pub use self::event::{Event, EventMessage};
pub use self::state::TaskState;
pub use self::task::{TaskFix, TaskInfo, TaskRecord};
pub use self::retry::{RetryPolicy, RetryPolicyTable, DEFAULT_POLICY_KEY};
pub use self::decision::{RetryContext, RetryDecision, RetryStats};
pub use self::outcome::ProcessOutcome;
pub use self::dead_letter::{
    AlertLevel, DeadLetterAction, DeadLetterContext, DeadLetterRecord, StorageType,
};
pub use self::errors::{
    BrokerError, PersistError, PublishError, StoreError, TransitionError, UpdateError,
};
