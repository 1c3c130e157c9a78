//! Retry decision model.
//!
//! `RetryContext::decide` is pure: given the persisted task view and the
//! topic's policy it returns what to do next. Carrying out the decision
//! (incrementing the row, delayed publish, final failure) belongs to
//! `app::retry::RetryStateManager`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, RetryPolicy, TaskInfo, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryDecision {
    /// Schedule another delivery after `delay`.
    Retry,
    /// Budget exhausted.
    Fail,
    /// The retry could not be evaluated (missing row, store error).
    Error,
}

/// Outcome of one retry evaluation. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    pub message_id: MessageId,
    pub message_type: String,

    /// For `Retry`, the count the row will have once the retry is recorded.
    pub current_retry_count: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error_message: String,
    pub decision: RetryDecision,
}

impl RetryContext {
    /// Decide from the persisted retry count. The event's own view is never consulted.
    pub fn decide(task: &TaskInfo, policy: &RetryPolicy, error_message: &str) -> Self {
        let current = task.retry_count;
        let (decision, current_retry_count, delay) = if policy.can_retry(current) {
            let next = current + 1;
            (RetryDecision::Retry, next, policy.delay(next))
        } else {
            (RetryDecision::Fail, current, Duration::ZERO)
        };
        Self {
            message_id: task.message_id.clone(),
            message_type: task.topic.clone(),
            current_retry_count,
            max_retries: policy.max_attempts,
            delay,
            error_message: error_message.to_string(),
            decision,
        }
    }

    /// Evaluation failed before a decision could be made.
    pub fn error(message_id: MessageId, message_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            current_retry_count: 0,
            max_retries: 0,
            delay: Duration::ZERO,
            error_message: error_message.into(),
            decision: RetryDecision::Error,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.decision == RetryDecision::Retry
    }

    pub fn delay_millis(&self) -> u64 {
        self.delay.as_millis() as u64
    }
}

/// Retry bookkeeping of one message, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub message_id: MessageId,
    pub current_retry_count: u32,
    pub max_retries: u32,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub last_retry_time: Option<DateTime<Utc>>,
}

impl From<&TaskInfo> for RetryStats {
    fn from(info: &TaskInfo) -> Self {
        Self {
            message_id: info.message_id.clone(),
            current_retry_count: info.retry_count,
            max_retries: info.max_retries,
            state: info.state,
            last_error: info.error_message.clone(),
            last_retry_time: info.last_retry_time,
        }
    }
}
