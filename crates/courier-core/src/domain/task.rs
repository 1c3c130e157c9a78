//! Task record: the durable row behind one event message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TransitionError;
use super::{EventMessage, MessageId, TaskState};

/// One row per event message.
///
/// Design:
/// - This is the single source of truth for delivery state.
/// - `message_id` never changes and `retry_count` only grows.
/// - All state transitions go through `transition`, which enforces the state table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub message_id: MessageId,
    pub topic: String,

    /// Serialized `EventMessage`.
    pub payload: String,
    pub state: TaskState,
    pub retry_count: u32,

    /// Resolved from the topic's retry policy when the row is created.
    pub max_retries: u32,

    /// Last failure detail.
    pub error_message: Option<String>,
    pub last_retry_time: Option<DateTime<Utc>>,

    /// Set once, on the first transition into a failure state.
    pub first_failed_time: Option<DateTime<Utc>>,

    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl TaskRecord {
    /// New row in `Create` for an event that is about to be published.
    pub fn create(
        event: &EventMessage,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: event.id.clone(),
            topic: event.topic.clone(),
            payload: event.to_payload()?,
            state: TaskState::Create,
            retry_count: 0,
            max_retries,
            error_message: None,
            last_retry_time: None,
            first_failed_time: None,
            created_time: now,
            updated_time: now,
        })
    }

    /// Completed, or failed with the retry budget used up.
    pub fn is_absorbing(&self) -> bool {
        match self.state {
            TaskState::Completed => true,
            TaskState::Failed => self.retry_count >= self.max_retries,
            _ => false,
        }
    }

    /// Failed (or waiting for a retry) with budget left.
    pub fn can_retry(&self) -> bool {
        matches!(self.state, TaskState::Failed | TaskState::RetryScheduled)
            && self.retry_count < self.max_retries
    }

    /// Move to `next`, rejecting anything the state table or absorbing rule forbids.
    pub fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let allowed = if self.is_absorbing() {
            self.state == next
        } else {
            self.state.can_transition_to(next)
        };
        if !allowed {
            return Err(TransitionError {
                message_id: self.message_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_time = now;
        Ok(())
    }

    pub fn mark_published(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Published, now)
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Processing, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Completed, now)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed, now)?;
        self.error_message = Some(reason.into());
        self.first_failed_time.get_or_insert(now);
        Ok(())
    }

    /// Bump the retry count and park the row until the delayed publish lands.
    pub fn schedule_retry(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::RetryScheduled, now)?;
        self.retry_count += 1;
        self.error_message = Some(reason.into());
        self.last_retry_time = Some(now);
        self.first_failed_time.get_or_insert(now);
        Ok(())
    }

    /// Record retry bookkeeping without a state change. Never lowers the count.
    pub fn set_retry_info(&mut self, retry_count: u32, reason: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.max(retry_count);
        self.error_message = Some(reason.into());
        self.last_retry_time = Some(now);
        self.updated_time = now;
    }

    /// Administrative repair. Bypasses the state table.
    pub fn apply_fix(&mut self, fix: &TaskFix, now: DateTime<Utc>) {
        if let Some(state) = fix.state {
            self.state = state;
        }
        if let Some(retry_count) = fix.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(error_message) = &fix.error_message {
            self.error_message = Some(error_message.clone());
        }
        self.updated_time = now;
    }

    pub fn parse_event(&self) -> Result<EventMessage, serde_json::Error> {
        EventMessage::from_payload(&self.payload)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            message_id: self.message_id.clone(),
            topic: self.topic.clone(),
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message.clone(),
            last_retry_time: self.last_retry_time,
            first_failed_time: self.first_failed_time,
            updated_time: self.updated_time,
        }
    }
}

/// Read-only view of a row, without the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub message_id: MessageId,
    pub topic: String,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub first_failed_time: Option<DateTime<Utc>>,
    pub updated_time: DateTime<Utc>,
}

impl TaskInfo {
    pub fn is_absorbing(&self) -> bool {
        match self.state {
            TaskState::Completed => true,
            TaskState::Failed => self.retry_count >= self.max_retries,
            _ => false,
        }
    }
}

/// Repair instruction for one row. `None` fields are left alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFix {
    pub message_id: MessageId,
    pub state: Option<TaskState>,
    pub retry_count: Option<u32>,
    pub error_message: Option<String>,
}

impl TaskFix {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            state: None,
            retry_count: None,
            error_message: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.retry_count.is_none() && self.error_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record() -> TaskRecord {
        let event = EventMessage::new(MessageId::new("m1"), "t", json!({ "n": 1 }));
        TaskRecord::create(&event, 3, Utc::now()).unwrap()
    }

    #[test]
    fn new_fix_changes_nothing() {
        let fix = TaskFix::new(MessageId::new("m1"));
        assert!(fix.is_empty());
        assert_eq!(fix.message_id, MessageId::new("m1"));

        let mut r = record();
        let before = r.clone();
        r.apply_fix(&fix, Utc::now());
        assert_eq!(r.state, before.state);
        assert_eq!(r.retry_count, before.retry_count);
        assert_eq!(r.error_message, before.error_message);
    }

    #[test]
    fn create_starts_in_create_with_zero_retries() {
        let r = record();
        assert_eq!(r.state, TaskState::Create);
        assert_eq!(r.retry_count, 0);
        assert_eq!(r.max_retries, 3);
        assert_eq!(r.parse_event().unwrap().id, MessageId::new("m1"));
    }

    #[test]
    fn schedule_retry_bumps_count_and_keeps_first_failure() {
        let mut r = record();
        let t0 = Utc::now();
        r.mark_published(t0).unwrap();
        r.mark_processing(t0).unwrap();
        r.schedule_retry("boom", t0).unwrap();
        assert_eq!(r.state, TaskState::RetryScheduled);
        assert_eq!(r.retry_count, 1);
        assert!(r.can_retry());

        let t1 = t0 + Duration::minutes(5);
        r.mark_published(t1).unwrap();
        r.mark_processing(t1).unwrap();
        r.schedule_retry("boom again", t1).unwrap();
        assert_eq!(r.retry_count, 2);
        assert_eq!(r.first_failed_time, Some(t0));
        assert_eq!(r.last_retry_time, Some(t1));
    }

    #[test]
    fn completed_rejects_further_transitions() {
        let mut r = record();
        let now = Utc::now();
        r.mark_published(now).unwrap();
        r.mark_processing(now).unwrap();
        r.mark_completed(now).unwrap();

        assert!(r.mark_completed(now).is_ok());
        let err = r.mark_failed("late", now).unwrap_err();
        assert_eq!(err.from, TaskState::Completed);
        assert_eq!(r.state, TaskState::Completed);
        assert_eq!(r.error_message, None);
    }

    #[test]
    fn exhausted_failure_is_absorbing() {
        let mut r = record();
        let now = Utc::now();
        r.retry_count = 3;
        r.mark_failed("exceeded", now).unwrap();
        assert!(r.is_absorbing());
        assert!(!r.can_retry());
        assert!(r.mark_published(now).is_err());
    }

    #[test]
    fn failure_with_budget_can_be_republished() {
        let mut r = record();
        let now = Utc::now();
        r.mark_failed("publish error", now).unwrap();
        assert!(!r.is_absorbing());
        assert!(r.can_retry());
        r.mark_published(now).unwrap();
        assert_eq!(r.state, TaskState::Published);
    }

    #[test]
    fn retry_info_never_lowers_count() {
        let mut r = record();
        r.retry_count = 2;
        r.set_retry_info(1, "stale", Utc::now());
        assert_eq!(r.retry_count, 2);
        r.set_retry_info(4, "fresh", Utc::now());
        assert_eq!(r.retry_count, 4);
    }
}
