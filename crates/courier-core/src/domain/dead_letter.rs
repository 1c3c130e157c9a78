//! Dead-letter values: actions, parameters and the per-message context.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventMessage, MessageId, TaskInfo};

pub const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const HEADER_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";
pub const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";

/// What to do with a dead-lettered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterAction {
    LogAndIgnore,
    StoreToDatabase,
    SendAlert,
    Requeue,
    ForwardToQueue,
    CustomHandle,
}

impl fmt::Display for DeadLetterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LogAndIgnore => "LOG_AND_IGNORE",
            Self::StoreToDatabase => "STORE_TO_DATABASE",
            Self::SendAlert => "SEND_ALERT",
            Self::Requeue => "REQUEUE",
            Self::ForwardToQueue => "FORWARD_TO_QUEUE",
            Self::CustomHandle => "CUSTOM_HANDLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    DeadLetterTable,
    FailedMessageTable,
    AuditLogTable,
}

/// Everything known about one dead-lettered message.
///
/// Built from the broker's death headers merged with the task row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterContext {
    pub message_id: MessageId,
    pub topic: String,
    pub original_queue: Option<String>,
    pub original_exchange: Option<String>,
    pub original_routing_key: Option<String>,
    pub death_reason: Option<String>,
    pub failure_reason: String,
    pub retry_count: u32,
    pub first_failure_time: DateTime<Utc>,

    /// When the dead-lettered delivery was picked up.
    pub received_at: DateTime<Utc>,
    pub event: EventMessage,
}

impl DeadLetterContext {
    /// `routing_key` is the key the dead-lettered delivery arrived with; the
    /// dead-letter exchange keeps the original one unless overridden.
    pub fn build(
        event: EventMessage,
        headers: &HashMap<String, String>,
        routing_key: Option<&str>,
        task: Option<&TaskInfo>,
        now: DateTime<Utc>,
    ) -> Self {
        let death_reason = headers.get(HEADER_FIRST_DEATH_REASON).cloned();
        let failure_reason = task
            .and_then(|t| t.error_message.clone())
            .or_else(|| death_reason.clone())
            .unwrap_or_else(|| "unknown error".to_string());

        Self {
            message_id: event.id.clone(),
            topic: event.topic.clone(),
            original_queue: headers.get(HEADER_FIRST_DEATH_QUEUE).cloned(),
            original_exchange: headers.get(HEADER_FIRST_DEATH_EXCHANGE).cloned(),
            original_routing_key: routing_key.map(str::to_string),
            death_reason,
            failure_reason,
            retry_count: task.map(|t| t.retry_count).unwrap_or(0),
            first_failure_time: task.and_then(|t| t.first_failed_time).unwrap_or(now),
            received_at: now,
            event,
        }
    }

    pub fn failure_duration(&self) -> chrono::Duration {
        self.received_at - self.first_failure_time
    }
}

/// A dead-lettered message as archived by `STORE_TO_DATABASE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: MessageId,
    pub topic: String,
    pub storage: StorageType,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub original_queue: Option<String>,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_context(ctx: &DeadLetterContext, storage: StorageType, now: DateTime<Utc>) -> Self {
        Self {
            message_id: ctx.message_id.clone(),
            topic: ctx.topic.clone(),
            storage,
            payload: ctx.event.data.clone(),
            error_message: ctx.failure_reason.clone(),
            original_queue: ctx.original_queue.clone(),
            retry_count: ctx.retry_count,
            first_failed_at: ctx.first_failure_time,
            stored_at: now,
        }
    }
}
