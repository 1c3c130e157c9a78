//! RetryStateManager - retry の判定と実行
//!
//! # 設計原則
//! - 判定は常に永続化された retry 回数から行う（event は不変で、再配送でも同じ内容が届く）
//! - 判定そのものは `RetryContext::decide`（純粋関数）、ここは I/O と記録だけ
//! - retry 回数は巻き戻さない。遅延再送に失敗したら FAILED として記録し、次の評価に任せる

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::domain::errors::UpdateError;
use crate::domain::{EventMessage, MessageId, RetryContext, RetryDecision, RetryStats};

use super::{EventPublisher, MessagePersistenceService};

pub struct RetryStateManager {
    persistence: Arc<MessagePersistenceService>,
    publisher: Arc<EventPublisher>,
}

impl RetryStateManager {
    pub fn new(persistence: Arc<MessagePersistenceService>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            persistence,
            publisher,
        }
    }

    /// Decide RETRY / FAIL from the stored retry count, or ERROR if the task cannot be read.
    pub async fn evaluate_retry(&self, event: &EventMessage, error_message: &str) -> RetryContext {
        let task = match self.persistence.get_task_info(&event.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(message_id = %event.id, "retry evaluation: task not found");
                return RetryContext::error(
                    event.id.clone(),
                    &event.topic,
                    format!("task not found; last error: {error_message}"),
                );
            }
            Err(e) => {
                error!(message_id = %event.id, error = %e, "retry evaluation: store error");
                return RetryContext::error(
                    event.id.clone(),
                    &event.topic,
                    format!("retry evaluation failed: {e}; last error: {error_message}"),
                );
            }
        };

        let policy = self.persistence.policies().resolve(&event.topic);
        let context = RetryContext::decide(&task, &policy, error_message);
        debug!(
            message_id = %event.id,
            decision = ?context.decision,
            retry_count = context.current_retry_count,
            max_retries = context.max_retries,
            delay_ms = context.delay_millis(),
            "retry evaluated"
        );
        context
    }

    /// Record the retry and schedule the delayed redelivery.
    ///
    /// A concurrent delivery that already scheduled this retry counts as success.
    pub async fn execute_retry(&self, context: &RetryContext, event: &EventMessage) -> bool {
        if context.decision != RetryDecision::Retry {
            warn!(message_id = %context.message_id, decision = ?context.decision, "execute_retry called without a RETRY decision");
            return false;
        }

        let audit = format!(
            "retry #{}, delay {}ms, reason: {}",
            context.current_retry_count,
            context.delay_millis(),
            context.error_message
        );
        let expected = context.current_retry_count.saturating_sub(1);
        match self
            .persistence
            .increment_retry_count_from(&context.message_id, expected, &audit)
            .await
        {
            Ok(_) => {}
            Err(UpdateError::Conflict { actual, .. }) if actual >= context.current_retry_count => {
                debug!(message_id = %context.message_id, retry_count = actual, "retry already scheduled by a concurrent delivery");
                return true;
            }
            Err(e) => {
                error!(message_id = %context.message_id, error = %e, "failed to record retry");
                return false;
            }
        }

        match self.publisher.publish_delayed(event, context.delay).await {
            Ok(()) => {
                info!(
                    message_id = %context.message_id,
                    retry = context.current_retry_count,
                    max_retries = context.max_retries,
                    delay_ms = context.delay_millis(),
                    "retry scheduled"
                );
                true
            }
            Err(e) => {
                // 回数は戻さない。失敗として記録して次の評価に回す
                self.persistence
                    .mark_failed(&context.message_id, &format!("retry publish failed: {e}"))
                    .await;
                false
            }
        }
    }

    /// Record the terminal failure with the max-retries bound and the last error.
    pub async fn mark_final_failure(&self, context: &RetryContext) -> bool {
        let message = format!(
            "exceeded max retries ({}), last error: {}",
            context.max_retries, context.error_message
        );
        let recorded = self.persistence.mark_failed(&context.message_id, &message).await;
        if recorded {
            warn!(message_id = %context.message_id, max_retries = context.max_retries, "message failed permanently");
        }
        recorded
    }

    pub async fn get_retry_stats(&self, message_id: &MessageId) -> Option<RetryStats> {
        match self.persistence.get_task_info(message_id).await {
            Ok(info) => info.as_ref().map(RetryStats::from),
            Err(e) => {
                error!(message_id = %message_id, error = %e, "failed to load retry stats");
                None
            }
        }
    }
}
