//! MessagePersistenceService - Task 行のライフサイクル操作
//!
//! # 方針
//! - `persist` の失敗は呼び出し元へ返す（outbox の要。記録なしに publish させない）
//! - それ以外の更新は失敗をログに出して `false` を返し、呼び出し元にフォールバックを選ばせる
//! - 冪等性は store の update-by-id と状態表（同一状態への遷移は no-op）で担保

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::errors::UpdateError;
use crate::domain::{
    EventMessage, MessageId, PersistError, RetryPolicyTable, StoreError, TaskFix, TaskInfo,
    TaskRecord, TaskState,
};
use crate::observability::StateCounts;
use crate::ports::{Clock, TaskStore, TaskUpdate, task_update};

pub struct MessagePersistenceService {
    store: Arc<dyn TaskStore>,
    policies: Arc<RetryPolicyTable>,
    clock: Arc<dyn Clock>,
}

impl MessagePersistenceService {
    pub fn new(store: Arc<dyn TaskStore>, policies: Arc<RetryPolicyTable>, clock: Arc<dyn Clock>) -> Self {
        Self { store, policies, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn policies(&self) -> &RetryPolicyTable {
        &self.policies
    }

    /// Write the outbox row for `event`.
    ///
    /// A row that already exists and is not absorbing is kept as-is (retry count
    /// included) and the call succeeds, so recovery can re-publish through here.
    pub async fn persist(&self, event: &EventMessage) -> Result<(), PersistError> {
        let max_retries = self.policies.resolve(&event.topic).max_attempts;
        let record = TaskRecord::create(event, max_retries, self.now())?;

        match self.store.insert(record).await {
            Ok(()) => {
                debug!(message_id = %event.id, topic = %event.topic, "task persisted");
                Ok(())
            }
            Err(StoreError::Duplicate(id)) => match self.store.find_by_id(&id).await? {
                Some(existing) if existing.is_absorbing() => {
                    warn!(message_id = %id, state = %existing.state, "refusing to re-publish a terminal task");
                    Err(PersistError::AlreadyCompleted(id))
                }
                Some(existing) => {
                    debug!(
                        message_id = %id,
                        state = %existing.state,
                        retry_count = existing.retry_count,
                        "task already persisted, re-publishing"
                    );
                    Ok(())
                }
                None => Err(PersistError::Store(StoreError::NotFound(id))),
            },
            Err(e) => {
                error!(message_id = %event.id, error = %e, "failed to persist task");
                Err(e.into())
            }
        }
    }

    pub async fn mark_published(&self, message_id: &MessageId) -> bool {
        let now = self.now();
        self.apply(message_id, "mark_published", task_update(move |r| r.mark_published(now)))
            .await
    }

    pub async fn mark_processing(&self, message_id: &MessageId) -> bool {
        let now = self.now();
        self.apply(message_id, "mark_processing", task_update(move |r| r.mark_processing(now)))
            .await
    }

    pub async fn mark_completed(&self, message_id: &MessageId) -> bool {
        let now = self.now();
        self.apply(message_id, "mark_completed", task_update(move |r| r.mark_completed(now)))
            .await
    }

    pub async fn mark_failed(&self, message_id: &MessageId, reason: &str) -> bool {
        let now = self.now();
        let reason = reason.to_string();
        self.apply(message_id, "mark_failed", task_update(move |r| r.mark_failed(reason, now)))
            .await
    }

    pub async fn update_retry_info(&self, message_id: &MessageId, retry_count: u32, reason: &str) -> bool {
        let now = self.now();
        let reason = reason.to_string();
        self.apply(
            message_id,
            "update_retry_info",
            task_update(move |r| {
                r.set_retry_info(retry_count, reason, now);
                Ok::<(), UpdateError>(())
            }),
        )
        .await
    }

    /// Atomically bump the retry count and park the task in RETRY_SCHEDULED.
    pub async fn increment_retry_count(&self, message_id: &MessageId, reason: &str) -> bool {
        let now = self.now();
        let reason = reason.to_string();
        self.apply(
            message_id,
            "increment_retry_count",
            task_update(move |r| r.schedule_retry(reason, now)),
        )
        .await
    }

    /// Like `increment_retry_count`, but only while the stored count is still
    /// `expected_current`. Returns `Err(UpdateError::Conflict)` when another
    /// delivery got there first.
    pub async fn increment_retry_count_from(
        &self,
        message_id: &MessageId,
        expected_current: u32,
        reason: &str,
    ) -> Result<TaskInfo, UpdateError> {
        let now = self.now();
        let reason = reason.to_string();
        let id = message_id.clone();
        let record = self
            .store
            .update(
                message_id,
                task_update(move |r| {
                    if r.retry_count != expected_current {
                        return Err(UpdateError::Conflict {
                            message_id: id,
                            expected: expected_current,
                            actual: r.retry_count,
                        });
                    }
                    r.schedule_retry(reason, now)?;
                    Ok(())
                }),
            )
            .await?;
        debug!(message_id = %message_id, retry_count = record.retry_count, "retry count incremented");
        Ok(record.info())
    }

    /// Administrative repair of one row. Bypasses the state table.
    pub async fn repair_task(&self, fix: &TaskFix) -> bool {
        if fix.is_empty() {
            return true;
        }
        let now = self.now();
        let owned = fix.clone();
        let repaired = self
            .apply(
                &fix.message_id,
                "repair_task",
                task_update(move |r| {
                    r.apply_fix(&owned, now);
                    Ok::<(), UpdateError>(())
                }),
            )
            .await;
        if repaired {
            info!(message_id = %fix.message_id, state = ?fix.state, retry_count = ?fix.retry_count, "task repaired");
        }
        repaired
    }

    /// Repair several rows; returns how many were applied.
    pub async fn batch_fix_task_state(&self, fixes: &[TaskFix]) -> usize {
        let mut fixed = 0;
        for fix in fixes {
            if self.repair_task(fix).await {
                fixed += 1;
            }
        }
        fixed
    }

    pub async fn get_task_info(&self, message_id: &MessageId) -> Result<Option<TaskInfo>, StoreError> {
        Ok(self.store.find_by_id(message_id).await?.map(|r| r.info()))
    }

    pub async fn get_message_by_id(&self, message_id: &MessageId) -> Result<Option<TaskRecord>, StoreError> {
        self.store.find_by_id(message_id).await
    }

    pub async fn get_unpublished_messages(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.find_by_state(TaskState::Create, limit).await
    }

    /// PROCESSING rows not touched for longer than `timeout`.
    pub async fn get_timeout_processing_messages(
        &self,
        timeout: Duration,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let cutoff = self.now() - chrono::Duration::milliseconds(timeout.as_millis() as i64);
        self.store
            .find_stale(TaskState::Processing, cutoff, limit)
            .await
    }

    /// FAILED rows that still have retry budget.
    pub async fn get_retryable_failed_messages(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.find_retryable_failed(limit).await
    }

    pub async fn get_messages_by_topic(&self, topic: &str, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.find_by_topic(topic, limit).await
    }

    /// Delete COMPLETED rows older than `before_days`.
    pub async fn cleanup_completed_messages(&self, before_days: u32) -> Result<usize, StoreError> {
        let cutoff = self.now() - chrono::Duration::days(i64::from(before_days));
        let removed = self.store.delete_completed_before(cutoff).await?;
        if removed > 0 {
            info!(removed, before_days, "cleaned up completed tasks");
        }
        Ok(removed)
    }

    pub async fn state_counts(&self) -> Result<StateCounts, StoreError> {
        Ok(StateCounts::from(&self.store.count_by_state().await?))
    }

    async fn apply(&self, message_id: &MessageId, action: &'static str, update: TaskUpdate) -> bool {
        match self.store.update(message_id, update).await {
            Ok(record) => {
                debug!(message_id = %message_id, state = %record.state, action, "task updated");
                true
            }
            Err(UpdateError::Transition(e)) => {
                warn!(message_id = %message_id, error = %e, action, "task update rejected");
                false
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, action, "task update failed");
                false
            }
        }
    }
}
