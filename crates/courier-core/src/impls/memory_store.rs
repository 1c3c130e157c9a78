//! In-memory task store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::errors::UpdateError;
use crate::domain::{MessageId, StoreError, TaskRecord, TaskState};
use crate::ports::{TaskStore, TaskUpdate};

/// In-memory store state.
#[derive(Default)]
struct InMemoryStoreState {
    /// All task records (single source of truth).
    records: HashMap<MessageId, TaskRecord>,

    /// Number of upcoming inserts that fail with a backend error.
    failing_inserts: usize,

    /// Every operation fails while set.
    unavailable: bool,
}

impl InMemoryStoreState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Records matching `filter`, oldest first, at most `limit`.
    fn select<F>(&self, limit: usize, filter: F) -> Vec<TaskRecord>
    where
        F: Fn(&TaskRecord) -> bool,
    {
        let mut matched: Vec<&TaskRecord> = self.records.values().filter(|r| filter(r)).collect();
        matched.sort_by(|a, b| {
            a.created_time
                .cmp(&b.created_time)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        matched.into_iter().take(limit).cloned().collect()
    }
}

/// In-memory `TaskStore`.
///
/// One mutex guards every row, so `update` is trivially atomic. Cloning the
/// store shares the same rows.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail.
    pub async fn fail_next_inserts(&self, n: usize) {
        self.state.lock().await.failing_inserts = n;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Put a row in place as-is, bypassing duplicate checks. For seeding fixtures.
    pub async fn put(&self, record: TaskRecord) {
        let mut state = self.state.lock().await;
        state.records.insert(record.message_id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Backend("insert failed".to_string()));
        }
        if state.records.contains_key(&record.message_id) {
            return Err(StoreError::Duplicate(record.message_id));
        }
        state.records.insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn find_by_id(&self, message_id: &MessageId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.records.get(message_id).cloned())
    }

    async fn find_by_state(&self, task_state: TaskState, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.select(limit, |r| r.state == task_state))
    }

    async fn find_retryable_failed(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.select(limit, |r| r.state == TaskState::Failed && r.can_retry()))
    }

    async fn find_by_topic(&self, topic: &str, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.select(limit, |r| r.topic == topic))
    }

    async fn find_stale(
        &self,
        task_state: TaskState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.select(limit, |r| r.state == task_state && r.updated_time < updated_before))
    }

    async fn update(&self, message_id: &MessageId, update: TaskUpdate) -> Result<TaskRecord, UpdateError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let record = state
            .records
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.clone()))?;

        // 失敗したら行に触れない（トランザクションのロールバック相当）
        let mut draft = record.clone();
        update(&mut draft)?;
        *record = draft.clone();
        Ok(draft)
    }

    async fn delete(&self, message_id: &MessageId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(state.records.remove(message_id).is_some())
    }

    async fn delete_completed_before(&self, updated_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let before = state.records.len();
        state
            .records
            .retain(|_, r| !(r.state == TaskState::Completed && r.updated_time < updated_before));
        Ok(before - state.records.len())
    }

    async fn count_by_state(&self) -> Result<HashMap<TaskState, usize>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let mut counts = HashMap::new();
        for record in state.records.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventMessage;
    use crate::ports::task_update;
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str, created: DateTime<Utc>) -> TaskRecord {
        let event = EventMessage::new(MessageId::new(id), "t", json!({}));
        TaskRecord::create(&event, 3, created).unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        store.insert(record("m1", now)).await.unwrap();
        let err = store.insert(record("m1", now)).await.unwrap_err();
        assert_eq!(err, StoreError::Duplicate(MessageId::new("m1")));
    }

    #[tokio::test]
    async fn find_by_state_is_oldest_first_and_limited() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        store.insert(record("b", now)).await.unwrap();
        store.insert(record("a", now - Duration::seconds(10))).await.unwrap();
        store.insert(record("c", now + Duration::seconds(10))).await.unwrap();

        let found = store.find_by_state(TaskState::Create, 2).await.unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn retryable_failed_filters_before_limit() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        for n in 0..5 {
            let mut r = record(&format!("x{n}"), now - Duration::seconds(60));
            r.mark_failed("boom", now).unwrap();
            r.set_retry_info(3, "boom", now);
            store.insert(r).await.unwrap();
        }
        let mut open = record("open", now);
        open.mark_failed("boom", now).unwrap();
        store.insert(open).await.unwrap();

        let found = store.find_retryable_failed(2).await.unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["open"]);
    }

    #[tokio::test]
    async fn rejected_update_leaves_row_untouched() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        store.insert(record("m1", now)).await.unwrap();

        let err = store
            .update(
                &MessageId::new("m1"),
                task_update(move |r| {
                    r.retry_count = 99;
                    r.mark_completed(now)
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Transition(_)));

        let row = store.find_by_id(&MessageId::new("m1")).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.state, TaskState::Create);
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store
            .update(&MessageId::new("nope"), task_update(|_| Ok::<(), UpdateError>(())))
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::Store(StoreError::NotFound(MessageId::new("nope"))));
    }

    #[tokio::test]
    async fn delete_completed_before_keeps_recent_and_open_rows() {
        let store = InMemoryTaskStore::new();
        let old = Utc::now() - Duration::days(10);
        let mut done_old = record("old", old);
        done_old.state = TaskState::Completed;
        let mut done_new = record("new", Utc::now());
        done_new.state = TaskState::Completed;
        store.put(done_old).await;
        store.put(done_new).await;
        store.put(record("open", old)).await;

        let removed = store
            .delete_completed_before(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryTaskStore::new();
        store.set_unavailable(true).await;
        assert!(store.find_by_id(&MessageId::new("m1")).await.is_err());
        assert!(store.count_by_state().await.is_err());
    }
}
