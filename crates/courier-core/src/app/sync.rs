//! MessageStateSynchronizer - 配送中のメッセージと Task 行の突き合わせ
//!
//! # 設計原則
//! - 状態の正は Task 行。event は payload を運ぶだけで状態を持たない
//! - 戦略は呼び出しごとの引数。共有された「現在の戦略」は持たない
//! - 同期の失敗で配送を止めない（ログを残して event をそのまま返す）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{EventMessage, MessageId, TaskFix, TaskInfo, TaskState};

use super::MessagePersistenceService;

const MISSING_ERROR_PLACEHOLDER: &str = "state sync repair: missing error message";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Repair obviously broken rows, then trust the row.
    #[default]
    DatabaseFirst,
    /// Treat the delivery as authoritative and put the row back into PROCESSING.
    MessageFirst,
    /// Pick per state: keep failed rows with retry history and completed rows as they are,
    /// repair everything else like `DatabaseFirst`.
    SmartMerge,
}

impl SyncStrategy {
    pub const ALL: [SyncStrategy; 3] = [Self::DatabaseFirst, Self::MessageFirst, Self::SmartMerge];
}

/// One way of reconciling a delivery with its stored row.
#[async_trait]
pub trait StateSyncStrategy: Send + Sync {
    async fn sync_state(&self, event: &EventMessage, task: &TaskInfo);
}

/// Fixes a row needs before it can be trusted. Empty when the row is sound.
pub fn analyze_task_problems(task: &TaskInfo) -> (TaskFix, Vec<&'static str>) {
    let mut fix = TaskFix::new(task.message_id.clone());
    let mut reasons = Vec::new();

    let missing_error = task.error_message.as_deref().is_none_or(|m| m.trim().is_empty());
    if matches!(task.state, TaskState::Failed | TaskState::RetryScheduled) && missing_error {
        fix.error_message = Some(MISSING_ERROR_PLACEHOLDER.to_string());
        reasons.push("filled missing error message");
    }
    if task.state == TaskState::RetryScheduled && task.retry_count == 0 {
        fix.retry_count = Some(1);
        reasons.push("retry scheduled without a counted retry");
    }
    (fix, reasons)
}

pub struct DatabaseFirstSync {
    persistence: Arc<MessagePersistenceService>,
}

impl DatabaseFirstSync {
    pub fn new(persistence: Arc<MessagePersistenceService>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl StateSyncStrategy for DatabaseFirstSync {
    async fn sync_state(&self, event: &EventMessage, task: &TaskInfo) {
        let (fix, reasons) = analyze_task_problems(task);
        if fix.is_empty() {
            debug!(message_id = %event.id, state = %task.state, "task state sound, nothing to sync");
            return;
        }
        if self.persistence.batch_fix_task_state(&[fix]).await == 1 {
            info!(message_id = %event.id, fixes = ?reasons, "task state repaired from database view");
        } else {
            warn!(message_id = %event.id, fixes = ?reasons, "task state repair failed");
        }
    }
}

pub struct MessageFirstSync {
    persistence: Arc<MessagePersistenceService>,
}

impl MessageFirstSync {
    pub fn new(persistence: Arc<MessagePersistenceService>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl StateSyncStrategy for MessageFirstSync {
    async fn sync_state(&self, event: &EventMessage, task: &TaskInfo) {
        info!(message_id = %event.id, state = %task.state, "syncing from message, resetting task to processing");
        if !self.persistence.mark_processing(&event.id).await {
            warn!(message_id = %event.id, state = %task.state, "message-first sync could not reset task");
        }
    }
}

pub struct SmartMergeSync {
    database_first: DatabaseFirstSync,
}

impl SmartMergeSync {
    pub fn new(persistence: Arc<MessagePersistenceService>) -> Self {
        Self {
            database_first: DatabaseFirstSync::new(persistence),
        }
    }
}

#[async_trait]
impl StateSyncStrategy for SmartMergeSync {
    async fn sync_state(&self, event: &EventMessage, task: &TaskInfo) {
        match task.state {
            TaskState::Failed if task.retry_count > 0 => {
                info!(message_id = %event.id, retry_count = task.retry_count, "smart merge: failed task has retry history, keeping state");
            }
            TaskState::Completed => {
                debug!(message_id = %event.id, "smart merge: task completed, nothing to sync");
            }
            _ => self.database_first.sync_state(event, task).await,
        }
    }
}

/// Result of [`MessageStateSynchronizer::sync_message_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedMessage {
    pub event: EventMessage,
    /// Row as stored after syncing; `None` when no row exists or it could not be read.
    pub task: Option<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    pub consistent: bool,
    pub message_id: MessageId,
    pub stored_state: Option<TaskState>,
    pub reason: Option<String>,
}

pub struct MessageStateSynchronizer {
    persistence: Arc<MessagePersistenceService>,
    strategies: HashMap<SyncStrategy, Arc<dyn StateSyncStrategy>>,
    default_strategy: SyncStrategy,
}

impl MessageStateSynchronizer {
    pub fn new(persistence: Arc<MessagePersistenceService>, default_strategy: SyncStrategy) -> Self {
        let mut strategies: HashMap<SyncStrategy, Arc<dyn StateSyncStrategy>> = HashMap::new();
        strategies.insert(
            SyncStrategy::DatabaseFirst,
            Arc::new(DatabaseFirstSync::new(persistence.clone())),
        );
        strategies.insert(
            SyncStrategy::MessageFirst,
            Arc::new(MessageFirstSync::new(persistence.clone())),
        );
        strategies.insert(
            SyncStrategy::SmartMerge,
            Arc::new(SmartMergeSync::new(persistence.clone())),
        );
        Self {
            persistence,
            strategies,
            default_strategy,
        }
    }

    /// Swap the implementation behind `strategy`.
    pub fn with_strategy(mut self, strategy: SyncStrategy, implementation: Arc<dyn StateSyncStrategy>) -> Self {
        self.strategies.insert(strategy, implementation);
        self
    }

    pub fn default_strategy(&self) -> SyncStrategy {
        self.default_strategy
    }

    pub async fn sync_message_state(&self, event: &EventMessage) -> SyncedMessage {
        self.sync_message_state_with(event, self.default_strategy).await
    }

    pub async fn sync_message_state_with(&self, event: &EventMessage, strategy: SyncStrategy) -> SyncedMessage {
        let task = match self.persistence.get_task_info(&event.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(message_id = %event.id, "no task row to sync against");
                return SyncedMessage {
                    event: event.clone(),
                    task: None,
                };
            }
            Err(e) => {
                error!(message_id = %event.id, error = %e, "state sync: task lookup failed");
                return SyncedMessage {
                    event: event.clone(),
                    task: None,
                };
            }
        };

        match self.strategies.get(&strategy) {
            Some(implementation) => implementation.sync_state(event, &task).await,
            None => warn!(message_id = %event.id, strategy = ?strategy, "no implementation for sync strategy"),
        }

        // Re-read so callers see the row after any repair.
        let task = match self.persistence.get_task_info(&event.id).await {
            Ok(refreshed) => refreshed.or(Some(task)),
            Err(e) => {
                warn!(message_id = %event.id, error = %e, "state sync: re-read failed, using pre-sync view");
                Some(task)
            }
        };
        SyncedMessage {
            event: event.clone(),
            task,
        }
    }

    pub async fn check_consistency(&self, event: &EventMessage) -> ConsistencyCheckResult {
        let task = match self.persistence.get_task_info(&event.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return ConsistencyCheckResult {
                    consistent: false,
                    message_id: event.id.clone(),
                    stored_state: None,
                    reason: Some("task not found".to_string()),
                };
            }
            Err(e) => {
                error!(message_id = %event.id, error = %e, "consistency check failed");
                return ConsistencyCheckResult {
                    consistent: false,
                    message_id: event.id.clone(),
                    stored_state: None,
                    reason: Some(format!("check failed: {e}")),
                };
            }
        };

        let (fix, reasons) = analyze_task_problems(&task);
        ConsistencyCheckResult {
            consistent: fix.is_empty(),
            message_id: event.id.clone(),
            stored_state: Some(task.state),
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        }
    }

    /// Rebuild the event from its stored payload.
    pub async fn force_sync_from_database(&self, message_id: &MessageId) -> Option<EventMessage> {
        let record = match self.persistence.get_message_by_id(message_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(message_id = %message_id, "force sync: message not stored");
                return None;
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "force sync: lookup failed");
                return None;
            }
        };
        match record.parse_event() {
            Ok(event) => {
                info!(message_id = %message_id, "event rebuilt from database");
                Some(event)
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "force sync: stored payload unreadable");
                None
            }
        }
    }

    /// Returns how many ids could be rebuilt.
    pub async fn batch_sync_message_states(&self, message_ids: &[MessageId]) -> usize {
        let mut synced = 0;
        for id in message_ids {
            if self.force_sync_from_database(id).await.is_some() {
                synced += 1;
            }
        }
        info!(total = message_ids.len(), synced, "batch sync finished");
        synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    use crate::domain::{RetryPolicyTable, TaskRecord};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;

    fn fixture() -> (InMemoryTaskStore, Arc<MessagePersistenceService>) {
        let store = InMemoryTaskStore::new();
        let persistence = Arc::new(MessagePersistenceService::new(
            Arc::new(store.clone()),
            Arc::new(RetryPolicyTable::default()),
            Arc::new(FixedClock::new(Utc::now())),
        ));
        (store, persistence)
    }

    fn event(id: &str) -> EventMessage {
        EventMessage::new(MessageId::new(id), "orders", json!({ "order": 7 }))
    }

    async fn stored(store: &InMemoryTaskStore, id: &str, state: TaskState, retry_count: u32, error: Option<&str>) {
        let mut record = TaskRecord::create(&event(id), 3, Utc::now()).unwrap();
        record.state = state;
        record.retry_count = retry_count;
        record.error_message = error.map(str::to_string);
        store.put(record).await;
    }

    #[tokio::test]
    async fn database_first_fills_missing_error_message() {
        let (store, persistence) = fixture();
        stored(&store, "m1", TaskState::Failed, 1, None).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let synced = sync.sync_message_state(&event("m1")).await;

        let task = synced.task.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error_message.as_deref(), Some(MISSING_ERROR_PLACEHOLDER));
    }

    #[tokio::test]
    async fn database_first_counts_uncounted_scheduled_retry() {
        let (store, persistence) = fixture();
        stored(&store, "m1", TaskState::RetryScheduled, 0, Some("timeout")).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let task = sync.sync_message_state(&event("m1")).await.task.unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn message_first_resets_to_processing() {
        let (store, persistence) = fixture();
        stored(&store, "m1", TaskState::Published, 0, None).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let task = sync
            .sync_message_state_with(&event("m1"), SyncStrategy::MessageFirst)
            .await
            .task
            .unwrap();
        assert_eq!(task.state, TaskState::Processing);
    }

    #[tokio::test]
    async fn strategy_is_chosen_per_call() {
        let (store, persistence) = fixture();
        stored(&store, "m1", TaskState::Published, 0, None).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let first = sync.sync_message_state(&event("m1")).await.task.unwrap();
        assert_eq!(first.state, TaskState::Published);
        let second = sync
            .sync_message_state_with(&event("m1"), SyncStrategy::MessageFirst)
            .await
            .task
            .unwrap();
        assert_eq!(second.state, TaskState::Processing);
        assert_eq!(sync.default_strategy(), SyncStrategy::DatabaseFirst);
    }

    #[rstest]
    #[case::failed_with_history(TaskState::Failed, 2, None, None)]
    #[case::completed(TaskState::Completed, 0, None, None)]
    #[case::failed_without_history(TaskState::Failed, 0, None, Some(MISSING_ERROR_PLACEHOLDER))]
    #[tokio::test]
    async fn smart_merge_keeps_settled_rows(
        #[case] state: TaskState,
        #[case] retry_count: u32,
        #[case] error: Option<&str>,
        #[case] expected_error: Option<&str>,
    ) {
        let (store, persistence) = fixture();
        stored(&store, "m1", state, retry_count, error).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::SmartMerge);

        let task = sync.sync_message_state(&event("m1")).await.task.unwrap();
        assert_eq!(task.state, state);
        assert_eq!(task.error_message.as_deref(), expected_error);
    }

    #[tokio::test]
    async fn missing_row_passes_event_through() {
        let (_store, persistence) = fixture();
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let ghost = event("ghost");
        let synced = sync.sync_message_state(&ghost).await;
        assert_eq!(synced.event, ghost);
        assert!(synced.task.is_none());
    }

    #[tokio::test]
    async fn consistency_flags_missing_and_broken_rows() {
        let (store, persistence) = fixture();
        stored(&store, "ok", TaskState::Published, 0, None).await;
        stored(&store, "broken", TaskState::Failed, 1, Some("  ")).await;
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let ok = sync.check_consistency(&event("ok")).await;
        assert!(ok.consistent);
        assert_eq!(ok.stored_state, Some(TaskState::Published));

        let missing = sync.check_consistency(&event("ghost")).await;
        assert!(!missing.consistent);
        assert_eq!(missing.stored_state, None);
        assert_eq!(missing.reason.as_deref(), Some("task not found"));

        let broken = sync.check_consistency(&event("broken")).await;
        assert!(!broken.consistent);
        assert_eq!(broken.stored_state, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn force_sync_rebuilds_stored_events() {
        let (_store, persistence) = fixture();
        let a = event("a");
        persistence.persist(&a).await.unwrap();
        persistence.persist(&event("b")).await.unwrap();
        let sync = MessageStateSynchronizer::new(persistence, SyncStrategy::DatabaseFirst);

        let rebuilt = sync.force_sync_from_database(&MessageId::new("a")).await.unwrap();
        assert_eq!(rebuilt, a);
        assert!(sync.force_sync_from_database(&MessageId::new("zz")).await.is_none());

        let ids = [MessageId::new("a"), MessageId::new("zz"), MessageId::new("b")];
        assert_eq!(sync.batch_sync_message_states(&ids).await, 2);
    }

    #[test]
    fn strategy_names_are_snake_case() {
        let names: Vec<String> = SyncStrategy::ALL
            .iter()
            .map(|s| serde_json::to_string(s).unwrap())
            .collect();
        assert_eq!(names, ["\"database_first\"", "\"message_first\"", "\"smart_merge\""]);
    }
}
