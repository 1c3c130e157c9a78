//! TaskStore port - Task 行の正本（source of truth）
//!
//! 実装はリレーショナル DB を想定（`message_id` に一意制約、`state` と
//! `updated_time` にインデックス）。開発・テスト用には `impls::InMemoryTaskStore`。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::UpdateError;
use crate::domain::{MessageId, StoreError, TaskRecord, TaskState};

/// 1 行に対する read-modify-write。Err を返したら行は変更されない
pub type TaskUpdate = Box<dyn FnOnce(&mut TaskRecord) -> Result<(), UpdateError> + Send>;

/// クロージャを `TaskUpdate` に包む（引数の型推論をここで効かせる）
pub fn task_update<F, E>(f: F) -> TaskUpdate
where
    F: FnOnce(&mut TaskRecord) -> Result<(), E> + Send + 'static,
    E: Into<UpdateError>,
{
    Box::new(move |record| f(record).map_err(Into::into))
}

/// TaskStore は Task 行の keyed store
///
/// # 設計原則
/// - `update` は 1 行に対する原子的な read-modify-write（トランザクション相当）
/// - 同じ行への書き込みは直列化、読み取りは並行可
/// - 一覧系は `created_time` の昇順、`limit` 件まで
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 新規行を追加。同じ `message_id` が既にあれば `StoreError::Duplicate`
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn find_by_id(&self, message_id: &MessageId) -> Result<Option<TaskRecord>, StoreError>;

    async fn find_by_state(&self, state: TaskState, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// FAILED rows with `retry_count < max_retries`
    async fn find_retryable_failed(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    async fn find_by_topic(&self, topic: &str, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// `state` のまま `updated_before` より前から更新されていない行
    async fn find_stale(
        &self,
        state: TaskState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// 行が無ければ `StoreError::NotFound`。成功時は更新後の行を返す
    async fn update(&self, message_id: &MessageId, update: TaskUpdate) -> Result<TaskRecord, UpdateError>;

    async fn delete(&self, message_id: &MessageId) -> Result<bool, StoreError>;

    /// `updated_before` より前に COMPLETED になった行を削除し、件数を返す
    async fn delete_completed_before(&self, updated_before: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn count_by_state(&self) -> Result<HashMap<TaskState, usize>, StoreError>;
}
