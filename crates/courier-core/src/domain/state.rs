//! TaskState - Task 行の状態
//!
//! # 状態遷移
//! ```text
//! CREATE --publish ok--> PUBLISHED --pickup--> PROCESSING --success--> COMPLETED
//! CREATE --publish fails--> FAILED
//! PROCESSING --failure, retryable--> RETRY_SCHEDULED --delayed publish ok--> PUBLISHED
//! PROCESSING --failure, exhausted--> FAILED
//! PROCESSING --timeout sweep--> PUBLISHED
//! FAILED (budget left) --recovery--> PUBLISHED
//! ```
//! COMPLETED は吸収状態。FAILED も retry 予算を使い切ったら吸収状態になる
//! （予算の判定は `TaskRecord::is_absorbing` 側）。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// TaskState は Task 行の状態を表現
///
/// 永続化には `code()` の文字列を使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// outbox に書かれたが、まだ broker に送っていない
    Create,
    /// broker への送信に成功
    Published,
    /// consumer が処理中
    Processing,
    /// retry 回数を加算済み、遅延再送待ち
    RetryScheduled,
    /// 処理成功
    Completed,
    /// 失敗（予算が残っていれば recovery で再送される）
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Create,
        TaskState::Published,
        TaskState::Processing,
        TaskState::RetryScheduled,
        TaskState::Completed,
        TaskState::Failed,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TaskState::Create => "CREATE",
            TaskState::Published => "PUBLISHED",
            TaskState::Processing => "PROCESSING",
            TaskState::RetryScheduled => "RETRY_SCHEDULED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    /// まだ broker に乗っていない（recovery の unpublished sweep 対象）
    pub fn is_unpublished(&self) -> bool {
        matches!(self, TaskState::Create)
    }

    /// 状態表上の遷移可否。同一状態への遷移は冪等な no-op として許可する
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        if *self == next {
            return true;
        }
        match self {
            Create => matches!(next, Published | Processing | Failed),
            Published => matches!(next, Processing | Failed),
            Processing => matches!(next, Completed | Failed | RetryScheduled | Published),
            RetryScheduled => matches!(next, Published | Processing | Failed),
            Failed => matches!(next, Published | Processing),
            Completed => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state code: {0}")]
pub struct UnknownStateCode(pub String);

impl FromStr for TaskState {
    type Err = UnknownStateCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.code() == s)
            .ok_or_else(|| UnknownStateCode(s.to_string()))
    }
}
