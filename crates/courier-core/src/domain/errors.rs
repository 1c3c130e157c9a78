//! Errors - エラー型と分類
//!
//! # 分類
//! - StoreError: TaskStore（正本）の障害
//! - BrokerError: broker 送信 / ack / nack の障害
//! - PersistError: outbox 書き込みの失敗（publish を中断させる）
//! - PublishError: publish 全体の失敗
//! - TransitionError: 状態表が許さない遷移

use thiserror::Error;

use super::{MessageId, TaskState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task already exists: message_id={0}")]
    Duplicate(MessageId),

    #[error("task not found: message_id={0}")]
    NotFound(MessageId),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("task is already in a terminal state: message_id={0}")]
    AlreadyCompleted(MessageId),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("outbox write failed: {0}")]
    Persist(#[from] PersistError),

    #[error("broker send failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("no stored message for message_id={0}")]
    NotFound(MessageId),

    #[error("stored payload cannot be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for message_id={message_id}: {from} -> {to}")]
pub struct TransitionError {
    pub message_id: MessageId,
    pub from: TaskState,
    pub to: TaskState,
}

/// Row-level update failure: the row rejected the transition, or the store failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The row moved on since the caller read it.
    #[error("stale retry count for message_id={message_id}: expected {expected}, found {actual}")]
    Conflict {
        message_id: MessageId,
        expected: u32,
        actual: u32,
    },
}
