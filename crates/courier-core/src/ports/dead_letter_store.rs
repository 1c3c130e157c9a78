//! DeadLetterStore port - `STORE_TO_DATABASE` の保存先
//!
//! 実装は dead-letter テーブル（`StorageType` ごとの表）を想定。
//! 開発・テスト用には `impls::InMemoryDeadLetterStore`。

use async_trait::async_trait;

use crate::domain::{DeadLetterRecord, MessageId, StoreError};

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// 保存できたときだけ Ok。Ok を返したら dead letter は ack してよい
    async fn save(&self, record: DeadLetterRecord) -> Result<(), StoreError>;

    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Vec<DeadLetterRecord>, StoreError>;
}
