//! Event message - broker に流れるイベントの外形
//!
//! # 学習ポイント
//! - Associated Constants (`const TOPIC`)
//! - `serde_json::Value` による payload の型消去と `decode::<E>()` による復元

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::MessageId;

/// Event は topic と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct PartCreated {
///     part_no: String,
/// }
///
/// impl Event for PartCreated {
///     const TOPIC: &'static str = "catalog.part.created";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// routing / 分類キー。retry policy もこの値で引く
    const TOPIC: &'static str;
}

/// EventMessage は Task 行の payload としてそのまま保存される
///
/// event 自体は不変。再配送では同じ内容が繰り返し届くので、
/// retry 回数などの可変状態は載せず、常に Task 行を正とする。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: MessageId,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(id: MessageId, topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id,
            topic: topic.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// 型付きイベントから EventMessage を作る（ID は ULID で採番）
    pub fn from_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageId::generate(),
            E::TOPIC,
            serde_json::to_value(event)?,
        ))
    }

    /// payload を型付きイベントに戻す
    pub fn decode<E: Event>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Task 行に保存する文字列表現
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Task 行の payload から復元
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
