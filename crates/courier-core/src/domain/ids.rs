//! Message identifier.
//!
//! # ID の方針
//! - `MessageId` は外部（プロデューサ）が割り当てる文字列 ID
//! - retry / 再配送をまたいで不変、Task 行の一意キー
//! - 自前で採番する場合は ULID を使う（時刻でソート可能、分散生成可能）

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// MessageId は 1 イベントメッセージの一意な識別子
///
/// broker に送るときの correlation id としてもそのまま使う。
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// 外部から割り当てられた ID をそのまま包む
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// ULID で新しい ID を採番
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Ulid> for MessageId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid.to_string())
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
