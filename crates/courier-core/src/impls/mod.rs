//! Impls - 開発・テスト用の実装
//!
//! - InMemoryTaskStore: TaskStore の in-memory 実装（障害注入つき）
//! - InMemoryBroker: Broker の in-memory 実装（送信を記録、障害注入つき）
//! - RecordingChannel: DeliveryChannel の実装（ack / nack を記録）
//! - InMemoryDeadLetterStore: DeadLetterStore の in-memory 実装（件数上限つき、古いものから捨てる）

pub mod memory_store;
pub mod memory_broker;
pub mod memory_dead_letter;

pub use self::memory_store::InMemoryTaskStore;
pub use self::memory_broker::{Acknowledgement, InMemoryBroker, RecordingChannel};
pub use self::memory_dead_letter::InMemoryDeadLetterStore;
