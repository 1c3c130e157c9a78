//! App - アプリケーションロジック
//!
//! # フロー
//! producer → EventPublisher（persist → publish）→ broker → ConsumerTemplate
//! → 失敗時 RetryStateManager → 遅延再送 or dead-letter → DeadLetterManager
//!
//! MessageRecoveryService は RecoveryLoop から定期的に動き、同じ publisher / retry 経路を使う。

pub mod persistence;
pub mod publisher;
pub mod retry;
pub mod dead_letter;
pub mod sync;
pub mod recovery;
pub mod consumer;
pub mod builder;

pub use self::persistence::MessagePersistenceService;
pub use self::publisher::EventPublisher;
pub use self::retry::RetryStateManager;
pub use self::dead_letter::DeadLetterManager;
pub use self::sync::{MessageStateSynchronizer, SyncStrategy};
pub use self::recovery::{MessageRecoveryService, RecoveryLoop};
pub use self::consumer::{ConsumerRegistry, ConsumerTemplate, DeliveryOutcome, EventConsumer};
