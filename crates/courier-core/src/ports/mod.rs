//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（リレーショナル DB, AMQP broker など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）。並行性の正しさは行単位の原子的更新に押し込む
//! - Broker は publish / ack / nack のプリミティブだけを提供
//! - DeadLetterStore は dead letter の保存先。保存の成否が DLQ の ack を決める
//! - 1 配送ごとに 1 DeliveryChannel（channel は配送間で共有しない）

pub mod task_store;
pub mod broker;
pub mod clock;
pub mod dead_letter_store;

pub use self::task_store::{task_update, TaskStore, TaskUpdate};
pub use self::broker::{Broker, Delivery, DeliveryChannel, OutboundMessage};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter_store::DeadLetterStore;
