//! courier-core
//!
//! Reliable event delivery on top of an AMQP-style broker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, event, state, task, retry, decision, outcome, dead_letter, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Broker, DeliveryChannel, Clock）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryBroker など開発用）
//! - **app**: アプリケーションロジック（persistence, publisher, retry, dead_letter, sync, recovery, consumer, builder）
//! - **config**: 設定（figment による階層マージ）
//! - **observability**: ログ初期化と状態カウント

pub mod domain;
pub mod ports;
pub mod impls;
pub mod app;
pub mod config;
pub mod observability;

pub use app::builder::{BuildError, Courier, CourierBuilder};
pub use config::CourierConfig;
pub use domain::{EventMessage, MessageId, TaskState};
