//! Broker port - AMQP 風 broker の最小プリミティブ
//!
//! broker 自体の配送プロトコルはここでは定義しない。必要なのは
//! exchange / routing key への publish と、配送ごとの ack / nack だけ。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, EventMessage, MessageId};

/// broker に送る 1 メッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,

    /// 常に `message_id` と同じ値
    pub correlation_id: MessageId,

    /// per-message TTL。retry exchange では期限切れで本来のキューに dead-letter される
    pub expiration: Option<Duration>,
    pub headers: HashMap<String, String>,
    pub body: EventMessage,
}

impl OutboundMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: EventMessage) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: body.id.clone(),
            expiration: None,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// consumer に届いた 1 配送
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub event: EventMessage,
}

impl Delivery {
    pub fn new(delivery_tag: u64, event: EventMessage) -> Self {
        Self {
            delivery_tag,
            routing_key: None,
            headers: HashMap::new(),
            event,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// 配送を受け取った channel。ack / nack はこの channel に対して行う
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// `requeue = false` なら broker の dead-letter exchange に回る
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
