//! InMemoryBroker / RecordingChannel - 開発用の broker
//!
//! # 実装詳細
//! - publish されたメッセージを順に記録するだけ（配送はしない）
//! - message_id 単位、または全体での送信失敗を注入できる
//! - RecordingChannel は ack / nack を記録し、「1 配送につき 1 回」を検証できる

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{BrokerError, MessageId};
use crate::ports::{Broker, DeliveryChannel, OutboundMessage};

#[derive(Default)]
struct BrokerState {
    published: Vec<OutboundMessage>,
    attempts: usize,
    failing_ids: HashSet<MessageId>,
    unavailable: bool,
}

/// InMemoryBroker は送信を記録する開発用 broker
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.fail_for(MessageId::new("m2")).await;
/// publisher.publish(&event).await?;
/// assert_eq!(broker.published().await.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `message_id` の送信を失敗させる
    pub async fn fail_for(&self, message_id: MessageId) {
        self.state.lock().await.failing_ids.insert(message_id);
    }

    pub async fn recover_for(&self, message_id: &MessageId) {
        self.state.lock().await.failing_ids.remove(message_id);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// 成功した送信（送信順）
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_to(&self, exchange: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// 失敗も含めた送信試行回数
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if state.unavailable {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }
        if state.failing_ids.contains(&message.body.id) {
            return Err(BrokerError::Rejected(format!(
                "publish refused for message_id={}",
                message.body.id
            )));
        }
        state.published.push(message);
        Ok(())
    }
}

/// 記録された ack / nack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
}

/// ack / nack を記録する DeliveryChannel
#[derive(Clone, Default)]
pub struct RecordingChannel {
    log: Arc<Mutex<Vec<Acknowledgement>>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.log.lock().await.clone()
    }

    pub async fn acks(&self) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|a| matches!(a, Acknowledgement::Ack(_)))
            .count()
    }

    pub async fn nacks(&self) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|a| matches!(a, Acknowledgement::Nack { .. }))
            .count()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.log.lock().await.push(Acknowledgement::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.log
            .lock()
            .await
            .push(Acknowledgement::Nack { delivery_tag, requeue });
        Ok(())
    }
}
