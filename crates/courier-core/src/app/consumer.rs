//! Consumer - 業務 consumer を包む配送処理テンプレート
//!
//! # フロー（1 配送）
//! 1. MessageStateSynchronizer で Task 行と突き合わせる
//! 2. 行が終端（COMPLETED / 予算切れ FAILED）なら ack して業務処理を飛ばす
//! 3. PROCESSING にして業務処理を呼ぶ
//! 4. 成功: COMPLETED にして ack
//! 5. 失敗: RetryStateManager に判定を委ねる
//!    - RETRY: 遅延再送を記録して ack（失敗したら nack, requeue なし）
//!    - FAIL: 最終失敗を記録して ack（記録できなければ nack, requeue なし）
//!    - ERROR: FAILED を記録して nack, requeue なし（broker の dead-letter に回る）
//!
//! # 型消去
//! `EventHandler<E>` は型付き、`EventConsumer` は object-safe。
//! `TypedConsumer<E, H>` で包んで `ConsumerRegistry` に topic 単位で登録する。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, EventMessage, ProcessOutcome, RetryDecision, RetryStats};
use crate::ports::{Delivery, DeliveryChannel};

use super::{MessagePersistenceService, MessageStateSynchronizer, RetryStateManager};

/// Business consumer for one topic.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn topic(&self) -> &str;

    async fn process(&self, event: &EventMessage) -> ProcessOutcome;

    async fn on_process_success(&self, event: &EventMessage) {
        debug!(message_id = %event.id, "process success hook");
    }

    async fn on_process_failure(&self, event: &EventMessage, error_message: &str) {
        debug!(message_id = %event.id, error = error_message, "process failure hook");
    }
}

/// Typed business logic for one [`Event`].
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E, message: &EventMessage) -> ProcessOutcome;
}

pub struct TypedConsumer<E: Event, H: EventHandler<E>> {
    handler: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event, H: EventHandler<E>> TypedConsumer<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> EventConsumer for TypedConsumer<E, H> {
    fn topic(&self) -> &str {
        E::TOPIC
    }

    async fn process(&self, event: &EventMessage) -> ProcessOutcome {
        match event.decode::<E>() {
            Ok(typed) => self.handler.handle(typed, event).await,
            Err(e) => ProcessOutcome::fatal(format!("json decode: {e}")),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("consumer for topic '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Consumers keyed by topic. Built at startup, read-only afterwards.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn EventConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Event, H: EventHandler<E> + 'static>(&mut self, handler: H) -> Result<(), RegistryError> {
        self.register_consumer(Arc::new(TypedConsumer::<E, H>::new(handler)))
    }

    pub fn register_consumer(&mut self, consumer: Arc<dyn EventConsumer>) -> Result<(), RegistryError> {
        let topic = consumer.topic().to_string();
        if self.consumers.contains_key(&topic) {
            return Err(RegistryError::AlreadyRegistered(topic));
        }
        self.consumers.insert(topic, consumer);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn EventConsumer>> {
        self.consumers.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.consumers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// What the template did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed and acked.
    Completed,
    /// Failed; a delayed redelivery is scheduled and the delivery acked.
    RetryScheduled,
    /// Failed with the retry budget used up; recorded and acked.
    FinalFailure,
    /// Nacked without requeue; the broker dead-letters it.
    Rejected,
    /// Task already settled; acked without running business logic.
    Skipped,
}

pub struct ConsumerTemplate {
    persistence: Arc<MessagePersistenceService>,
    synchronizer: Arc<MessageStateSynchronizer>,
    retry: Arc<RetryStateManager>,
}

impl ConsumerTemplate {
    pub fn new(
        persistence: Arc<MessagePersistenceService>,
        synchronizer: Arc<MessageStateSynchronizer>,
        retry: Arc<RetryStateManager>,
    ) -> Self {
        Self {
            persistence,
            synchronizer,
            retry,
        }
    }

    /// Route the delivery to the consumer registered for its topic.
    pub async fn dispatch(
        &self,
        registry: &ConsumerRegistry,
        delivery: &Delivery,
        channel: &dyn DeliveryChannel,
    ) -> DeliveryOutcome {
        let Some(consumer) = registry.get(&delivery.event.topic) else {
            warn!(message_id = %delivery.event.id, topic = %delivery.event.topic, "no consumer for topic, rejecting");
            nack(channel, delivery).await;
            return DeliveryOutcome::Rejected;
        };
        self.handle_delivery(consumer.as_ref(), delivery, channel).await
    }

    pub async fn handle_delivery(
        &self,
        consumer: &dyn EventConsumer,
        delivery: &Delivery,
        channel: &dyn DeliveryChannel,
    ) -> DeliveryOutcome {
        let message_id = &delivery.event.id;
        info!(message_id = %message_id, topic = %delivery.event.topic, "handling delivery");

        let synced = self.synchronizer.sync_message_state(&delivery.event).await;
        if let Some(task) = synced.task.as_ref().filter(|t| t.is_absorbing()) {
            info!(message_id = %message_id, state = %task.state, "task already settled, skipping");
            ack(channel, delivery).await;
            return DeliveryOutcome::Skipped;
        }

        if !self.persistence.mark_processing(message_id).await {
            debug!(message_id = %message_id, "could not mark processing, continuing");
        }

        let outcome = consumer.process(&synced.event).await;
        match outcome.failure_message() {
            None => {
                if !self.persistence.mark_completed(message_id).await {
                    warn!(message_id = %message_id, "processed but completion not recorded");
                }
                ack(channel, delivery).await;
                consumer.on_process_success(&synced.event).await;
                info!(message_id = %message_id, "delivery completed");
                DeliveryOutcome::Completed
            }
            Some(error_message) => {
                if matches!(outcome, ProcessOutcome::Fatal(_)) {
                    error!(message_id = %message_id, error = %error_message, "business logic failed");
                } else {
                    warn!(message_id = %message_id, error = %error_message, "business logic rejected message");
                }
                let result = self.handle_failure(delivery, channel, &error_message).await;
                consumer.on_process_failure(&synced.event, &error_message).await;
                result
            }
        }
    }

    pub async fn get_retry_stats(&self, delivery: &Delivery) -> Option<RetryStats> {
        self.retry.get_retry_stats(&delivery.event.id).await
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        channel: &dyn DeliveryChannel,
        error_message: &str,
    ) -> DeliveryOutcome {
        let event = &delivery.event;
        let context = self.retry.evaluate_retry(event, error_message).await;
        match context.decision {
            RetryDecision::Retry => {
                if self.retry.execute_retry(&context, event).await {
                    ack(channel, delivery).await;
                    DeliveryOutcome::RetryScheduled
                } else {
                    error!(message_id = %event.id, "retry could not be scheduled, rejecting");
                    nack(channel, delivery).await;
                    DeliveryOutcome::Rejected
                }
            }
            RetryDecision::Fail => {
                if self.retry.mark_final_failure(&context).await {
                    ack(channel, delivery).await;
                    DeliveryOutcome::FinalFailure
                } else {
                    error!(message_id = %event.id, "final failure not recorded, rejecting");
                    nack(channel, delivery).await;
                    DeliveryOutcome::Rejected
                }
            }
            RetryDecision::Error => {
                error!(message_id = %event.id, error = %context.error_message, "retry evaluation failed, rejecting");
                self.persistence
                    .mark_failed(&event.id, &context.error_message)
                    .await;
                nack(channel, delivery).await;
                DeliveryOutcome::Rejected
            }
        }
    }
}

async fn ack(channel: &dyn DeliveryChannel, delivery: &Delivery) {
    if let Err(e) = channel.ack(delivery.delivery_tag).await {
        error!(message_id = %delivery.event.id, error = %e, "ack failed");
    }
}

async fn nack(channel: &dyn DeliveryChannel, delivery: &Delivery) {
    if let Err(e) = channel.nack(delivery.delivery_tag, false).await {
        error!(message_id = %delivery.event.id, error = %e, "nack failed");
    }
}
