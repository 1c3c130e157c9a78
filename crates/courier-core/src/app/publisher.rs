//! EventPublisher - transactional outbox publisher
//!
//! # フロー
//! 1. Task 行を書く（失敗したら broker には何も送らない）
//! 2. correlation id = message_id で broker に送る
//! 3. 送信失敗なら Task を FAILED にする。成功なら PUBLISHED
//!
//! 遅延再送は retry exchange に per-message TTL を付けて送る。期限切れで
//! broker が本来のキューへ dead-letter するので、専用のスケジューラは持たない。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::domain::{EventMessage, MessageId, PersistError, PublishError};
use crate::ports::{Broker, OutboundMessage};

use super::MessagePersistenceService;

pub struct EventPublisher {
    persistence: Arc<MessagePersistenceService>,
    broker: Arc<dyn Broker>,
    topology: BrokerConfig,
}

impl EventPublisher {
    pub fn new(
        persistence: Arc<MessagePersistenceService>,
        broker: Arc<dyn Broker>,
        topology: BrokerConfig,
    ) -> Self {
        Self {
            persistence,
            broker,
            topology,
        }
    }

    pub fn topology(&self) -> &BrokerConfig {
        &self.topology
    }

    /// Publish to the default exchange and routing key.
    pub async fn publish(&self, event: &EventMessage) -> Result<(), PublishError> {
        self.publish_to(event, &self.topology.exchange, &self.topology.routing_key)
            .await
    }

    pub async fn publish_to(
        &self,
        event: &EventMessage,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        if let Err(e) = self.persistence.persist(event).await {
            error!(message_id = %event.id, error = %e, "outbox write failed, event not sent");
            return Err(e.into());
        }

        let message = OutboundMessage::new(exchange, routing_key, event.clone());
        if let Err(e) = self.broker.publish(message).await {
            error!(message_id = %event.id, exchange, routing_key, error = %e, "broker send failed");
            self.persistence
                .mark_failed(&event.id, &format!("publish error: {e}"))
                .await;
            return Err(e.into());
        }

        self.persistence.mark_published(&event.id).await;
        info!(message_id = %event.id, topic = %event.topic, exchange, routing_key, "event published");
        Ok(())
    }

    /// Send through the retry exchange with a TTL of `delay`.
    ///
    /// The row must already exist. On success it moves to PUBLISHED; on failure
    /// the caller decides how to record it.
    pub async fn publish_delayed(&self, event: &EventMessage, delay: Duration) -> Result<(), PublishError> {
        let message = OutboundMessage::new(
            &self.topology.retry_exchange,
            &self.topology.retry_routing_key,
            event.clone(),
        )
        .with_expiration(delay);

        if let Err(e) = self.broker.publish(message).await {
            warn!(message_id = %event.id, delay_ms = delay.as_millis() as u64, error = %e, "delayed publish failed");
            return Err(e.into());
        }

        self.persistence.mark_published(&event.id).await;
        info!(message_id = %event.id, delay_ms = delay.as_millis() as u64, "event scheduled for redelivery");
        Ok(())
    }

    /// Send a stored event straight to a queue through the default exchange.
    pub async fn forward_to_queue(&self, event: &EventMessage, queue: &str) -> Result<(), PublishError> {
        let message = OutboundMessage::new("", queue, event.clone());
        self.broker.publish(message).await?;
        debug!(message_id = %event.id, queue, "event forwarded");
        Ok(())
    }

    /// Returns how many events were published.
    pub async fn publish_batch(&self, events: &[EventMessage]) -> usize {
        let mut published = 0;
        for event in events {
            if self.publish(event).await.is_ok() {
                published += 1;
            }
        }
        info!(total = events.len(), published, "batch published");
        published
    }

    /// Re-hydrate the stored event and publish it again. Fails when nothing is stored.
    pub async fn republish_failed(&self, message_id: &MessageId) -> Result<(), PublishError> {
        let record = self
            .persistence
            .get_message_by_id(message_id)
            .await
            .map_err(PersistError::from)?
            .ok_or_else(|| PublishError::NotFound(message_id.clone()))?;
        let event = record.parse_event().map_err(PublishError::Decode)?;
        self.publish(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::domain::{BrokerError, RetryPolicyTable, TaskState};
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::{FixedClock, TaskStore};

    fn persistence(store: &InMemoryTaskStore) -> Arc<MessagePersistenceService> {
        Arc::new(MessagePersistenceService::new(
            Arc::new(store.clone()),
            Arc::new(RetryPolicyTable::default()),
            Arc::new(FixedClock::new(Utc::now())),
        ))
    }

    fn publisher(store: &InMemoryTaskStore, broker: &InMemoryBroker) -> EventPublisher {
        EventPublisher::new(persistence(store), Arc::new(broker.clone()), BrokerConfig::default())
    }

    fn event(id: &str) -> EventMessage {
        EventMessage::new(MessageId::new(id), "t", json!({ "n": 1 }))
    }

    async fn state_of(store: &InMemoryTaskStore, id: &str) -> TaskState {
        store.find_by_id(&MessageId::new(id)).await.unwrap().unwrap().state
    }

    /// Broker that records whether the outbox row existed at send time.
    struct ProbingBroker {
        store: InMemoryTaskStore,
        seen: Mutex<Vec<Option<TaskState>>>,
    }

    #[async_trait]
    impl Broker for ProbingBroker {
        async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
            let row = self.store.find_by_id(&message.correlation_id).await.unwrap();
            self.seen.lock().await.push(row.map(|r| r.state));
            Ok(())
        }
    }

    #[tokio::test]
    async fn row_exists_before_send() {
        let store = InMemoryTaskStore::new();
        let probe = Arc::new(ProbingBroker {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(persistence(&store), probe.clone(), BrokerConfig::default());

        publisher.publish(&event("m1")).await.unwrap();

        assert_eq!(*probe.seen.lock().await, vec![Some(TaskState::Create)]);
        assert_eq!(state_of(&store, "m1").await, TaskState::Published);
    }

    #[tokio::test]
    async fn no_send_when_outbox_write_fails() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        store.fail_next_inserts(1).await;

        let result = publisher(&store, &broker).publish(&event("m1")).await;

        assert!(matches!(result, Err(PublishError::Persist(_))));
        assert_eq!(broker.attempts().await, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn send_carries_correlation_id_and_default_route() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        publisher(&store, &broker).publish(&event("m1")).await.unwrap();

        let sent = broker.published().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].correlation_id, MessageId::new("m1"));
        assert_eq!(sent[0].exchange, "courier.events");
        assert_eq!(sent[0].routing_key, "courier.default");
        assert_eq!(sent[0].expiration, None);
    }

    #[tokio::test]
    async fn broker_failure_marks_task_failed() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        broker.fail_for(MessageId::new("m1")).await;

        let result = publisher(&store, &broker).publish(&event("m1")).await;

        assert!(matches!(result, Err(PublishError::Broker(_))));
        let row = store.find_by_id(&MessageId::new("m1")).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert!(row.error_message.unwrap().starts_with("publish error:"));
    }

    #[tokio::test]
    async fn delayed_publish_uses_retry_exchange_and_ttl() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let publisher = publisher(&store, &broker);
        publisher.publish(&event("m1")).await.unwrap();

        publisher
            .publish_delayed(&event("m1"), Duration::from_millis(60_000))
            .await
            .unwrap();

        let delayed = broker.published_to("courier.retry").await;
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].routing_key, "courier.retry");
        assert_eq!(delayed[0].expiration, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn batch_counts_successes() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        broker.fail_for(MessageId::new("b")).await;

        let events = vec![event("a"), event("b"), event("c")];
        assert_eq!(publisher(&store, &broker).publish_batch(&events).await, 2);
        assert_eq!(state_of(&store, "b").await, TaskState::Failed);
    }

    #[tokio::test]
    async fn republish_failed_rehydrates_stored_event() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let publisher = publisher(&store, &broker);
        let original = event("m1");
        broker.fail_for(original.id.clone()).await;
        assert!(publisher.publish(&original).await.is_err());

        broker.recover_for(&original.id).await;
        publisher.republish_failed(&original.id).await.unwrap();

        assert_eq!(state_of(&store, "m1").await, TaskState::Published);
        assert_eq!(broker.published().await[0].body, original);
    }

    #[tokio::test]
    async fn republish_without_stored_row_fails_closed() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let result = publisher(&store, &broker)
            .republish_failed(&MessageId::new("ghost"))
            .await;
        assert!(matches!(result, Err(PublishError::NotFound(_))));
        assert_eq!(broker.attempts().await, 0);
    }
}
