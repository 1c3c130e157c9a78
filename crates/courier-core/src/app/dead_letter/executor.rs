//! Action executor: carries out dead-letter actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::domain::{AlertLevel, DeadLetterContext, DeadLetterRecord, StorageType};
use crate::ports::{DeadLetterStore, DeliveryChannel};

use super::handler::HandlerError;
use crate::app::{EventPublisher, MessagePersistenceService};

/// Side effects of dead-letter actions. Every method reports success as a bool.
///
/// Only `requeue` touches the delivery; for the others the manager acks once
/// the executor reports success.
#[async_trait]
pub trait DeadLetterActionExecutor: Send + Sync {
    async fn store_to_database(&self, context: &DeadLetterContext, storage: StorageType) -> bool;

    async fn send_alert(&self, context: &DeadLetterContext, level: AlertLevel) -> bool;

    /// Delayed republish and ack when `delay > 0`, otherwise nack with requeue.
    async fn requeue(
        &self,
        context: &DeadLetterContext,
        delay: Duration,
        channel: &dyn DeliveryChannel,
        delivery_tag: u64,
    ) -> bool;

    async fn forward_to_queue(&self, context: &DeadLetterContext, target_queue: &str) -> bool;

    async fn custom_handle(
        &self,
        context: &DeadLetterContext,
        handler: &str,
        params: Option<&serde_json::Value>,
    ) -> bool;
}

/// Named extension point for `CUSTOM_HANDLE`.
#[async_trait]
pub trait CustomDeadLetterHandler: Send + Sync {
    async fn handle(
        &self,
        context: &DeadLetterContext,
        params: Option<&serde_json::Value>,
    ) -> Result<(), HandlerError>;
}

/// Custom handler registered as "default": logs and succeeds.
pub struct LoggingCustomHandler;

#[async_trait]
impl CustomDeadLetterHandler for LoggingCustomHandler {
    async fn handle(
        &self,
        context: &DeadLetterContext,
        params: Option<&serde_json::Value>,
    ) -> Result<(), HandlerError> {
        info!(message_id = %context.message_id, topic = %context.topic, params = ?params, "custom dead-letter handling");
        Ok(())
    }
}

pub struct DefaultActionExecutor {
    persistence: Arc<MessagePersistenceService>,
    publisher: Arc<EventPublisher>,
    archive: Arc<dyn DeadLetterStore>,
    requeue_ceiling: u32,
    custom_handlers: HashMap<String, Arc<dyn CustomDeadLetterHandler>>,
}

impl DefaultActionExecutor {
    pub fn new(
        persistence: Arc<MessagePersistenceService>,
        publisher: Arc<EventPublisher>,
        archive: Arc<dyn DeadLetterStore>,
        requeue_ceiling: u32,
    ) -> Self {
        let mut custom_handlers: HashMap<String, Arc<dyn CustomDeadLetterHandler>> = HashMap::new();
        custom_handlers.insert("default".to_string(), Arc::new(LoggingCustomHandler));
        Self {
            persistence,
            publisher,
            archive,
            requeue_ceiling,
            custom_handlers,
        }
    }

    pub fn with_custom_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn CustomDeadLetterHandler>,
    ) -> Self {
        self.custom_handlers.insert(name.into(), handler);
        self
    }
}

#[async_trait]
impl DeadLetterActionExecutor for DefaultActionExecutor {
    async fn store_to_database(&self, context: &DeadLetterContext, storage: StorageType) -> bool {
        if !self
            .persistence
            .mark_failed(&context.message_id, &format!("dead letter: {}", context.failure_reason))
            .await
        {
            warn!(message_id = %context.message_id, "dead letter not stored: task state not updated");
            return false;
        }

        let record = DeadLetterRecord::from_context(context, storage, self.persistence.now());
        if let Err(e) = self.archive.save(record).await {
            error!(message_id = %context.message_id, storage = ?storage, error = %e, "dead letter not stored");
            return false;
        }
        info!(message_id = %context.message_id, storage = ?storage, "dead letter stored");
        true
    }

    async fn send_alert(&self, context: &DeadLetterContext, level: AlertLevel) -> bool {
        match level {
            AlertLevel::Low => info!(
                message_id = %context.message_id,
                topic = %context.topic,
                retry_count = context.retry_count,
                reason = %context.failure_reason,
                "dead-letter alert (low)"
            ),
            AlertLevel::Medium => warn!(
                message_id = %context.message_id,
                topic = %context.topic,
                retry_count = context.retry_count,
                reason = %context.failure_reason,
                "dead-letter alert (medium)"
            ),
            AlertLevel::High | AlertLevel::Critical => error!(
                message_id = %context.message_id,
                topic = %context.topic,
                retry_count = context.retry_count,
                reason = %context.failure_reason,
                level = ?level,
                "dead-letter alert"
            ),
        }
        true
    }

    async fn requeue(
        &self,
        context: &DeadLetterContext,
        delay: Duration,
        channel: &dyn DeliveryChannel,
        delivery_tag: u64,
    ) -> bool {
        if context.retry_count >= self.requeue_ceiling {
            warn!(
                message_id = %context.message_id,
                retry_count = context.retry_count,
                ceiling = self.requeue_ceiling,
                "requeue refused: retry ceiling reached"
            );
            return false;
        }

        if delay > Duration::ZERO {
            if let Err(e) = self.publisher.publish_delayed(&context.event, delay).await {
                error!(message_id = %context.message_id, error = %e, "dead-letter requeue failed");
                return false;
            }
            return match channel.ack(delivery_tag).await {
                Ok(()) => true,
                Err(e) => {
                    error!(message_id = %context.message_id, error = %e, "ack after requeue failed");
                    false
                }
            };
        }

        match channel.nack(delivery_tag, true).await {
            Ok(()) => {
                info!(message_id = %context.message_id, "dead letter requeued immediately");
                true
            }
            Err(e) => {
                error!(message_id = %context.message_id, error = %e, "nack with requeue failed");
                false
            }
        }
    }

    async fn forward_to_queue(&self, context: &DeadLetterContext, target_queue: &str) -> bool {
        match self.publisher.forward_to_queue(&context.event, target_queue).await {
            Ok(()) => {
                info!(message_id = %context.message_id, target_queue, "dead letter forwarded");
                true
            }
            Err(e) => {
                error!(message_id = %context.message_id, target_queue, error = %e, "dead-letter forward failed");
                false
            }
        }
    }

    async fn custom_handle(
        &self,
        context: &DeadLetterContext,
        handler: &str,
        params: Option<&serde_json::Value>,
    ) -> bool {
        let Some(custom) = self.custom_handlers.get(handler) else {
            warn!(message_id = %context.message_id, handler, "no custom dead-letter handler registered");
            return false;
        };
        match custom.handle(context, params).await {
            Ok(()) => true,
            Err(e) => {
                warn!(message_id = %context.message_id, error = %e, "custom dead-letter handler failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    use chrono::Utc;
    use serde_json::json;

    use crate::config::BrokerConfig;
    use crate::domain::{EventMessage, MessageId, RetryPolicyTable, TaskState};
    use crate::impls::{
        Acknowledgement, InMemoryBroker, InMemoryDeadLetterStore, InMemoryTaskStore, RecordingChannel,
    };
    use crate::ports::FixedClock;

    struct Fixture {
        store: InMemoryTaskStore,
        broker: InMemoryBroker,
        archive: InMemoryDeadLetterStore,
        persistence: Arc<MessagePersistenceService>,
        executor: DefaultActionExecutor,
    }

    fn fixture() -> Fixture {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let archive = InMemoryDeadLetterStore::new();
        let persistence = Arc::new(MessagePersistenceService::new(
            Arc::new(store.clone()),
            Arc::new(RetryPolicyTable::default()),
            Arc::new(FixedClock::new(Utc::now())),
        ));
        let publisher = Arc::new(EventPublisher::new(
            persistence.clone(),
            Arc::new(broker.clone()),
            BrokerConfig::default(),
        ));
        let executor = DefaultActionExecutor::new(persistence.clone(), publisher, Arc::new(archive.clone()), 10);
        Fixture {
            store,
            broker,
            archive,
            persistence,
            executor,
        }
    }

    fn context(retry_count: u32) -> DeadLetterContext {
        let event = EventMessage::new(MessageId::new("m1"), "t", json!({ "n": 1 }));
        let mut ctx = DeadLetterContext::build(event, &Map::new(), None, None, Utc::now());
        ctx.retry_count = retry_count;
        ctx
    }

    #[tokio::test]
    async fn requeue_at_ceiling_fails_without_touching_the_delivery() {
        let fx = fixture();
        let channel = RecordingChannel::new();
        let requeued = fx
            .executor
            .requeue(&context(11), Duration::from_secs(3), &channel, 7)
            .await;
        assert!(!requeued);
        assert!(channel.acknowledgements().await.is_empty());
        assert_eq!(fx.broker.attempts().await, 0);
    }

    #[tokio::test]
    async fn delayed_requeue_publishes_then_acks() {
        let fx = fixture();
        let channel = RecordingChannel::new();
        assert!(fx.executor.requeue(&context(2), Duration::from_secs(3), &channel, 7).await);
        assert_eq!(channel.acknowledgements().await, vec![Acknowledgement::Ack(7)]);
        let delayed = fx.broker.published_to("courier.retry").await;
        assert_eq!(delayed[0].expiration, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn immediate_requeue_nacks_with_requeue() {
        let fx = fixture();
        let channel = RecordingChannel::new();
        assert!(fx.executor.requeue(&context(0), Duration::ZERO, &channel, 7).await);
        assert_eq!(
            channel.acknowledgements().await,
            vec![Acknowledgement::Nack { delivery_tag: 7, requeue: true }]
        );
    }

    #[tokio::test]
    async fn store_archives_and_marks_task_failed() {
        let fx = fixture();
        let ctx = context(1);
        fx.persistence.persist(&ctx.event).await.unwrap();

        assert!(fx.executor.store_to_database(&ctx, StorageType::FailedMessageTable).await);

        let archived = fx.archive.records().await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].storage, StorageType::FailedMessageTable);
        let info = fx.persistence.get_task_info(&ctx.message_id).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error_message.as_deref(), Some("dead letter: unknown error"));
    }

    #[tokio::test]
    async fn store_outage_is_reported_and_nothing_archived() {
        let fx = fixture();
        let ctx = context(1);
        fx.persistence.persist(&ctx.event).await.unwrap();
        fx.store.set_unavailable(true).await;

        assert!(!fx.executor.store_to_database(&ctx, StorageType::DeadLetterTable).await);
        assert!(fx.archive.is_empty().await);
    }

    #[tokio::test]
    async fn archive_outage_is_reported() {
        let fx = fixture();
        let ctx = context(1);
        fx.persistence.persist(&ctx.event).await.unwrap();
        fx.archive.set_unavailable(true).await;

        assert!(!fx.executor.store_to_database(&ctx, StorageType::DeadLetterTable).await);
    }

    #[tokio::test]
    async fn forward_goes_through_default_exchange() {
        let fx = fixture();
        assert!(fx.executor.forward_to_queue(&context(0), "archive").await);
        let sent = fx.broker.published_to("").await;
        assert_eq!(sent[0].routing_key, "archive");
    }

    struct Refusing;

    #[async_trait]
    impl CustomDeadLetterHandler for Refusing {
        async fn handle(
            &self,
            _context: &DeadLetterContext,
            _params: Option<&serde_json::Value>,
        ) -> Result<(), HandlerError> {
            Err(HandlerError::new("refusing", "not today"))
        }
    }

    #[tokio::test]
    async fn custom_handlers_dispatch_by_name() {
        let fx = fixture();
        let executor = fx.executor.with_custom_handler("refusing", Arc::new(Refusing));
        let ctx = context(0);
        assert!(executor.custom_handle(&ctx, "default", None).await);
        assert!(!executor.custom_handle(&ctx, "refusing", None).await);
        assert!(!executor.custom_handle(&ctx, "missing", None).await);
    }

    #[tokio::test]
    async fn alerts_always_report_success() {
        let fx = fixture();
        for level in [AlertLevel::Low, AlertLevel::Medium, AlertLevel::High, AlertLevel::Critical] {
            assert!(fx.executor.send_alert(&context(0), level).await);
        }
    }
}
