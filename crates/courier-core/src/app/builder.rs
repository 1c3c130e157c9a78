//! CourierBuilder - サービス一式の組み立て
//!
//! # Fail-fast
//! - `expect_topics()` で必要な topic を宣言する
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と設定値を検証する
//! - 不足があれば `BuildError` を返し、起動させない

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, CourierConfig};
use crate::domain::Event;
use crate::impls::{InMemoryBroker, InMemoryDeadLetterStore, InMemoryTaskStore};
use crate::ports::{Broker, Clock, DeadLetterStore, Delivery, DeliveryChannel, SystemClock, TaskStore};

use super::consumer::{ConsumerRegistry, EventConsumer, EventHandler, RegistryError};
use super::dead_letter::{
    CustomDeadLetterHandler, DeadLetterHandler, DeadLetterResolution, DefaultActionExecutor,
    DefaultDeadLetterHandler, DefaultDecisionStrategy,
};
use super::{
    ConsumerTemplate, DeadLetterManager, DeliveryOutcome, EventPublisher, MessagePersistenceService,
    MessageRecoveryService, MessageStateSynchronizer, RecoveryLoop, RetryStateManager,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing consumers for topics: {0:?}")]
    MissingConsumers(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// ```ignore
/// let courier = CourierBuilder::new(config)
///     .register::<PartCreated, _>(PartCreatedHandler)?
///     .expect_topics(&[PartCreated::TOPIC])
///     .build()?;
/// ```
///
/// Store, broker and dead-letter store default to the in-memory adapters; the
/// clock defaults to the system clock.
pub struct CourierBuilder {
    config: CourierConfig,
    store: Option<Arc<dyn TaskStore>>,
    broker: Option<Arc<dyn Broker>>,
    clock: Option<Arc<dyn Clock>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    consumers: ConsumerRegistry,
    dead_letter_handlers: Vec<Arc<dyn DeadLetterHandler>>,
    custom_handlers: Vec<(String, Arc<dyn CustomDeadLetterHandler>)>,
    expected_topics: Option<Vec<String>>,
}

impl CourierBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            store: None,
            broker: None,
            clock: None,
            dead_letter_store: None,
            consumers: ConsumerRegistry::new(),
            dead_letter_handlers: Vec::new(),
            custom_handlers: Vec::new(),
            expected_topics: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn register<E: Event, H: EventHandler<E> + 'static>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.consumers.register::<E, H>(handler)?;
        Ok(self)
    }

    pub fn register_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Result<Self, RegistryError> {
        self.consumers.register_consumer(consumer)?;
        Ok(self)
    }

    /// The catch-all default handler is always added last.
    pub fn dead_letter_handler(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter_handlers.push(handler);
        self
    }

    pub fn custom_dead_letter_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn CustomDeadLetterHandler>,
    ) -> Self {
        self.custom_handlers.push((name.into(), handler));
        self
    }

    pub fn expect_topics(mut self, topics: &[&str]) -> Self {
        self.expected_topics = Some(topics.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Courier, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_topics {
            let registered = self.consumers.topics();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingConsumers(missing));
            }
        }

        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()) as Arc<dyn TaskStore>);
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()) as Arc<dyn Broker>);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let archive_capacity = config.dead_letter.archive_capacity;
        let dead_letter_store = self.dead_letter_store.unwrap_or_else(|| {
            Arc::new(InMemoryDeadLetterStore::with_capacity(archive_capacity)) as Arc<dyn DeadLetterStore>
        });

        let persistence = Arc::new(MessagePersistenceService::new(
            store,
            Arc::new(config.retry.policies.clone()),
            clock,
        ));
        let publisher = Arc::new(EventPublisher::new(
            persistence.clone(),
            broker,
            config.broker.clone(),
        ));
        let retry = Arc::new(RetryStateManager::new(persistence.clone(), publisher.clone()));
        let synchronizer = Arc::new(MessageStateSynchronizer::new(
            persistence.clone(),
            config.sync.strategy,
        ));

        let requeue_ceiling = config.dead_letter.requeue_ceiling;
        let mut executor = DefaultActionExecutor::new(
            persistence.clone(),
            publisher.clone(),
            dead_letter_store,
            requeue_ceiling,
        );
        for (name, handler) in self.custom_handlers {
            executor = executor.with_custom_handler(name, handler);
        }
        let mut handlers = self.dead_letter_handlers;
        handlers.push(Arc::new(DefaultDeadLetterHandler));
        let dead_letter = Arc::new(DeadLetterManager::new(
            persistence.clone(),
            handlers,
            Arc::new(DefaultDecisionStrategy::new(
                config.broker.archive_queue.clone(),
                requeue_ceiling,
            )),
            Arc::new(executor),
        ));

        let recovery = Arc::new(MessageRecoveryService::new(
            persistence.clone(),
            publisher.clone(),
            config.recovery.clone(),
        ));
        let template = Arc::new(ConsumerTemplate::new(
            persistence.clone(),
            synchronizer.clone(),
            retry.clone(),
        ));

        Ok(Courier {
            config,
            persistence,
            publisher,
            retry,
            synchronizer,
            dead_letter,
            recovery,
            consumers: Arc::new(self.consumers),
            template,
        })
    }
}

/// Wired services. Cheap to share: every field is an `Arc` or plain config.
pub struct Courier {
    pub config: CourierConfig,
    pub persistence: Arc<MessagePersistenceService>,
    pub publisher: Arc<EventPublisher>,
    pub retry: Arc<RetryStateManager>,
    pub synchronizer: Arc<MessageStateSynchronizer>,
    pub dead_letter: Arc<DeadLetterManager>,
    pub recovery: Arc<MessageRecoveryService>,
    pub consumers: Arc<ConsumerRegistry>,
    pub template: Arc<ConsumerTemplate>,
}

impl Courier {
    /// Hand a work-queue delivery to the consumer for its topic.
    pub async fn dispatch(&self, delivery: &Delivery, channel: &dyn DeliveryChannel) -> DeliveryOutcome {
        self.template.dispatch(&self.consumers, delivery, channel).await
    }

    /// Hand a dead-letter-queue delivery to the dead-letter chain.
    pub async fn handle_dead_letter(
        &self,
        delivery: &Delivery,
        channel: &dyn DeliveryChannel,
    ) -> DeadLetterResolution {
        self.dead_letter.handle_dead_letter(delivery, channel).await
    }

    /// Start scheduled recovery; `None` when disabled in config.
    pub fn spawn_recovery(&self) -> Option<RecoveryLoop> {
        RecoveryLoop::spawn(self.recovery.clone())
    }
}
