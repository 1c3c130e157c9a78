//! DeadLetterManager - dead-letter キューの終端処理
//!
//! # フロー
//! 1. broker の death header と Task 行から DeadLetterContext を組み立てる
//! 2. topic を扱える handler を priority 昇順に試す
//! 3. handler が選んだ action を実行し、成功した最初の handler で打ち切る（first-success-wins）
//! 4. 誰も成功しなければ既定処理: ログ + FAILED 記録 + ack
//!
//! # 設計原則
//! - DLQ は終端。どの経路でも配送を未 ack のまま残さない（DLQ 上の無限再配送を防ぐ）
//! - 何をするか（handler）と、どんなパラメータでするか（strategy）は独立に差し替える

pub mod handler;
pub mod strategy;
pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::domain::{DeadLetterAction, DeadLetterContext, MessageId};
use crate::ports::{Delivery, DeliveryChannel};

use super::MessagePersistenceService;

pub use self::executor::{
    CustomDeadLetterHandler, DeadLetterActionExecutor, DefaultActionExecutor, LoggingCustomHandler,
};
pub use self::handler::{
    DEFAULT_PRIORITY, DeadLetterHandler, DefaultDeadLetterHandler, HandlerError, TopicActionHandler,
};
pub use self::strategy::{DeadLetterDecisionStrategy, DefaultDecisionStrategy};

/// What happened to one dead-lettered delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterResolution {
    pub message_id: MessageId,
    /// Handler whose action succeeded; `None` when the fallback ran.
    pub handler: Option<String>,
    pub action: Option<DeadLetterAction>,
    pub fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub today: u64,
    /// Resolved by a handler.
    pub processed: u64,
    /// Resolved by the fallback.
    pub failed: u64,
    pub most_failed_topic: Option<String>,
}

#[derive(Default)]
struct StatsState {
    total: u64,
    today: u64,
    day: Option<NaiveDate>,
    processed: u64,
    failed: u64,
    by_topic: HashMap<String, u64>,
}

pub struct DeadLetterManager {
    persistence: Arc<MessagePersistenceService>,
    handlers: Vec<Arc<dyn DeadLetterHandler>>,
    strategy: Arc<dyn DeadLetterDecisionStrategy>,
    executor: Arc<dyn DeadLetterActionExecutor>,
    stats: Mutex<StatsState>,
}

impl DeadLetterManager {
    /// Handlers are sorted once here; equal priorities keep registration order.
    pub fn new(
        persistence: Arc<MessagePersistenceService>,
        mut handlers: Vec<Arc<dyn DeadLetterHandler>>,
        strategy: Arc<dyn DeadLetterDecisionStrategy>,
        executor: Arc<dyn DeadLetterActionExecutor>,
    ) -> Self {
        handlers.sort_by_key(|h| h.priority());
        Self {
            persistence,
            handlers,
            strategy,
            executor,
            stats: Mutex::new(StatsState::default()),
        }
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub async fn handle_dead_letter(
        &self,
        delivery: &Delivery,
        channel: &dyn DeliveryChannel,
    ) -> DeadLetterResolution {
        let event = &delivery.event;
        let task = match self.persistence.get_task_info(&event.id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(message_id = %event.id, error = %e, "dead letter: task lookup failed");
                None
            }
        };
        let context = DeadLetterContext::build(
            event.clone(),
            &delivery.headers,
            delivery.routing_key.as_deref(),
            task.as_ref(),
            self.persistence.now(),
        );
        warn!(
            message_id = %context.message_id,
            topic = %context.topic,
            original_queue = ?context.original_queue,
            retry_count = context.retry_count,
            reason = %context.failure_reason,
            "dead letter received"
        );

        for handler in self.handlers.iter().filter(|h| h.supports(&context.topic)) {
            let action = match handler.handle(&context) {
                Ok(action) => action,
                Err(e) => {
                    warn!(message_id = %context.message_id, error = %e, "dead-letter handler raised, trying next");
                    continue;
                }
            };
            if self
                .execute_action(action, &context, channel, delivery.delivery_tag)
                .await
            {
                info!(message_id = %context.message_id, handler = handler.name(), action = %action, "dead letter resolved");
                self.record(&context.topic, true).await;
                return DeadLetterResolution {
                    message_id: context.message_id,
                    handler: Some(handler.name().to_string()),
                    action: Some(action),
                    fallback: false,
                };
            }
            warn!(message_id = %context.message_id, handler = handler.name(), action = %action, "dead-letter action failed, trying next");
        }

        self.default_handling(&context, channel, delivery.delivery_tag).await;
        self.record(&context.topic, false).await;
        DeadLetterResolution {
            message_id: context.message_id,
            handler: None,
            action: None,
            fallback: true,
        }
    }

    /// Run `action`; true once the delivery's fate is settled.
    pub async fn execute_action(
        &self,
        action: DeadLetterAction,
        context: &DeadLetterContext,
        channel: &dyn DeliveryChannel,
        delivery_tag: u64,
    ) -> bool {
        match action {
            DeadLetterAction::LogAndIgnore => {
                info!(message_id = %context.message_id, reason = %context.failure_reason, "dead letter ignored");
                ack(channel, delivery_tag, context).await
            }
            DeadLetterAction::StoreToDatabase => {
                let storage = self.strategy.storage_type(context);
                self.executor.store_to_database(context, storage).await
                    && ack(channel, delivery_tag, context).await
            }
            DeadLetterAction::SendAlert => {
                let level = self.strategy.alert_level(context);
                self.executor.send_alert(context, level).await && ack(channel, delivery_tag, context).await
            }
            DeadLetterAction::Requeue => match self.strategy.requeue_delay(context) {
                Some(delay) => {
                    self.executor
                        .requeue(context, delay, channel, delivery_tag)
                        .await
                }
                None => {
                    warn!(message_id = %context.message_id, retry_count = context.retry_count, "requeue forbidden by strategy");
                    false
                }
            },
            DeadLetterAction::ForwardToQueue => {
                let target = self.strategy.target_queue(context);
                self.executor.forward_to_queue(context, &target).await
                    && ack(channel, delivery_tag, context).await
            }
            DeadLetterAction::CustomHandle => {
                let name = self.strategy.custom_handler(context);
                let params = self.strategy.custom_params(context);
                self.executor
                    .custom_handle(context, &name, params.as_ref())
                    .await
                    && ack(channel, delivery_tag, context).await
            }
        }
    }

    pub async fn stats(&self) -> DeadLetterStats {
        let stats = self.stats.lock().await;
        let today = self.persistence.now().date_naive();
        let most_failed_topic = stats
            .by_topic
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(topic, _)| topic.clone());
        DeadLetterStats {
            total: stats.total,
            today: if stats.day == Some(today) { stats.today } else { 0 },
            processed: stats.processed,
            failed: stats.failed,
            most_failed_topic,
        }
    }

    async fn default_handling(&self, context: &DeadLetterContext, channel: &dyn DeliveryChannel, delivery_tag: u64) {
        error!(
            message_id = %context.message_id,
            topic = %context.topic,
            reason = %context.failure_reason,
            "no dead-letter handler succeeded, applying default handling"
        );
        let reason = format!("default dead-letter handling: {}", context.failure_reason);
        if !self.persistence.mark_failed(&context.message_id, &reason).await {
            warn!(message_id = %context.message_id, "default dead-letter handling could not mark task failed");
        }
        ack(channel, delivery_tag, context).await;
    }

    async fn record(&self, topic: &str, processed: bool) {
        let today = self.persistence.now().date_naive();
        let mut stats = self.stats.lock().await;
        stats.total += 1;
        if stats.day != Some(today) {
            stats.day = Some(today);
            stats.today = 0;
        }
        stats.today += 1;
        if processed {
            stats.processed += 1;
        } else {
            stats.failed += 1;
        }
        *stats.by_topic.entry(topic.to_string()).or_insert(0) += 1;
    }
}

async fn ack(channel: &dyn DeliveryChannel, delivery_tag: u64, context: &DeadLetterContext) -> bool {
    match channel.ack(delivery_tag).await {
        Ok(()) => true,
        Err(e) => {
            error!(message_id = %context.message_id, error = %e, "dead-letter ack failed");
            false
        }
    }
}
