//! Decision strategy: parameters for the action a handler picked.

use std::time::Duration;

use crate::domain::{AlertLevel, DeadLetterContext, StorageType};

/// Decides *with what parameters* an action runs, independently of which
/// handler chose it.
pub trait DeadLetterDecisionStrategy: Send + Sync {
    fn alert_level(&self, context: &DeadLetterContext) -> AlertLevel;

    fn target_queue(&self, context: &DeadLetterContext) -> String;

    fn custom_handler(&self, context: &DeadLetterContext) -> String;

    fn custom_params(&self, context: &DeadLetterContext) -> Option<serde_json::Value>;

    fn storage_type(&self, context: &DeadLetterContext) -> StorageType;

    /// `None` forbids requeueing. `Duration::ZERO` requeues immediately.
    fn requeue_delay(&self, context: &DeadLetterContext) -> Option<Duration>;
}

#[derive(Debug, Clone)]
pub struct DefaultDecisionStrategy {
    archive_queue: String,
    requeue_ceiling: u32,
}

impl DefaultDecisionStrategy {
    pub fn new(archive_queue: impl Into<String>, requeue_ceiling: u32) -> Self {
        Self {
            archive_queue: archive_queue.into(),
            requeue_ceiling,
        }
    }
}

impl Default for DefaultDecisionStrategy {
    fn default() -> Self {
        Self::new("dead-letter-archive-queue", 10)
    }
}

impl DeadLetterDecisionStrategy for DefaultDecisionStrategy {
    fn alert_level(&self, context: &DeadLetterContext) -> AlertLevel {
        match context.retry_count {
            5.. => AlertLevel::Critical,
            3..=4 => AlertLevel::High,
            1..=2 => AlertLevel::Medium,
            0 => AlertLevel::Low,
        }
    }

    fn target_queue(&self, _context: &DeadLetterContext) -> String {
        self.archive_queue.clone()
    }

    fn custom_handler(&self, _context: &DeadLetterContext) -> String {
        "default".to_string()
    }

    fn custom_params(&self, _context: &DeadLetterContext) -> Option<serde_json::Value> {
        None
    }

    fn storage_type(&self, _context: &DeadLetterContext) -> StorageType {
        StorageType::DeadLetterTable
    }

    fn requeue_delay(&self, context: &DeadLetterContext) -> Option<Duration> {
        match context.retry_count {
            n if n >= self.requeue_ceiling => None,
            5.. => Some(Duration::from_secs(10)),
            3..=4 => Some(Duration::from_secs(5)),
            _ => Some(Duration::from_secs(3)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    use crate::domain::{EventMessage, MessageId};

    fn context(retry_count: u32) -> DeadLetterContext {
        let event = EventMessage::new(MessageId::new("m1"), "t", json!({}));
        let mut ctx = DeadLetterContext::build(event, &HashMap::new(), None, None, Utc::now());
        ctx.retry_count = retry_count;
        ctx
    }

    #[rstest]
    #[case::none(0, AlertLevel::Low)]
    #[case::one(1, AlertLevel::Medium)]
    #[case::three(3, AlertLevel::High)]
    #[case::five(5, AlertLevel::Critical)]
    #[case::many(42, AlertLevel::Critical)]
    fn alert_level_tiers(#[case] retries: u32, #[case] level: AlertLevel) {
        assert_eq!(DefaultDecisionStrategy::default().alert_level(&context(retries)), level);
    }

    #[rstest]
    #[case::fresh(0, Some(3))]
    #[case::three(3, Some(5))]
    #[case::five(5, Some(10))]
    #[case::nine(9, Some(10))]
    #[case::ceiling(10, None)]
    #[case::past_ceiling(11, None)]
    fn requeue_delay_tiers(#[case] retries: u32, #[case] secs: Option<u64>) {
        let delay = DefaultDecisionStrategy::default().requeue_delay(&context(retries));
        assert_eq!(delay, secs.map(Duration::from_secs));
    }

    #[test]
    fn fixed_parameters() {
        let strategy = DefaultDecisionStrategy::new("archive", 10);
        let ctx = context(0);
        assert_eq!(strategy.target_queue(&ctx), "archive");
        assert_eq!(strategy.storage_type(&ctx), StorageType::DeadLetterTable);
        assert_eq!(strategy.custom_handler(&ctx), "default");
        assert_eq!(strategy.custom_params(&ctx), None);
    }
}
