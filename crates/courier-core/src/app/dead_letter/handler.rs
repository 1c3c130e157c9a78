//! Dead-letter handlers: pick an action for a dead-lettered message.
//!
//! Handlers are tried in ascending `priority` order. The first one whose action
//! executes successfully wins; a handler that errors or whose action fails
//! passes the message on to the next.

use thiserror::Error;

use crate::domain::{DeadLetterAction, DeadLetterContext};

pub const DEFAULT_PRIORITY: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dead-letter handler '{handler}' failed: {reason}")]
pub struct HandlerError {
    pub handler: String,
    pub reason: String,
}

impl HandlerError {
    pub fn new(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

pub trait DeadLetterHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, topic: &str) -> bool;

    /// Lower runs first.
    fn priority(&self) -> u32 {
        DEFAULT_PRIORITY
    }

    fn handle(&self, context: &DeadLetterContext) -> Result<DeadLetterAction, HandlerError>;
}

/// Catch-all handler, always last.
///
/// Alerts once a message has been retried 5 times or has been failing for over
/// an hour; otherwise archives it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDeadLetterHandler;

impl DefaultDeadLetterHandler {
    const ALERT_RETRY_COUNT: u32 = 5;

    fn alert_after() -> chrono::Duration {
        chrono::Duration::hours(1)
    }
}

impl DeadLetterHandler for DefaultDeadLetterHandler {
    fn name(&self) -> &str {
        "default"
    }

    fn supports(&self, _topic: &str) -> bool {
        true
    }

    fn priority(&self) -> u32 {
        u32::MAX
    }

    fn handle(&self, context: &DeadLetterContext) -> Result<DeadLetterAction, HandlerError> {
        if context.retry_count >= Self::ALERT_RETRY_COUNT
            || context.failure_duration() > Self::alert_after()
        {
            Ok(DeadLetterAction::SendAlert)
        } else {
            Ok(DeadLetterAction::StoreToDatabase)
        }
    }
}

/// Handler bound to a fixed set of topics that always answers with one action.
///
/// Covers the common case of "everything from topic X goes to Y" without a
/// dedicated type.
#[derive(Debug, Clone)]
pub struct TopicActionHandler {
    name: String,
    topics: Vec<String>,
    priority: u32,
    action: DeadLetterAction,
}

impl TopicActionHandler {
    pub fn new(name: impl Into<String>, topics: &[&str], action: DeadLetterAction) -> Self {
        Self {
            name: name.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            priority: DEFAULT_PRIORITY,
            action,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl DeadLetterHandler for TopicActionHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn handle(&self, _context: &DeadLetterContext) -> Result<DeadLetterAction, HandlerError> {
        Ok(self.action)
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

    fn context(retry_count: u32, failing_for: chrono::Duration) -> DeadLetterContext {
        let now = Utc::now();
        let event = EventMessage::new(MessageId::new("m1"), "t", json!({}));
        let mut ctx = DeadLetterContext::build(event, &HashMap::new(), None, None, now);
        ctx.retry_count = retry_count;
        ctx.first_failure_time = now - failing_for;
        ctx
    }

    #[rstest]
    #[case::fresh(0, 0, DeadLetterAction::StoreToDatabase)]
    #[case::few_retries(4, 30, DeadLetterAction::StoreToDatabase)]
    #[case::many_retries(5, 0, DeadLetterAction::SendAlert)]
    #[case::long_failure(1, 61, DeadLetterAction::SendAlert)]
    fn default_handler_escalates(#[case] retries: u32, #[case] minutes: i64, #[case] expected: DeadLetterAction) {
        let ctx = context(retries, chrono::Duration::minutes(minutes));
        assert_eq!(DefaultDeadLetterHandler.handle(&ctx).unwrap(), expected);
    }

    #[test]
    fn default_handler_is_a_last_resort_catch_all() {
        assert!(DefaultDeadLetterHandler.supports("anything"));
        assert_eq!(DefaultDeadLetterHandler.priority(), u32::MAX);
    }

    #[test]
    fn topic_handler_supports_only_its_topics() {
        let handler = TopicActionHandler::new("orders", &["orders", "refunds"], DeadLetterAction::ForwardToQueue)
            .with_priority(10);
        assert!(handler.supports("refunds"));
        assert!(!handler.supports("t"));
        assert_eq!(handler.priority(), 10);
        assert_eq!(
            handler.handle(&context(0, chrono::Duration::zero())).unwrap(),
            DeadLetterAction::ForwardToQueue
        );
    }
}
