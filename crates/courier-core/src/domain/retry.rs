//! Retry policy: decides backoff delays per topic.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Key of the fallback policy in a `RetryPolicyTable`.
pub const DEFAULT_POLICY_KEY: &str = "default";

/// Retry policy for one topic.
///
/// Tiered delays first, then exponential growth from the last tier, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Delay before retry #1, #2, ... in milliseconds.
    pub delays_ms: Vec<u64>,

    /// Applied to the last tier for retries past the end of `delays_ms`.
    pub backoff_multiplier: f64,

    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays_ms: vec![60_000, 300_000, 900_000],
            backoff_multiplier: 2.0,
            max_delay_ms: 1_800_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-indexed).
    ///
    /// With the default tiers [60s, 300s, 900s], multiplier 2.0, cap 1800s:
    /// - retry 1: 60s
    /// - retry 2: 300s
    /// - retry 3: 900s
    /// - retry 4: 1800s
    /// - retry 5: 1800s (capped)
    pub fn delay(&self, retry_count: u32) -> Duration {
        let Some(&last) = self.delays_ms.last() else {
            return Duration::ZERO;
        };
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let index = retry_count as usize;
        let millis = if index <= self.delays_ms.len() {
            self.delays_ms[index - 1]
        } else {
            let exponent = (index - self.delays_ms.len()) as i32;
            let grown = last as f64 * self.backoff_multiplier.powi(exponent);
            grown.min(self.max_delay_ms as f64) as u64
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    pub fn can_retry(&self, current_retry_count: u32) -> bool {
        current_retry_count < self.max_attempts
    }
}

/// Retry policies keyed by topic, with a "default" fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryPolicyTable {
    policies: HashMap<String, RetryPolicy>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_POLICY_KEY.to_string(), RetryPolicy::default());
        Self { policies }
    }
}

impl RetryPolicyTable {
    pub fn new(policies: HashMap<String, RetryPolicy>) -> Self {
        Self { policies }
    }

    pub fn with_policy(mut self, topic: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(topic.into(), policy);
        self
    }

    /// Policy for `topic`, else the "default" entry, else `RetryPolicy::default()`.
    pub fn resolve(&self, topic: &str) -> RetryPolicy {
        self.policies
            .get(topic)
            .or_else(|| self.policies.get(DEFAULT_POLICY_KEY))
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(0, 0)]
    #[case::first_tier(1, 60)]
    #[case::second_tier(2, 300)]
    #[case::third_tier(3, 900)]
    #[case::grown_then_capped(4, 1800)]
    #[case::stays_capped(9, 1800)]
    fn default_curve(#[case] retry: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(retry), Duration::from_secs(secs));
    }

    #[test]
    fn growth_past_last_tier_below_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            delays_ms: vec![1_000],
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
    }

    #[test]
    fn empty_tiers_mean_no_delay() {
        let policy = RetryPolicy {
            delays_ms: vec![],
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(2), Duration::ZERO);
    }

    #[test]
    fn can_retry_below_max_attempts_only() {
        let policy = RetryPolicy::default();
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
    }

    #[test]
    fn table_falls_back_to_default() {
        let fast = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };
        let table = RetryPolicyTable::default().with_policy("orders", fast.clone());
        assert_eq!(table.resolve("orders"), fast);
        assert_eq!(table.resolve("unknown"), RetryPolicy::default());
        assert_eq!(RetryPolicyTable::new(HashMap::new()).resolve("x"), RetryPolicy::default());
    }
}
