//! MessageRecoveryService - Task 行からの取りこぼし回収
//!
//! # フロー
//! 1. CREATE のまま残った行を publish し直す
//! 2. PROCESSING のまま放置された行を publish し直す（business logic は冪等である前提）
//! 3. retry 予算の残った FAILED 行を publish し直す
//!
//! 1 件の失敗で sweep を止めない。失敗は FAILED として記録し、件数だけ返す。
//! RecoveryLoop はこれを一定間隔で回す。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::domain::TaskRecord;
use crate::observability::StateCounts;

use super::{EventPublisher, MessagePersistenceService};

/// Snapshot of rows that need attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub unpublished: usize,
    pub timed_out_processing: usize,
    pub retryable_failed: usize,
    /// `None` when the store could not be counted.
    pub state_counts: Option<StateCounts>,
}

impl ConsistencyReport {
    pub fn total_problems(&self) -> usize {
        self.unpublished + self.timed_out_processing + self.retryable_failed
    }

    pub fn needs_recovery(&self) -> bool {
        self.total_problems() > 0
    }
}

#[derive(Clone, Copy)]
enum Sweep {
    Unpublished,
    TimedOut,
    RetryableFailed,
}

impl Sweep {
    fn name(self) -> &'static str {
        match self {
            Sweep::Unpublished => "unpublished",
            Sweep::TimedOut => "timed_out_processing",
            Sweep::RetryableFailed => "retryable_failed",
        }
    }

    /// Whether a failed re-publish is recorded as FAILED by the sweep.
    fn marks_failures(self) -> bool {
        !matches!(self, Sweep::RetryableFailed)
    }
}

pub struct MessageRecoveryService {
    persistence: Arc<MessagePersistenceService>,
    publisher: Arc<EventPublisher>,
    config: RecoveryConfig,
}

impl MessageRecoveryService {
    pub fn new(
        persistence: Arc<MessagePersistenceService>,
        publisher: Arc<EventPublisher>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            persistence,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Re-publish rows still in CREATE. Returns how many were published.
    pub async fn recover_unpublished_messages(&self) -> usize {
        match self
            .persistence
            .get_unpublished_messages(self.config.unpublished_batch)
            .await
        {
            Ok(rows) => self.republish(Sweep::Unpublished, rows).await,
            Err(e) => {
                error!(error = %e, "recovery: loading unpublished tasks failed");
                0
            }
        }
    }

    /// Re-publish rows left in PROCESSING for longer than `timeout`.
    pub async fn recover_timeout_processing_messages(&self, timeout: Duration) -> usize {
        match self
            .persistence
            .get_timeout_processing_messages(timeout, self.config.timeout_batch)
            .await
        {
            Ok(rows) => self.republish(Sweep::TimedOut, rows).await,
            Err(e) => {
                error!(error = %e, "recovery: loading timed-out tasks failed");
                0
            }
        }
    }

    /// Re-publish FAILED rows with retry budget left.
    pub async fn retry_failed_messages(&self) -> usize {
        match self
            .persistence
            .get_retryable_failed_messages(self.config.retryable_batch)
            .await
        {
            Ok(rows) => self.republish(Sweep::RetryableFailed, rows).await,
            Err(e) => {
                error!(error = %e, "recovery: loading retryable tasks failed");
                0
            }
        }
    }

    /// All three sweeps in order; returns the summed count.
    pub async fn full_message_recovery(&self) -> usize {
        info!("full message recovery started");
        let unpublished = self.recover_unpublished_messages().await;
        let timed_out = self
            .recover_timeout_processing_messages(self.config.processing_timeout())
            .await;
        let retried = self.retry_failed_messages().await;
        let total = unpublished + timed_out + retried;
        info!(unpublished, timed_out, retried, total, "full message recovery finished");
        total
    }

    pub async fn check_message_consistency(&self) -> ConsistencyReport {
        let sample = self.config.consistency_sample;
        let unpublished = self
            .persistence
            .get_unpublished_messages(sample)
            .await
            .map(|rows| rows.len())
            .unwrap_or_else(|e| {
                warn!(error = %e, "consistency check: unpublished query failed");
                0
            });
        let timed_out_processing = self
            .persistence
            .get_timeout_processing_messages(self.config.consistency_timeout(), sample)
            .await
            .map(|rows| rows.len())
            .unwrap_or_else(|e| {
                warn!(error = %e, "consistency check: timed-out query failed");
                0
            });
        let retryable_failed = self
            .persistence
            .get_retryable_failed_messages(sample)
            .await
            .map(|rows| rows.len())
            .unwrap_or_else(|e| {
                warn!(error = %e, "consistency check: retryable query failed");
                0
            });
        let state_counts = match self.persistence.state_counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "consistency check: state counts failed");
                None
            }
        };

        let report = ConsistencyReport {
            checked_at: self.persistence.now(),
            unpublished,
            timed_out_processing,
            retryable_failed,
            state_counts,
        };
        if report.needs_recovery() {
            warn!(
                unpublished,
                timed_out_processing,
                retryable_failed,
                "inconsistent tasks found, run message recovery"
            );
        } else {
            info!("message states consistent");
        }
        report
    }

    async fn republish(&self, sweep: Sweep, rows: Vec<TaskRecord>) -> usize {
        let total = rows.len();
        let mut recovered = 0;
        for row in rows {
            let event = match row.parse_event() {
                Ok(event) => event,
                Err(e) => {
                    error!(message_id = %row.message_id, error = %e, "recovery: stored payload unreadable");
                    self.persistence
                        .mark_failed(&row.message_id, &format!("recovery decode failed: {e}"))
                        .await;
                    continue;
                }
            };
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    recovered += 1;
                    debug!(message_id = %event.id, sweep = sweep.name(), "task recovered");
                }
                Err(e) => {
                    error!(message_id = %event.id, sweep = sweep.name(), error = %e, "recovery publish failed");
                    if sweep.marks_failures() {
                        self.persistence
                            .mark_failed(&event.id, &format!("recovery publish failed: {e}"))
                            .await;
                    }
                }
            }
        }
        info!(sweep = sweep.name(), total, recovered, "recovery sweep finished");
        recovered
    }
}

/// Periodic recovery handle.
/// - 初回 tick は即時。以降 `interval` ごとに full recovery と cleanup を回す
/// - 遅れた tick は詰めずに飛ばす
pub struct RecoveryLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RecoveryLoop {
    /// Spawn the loop. Returns `None` when recovery is disabled in config.
    pub fn spawn(service: Arc<MessageRecoveryService>) -> Option<Self> {
        if !service.config().enabled {
            info!("scheduled recovery disabled");
            return None;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(recovery_loop(service, shutdown_rx));
        Some(Self { shutdown_tx, join })
    }

    /// Stop after the current sweep finishes.
    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "recovery loop ended abnormally");
        }
    }
}

/// One scheduled pass: full recovery, then retention cleanup.
pub async fn run_recovery_pass(service: &MessageRecoveryService) -> usize {
    let recovered = service.full_message_recovery().await;
    let retention_days = service.config().retention_days;
    match service.persistence.cleanup_completed_messages(retention_days).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, retention_days, "completed tasks cleaned up"),
        Err(e) => warn!(error = %e, "completed task cleanup failed"),
    }
    recovered
}

async fn recovery_loop(service: Arc<MessageRecoveryService>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = service.config().interval().max(Duration::from_millis(1));
    info!(interval_secs = period.as_secs(), "recovery loop started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        run_recovery_pass(&service).await;
    }
    info!("recovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::BrokerConfig;
    use crate::domain::{EventMessage, MessageId, RetryPolicyTable, TaskState};
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::FixedClock;

    struct Fixture {
        clock: Arc<FixedClock>,
        broker: InMemoryBroker,
        persistence: Arc<MessagePersistenceService>,
        service: Arc<MessageRecoveryService>,
    }

    fn fixture(config: RecoveryConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let broker = InMemoryBroker::new();
        let persistence = Arc::new(MessagePersistenceService::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(RetryPolicyTable::default()),
            clock.clone(),
        ));
        let publisher = Arc::new(EventPublisher::new(
            persistence.clone(),
            Arc::new(broker.clone()),
            BrokerConfig::default(),
        ));
        let service = Arc::new(MessageRecoveryService::new(persistence.clone(), publisher, config));
        Fixture {
            clock,
            broker,
            persistence,
            service,
        }
    }

    fn event(id: &str) -> EventMessage {
        EventMessage::new(MessageId::new(id), "orders", json!({ "id": id }))
    }

    impl Fixture {
        async fn state(&self, id: &str) -> TaskState {
            self.persistence
                .get_task_info(&MessageId::new(id))
                .await
                .unwrap()
                .unwrap()
                .state
        }
    }

    #[tokio::test]
    async fn unpublished_sweep_counts_successes_and_fails_the_rest() {
        let fx = fixture(RecoveryConfig::default());
        for id in ["m1", "m2", "m3", "m4", "m5"] {
            fx.persistence.persist(&event(id)).await.unwrap();
        }
        fx.broker.fail_for(MessageId::new("m2")).await;
        fx.broker.fail_for(MessageId::new("m4")).await;

        assert_eq!(fx.service.recover_unpublished_messages().await, 3);

        for id in ["m1", "m3", "m5"] {
            assert_eq!(fx.state(id).await, TaskState::Published);
        }
        for id in ["m2", "m4"] {
            assert_eq!(fx.state(id).await, TaskState::Failed);
            let info = fx.persistence.get_task_info(&MessageId::new(id)).await.unwrap().unwrap();
            assert!(info.error_message.unwrap().starts_with("recovery publish failed:"));
        }
    }

    #[tokio::test]
    async fn unpublished_sweep_respects_batch_cap() {
        let config = RecoveryConfig {
            unpublished_batch: 2,
            ..RecoveryConfig::default()
        };
        let fx = fixture(config);
        for id in ["m1", "m2", "m3"] {
            fx.persistence.persist(&event(id)).await.unwrap();
        }
        assert_eq!(fx.service.recover_unpublished_messages().await, 2);
        assert_eq!(fx.state("m3").await, TaskState::Create);
    }

    #[tokio::test]
    async fn stuck_processing_rows_are_republished_after_timeout() {
        let fx = fixture(RecoveryConfig::default());
        for id in ["old", "fresh"] {
            fx.persistence.persist(&event(id)).await.unwrap();
        }
        fx.persistence.mark_processing(&MessageId::new("old")).await;
        fx.clock.advance(chrono::Duration::seconds(120));
        fx.persistence.mark_processing(&MessageId::new("fresh")).await;

        let recovered = fx
            .service
            .recover_timeout_processing_messages(Duration::from_secs(60))
            .await;

        assert_eq!(recovered, 1);
        assert_eq!(fx.state("old").await, TaskState::Published);
        assert_eq!(fx.state("fresh").await, TaskState::Processing);
    }

    #[tokio::test]
    async fn only_failed_rows_with_budget_are_retried() {
        let fx = fixture(RecoveryConfig::default());
        for id in ["retryable", "exhausted"] {
            fx.persistence.persist(&event(id)).await.unwrap();
            fx.persistence.mark_failed(&MessageId::new(id), "boom").await;
        }
        fx.persistence
            .update_retry_info(&MessageId::new("exhausted"), 3, "boom")
            .await;

        assert_eq!(fx.service.retry_failed_messages().await, 1);
        assert_eq!(fx.state("retryable").await, TaskState::Published);
        assert_eq!(fx.state("exhausted").await, TaskState::Failed);
    }

    #[tokio::test]
    async fn retryable_row_behind_many_exhausted_failures_is_still_retried() {
        let fx = fixture(RecoveryConfig::default());
        for n in 0..120 {
            let id = format!("exhausted-{n:03}");
            fx.persistence.persist(&event(&id)).await.unwrap();
            fx.persistence.mark_failed(&MessageId::new(id.as_str()), "boom").await;
            fx.persistence
                .update_retry_info(&MessageId::new(id.as_str()), 3, "boom")
                .await;
        }
        fx.clock.advance(chrono::Duration::seconds(1));
        fx.persistence.persist(&event("late")).await.unwrap();
        fx.persistence.mark_failed(&MessageId::new("late"), "boom").await;

        assert_eq!(fx.service.retry_failed_messages().await, 1);
        assert_eq!(fx.state("late").await, TaskState::Published);
    }

    #[tokio::test]
    async fn full_recovery_sums_all_sweeps() {
        let fx = fixture(RecoveryConfig::default());
        fx.persistence.persist(&event("new")).await.unwrap();
        fx.persistence.persist(&event("stuck")).await.unwrap();
        fx.persistence.mark_processing(&MessageId::new("stuck")).await;
        fx.persistence.persist(&event("failed")).await.unwrap();
        fx.persistence.mark_failed(&MessageId::new("failed"), "boom").await;
        fx.clock.advance(chrono::Duration::minutes(5));

        assert_eq!(fx.service.full_message_recovery().await, 3);
        assert_eq!(fx.broker.published().await.len(), 3);
    }

    #[tokio::test]
    async fn consistency_report_counts_problem_rows() {
        let fx = fixture(RecoveryConfig::default());
        fx.persistence.persist(&event("new")).await.unwrap();
        fx.persistence.persist(&event("failed")).await.unwrap();
        fx.persistence.mark_failed(&MessageId::new("failed"), "boom").await;

        let report = fx.service.check_message_consistency().await;
        assert_eq!(report.unpublished, 1);
        assert_eq!(report.retryable_failed, 1);
        assert_eq!(report.timed_out_processing, 0);
        assert!(report.needs_recovery());
        assert_eq!(report.state_counts.unwrap().total(), 2);

        fx.service.full_message_recovery().await;
        assert!(!fx.service.check_message_consistency().await.needs_recovery());
    }

    #[tokio::test]
    async fn recovery_loop_runs_immediately_and_stops_on_shutdown() {
        let fx = fixture(RecoveryConfig::default());
        fx.persistence.persist(&event("m1")).await.unwrap();

        let handle = RecoveryLoop::spawn(fx.service.clone()).unwrap();
        for _ in 0..100 {
            if fx.broker.attempts().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown_and_join().await;

        assert_eq!(fx.state("m1").await, TaskState::Published);
    }

    #[tokio::test]
    async fn disabled_recovery_spawns_nothing() {
        let config = RecoveryConfig {
            enabled: false,
            ..RecoveryConfig::default()
        };
        let fx = fixture(config);
        assert!(RecoveryLoop::spawn(fx.service.clone()).is_none());
    }
}
