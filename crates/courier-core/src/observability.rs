//! Logging setup and state-count views.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::domain::TaskState;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber once. Later calls are no-ops.
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
        };

        let compact = (!config.json).then(|| {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact()
                .with_filter(filter())
        });
        let json = config.json.then(|| {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .json()
                .with_filter(filter())
        });

        // 既に別の subscriber が入っていても止めない
        if tracing_subscriber::registry()
            .with(compact)
            .with(json)
            .try_init()
            .is_err()
        {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }

        tracing::debug!(level = %config.level, json = config.json, "logging initialized");
    });
}

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub create: usize,
    pub published: usize,
    pub processing: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.create + self.published + self.processing + self.retry_scheduled + self.completed + self.failed
    }
}

impl From<&HashMap<TaskState, usize>> for StateCounts {
    fn from(map: &HashMap<TaskState, usize>) -> Self {
        let get = |state| map.get(&state).copied().unwrap_or(0);
        Self {
            create: get(TaskState::Create),
            published: get(TaskState::Published),
            processing: get(TaskState::Processing),
            retry_scheduled: get(TaskState::RetryScheduled),
            completed: get(TaskState::Completed),
            failed: get(TaskState::Failed),
        }
    }
}
