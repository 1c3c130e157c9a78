//! In-memory dead-letter store.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DeadLetterRecord, MessageId, StoreError};
use crate::ports::DeadLetterStore;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct DeadLetterState {
    records: VecDeque<DeadLetterRecord>,
    unavailable: bool,
}

/// Keeps at most `capacity` records; the oldest is dropped when full.
#[derive(Clone)]
pub struct InMemoryDeadLetterStore {
    state: Arc<Mutex<DeadLetterState>>,
    capacity: usize,
}

impl Default for InMemoryDeadLetterStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeadLetterState::default())),
            capacity: capacity.max(1),
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Stored records, oldest first.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().await.records.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn save(&self, record: DeadLetterRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Backend("dead-letter store unavailable".to_string()));
        }
        if state.records.len() >= self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(record);
        Ok(())
    }

    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Backend("dead-letter store unavailable".to_string()));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| &r.message_id == message_id)
            .cloned()
            .collect())
    }
}
