//! Outcome of one run of consumer business logic.

use serde::{Deserialize, Serialize};

/// Result of a consumer's business logic, consumed by the retry path.
///
/// - `Ok`: done, the task completes.
/// - `BusinessFailure`: the logic ran and rejected the message (validation, conflict, ...).
/// - `Fatal`: the logic blew up (I/O error, panic-like condition).
///
/// Both failure kinds go through retry evaluation. They differ in how they are logged
/// and in the error text recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Ok,
    BusinessFailure(String),
    Fatal(String),
}

impl ProcessOutcome {
    pub fn business_failure(reason: impl Into<String>) -> Self {
        Self::BusinessFailure(reason.into())
    }

    pub fn fatal(error: impl std::fmt::Display) -> Self {
        Self::Fatal(error.to_string())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Error text recorded on the task; `None` for `Ok`.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Ok => None,
            Self::BusinessFailure(reason) => Some(format!("business failure: {reason}")),
            Self::Fatal(error) => Some(format!("processing error: {error}")),
        }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for ProcessOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_messages_name_the_kind() {
        assert_eq!(ProcessOutcome::Ok.failure_message(), None);
        assert_eq!(
            ProcessOutcome::business_failure("stock mismatch").failure_message().as_deref(),
            Some("business failure: stock mismatch")
        );
        assert_eq!(
            ProcessOutcome::fatal("db down").failure_message().as_deref(),
            Some("processing error: db down")
        );
    }

    #[test]
    fn result_converts_into_outcome() {
        let ok: Result<(), String> = Ok(());
        assert!(ProcessOutcome::from(ok).is_ok());
        let err: Result<(), String> = Err("timeout".into());
        assert_eq!(ProcessOutcome::from(err), ProcessOutcome::Fatal("timeout".into()));
    }
}
