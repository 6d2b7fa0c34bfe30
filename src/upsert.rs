use crate::model::CanonicalRow;
use crate::retry::RetryPolicy;
use crate::store::{RowStore, StoreError, WritePayload};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Success { id: String, attempts: u32 },
    Failure { reason: String, attempts: u32 },
}

impl UpsertOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpsertOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub inserted: usize,
    pub failed: usize,
}

/// Writes rows one at a time, retrying transient store failures.
pub struct Upserter<'a> {
    store: &'a dyn RowStore,
    policy: RetryPolicy,
}

impl<'a> Upserter<'a> {
    pub fn new(store: &'a dyn RowStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn upsert(&self, database_id: &str, payload: &WritePayload, label: &str) -> UpsertOutcome {
        let outcome = self.policy.run(
            label,
            || self.store.insert(database_id, payload),
            StoreError::is_transient,
        );
        match outcome.result {
            Ok(id) => UpsertOutcome::Success {
                id,
                attempts: outcome.attempts,
            },
            Err(err) => UpsertOutcome::Failure {
                reason: err.to_string(),
                attempts: outcome.attempts,
            },
        }
    }

    /// A failed row is logged and skipped; the rest of the batch still runs.
    pub fn upsert_all<R: CanonicalRow>(&self, database_id: &str, rows: &[R]) -> BatchResult {
        let mut result = BatchResult::default();
        for row in rows {
            let label = row.describe();
            match self.upsert(database_id, &row.to_payload(), &label) {
                UpsertOutcome::Success { attempts, .. } => {
                    result.inserted += 1;
                    info!(row = %label, attempts, "row added");
                }
                UpsertOutcome::Failure { reason, attempts } => {
                    result.failed += 1;
                    warn!(row = %label, attempts, %reason, "row upload failed");
                }
            }
        }
        result
    }
}
