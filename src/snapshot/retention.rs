// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot retention.
//!
//! Each dataset keeps at most a fixed number of pacsnap-managed snapshots.
//! Pruning lists them newest first, keeps the head of that list, and destroys
//! the tail. Snapshots not carrying the pacsnap prefix are never considered.

use crate::snapshot::{
    backend::{BackendError, SnapshotEntry, StorageBackend},
    StepResult,
};

use tracing::{info, instrument, warn};

/// Count based retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_snapshots: usize,
}

impl RetentionPolicy {
    /// Construct new retention policy.
    ///
    /// A count of zero is raised to one, so the snapshot just created always
    /// survives.
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots: max_snapshots.max(1),
        }
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Select entries past the retention limit.
    ///
    /// Expects entries ordered newest first.
    pub fn expired<'a>(&self, entries: &'a [SnapshotEntry]) -> &'a [SnapshotEntry] {
        entries.get(self.max_snapshots..).unwrap_or_default()
    }
}

/// Single destroy attempt made while pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneAction {
    /// Full snapshot identifier, i.e., `dataset@name`.
    pub snapshot: String,

    /// Result of the destroy attempt.
    pub result: StepResult,
}

/// Prune expired snapshots of a dataset.
///
/// A failure to destroy one snapshot is recorded, and the remaining
/// snapshots are still attempted.
///
/// # Errors
///
/// - Return [`BackendError`] if snapshots of dataset cannot be listed. No
///   snapshot is destroyed in that case.
#[instrument(skip(backend, policy), level = "debug")]
pub async fn prune<B>(
    backend: &B,
    dataset: &str,
    policy: &RetentionPolicy,
) -> Result<Vec<PruneAction>, BackendError>
where
    B: StorageBackend,
{
    let entries = backend.list_snapshots(dataset).await?;
    let expired = policy.expired(&entries);
    let mut actions = Vec::with_capacity(expired.len());

    for entry in expired {
        let snapshot = entry.full_name();
        let result = match backend.destroy_snapshot(&entry.dataset, &entry.name).await {
            Ok(()) => {
                info!("destroyed expired snapshot {snapshot}");
                StepResult::Succeeded
            }
            Err(error) => {
                warn!("failed to destroy expired snapshot {snapshot}: {error}");
                StepResult::Failed(error.to_string())
            }
        };
        actions.push(PruneAction { snapshot, result });
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn entries(count: usize) -> Vec<SnapshotEntry> {
        (0..count)
            .map(|idx| SnapshotEntry {
                dataset: "zroot/ROOT/default".into(),
                name: format!("pacman-pre-u2025010{idx}t000000z-no-targets"),
                creation: 1_000 - idx as i64,
            })
            .collect()
    }

    #[test_case(0, 1; "zero raised to one")]
    #[test_case(1, 1; "one")]
    #[test_case(10, 10; "ten")]
    #[test]
    fn policy_never_keeps_less_than_one(input: usize, expect: usize) {
        pretty_assertions::assert_eq!(RetentionPolicy::new(input).max_snapshots(), expect);
    }

    #[test]
    fn expired_is_tail_past_limit() {
        let all = entries(5);
        let result = RetentionPolicy::new(3).expired(&all);
        pretty_assertions::assert_eq!(result, &all[3..]);
    }

    #[test_case(0; "none")]
    #[test_case(2; "under limit")]
    #[test_case(3; "at limit")]
    #[test]
    fn nothing_expires_within_limit(count: usize) {
        let all = entries(count);
        assert!(RetentionPolicy::new(3).expired(&all).is_empty());
    }
}
