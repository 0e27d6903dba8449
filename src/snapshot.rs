// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot lifecycle around pacman transactions.
//!
//! Pacman calls pacsnap from a transaction hook, once before the transaction
//! and once after it. Each call snapshots the datasets backing `/`, `/home`,
//! and optionally `/var`, then prunes old snapshots of those datasets.
//!
//! # Best Effort
//!
//! A pacsnap run must never block or fail a package transaction. Hence,
//! [`SnapshotLifecycle::run`] does not return errors at all. Each step
//! records its own [`StepResult`] inside an [`Outcome`], and the caller
//! decides what to do with failures, which usually means logging them.
//!
//! A run short-circuits without touching anything when:
//!
//! - The disable sentinel exists.
//! - The `zfs` tool is not installed.
//! - The root filesystem is not a ZFS dataset.
//! - Another pacsnap run holds the lock.
//!
//! None of these count as failures.
//!
//! # Step Order
//!
//! Datasets are handled in fixed order: root, home, var, followed by any
//! extra datasets named in settings. Every dataset gets the same
//! [`SnapshotName`] within one run, so the snapshots of one transaction can
//! be matched up across datasets. Pruning of a dataset happens right after
//! its snapshot was created, and only if that creation succeeded.

pub mod backend;
pub mod lock;
pub mod name;
pub mod retention;

use crate::{
    config::Settings,
    snapshot::{
        backend::{Dataset, SnapshotEntry, StorageBackend},
        lock::{HookLock, LockError},
        name::{Fingerprint, Phase, SnapshotName},
        retention::{prune, PruneAction, RetentionPolicy},
    },
};

use chrono::{DateTime, Utc};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Mountpoint whose dataset must exist for pacsnap to do anything.
pub const ROOT_MOUNTPOINT: &str = "/";

/// Mountpoint snapshotted whenever it is a separate dataset.
pub const HOME_MOUNTPOINT: &str = "/home";

/// Mountpoint snapshotted only when enabled in settings.
pub const VAR_MOUNTPOINT: &str = "/var";

/// Result of a single step of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Step did what it was supposed to.
    Succeeded,

    /// Step was attempted, but failed.
    Failed(String),

    /// Step was not attempted.
    Skipped(String),
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl Display for StepResult {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Succeeded => fmt.write_str("ok"),
            Self::Failed(reason) => write!(fmt, "failed: {reason}"),
            Self::Skipped(reason) => write!(fmt, "skipped: {reason}"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// All candidate datasets were processed.
    Completed,

    /// Disable sentinel exists.
    Disabled,

    /// Storage backend tooling is not installed.
    BackendAbsent,

    /// Root filesystem is not backed by the storage backend.
    NotApplicable,

    /// Another run holds the lock.
    Busy,

    /// Lock could not be taken for reasons other than contention.
    LockUnavailable(String),
}

impl Display for RunStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Completed => fmt.write_str("completed"),
            Self::Disabled => fmt.write_str("disabled"),
            Self::BackendAbsent => fmt.write_str("backend absent"),
            Self::NotApplicable => fmt.write_str("not applicable"),
            Self::Busy => fmt.write_str("busy"),
            Self::LockUnavailable(reason) => write!(fmt, "lock unavailable: {reason}"),
        }
    }
}

/// Report of what happened to one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetReport {
    /// Dataset name.
    pub dataset: String,

    /// Snapshot creation step.
    pub creation: StepResult,

    /// Snapshot listing step of pruning.
    pub pruning: StepResult,

    /// Destroy attempts made while pruning.
    pub pruned: Vec<PruneAction>,
}

/// Managed snapshots of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetListing {
    /// Dataset name.
    pub dataset: String,

    /// Snapshot listing step.
    pub listing: StepResult,

    /// Managed snapshots, newest first.
    pub snapshots: Vec<SnapshotEntry>,
}

/// Informational record of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// How the run ended.
    pub status: RunStatus,

    /// Snapshot name shared by every dataset of the run.
    pub snapshot_name: Option<SnapshotName>,

    /// Per-dataset reports in processing order.
    pub datasets: Vec<DatasetReport>,

    /// Candidate mountpoints that did not resolve to a dataset.
    pub skipped: Vec<PathBuf>,
}

impl Outcome {
    fn early(status: RunStatus) -> Self {
        Self {
            status,
            snapshot_name: None,
            datasets: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Number of snapshots created.
    pub fn created(&self) -> usize {
        self.datasets
            .iter()
            .filter(|report| report.creation.is_success())
            .count()
    }

    /// Number of snapshots destroyed by pruning.
    pub fn destroyed(&self) -> usize {
        self.datasets
            .iter()
            .flat_map(|report| report.pruned.iter())
            .filter(|action| action.result.is_success())
            .count()
    }

    /// Number of failed steps.
    pub fn failures(&self) -> usize {
        self.datasets
            .iter()
            .map(|report| {
                let listing = usize::from(matches!(report.pruning, StepResult::Failed(_)));
                let creation = usize::from(matches!(report.creation, StepResult::Failed(_)));
                let destroys = report
                    .pruned
                    .iter()
                    .filter(|action| matches!(action.result, StepResult::Failed(_)))
                    .count();
                listing + creation + destroys
            })
            .sum()
    }

    /// One line summary fit for logging.
    pub fn summary(&self) -> String {
        match self.status {
            RunStatus::Completed => format!(
                "created {}/{} snapshots, pruned {}, {} failures",
                self.created(),
                self.datasets.len(),
                self.destroyed(),
                self.failures()
            ),
            ref status => format!("nothing done, {status}"),
        }
    }
}

/// Input of a run, supplied by the pacman hook.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Request {
    /// Position relative to pacman transaction.
    pub phase: Phase,

    /// Package targets of the transaction, in pacman's order.
    pub targets: Vec<String>,
}

impl Request {
    pub fn new(phase: Phase, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phase,
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    /// Build request from hook input, one target per line.
    ///
    /// Blank lines are dropped, and surrounding whitespace is trimmed.
    pub fn from_hook_input(phase: Phase, input: impl AsRef<str>) -> Self {
        Self::new(
            phase,
            input
                .as_ref()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
        )
    }
}

/// Datasets a run will operate on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Candidates {
    /// Resolved datasets, root first.
    pub datasets: Vec<Dataset>,

    /// Mountpoints that did not resolve.
    pub skipped: Vec<PathBuf>,
}

/// Snapshot lifecycle manager.
#[derive(Debug)]
pub struct SnapshotLifecycle<B>
where
    B: StorageBackend,
{
    backend: B,
    settings: Settings,
}

impl<B> SnapshotLifecycle<B>
where
    B: StorageBackend,
{
    /// Construct new lifecycle manager.
    pub fn new(backend: B, settings: Settings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mountpoints considered for snapshots, in processing order.
    pub fn mountpoints(&self) -> Vec<PathBuf> {
        let mut mountpoints = vec![PathBuf::from(ROOT_MOUNTPOINT), PathBuf::from(HOME_MOUNTPOINT)];
        if self.settings.include_var {
            mountpoints.push(PathBuf::from(VAR_MOUNTPOINT));
        }

        mountpoints
    }

    /// Snapshot and prune candidate datasets for a transaction.
    pub async fn run(&self, request: &Request) -> Outcome {
        self.run_at(request, Utc::now()).await
    }

    /// Snapshot and prune candidate datasets as if run at given time.
    #[instrument(skip(self, request), fields(phase = %request.phase), level = "debug")]
    pub async fn run_at(&self, request: &Request, now: DateTime<Utc>) -> Outcome {
        if self.is_disabled() {
            info!(
                "disable sentinel {:?} present, skipping",
                self.settings.disable_sentinel.display()
            );
            return Outcome::early(RunStatus::Disabled);
        }

        let candidates = match self.resolve().await {
            Ok(candidates) => candidates,
            Err(status) => return Outcome::early(status),
        };

        let fingerprint = Fingerprint::from_targets(request.targets.as_slice());
        let name = SnapshotName::new(request.phase, now, &fingerprint);

        let _lock = match self.lock() {
            Ok(lock) => lock,
            Err(status) => return Outcome::early(status),
        };

        let retention = self.settings.retention();
        let mut reports = Vec::with_capacity(candidates.datasets.len());
        for dataset in &candidates.datasets {
            reports.push(self.snapshot_dataset(&dataset.name, &name, &retention).await);
        }

        Outcome {
            status: RunStatus::Completed,
            snapshot_name: Some(name),
            datasets: reports,
            skipped: candidates.skipped,
        }
    }

    /// Prune candidate datasets without creating snapshots.
    ///
    /// Honors the disable sentinel and the lock just like [`Self::run`].
    #[instrument(skip(self), level = "debug")]
    pub async fn prune(&self) -> Outcome {
        if self.is_disabled() {
            info!("disable sentinel present, skipping");
            return Outcome::early(RunStatus::Disabled);
        }

        let candidates = match self.resolve().await {
            Ok(candidates) => candidates,
            Err(status) => return Outcome::early(status),
        };

        let _lock = match self.lock() {
            Ok(lock) => lock,
            Err(status) => return Outcome::early(status),
        };

        let retention = self.settings.retention();
        let mut reports = Vec::with_capacity(candidates.datasets.len());
        for dataset in &candidates.datasets {
            let (pruning, pruned) = self.prune_dataset(&dataset.name, &retention).await;
            reports.push(DatasetReport {
                dataset: dataset.name.clone(),
                creation: StepResult::Skipped("prune only".into()),
                pruning,
                pruned,
            });
        }

        Outcome {
            status: RunStatus::Completed,
            snapshot_name: None,
            datasets: reports,
            skipped: candidates.skipped,
        }
    }

    /// Resolve candidate datasets.
    ///
    /// # Errors
    ///
    /// - Return [`RunStatus::BackendAbsent`] if backend tooling is missing.
    /// - Return [`RunStatus::NotApplicable`] if root is not a dataset.
    pub async fn resolve(&self) -> Result<Candidates, RunStatus> {
        if !self.backend.is_available().await {
            info!("zfs tooling not found, skipping");
            return Err(RunStatus::BackendAbsent);
        }

        let mut candidates = Candidates::default();
        for mountpoint in self.mountpoints() {
            let is_root = mountpoint == Path::new(ROOT_MOUNTPOINT);
            match self.backend.dataset_for_mountpoint(&mountpoint).await {
                Ok(Some(dataset)) => {
                    // INVARIANT: One snapshot per dataset, even if mounted twice.
                    if !candidates.datasets.iter().any(|known| known.name == dataset.name) {
                        candidates.datasets.push(dataset);
                    }
                }
                Ok(None) if is_root => {
                    info!("root filesystem is not a zfs dataset, skipping");
                    return Err(RunStatus::NotApplicable);
                }
                Err(error) if is_root => {
                    warn!("cannot resolve root dataset: {error}");
                    return Err(RunStatus::NotApplicable);
                }
                Ok(None) => candidates.skipped.push(mountpoint),
                Err(error) => {
                    warn!(
                        "cannot resolve dataset of {:?}: {error}",
                        mountpoint.display()
                    );
                    candidates.skipped.push(mountpoint);
                }
            }
        }

        for name in &self.settings.extra_datasets {
            if candidates.datasets.iter().any(|known| &known.name == name) {
                continue;
            }

            match self.backend.dataset_exists(name).await {
                Ok(true) => candidates.datasets.push(Dataset::new(name.clone(), None)),
                Ok(false) => warn!("extra dataset {name} does not exist, skipping"),
                Err(error) => warn!("cannot check extra dataset {name}: {error}"),
            }
        }

        Ok(candidates)
    }

    /// List managed snapshots of every candidate dataset, newest first.
    ///
    /// Read-only, so neither the disable sentinel nor the lock apply.
    ///
    /// # Errors
    ///
    /// - Return [`RunStatus`] of [`Self::resolve`] if there is nothing to
    ///   list.
    pub async fn list(&self) -> Result<Vec<DatasetListing>, RunStatus> {
        let candidates = self.resolve().await?;
        let mut listings = Vec::with_capacity(candidates.datasets.len());
        for dataset in candidates.datasets {
            let (listing, snapshots) = match self.backend.list_snapshots(&dataset.name).await {
                Ok(snapshots) => (StepResult::Succeeded, snapshots),
                Err(error) => {
                    warn!("failed to list snapshots of {}: {error}", dataset.name);
                    (StepResult::Failed(error.to_string()), Vec::new())
                }
            };

            listings.push(DatasetListing {
                dataset: dataset.name,
                listing,
                snapshots,
            });
        }

        Ok(listings)
    }

    fn is_disabled(&self) -> bool {
        self.settings.disable_sentinel.exists()
    }

    fn lock(&self) -> Result<HookLock, RunStatus> {
        match HookLock::try_acquire(&self.settings.lock_path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Busy { .. }) => {
                info!("another pacsnap run holds the lock, skipping");
                Err(RunStatus::Busy)
            }
            Err(error) => {
                warn!("{error}");
                Err(RunStatus::LockUnavailable(error.to_string()))
            }
        }
    }

    async fn snapshot_dataset(
        &self,
        dataset: &str,
        name: &SnapshotName,
        retention: &RetentionPolicy,
    ) -> DatasetReport {
        match self.backend.create_snapshot(dataset, name.as_str()).await {
            Ok(()) => {
                info!("created snapshot {}", name.for_dataset(dataset));
                let (pruning, pruned) = self.prune_dataset(dataset, retention).await;
                DatasetReport {
                    dataset: dataset.into(),
                    creation: StepResult::Succeeded,
                    pruning,
                    pruned,
                }
            }
            Err(error) => {
                warn!("failed to create snapshot {}: {error}", name.for_dataset(dataset));
                DatasetReport {
                    dataset: dataset.into(),
                    creation: StepResult::Failed(error.to_string()),
                    pruning: StepResult::Skipped("snapshot creation failed".into()),
                    pruned: Vec::new(),
                }
            }
        }
    }

    async fn prune_dataset(
        &self,
        dataset: &str,
        retention: &RetentionPolicy,
    ) -> (StepResult, Vec<PruneAction>) {
        match prune(&self.backend, dataset, retention).await {
            Ok(pruned) => (StepResult::Succeeded, pruned),
            Err(error) => {
                warn!("failed to list snapshots of {dataset}: {error}");
                (StepResult::Failed(error.to_string()), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hook_input_drops_blank_lines() {
        let result = Request::from_hook_input(Phase::Post, "linux\n\n  zfs-linux \n");
        let expect = Request::new(Phase::Post, ["linux", "zfs-linux"]);
        assert_eq!(result, expect);
    }

    #[test]
    fn early_outcome_summary() {
        let result = Outcome::early(RunStatus::Disabled).summary();
        assert_eq!(result, "nothing done, disabled");
    }
}
