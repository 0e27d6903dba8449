// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use pacsnap::{
    snapshot::{
        backend::{BackendError, Dataset, Result, SnapshotEntry, StorageBackend},
        name::is_managed,
    },
    Settings,
};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tempfile::TempDir;

/// In-memory storage backend.
///
/// Snapshots get strictly increasing creation times in the order they are
/// created, starting after any seeded snapshots.
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    absent: bool,
    mounts: HashMap<PathBuf, String>,
    snapshots: BTreeMap<String, Vec<(String, i64)>>,
    clock: i64,
    calls: usize,
    broken_creates: HashSet<String>,
    broken_destroys: HashSet<String>,
    broken_lists: HashSet<String>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn absent(self) -> Self {
        self.state.lock().unwrap().absent = true;
        self
    }

    pub(crate) fn mount(self, mountpoint: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let dataset = dataset.into();
            state.snapshots.entry(dataset.clone()).or_default();
            state.mounts.insert(mountpoint.into(), dataset);
        }
        self
    }

    /// Add dataset that is not mounted anywhere.
    pub(crate) fn dataset(self, dataset: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .entry(dataset.into())
            .or_default();
        self
    }

    pub(crate) fn seed(self, dataset: &str, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.clock += 1;
            let creation = state.clock;
            state
                .snapshots
                .entry(dataset.into())
                .or_default()
                .push((name.into(), creation));
        }
        self
    }

    pub(crate) fn break_create(self, dataset: &str) -> Self {
        self.state.lock().unwrap().broken_creates.insert(dataset.into());
        self
    }

    pub(crate) fn break_destroy(self, full_name: &str) -> Self {
        self.state.lock().unwrap().broken_destroys.insert(full_name.into());
        self
    }

    pub(crate) fn break_list(self, dataset: &str) -> Self {
        self.state.lock().unwrap().broken_lists.insert(dataset.into());
        self
    }

    /// Number of calls made, not counting availability checks.
    pub(crate) fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// All snapshot names of dataset, newest first.
    pub(crate) fn snapshots(&self, dataset: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut entries = state.snapshots.get(dataset).cloned().unwrap_or_default();
        entries.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1));
        entries.into_iter().map(|(name, _)| name).collect()
    }

    /// Managed snapshot names of dataset, newest first.
    pub(crate) fn managed(&self, dataset: &str) -> Vec<String> {
        self.snapshots(dataset)
            .into_iter()
            .filter(|name| is_managed(name))
            .collect()
    }

    fn failure(command: String) -> BackendError {
        BackendError::Failed {
            command,
            message: "simulated failure".into(),
        }
    }
}

impl StorageBackend for FakeBackend {
    async fn is_available(&self) -> bool {
        !self.state.lock().unwrap().absent
    }

    async fn dataset_for_mountpoint(&self, mountpoint: &Path) -> Result<Option<Dataset>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state
            .mounts
            .get(mountpoint)
            .map(|name| Dataset::new(name.clone(), Some(mountpoint.to_path_buf()))))
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.snapshots.contains_key(dataset))
    }

    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let command = format!("zfs snapshot {dataset}@{name}");
        if state.broken_creates.contains(dataset) {
            return Err(Self::failure(command));
        }

        state.clock += 1;
        let creation = state.clock;
        let Some(snapshots) = state.snapshots.get_mut(dataset) else {
            return Err(Self::failure(command));
        };
        if snapshots.iter().any(|(known, _)| known == name) {
            return Err(Self::failure(command));
        }
        snapshots.push((name.into(), creation));

        Ok(())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<SnapshotEntry>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.broken_lists.contains(dataset) {
            return Err(Self::failure(format!("zfs list {dataset}")));
        }

        let mut entries = state
            .snapshots
            .get(dataset)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| is_managed(name))
            .map(|(name, creation)| SnapshotEntry {
                dataset: dataset.into(),
                name,
                creation,
            })
            .collect::<Vec<_>>();
        entries.sort_by(|lhs, rhs| rhs.creation.cmp(&lhs.creation));

        Ok(entries)
    }

    async fn destroy_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let full_name = format!("{dataset}@{name}");
        if state.broken_destroys.contains(&full_name) {
            return Err(Self::failure(format!("zfs destroy {full_name}")));
        }

        if let Some(snapshots) = state.snapshots.get_mut(dataset) {
            snapshots.retain(|(known, _)| known != name);
        }

        Ok(())
    }
}

/// Settings pointing lock and sentinel into a scratch directory.
pub(crate) struct SettingsFixture {
    _dir: TempDir,
    pub(crate) settings: Settings,
}

impl SettingsFixture {
    pub(crate) fn new(max_snapshots: usize) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let settings = Settings {
            max_snapshots,
            disable_sentinel: dir.path().join("disable"),
            lock_path: dir.path().join("pacsnap.lock"),
            include_var: false,
            command_timeout_secs: 1,
            extra_datasets: Vec::new(),
        };

        Ok(Self {
            _dir: dir,
            settings,
        })
    }

    pub(crate) fn with_var(mut self) -> Self {
        self.settings.include_var = true;
        self
    }

    pub(crate) fn with_extra(mut self, datasets: &[&str]) -> Self {
        self.settings.extra_datasets = datasets.iter().map(|name| name.to_string()).collect();
        self
    }
}
