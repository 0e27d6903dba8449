// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Storage backend access.
//!
//! Pacsnap never links against libzfs. Everything it needs from the storage
//! layer goes through the narrow [`StorageBackend`] trait, which the real
//! system satisfies by calling the `zfs` binary, and which tests satisfy with
//! an in-memory fake.
//!
//! # Time Limits
//!
//! A hung `zfs` process must not stall pacman. Every command issued by
//! [`ZfsCli`] runs under a time limit, and the child is killed once that
//! limit passes. Hitting the limit is reported as [`BackendError::Timeout`].

use crate::{path::mount_table, snapshot::name::is_managed};

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Dataset of the storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Full dataset name, e.g., `zroot/ROOT/default`.
    pub name: String,

    /// Mountpoint the dataset was resolved from.
    pub mountpoint: Option<PathBuf>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, mountpoint: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mountpoint,
        }
    }
}

/// Snapshot listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Dataset the snapshot belongs to.
    pub dataset: String,

    /// Snapshot name without `dataset@` part.
    pub name: String,

    /// Creation time in seconds since the Unix epoch.
    pub creation: i64,
}

impl SnapshotEntry {
    /// Full snapshot identifier, i.e., `dataset@name`.
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

/// Layer of indirection for storage backend access.
#[allow(async_fn_in_trait)]
pub trait StorageBackend {
    /// Check if the backend's tooling exists on this system.
    async fn is_available(&self) -> bool;

    /// Resolve dataset mounted exactly at target mountpoint.
    ///
    /// Return `None` if nothing from this backend is mounted there.
    async fn dataset_for_mountpoint(&self, mountpoint: &Path) -> Result<Option<Dataset>>;

    /// Check if dataset exists.
    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    /// Create snapshot `dataset@name`.
    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()>;

    /// List pacsnap-managed snapshots of dataset, newest first.
    ///
    /// Snapshots with identical creation times keep whatever relative order
    /// the backend reports them in.
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<SnapshotEntry>>;

    /// Destroy snapshot `dataset@name`.
    async fn destroy_snapshot(&self, dataset: &str, name: &str) -> Result<()>;
}

/// Storage backend access through the `zfs` command line tool.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    binary: PathBuf,
    mount_table: PathBuf,
    timeout: Duration,
}

impl ZfsCli {
    /// Construct new `zfs` caller with a per-command time limit.
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: PathBuf::from("zfs"),
            mount_table: mount_table(),
            timeout,
        }
    }

    /// Use a different `zfs` binary, either a bare name looked up on `PATH`
    /// or an explicit path.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Read mounts from a different mount table.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    fn locate_binary(&self) -> Option<PathBuf> {
        if self.binary.components().count() > 1 {
            return is_executable(&self.binary).then(|| self.binary.clone());
        }

        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(&self.binary))
                .find(|candidate| is_executable(candidate))
        })
    }

    #[instrument(skip(self, args), level = "debug")]
    async fn zfscall(&self, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!("run {command:?}");

        let output = Command::new(self.binary.as_os_str())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(result) => result.map_err(|source| BackendError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(BackendError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(output.stderr.as_slice());
            return Err(BackendError::Failed {
                command,
                message: chomp(&stderr),
            });
        }

        Ok(stdout)
    }
}

impl StorageBackend for ZfsCli {
    async fn is_available(&self) -> bool {
        match self.locate_binary() {
            Some(path) => {
                debug!("found zfs binary at {:?}", path.display());
                true
            }
            None => false,
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn dataset_for_mountpoint(&self, mountpoint: &Path) -> Result<Option<Dataset>> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|source| BackendError::MountTable {
                source,
                table_path: self.mount_table.clone(),
            })?;

        let Some(source) = zfs_source_for_mountpoint(&table, mountpoint) else {
            debug!("no zfs dataset mounted at {:?}", mountpoint.display());
            return Ok(None);
        };

        // INVARIANT: Never pass names outside the dataset grammar to zfs.
        if !is_valid_dataset_name(&source) {
            debug!("ignoring invalid dataset name {source:?}");
            return Ok(None);
        }

        if !self.dataset_exists(&source).await? {
            return Ok(None);
        }

        Ok(Some(Dataset::new(source, Some(mountpoint.to_path_buf()))))
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        match self.zfscall(&["list", "-H", "-o", "name", dataset]).await {
            Ok(_) => Ok(true),
            Err(BackendError::Failed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.zfscall(&["snapshot", &format!("{dataset}@{name}")])
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<SnapshotEntry>> {
        let output = self
            .zfscall(&[
                "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation", "-S", "creation",
                "-d", "1", dataset,
            ])
            .await?;

        parse_snapshot_listing(&output)
    }

    async fn destroy_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.zfscall(&["destroy", &format!("{dataset}@{name}")])
            .await?;
        Ok(())
    }
}

/// Find source of zfs filesystem mounted exactly at mountpoint.
///
/// Expects mount table in `/proc/self/mounts` layout. If a mountpoint is
/// mounted over more than once, then the last entry wins, because that is
/// the mount currently visible.
pub fn zfs_source_for_mountpoint(table: &str, mountpoint: &Path) -> Option<String> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some((unescape_mount_field(source), unescape_mount_field(target), fstype))
        })
        .filter(|(_, target, _)| Path::new(target) == mountpoint)
        .last()
        .and_then(|(source, _, fstype)| (fstype == "zfs").then_some(source))
}

/// Parse output of `zfs list -H -p -o name,creation`.
///
/// Keeps only pacsnap-managed snapshots, preserving listing order.
///
/// # Errors
///
/// - Return [`BackendError::Parse`] if a line is not a tab separated
///   snapshot name and integer creation time.
pub fn parse_snapshot_listing(output: &str) -> Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let (full_name, creation) = line
            .split_once('\t')
            .ok_or_else(|| BackendError::Parse(line.into()))?;
        let (dataset, name) = full_name
            .split_once('@')
            .ok_or_else(|| BackendError::Parse(line.into()))?;
        let creation = creation
            .trim()
            .parse::<i64>()
            .map_err(|_| BackendError::Parse(line.into()))?;

        if !is_managed(name) {
            continue;
        }

        entries.push(SnapshotEntry {
            dataset: dataset.into(),
            name: name.into(),
            creation,
        });
    }

    Ok(entries)
}

/// Check dataset name against allowlist grammar.
///
/// Accepts alphanumerics along with `.`, `_`, `:`, `/`, `+`, and `-`. Leading
/// or trailing slashes are rejected.
pub fn is_valid_dataset_name(name: impl AsRef<str>) -> bool {
    let name = name.as_ref();
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '/' | '+' | '-'))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// Mount table fields escape whitespace and backslashes as three-digit octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() {
            let byte = std::str::from_utf8(&bytes[idx + 1..idx + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(byte) = byte {
                out.push(byte);
                idx += 4;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: &str) -> String {
    message.trim_end_matches(['\r', '\n']).to_string()
}

/// Storage backend error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Command could not be started at all.
    #[error("failed to spawn {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command exceeded its time limit and was killed.
    #[error("command {command:?} timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Command ran, but exited unsuccessfully.
    #[error("command {command:?} failed: {message}")]
    Failed { command: String, message: String },

    /// Command output is not in the expected layout.
    #[error("unexpected output line {0:?}")]
    Parse(String),

    /// Mount table cannot be read.
    #[error("failed to read mount table at {:?}", table_path.display())]
    MountTable {
        #[source]
        source: std::io::Error,
        table_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
