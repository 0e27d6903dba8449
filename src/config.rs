// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Pacsnap reads its settings once per invocation. Settings come from three
//! layers, later layers winning over earlier ones:
//!
//! 1. Built-in defaults.
//! 2. Optional TOML file, `/etc/pacsnap/config.toml` by default.
//! 3. Environment variables prefixed with `PACSNAP_`.
//!
//! # Malformed Values
//!
//! Pacsnap runs inside pacman transaction hooks, so a typo in the retention
//! count must never stop a package upgrade. Values of the wrong type or that
//! cannot be parsed fall back to their defaults with a warning, and unknown
//! keys are ignored with a warning. Retention counts below one are clamped to
//! one, which keeps only the snapshot just made. Only a file that is not
//! valid TOML at all is rejected.
//!
//! # Example
//!
//! ```toml
//! max_snapshots = 5
//! disable_sentinel = "/etc/pacsnap/disable"
//! lock_path = "/run/pacsnap.lock"
//! include_var = true
//! command_timeout_secs = 5
//! extra_datasets = ["zroot/data/srv"]
//! ```

use crate::{
    path::{default_disable_sentinel, default_lock_path},
    snapshot::{backend::is_valid_dataset_name, retention::RetentionPolicy},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, warn};

/// Default number of snapshots kept per dataset.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 3;

/// Default time limit for any single external command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// Effective settings for one invocation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct Settings {
    /// Maximum number of prefix-matching snapshots to keep per dataset.
    ///
    /// # Invariant
    ///
    /// - Always at least one.
    pub max_snapshots: usize,

    /// Existence of this path disables all snapshot activity.
    pub disable_sentinel: PathBuf,

    /// Path of the non-blocking advisory lock.
    pub lock_path: PathBuf,

    /// Snapshot the dataset mounted at `/var` too.
    pub include_var: bool,

    /// Time limit in seconds for each external command.
    pub command_timeout_secs: u64,

    /// Additional datasets snapshotted after the mountpoint datasets.
    pub extra_datasets: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            disable_sentinel: default_disable_sentinel(),
            lock_path: default_lock_path(),
            include_var: false,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            extra_datasets: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from configuration file and environment.
    ///
    /// A missing configuration file is not an error, built-in defaults are
    /// used in its place. Environment overrides are applied in both cases.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if configuration file exists but
    ///   cannot be read.
    /// - Return [`ConfigError::Deserialize`] if configuration file is not
    ///   valid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = match read_to_string(path) {
            Ok(data) => data.parse()?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no configuration file at {:?}, using defaults", path.display());
                Settings::default()
            }
            Err(err) => {
                return Err(ConfigError::Read {
                    source: err,
                    config_path: path.to_path_buf(),
                })
            }
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load settings for a hook run, never failing.
    ///
    /// Malformed values are already defaulted by [`Self::load`]. A file that
    /// cannot be read or is not TOML at all gets logged, and `None` tells the
    /// caller to skip the run rather than guess at the retention count.
    pub fn load_for_hook(path: impl AsRef<Path>) -> Option<Self> {
        match Self::load(path) {
            Ok(settings) => Some(settings),
            Err(error) => {
                warn!("cannot load configuration, skipping snapshots: {error}");
                None
            }
        }
    }

    /// Apply `PACSNAP_*` environment variables on top of current settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("PACSNAP_MAX_SNAPSHOTS") {
            self.max_snapshots = parse_max_snapshots(&value);
        }

        if let Some(value) = std::env::var_os("PACSNAP_DISABLE_SENTINEL") {
            self.disable_sentinel = PathBuf::from(value);
        }

        if let Some(value) = std::env::var_os("PACSNAP_LOCK_PATH") {
            self.lock_path = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("PACSNAP_INCLUDE_VAR") {
            self.include_var = parse_flag(&value);
        }

        if let Ok(value) = std::env::var("PACSNAP_COMMAND_TIMEOUT") {
            self.command_timeout_secs = parse_timeout(&value);
        }

        if let Ok(value) = std::env::var("PACSNAP_EXTRA_DATASETS") {
            self.extra_datasets = parse_datasets(value.split(','));
        }
    }

    /// Retention policy described by these settings.
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.max_snapshots)
    }

    /// Time limit for each external command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let file: SettingsFile = toml::from_str(data).map_err(ConfigError::Deserialize)?;
        let mut settings = Settings::default();

        for key in file.unknown.keys() {
            warn!("ignoring unknown configuration key {key:?}");
        }

        if let Some(value) = file.max_snapshots {
            settings.max_snapshots = match value.as_text("max_snapshots") {
                Some(text) => parse_max_snapshots(&text),
                None => DEFAULT_MAX_SNAPSHOTS,
            };
        }

        // INVARIANT: Perform shell expansion on path fields.
        if let Some(path) = file
            .disable_sentinel
            .and_then(|value| loose_path("disable_sentinel", value))
        {
            settings.disable_sentinel = path;
        }

        if let Some(path) = file
            .lock_path
            .and_then(|value| loose_path("lock_path", value))
        {
            settings.lock_path = path;
        }

        if let Some(value) = file.include_var {
            settings.include_var = match value {
                LooseValue::Flag(flag) => flag,
                other => other
                    .as_text("include_var")
                    .map(|text| parse_flag(&text))
                    .unwrap_or_default(),
            };
        }

        if let Some(value) = file.command_timeout_secs {
            settings.command_timeout_secs = match value.as_text("command_timeout_secs") {
                Some(text) => parse_timeout(&text),
                None => DEFAULT_COMMAND_TIMEOUT_SECS,
            };
        }

        if let Some(value) = file.extra_datasets {
            settings.extra_datasets = parse_datasets(loose_names(value));
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Raw layout of configuration file.
///
/// Scalar fields accept any TOML value, so malformed entries can be
/// defaulted with a warning instead of rejecting the whole file.
#[derive(Default, Debug, Deserialize)]
struct SettingsFile {
    max_snapshots: Option<LooseValue>,
    disable_sentinel: Option<LooseValue>,
    lock_path: Option<LooseValue>,
    include_var: Option<LooseValue>,
    command_timeout_secs: Option<LooseValue>,
    extra_datasets: Option<toml::Value>,

    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LooseValue {
    Integer(i64),
    Flag(bool),
    Text(String),
    Other(toml::Value),
}

impl LooseValue {
    /// Textual form of integers and strings, `None` with a warning otherwise.
    fn as_text(&self, key: &str) -> Option<String> {
        match self {
            Self::Integer(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
            Self::Flag(value) => {
                warn!("{key} = {value} has the wrong type, using default");
                None
            }
            Self::Other(value) => {
                warn!("{key} = {value} has the wrong type, using default");
                None
            }
        }
    }
}

fn loose_path(key: &str, value: LooseValue) -> Option<PathBuf> {
    let LooseValue::Text(path) = value else {
        warn!("{key} must be a path string, using default");
        return None;
    };

    match expand_path(&path) {
        Ok(path) => Some(path),
        Err(error) => {
            warn!("cannot expand {key} {path:?}, using default: {error}");
            None
        }
    }
}

// Non-string entries are dropped instead of failing the whole file.
fn loose_names(value: toml::Value) -> Vec<String> {
    match value {
        toml::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                toml::Value::String(name) => Some(name),
                other => {
                    warn!("ignoring non-string entry {other} in extra_datasets");
                    None
                }
            })
            .collect(),
        toml::Value::String(name) => vec![name],
        other => {
            warn!("extra_datasets = {other} is not a list, ignoring");
            Vec::new()
        }
    }
}

/// Parse retention count, clamping to at least one.
///
/// Falls back to [`DEFAULT_MAX_SNAPSHOTS`] for anything that is not an
/// integer.
pub fn parse_max_snapshots(value: &str) -> usize {
    match value.trim().parse::<i64>() {
        Ok(count) if count < 1 => {
            warn!("retention count {count} is below one, clamping to 1");
            1
        }
        Ok(count) => usize::try_from(count).unwrap_or(usize::MAX),
        Err(_) => {
            warn!(
                "retention count {value:?} is not a number, using default of {DEFAULT_MAX_SNAPSHOTS}"
            );
            DEFAULT_MAX_SNAPSHOTS
        }
    }
}

fn parse_timeout(value: &str) -> u64 {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => {
            warn!(
                "command timeout {value:?} is invalid, using default of {DEFAULT_COMMAND_TIMEOUT_SECS}s"
            );
            DEFAULT_COMMAND_TIMEOUT_SECS
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Keep valid dataset names in order, dropping duplicates.
pub fn parse_datasets(names: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
    let mut datasets: Vec<String> = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }

        if !is_valid_dataset_name(name) {
            warn!("ignoring invalid dataset name {name:?} in extra_datasets");
            continue;
        }

        if !datasets.iter().any(|known| known == name) {
            datasets.push(name.into());
        }
    }

    datasets
}

fn expand_path(path: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path)
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file exists, but cannot be read.
    #[error("failed to read configuration file at {:?}", config_path.display())]
    Read {
        #[source]
        source: std::io::Error,
        config_path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
