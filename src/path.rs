// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of the system files that pacsnap reads or
//! manages. None of these functions check that the returned path exists.

use std::path::PathBuf;

/// Default absolute path to configuration file.
///
/// Can be overridden through `PACSNAP_CONFIG`, or by the `--config` flag of
/// the command line front end.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("PACSNAP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/pacsnap/config.toml"))
}

/// Default absolute path to disable sentinel.
///
/// If a file exists at this path, then snapshot runs do nothing at all.
pub fn default_disable_sentinel() -> PathBuf {
    PathBuf::from("/etc/pacsnap/disable")
}

/// Default absolute path to advisory lock file.
///
/// Lives under `/run` so a stale lock file never survives a reboot.
pub fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/pacsnap.lock")
}

/// Default absolute path to pacman's hook directory.
///
/// # See Also
///
/// - [alpm-hooks(5)](https://man.archlinux.org/man/alpm-hooks.5)
pub fn default_hook_dir() -> PathBuf {
    PathBuf::from("/etc/pacman.d/hooks")
}

/// Absolute path to the mount table of the current process.
pub fn mount_table() -> PathBuf {
    PathBuf::from("/proc/self/mounts")
}
