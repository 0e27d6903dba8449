// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Pacman hook files.
//!
//! Pacsnap is wired into pacman through two alpm hooks: one firing before a
//! transaction, and one firing after it. Both ask pacman for the transaction
//! targets through `NeedsTargets`, which pacman then feeds to pacsnap on
//! standard input, one package per line.
//!
//! Hooks run in lexical order of their file names. The pre-transaction hook
//! is named so it sorts first, and the post-transaction hook so it sorts
//! last, keeping the snapshots as close to the package changes as possible.
//!
//! # See Also
//!
//! - [alpm-hooks(5)](https://man.archlinux.org/man/alpm-hooks.5)

use crate::snapshot::name::Phase;

use std::{
    fs::{create_dir_all, remove_file, write},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Default path to pacsnap executable referenced by hook files.
pub const DEFAULT_EXECUTABLE: &str = "/usr/bin/pacsnap";

/// A single pacman hook file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFile {
    phase: Phase,
    executable: PathBuf,
}

impl HookFile {
    /// Construct new hook file for transaction phase.
    pub fn new(phase: Phase, executable: impl Into<PathBuf>) -> Self {
        Self {
            phase,
            executable: executable.into(),
        }
    }

    /// Both hook files, pre-transaction first.
    pub fn pair(executable: impl AsRef<Path>) -> [Self; 2] {
        [
            Self::new(Phase::Pre, executable.as_ref()),
            Self::new(Phase::Post, executable.as_ref()),
        ]
    }

    /// File name of hook inside pacman's hook directory.
    pub fn file_name(&self) -> &'static str {
        match self.phase {
            Phase::Pre => "00-pacsnap-pre.hook",
            Phase::Post => "zz-pacsnap-post.hook",
        }
    }

    /// Render hook file contents.
    pub fn render(&self) -> String {
        let (when, description) = match self.phase {
            Phase::Pre => ("PreTransaction", "before"),
            Phase::Post => ("PostTransaction", "after"),
        };

        format!(
            "[Trigger]\n\
             Operation = Install\n\
             Operation = Upgrade\n\
             Operation = Remove\n\
             Type = Package\n\
             Target = *\n\
             \n\
             [Action]\n\
             Description = Creating ZFS snapshots {description} pacman transaction...\n\
             When = {when}\n\
             Exec = {} run {}\n\
             NeedsTargets\n",
            self.executable.display(),
            self.phase,
        )
    }
}

/// Install both hook files into hook directory.
///
/// Creates hook directory if missing. Existing pacsnap hook files are
/// overwritten.
///
/// # Errors
///
/// - Return [`HookError::CreateDir`] if hook directory cannot be created.
/// - Return [`HookError::Write`] if a hook file cannot be written.
pub fn install(hook_dir: impl AsRef<Path>, executable: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let hook_dir = hook_dir.as_ref();
    create_dir_all(hook_dir).map_err(|err| HookError::CreateDir {
        source: err,
        hook_dir: hook_dir.to_path_buf(),
    })?;

    let mut installed = Vec::new();
    for hook in HookFile::pair(executable) {
        let hook_path = hook_dir.join(hook.file_name());
        write(&hook_path, hook.render()).map_err(|err| HookError::Write {
            source: err,
            hook_path: hook_path.clone(),
        })?;
        info!("installed pacman hook {:?}", hook_path.display());
        installed.push(hook_path);
    }

    Ok(installed)
}

/// Remove both hook files from hook directory.
///
/// Hook files that do not exist are skipped with a warning.
///
/// # Errors
///
/// - Return [`HookError::Remove`] if an existing hook file cannot be
///   removed.
pub fn remove(hook_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for hook in HookFile::pair(DEFAULT_EXECUTABLE) {
        let hook_path = hook_dir.as_ref().join(hook.file_name());
        match remove_file(&hook_path) {
            Ok(()) => {
                info!("removed pacman hook {:?}", hook_path.display());
                removed.push(hook_path);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("pacman hook {:?} already absent", hook_path.display());
            }
            Err(err) => {
                return Err(HookError::Remove {
                    source: err,
                    hook_path,
                })
            }
        }
    }

    Ok(removed)
}

/// Hook file management error types.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Hook directory cannot be created.
    #[error("failed to create hook directory at {:?}", hook_dir.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        hook_dir: PathBuf,
    },

    /// Hook file cannot be written.
    #[error("failed to write hook file at {:?}", hook_path.display())]
    Write {
        #[source]
        source: std::io::Error,
        hook_path: PathBuf,
    },

    /// Hook file cannot be removed.
    #[error("failed to remove hook file at {:?}", hook_path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        hook_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = HookError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_pre_transaction_hook() {
        let result = HookFile::new(Phase::Pre, DEFAULT_EXECUTABLE).render();
        let expect = indoc! {r#"
            [Trigger]
            Operation = Install
            Operation = Upgrade
            Operation = Remove
            Type = Package
            Target = *

            [Action]
            Description = Creating ZFS snapshots before pacman transaction...
            When = PreTransaction
            Exec = /usr/bin/pacsnap run pre
            NeedsTargets
        "#};
        assert_eq!(result, expect);
    }

    #[test]
    fn render_post_transaction_hook() {
        let result = HookFile::new(Phase::Post, "/usr/local/bin/pacsnap").render();
        let expect = indoc! {r#"
            [Trigger]
            Operation = Install
            Operation = Upgrade
            Operation = Remove
            Type = Package
            Target = *

            [Action]
            Description = Creating ZFS snapshots after pacman transaction...
            When = PostTransaction
            Exec = /usr/local/bin/pacsnap run post
            NeedsTargets
        "#};
        assert_eq!(result, expect);
    }

    #[test]
    fn hook_files_sort_around_other_hooks() {
        let [pre, post] = HookFile::pair(DEFAULT_EXECUTABLE);
        assert!(pre.file_name() < "10-linux.hook");
        assert!(post.file_name() > "90-mkinitcpio-install.hook");
    }

    #[test]
    fn install_then_remove() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let hook_dir = dir.path().join("hooks");

        let installed = install(&hook_dir, DEFAULT_EXECUTABLE)?;
        assert_eq!(
            installed,
            vec![
                hook_dir.join("00-pacsnap-pre.hook"),
                hook_dir.join("zz-pacsnap-post.hook"),
            ]
        );
        assert_eq!(
            std::fs::read_to_string(&installed[0])?,
            HookFile::new(Phase::Pre, DEFAULT_EXECUTABLE).render()
        );

        let removed = remove(&hook_dir)?;
        assert_eq!(removed, installed);
        assert!(!installed[0].exists());
        assert!(!installed[1].exists());

        // Removing again is not an error.
        assert!(remove(&hook_dir)?.is_empty());

        Ok(())
    }
}
