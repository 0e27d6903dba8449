// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Best-effort ZFS snapshots around pacman transactions.
//!
//! Pacsnap is meant to be called from pacman hooks. Before and after each
//! package transaction it snapshots the ZFS datasets backing `/`, `/home`,
//! and optionally `/var`, then prunes old pacsnap snapshots so that only a
//! fixed number per dataset remain. It never blocks or fails the transaction
//! that triggered it.
//!
//! # See Also
//!
//! 1. [ArchWiki - ZFS](https://wiki.archlinux.org/title/ZFS)
//! 2. [`SnapshotLifecycle`]

pub mod config;
pub mod hook;
pub mod path;
pub mod snapshot;

pub use config::Settings;
pub use snapshot::{
    backend::{StorageBackend, ZfsCli},
    name::Phase,
    Outcome, Request, RunStatus, SnapshotLifecycle,
};
