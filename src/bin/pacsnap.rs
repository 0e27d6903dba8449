// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use pacsnap::{
    hook::{self, HookFile, DEFAULT_EXECUTABLE},
    path::{default_config_path, default_hook_dir},
    snapshot::{Outcome, StepResult},
    Phase, Request, RunStatus, Settings, SnapshotLifecycle, ZfsCli,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{
    ffi::OsString,
    io::{stdin, IsTerminal, Read},
    path::PathBuf,
    process::exit,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  pacsnap [options] <pacsnap-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config_path = self.config.unwrap_or_else(default_config_path);
        match self.command {
            Command::Run(opts) => {
                run_snapshot(config_path, opts).await;
                Ok(())
            }
            Command::Prune => run_prune(config_path).await,
            Command::List => run_list(config_path).await,
            Command::Hook(opts) => run_hook(opts),
            Command::Config => run_config(config_path),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Snapshot and prune datasets for a pacman transaction.
    #[command(override_usage = "pacsnap run [options] [pre|post] < targets")]
    Run(RunOptions),

    /// Prune old snapshots without creating new ones.
    #[command(override_usage = "pacsnap prune [options]")]
    Prune,

    /// List pacsnap snapshots of candidate datasets.
    #[command(override_usage = "pacsnap list [options]")]
    List,

    /// Manage pacman hook files.
    #[command(override_usage = "pacsnap hook [options] <show|install|remove>")]
    Hook(HookOptions),

    /// Show effective configuration.
    #[command(override_usage = "pacsnap config [options]")]
    Config,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Transaction phase to snapshot for.
    #[arg(value_name = "phase", default_value = "pre")]
    pub phase: Phase,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct HookOptions {
    #[command(subcommand)]
    pub action: HookAction,

    /// Pacman hook directory.
    #[arg(short, long, global = true, value_name = "path")]
    pub dir: Option<PathBuf>,

    /// Path to pacsnap executable used in hook files.
    #[arg(short, long, global = true, value_name = "path")]
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum HookAction {
    /// Print hook files.
    Show,

    /// Write hook files into hook directory.
    Install,

    /// Delete hook files from hook directory.
    Remove,
}

/// Result of parsing command line arguments.
#[derive(Debug)]
enum Invocation {
    /// Arguments are valid.
    Parsed(Cli),

    /// Arguments of a hook run are invalid, so the run is skipped.
    SkipRun(String),

    /// Anything else clap wants to report, including help and version.
    Exit(clap::Error),
}

impl Invocation {
    fn from_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
        match Cli::try_parse_from(&args) {
            Ok(cli) => Self::Parsed(cli),
            // INVARIANT: Pacman must never see a failing hook, even when misconfigured.
            Err(error) if error.use_stderr() && is_run_invocation(&args) => {
                let rendered = error.render().to_string();
                let reason = rendered.lines().next().unwrap_or_default();
                Self::SkipRun(reason.trim_start_matches("error: ").into())
            }
            Err(error) => Self::Exit(error),
        }
    }
}

// Find subcommand by skipping program name and global options.
fn is_run_invocation(args: &[OsString]) -> bool {
    let mut args = args.iter().skip(1).filter_map(|arg| arg.to_str());
    while let Some(arg) = args.next() {
        match arg {
            "-c" | "--config" => {
                args.next();
            }
            arg if arg.starts_with('-') => continue,
            arg => return arg == "run",
        }
    }

    false
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    match Invocation::from_args(std::env::args_os()) {
        Invocation::Parsed(cli) => cli.run().await,
        Invocation::SkipRun(reason) => {
            warn!("invalid arguments, skipping snapshots: {reason}");
            Ok(())
        }
        Invocation::Exit(error) => error.exit(),
    }
}

// Never fails: pacman must not be blocked by anything that happens here.
async fn run_snapshot(config_path: PathBuf, opts: RunOptions) {
    let Some(settings) = Settings::load_for_hook(&config_path) else {
        return;
    };

    let request = Request::from_hook_input(opts.phase, read_targets());
    debug!("{} targets supplied", request.targets.len());

    let backend = ZfsCli::new(settings.command_timeout());
    let lifecycle = SnapshotLifecycle::new(backend, settings);
    let outcome = lifecycle.run(&request).await;
    log_outcome(&outcome);
}

async fn run_prune(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load(config_path)?;
    let backend = ZfsCli::new(settings.command_timeout());
    let lifecycle = SnapshotLifecycle::new(backend, settings);
    let outcome = lifecycle.prune().await;
    log_outcome(&outcome);

    Ok(())
}

async fn run_list(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load(config_path)?;
    let backend = ZfsCli::new(settings.command_timeout());
    let lifecycle = SnapshotLifecycle::new(backend, settings);
    let listings = match lifecycle.list().await {
        Ok(listings) => listings,
        Err(status) => {
            info!("nothing to list, {status}");
            return Ok(());
        }
    };

    for listing in listings {
        println!("{}", listing.dataset);
        if let StepResult::Failed(reason) = &listing.listing {
            println!("  ({reason})");
        }

        for entry in listing.snapshots {
            let created = chrono::DateTime::from_timestamp(entry.creation, 0)
                .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| entry.creation.to_string());
            println!("  {created}  {}", entry.name);
        }
    }

    Ok(())
}

fn run_hook(opts: HookOptions) -> Result<()> {
    let hook_dir = opts.dir.unwrap_or_else(default_hook_dir);
    let executable = opts
        .executable
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));

    match opts.action {
        HookAction::Show => {
            for hook in HookFile::pair(&executable) {
                println!("# {}", hook_dir.join(hook.file_name()).display());
                println!("{}", hook.render());
            }
        }
        HookAction::Install => {
            hook::install(&hook_dir, &executable)?;
        }
        HookAction::Remove => {
            hook::remove(&hook_dir)?;
        }
    }

    Ok(())
}

fn run_config(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load(&config_path)?;
    println!("# {}", config_path.display());
    print!("{settings}");

    Ok(())
}

fn read_targets() -> String {
    let mut input = String::new();

    // INVARIANT: Only read piped input, an interactive terminal would block.
    if stdin().is_terminal() {
        return input;
    }

    if let Err(error) = stdin().read_to_string(&mut input) {
        warn!("cannot read transaction targets: {error}");
        input.clear();
    }

    input
}

fn log_outcome(outcome: &Outcome) {
    if outcome.status != RunStatus::Completed {
        info!("{}", outcome.summary());
        return;
    }

    for mountpoint in &outcome.skipped {
        debug!("no dataset at {:?}", mountpoint.display());
    }

    for report in &outcome.datasets {
        debug!("{}: snapshot {}, prune {}", report.dataset, report.creation, report.pruning);
        for action in &report.pruned {
            if let StepResult::Failed(_) = action.result {
                debug!("{}: destroy {}", action.snapshot, action.result);
            }
        }
    }

    if outcome.failures() > 0 {
        warn!("{}", outcome.summary());
    } else {
        info!("{}", outcome.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_hook_arguments_skip_run() {
        for args in [
            vec!["pacsnap", "run", "during"],
            vec!["pacsnap", "run", "pre", "extra"],
            vec!["pacsnap", "run", "--bogus"],
            vec!["pacsnap", "-c", "/etc/pacsnap/config.toml", "run", "during"],
            vec!["pacsnap", "--config=/tmp/x.toml", "run", "sideways"],
        ] {
            let result = Invocation::from_args(&args);
            assert!(matches!(result, Invocation::SkipRun(_)), "{args:?}: {result:?}");
        }
    }

    #[test]
    fn valid_hook_arguments_parse() {
        let result = Invocation::from_args(["pacsnap", "run", "post"]);
        assert!(matches!(
            result,
            Invocation::Parsed(Cli {
                command: Command::Run(RunOptions { phase: Phase::Post }),
                ..
            })
        ));

        let result = Invocation::from_args(["pacsnap", "run"]);
        assert!(matches!(
            result,
            Invocation::Parsed(Cli {
                command: Command::Run(RunOptions { phase: Phase::Pre }),
                ..
            })
        ));
    }

    #[test]
    fn other_bad_arguments_still_fail() {
        for args in [
            vec!["pacsnap", "hook", "bogus"],
            vec!["pacsnap", "-c", "run", "prune", "extra"],
            vec!["pacsnap", "frobnicate"],
        ] {
            let result = Invocation::from_args(&args);
            assert!(
                matches!(&result, Invocation::Exit(error) if error.use_stderr()),
                "{args:?}: {result:?}"
            );
        }
    }

    #[test]
    fn help_is_not_skipped() {
        let result = Invocation::from_args(["pacsnap", "run", "--help"]);
        assert!(matches!(&result, Invocation::Exit(error) if !error.use_stderr()));
    }
}
