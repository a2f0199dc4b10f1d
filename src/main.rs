use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use smartpatch::admin;
use smartpatch::client::{
    is_repair_needed, LauncherUpdater, Progress, Repairer, UpdateContext, UpdateRunner, Updater,
};
use smartpatch::download::downloader_for;
use smartpatch::util::format_size;
use smartpatch::{AdminSettings, Bump, FailurePolicy, LauncherSettings, Version};

#[derive(Parser)]
#[command(name = "smartpatch", about = "Publish versioned builds and patches, keep installations current")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WorkspaceArgs {
    /// Publishing workspace holding app/, builds/, patches/ and updater/
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// TOML file with publishing settings
    #[arg(long)]
    config: Option<PathBuf>,
}

impl WorkspaceArgs {
    fn settings(&self) -> anyhow::Result<AdminSettings> {
        let mut settings = match &self.config {
            Some(path) => AdminSettings::load(path)?,
            None => AdminSettings::default(),
        };
        if let Some(workspace) = &self.workspace {
            settings.workspace = workspace.clone();
        }
        Ok(settings)
    }
}

#[derive(Args)]
struct ClientArgs {
    /// Installation root holding the game, temp and logs folders
    #[arg(long)]
    root: Option<PathBuf>,
    /// Base URL of the published tree (http(s)://, file:// or a plain path)
    #[arg(long)]
    remote: Option<String>,
    /// TOML file with launcher settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Download one file at a time
    #[arg(long)]
    sequential: bool,
    /// What to do when a patched file cannot be rebuilt
    #[arg(long, value_enum)]
    failure_policy: Option<FailurePolicy>,
}

impl ClientArgs {
    fn settings(&self) -> anyhow::Result<LauncherSettings> {
        let mut settings = match &self.config {
            Some(path) => LauncherSettings::load(path)?,
            None => LauncherSettings::default(),
        };
        if let Some(root) = &self.root {
            settings.root_path = root.clone();
        }
        if let Some(remote) = &self.remote {
            settings.remote_url = remote.clone();
        }
        if self.sequential {
            settings.parallel_downloads = false;
        }
        if let Some(policy) = self.failure_policy {
            settings.failure_policy = policy;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Publish the app folder as a new build
    Build {
        #[command(flatten)]
        workspace: WorkspaceArgs,
        /// Version of the new build
        #[arg(long, conflicts_with = "bump")]
        version: Option<Version>,
        /// Derive the version from the last published build
        #[arg(long, value_enum)]
        bump: Option<Bump>,
    },
    /// Publish the patch between two builds
    Patch {
        #[command(flatten)]
        workspace: WorkspaceArgs,
        #[arg(long)]
        from: Version,
        #[arg(long)]
        to: Version,
        /// Zip compression level, 0 (store) to 9
        #[arg(long)]
        level: Option<u8>,
    },
    /// Rebuild the launcher file index from updater/
    UpdaterIndex {
        #[command(flatten)]
        workspace: WorkspaceArgs,
    },
    /// Update the launcher, repair the installation if needed and apply pending patches
    Sync {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Check every installed file against the current build and restore what differs
    Repair {
        #[command(flatten)]
        client: ClientArgs,
    },
}

async fn run_steps(settings: LauncherSettings, sync: bool) -> anyhow::Result<()> {
    let downloader = downloader_for(&settings)?;
    let ctx = UpdateContext::initialize(settings, downloader).await?;

    let mut runner = UpdateRunner::new();
    if sync {
        runner.register(LauncherUpdater::new());
        if is_repair_needed(&ctx) {
            runner.register(Repairer::new());
        }
        runner.register(Updater::new());
    } else {
        runner.register(Repairer::new());
    }
    runner.on_step_performed(|name| println!("  Step done: {name}"));

    let progress = Progress::new();
    runner.run(&ctx, &progress).await?;

    println!("\nInstallation is up to date!");
    println!("  Version: {}", ctx.target_version());
    println!("  Operations: {}/{}", progress.current(), progress.total());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    match cli.command {
        Commands::Build {
            workspace,
            version,
            bump,
        } => {
            let settings = workspace.settings()?;
            let version = match (version, bump) {
                (Some(version), _) => Some(version),
                (None, Some(bump)) => Some(admin::next_version(&settings, bump)?),
                (None, None) => None,
            };
            println!("Building...");
            println!("  Workspace: {}", settings.workspace.display());

            let report = admin::build(&settings, version).await?;

            println!("\nBuild created successfully!");
            println!("  Version: {}", report.version);
            println!("  Files: {}", report.files);
            println!("  Size: {}", format_size(report.total_size));
        }
        Commands::Patch {
            workspace,
            from,
            to,
            level,
        } => {
            let settings = workspace.settings()?;
            let level = level.unwrap_or(settings.compression_level);
            println!("Creating patch {from} -> {to}...");

            let report = admin::build_patch(&settings, from, to, level).await?;

            println!("\nPatch created successfully!");
            println!("  Files added: {}", report.summary.added);
            println!("  Files updated: {}", report.summary.updated);
            println!("  Files with changed attributes: {}", report.summary.changed_attributes);
            println!("  Files deleted: {}", report.summary.deleted);
            println!("  Reused from {from}: {}", format_size(report.copied_bytes));
            println!("  Archive size: {}", format_size(report.archive_size));
        }
        Commands::UpdaterIndex { workspace } => {
            let settings = workspace.settings()?;
            let definition = admin::build_updater_index(&settings)
                .with_context(|| format!("Failed to index {}", settings.updater_path().display()))?;
            println!("Updater index written: {} entries", definition.entries.len());
        }
        Commands::Sync { client } => {
            let settings = client.settings()?;
            println!("Synchronizing {}...", settings.root_path.display());
            run_steps(settings, true).await?;
        }
        Commands::Repair { client } => {
            let settings = client.settings()?;
            println!("Repairing {}...", settings.root_path.display());
            run_steps(settings, false).await?;
        }
    }

    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}
