//! Headless CLI for the Depot sync engine.
//!
//! All semantics live in `depot-engine`; this binary resolves the peer
//! config, maps subcommands onto engine operations, and prints outcomes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use depot_core::PeerConfig;
use depot_engine::{
    Engine, ExclusionLock, ProgressEvent, ProgressFn, Resolution,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Synchronize project trees over a shared mount")]
#[command(version)]
struct Cli {
    /// Peer config file (default: ~/.depot/config.json)
    #[arg(long, env = "DEPOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Project management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Scan, diff, and publish local changes as a new snapshot
    Push {
        project: Uuid,
        /// Snapshot message
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Bring the working copy up to the branch head
    Pull {
        project: Uuid,
        #[arg(short, long)]
        branch: Option<String>,
        /// Conflict resolutions as path=keep_local|keep_remote|keep_both
        #[arg(short, long = "resolve", value_parser = parse_resolution)]
        resolutions: Vec<(String, Resolution)>,
        /// Selective-sync include patterns (gitignore syntax)
        #[arg(long = "include")]
        include_patterns: Vec<String>,
    },
    /// Reset the working copy to a named snapshot
    Restore {
        project: Uuid,
        snapshot: Uuid,
        #[arg(long = "include")]
        include_patterns: Vec<String>,
    },
    /// Show local changes against the branch head (read-only)
    Status {
        project: Uuid,
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Snapshot history for a project
    Log {
        project: Uuid,
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Advisory file locks
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Remove unreferenced blobs from the shared store
    Gc,
    /// Administrative recovery: clear the exclusion lock unconditionally
    ForceUnlock,
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a new project and bind it to a local path
    Create { name: String, local_path: PathBuf },
    /// List projects in the shared catalog
    List,
    /// Delete a project and its history (blobs are reclaimed by gc)
    Delete { project: Uuid },
}

#[derive(Subcommand)]
enum LockCommands {
    /// List advisory locks for a project
    List { project: Uuid },
    /// Take an advisory lock on a path
    Acquire { project: Uuid, path: String },
    /// Release an advisory lock on a path
    Release { project: Uuid, path: String },
}

fn parse_resolution(raw: &str) -> Result<(String, Resolution), String> {
    let (path, choice) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected path=resolution, got '{raw}'"))?;
    let resolution = match choice {
        "keep_local" => Resolution::KeepLocal,
        "keep_remote" => Resolution::KeepRemote,
        "keep_both" => Resolution::KeepBoth,
        other => return Err(format!("unknown resolution '{other}'")),
    };
    Ok((path.to_string(), resolution))
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".depot").join("config.json"))
}

fn load_config(path: Option<&Path>) -> Result<(PathBuf, PeerConfig)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    let config = PeerConfig::load(&path)
        .with_context(|| format!("failed to load peer config from {}", path.display()))?;
    Ok((path, config))
}

fn bound_local_path(config: &PeerConfig, project: Uuid) -> Result<PathBuf> {
    config
        .local_path(project)
        .map(Path::to_path_buf)
        .with_context(|| format!("project {project} has no local path bound on this peer"))
}

fn progress_printer() -> ProgressFn {
    Arc::new(|event: ProgressEvent| match event {
        ProgressEvent::Scan { files, path } => {
            eprint!("\r  scanned {files} files ({path})\x1b[K");
        }
        ProgressEvent::Transfer { bytes } => {
            eprint!("\r  transferred {} KiB\x1b[K", bytes / 1024);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config_path, config) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Project { command } => match command {
            ProjectCommands::Create { name, local_path } => {
                let mut engine = Engine::open(config.clone()).await?;
                let project = engine.create_project(&name)?;

                let mut config = config;
                config.projects.insert(
                    project.id,
                    depot_core::ProjectBinding {
                        local_path: local_path.clone(),
                    },
                );
                config.save(&config_path)?;
                println!("created project {} ({})", project.id, project.name);
            }
            ProjectCommands::List => {
                let engine = Engine::open(config).await?;
                for project in engine.catalog().list_projects() {
                    let last = project
                        .last_sync_at
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!("{}  {}  last sync: {}", project.id, project.name, last);
                }
            }
            ProjectCommands::Delete { project } => {
                let mut engine = Engine::open(config).await?;
                engine.delete_project(project)?;
                println!("deleted project {project}");
            }
        },
        Commands::Push {
            project,
            message,
            branch,
        } => {
            let local_path = bound_local_path(&config, project)?;
            let mut engine = Engine::open(config).await?;
            let outcome = engine
                .push(
                    project,
                    &local_path,
                    &message,
                    branch.as_deref(),
                    Some(progress_printer()),
                )
                .await?;
            eprintln!();
            match outcome.snapshot_id {
                Some(id) => println!(
                    "pushed snapshot {id}: +{} ~{} -{} ({} bytes)",
                    outcome.files_added,
                    outcome.files_modified,
                    outcome.files_deleted,
                    outcome.bytes_transferred
                ),
                None => println!("nothing to push"),
            }
        }
        Commands::Pull {
            project,
            branch,
            resolutions,
            include_patterns,
        } => {
            let local_path = bound_local_path(&config, project)?;
            let resolutions: HashMap<String, Resolution> = resolutions.into_iter().collect();
            let include = (!include_patterns.is_empty()).then_some(include_patterns.as_slice());

            let mut engine = Engine::open(config).await?;
            let outcome = engine
                .pull(
                    project,
                    &local_path,
                    branch.as_deref(),
                    &resolutions,
                    Some(progress_printer()),
                    include,
                )
                .await?;
            eprintln!();
            if !outcome.success {
                eprintln!("pull stopped: {} conflict(s)", outcome.conflicts.len());
                for conflict in &outcome.conflicts {
                    eprintln!(
                        "  {} (local {}, remote {})",
                        conflict.path, conflict.local_modified_at, conflict.remote_modified_at
                    );
                }
                eprintln!("re-run with --resolve <path>=keep_local|keep_remote|keep_both");
                std::process::exit(1);
            }
            for failure in &outcome.failures {
                eprintln!("  failed: {} ({})", failure.path, failure.error);
            }
            println!(
                "pulled: {} downloaded, {} deleted",
                outcome.files_downloaded, outcome.files_deleted
            );
        }
        Commands::Restore {
            project,
            snapshot,
            include_patterns,
        } => {
            let local_path = bound_local_path(&config, project)?;
            let include = (!include_patterns.is_empty()).then_some(include_patterns.as_slice());
            let mut engine = Engine::open(config).await?;
            let outcome = engine
                .restore(
                    project,
                    &local_path,
                    snapshot,
                    Some(progress_printer()),
                    include,
                )
                .await?;
            eprintln!();
            for failure in &outcome.failures {
                eprintln!("  failed: {} ({})", failure.path, failure.error);
            }
            println!(
                "restored: {} downloaded, {} deleted",
                outcome.files_downloaded, outcome.files_deleted
            );
        }
        Commands::Status { project, branch } => {
            let local_path = bound_local_path(&config, project)?;
            let mut engine = Engine::open(config).await?;
            let outcome = engine
                .status(project, &local_path, branch.as_deref())
                .await?;
            for path in &outcome.added {
                println!("A {path}");
            }
            for path in &outcome.modified {
                println!("M {path}");
            }
            for path in &outcome.deleted {
                println!("D {path}");
            }
            println!(
                "{} added, {} modified, {} deleted, {} unchanged",
                outcome.added.len(),
                outcome.modified.len(),
                outcome.deleted.len(),
                outcome.unchanged
            );
        }
        Commands::Log {
            project,
            branch,
            limit,
        } => {
            let engine = Engine::open(config).await?;
            for snapshot in engine
                .catalog()
                .snapshots(project, branch.as_deref(), Some(limit))
            {
                println!(
                    "{}  {}  [{}] {} files, {} bytes  {}  {}",
                    snapshot.id,
                    snapshot.created_at,
                    snapshot.branch,
                    snapshot.file_count,
                    snapshot.total_size,
                    snapshot.created_by,
                    snapshot.message
                );
            }
        }
        Commands::Lock { command } => match command {
            LockCommands::List { project } => {
                let mut engine = Engine::open(config).await?;
                for lock in engine.file_locks(project)? {
                    println!("{}  {}  since {}", lock.path, lock.machine_name, lock.locked_at);
                }
            }
            LockCommands::Acquire { project, path } => {
                let mut engine = Engine::open(config).await?;
                if engine.acquire_file_lock(project, &path)? {
                    println!("locked {path}");
                } else {
                    bail!("{path} is already locked by another peer");
                }
            }
            LockCommands::Release { project, path } => {
                let mut engine = Engine::open(config).await?;
                if engine.release_file_lock(project, &path)? {
                    println!("released {path}");
                } else {
                    bail!("{path} is locked by another peer; not released");
                }
            }
        },
        Commands::Gc => {
            let mut engine = Engine::open(config).await?;
            let outcome = engine.gc().await?;
            println!(
                "gc: removed {} blobs, freed {} bytes, cleared {} temp files",
                outcome.blobs_removed, outcome.bytes_freed, outcome.temp_files_removed
            );
        }
        Commands::ForceUnlock => {
            if let Some(holder) = ExclusionLock::holder(&config.nas_path) {
                eprintln!(
                    "clearing lock held by {} ({} since {})",
                    holder.machine_name, holder.operation, holder.locked_at
                );
            }
            ExclusionLock::force_release(&config.nas_path)?;
            println!("exclusion lock cleared");
        }
    }

    Ok(())
}
