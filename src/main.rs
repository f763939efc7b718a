mod cache;
mod config;
mod credentials;
mod error;
mod forge;
mod git;
mod refresh;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStrategy, CloneState, ListFilter, RepositoryManager};
use crate::config::{Config, LogFormat};
use crate::error::CacheError;
use crate::git::{GitCli, VersionControl};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "repocache", about = "Size-bounded cache of remote git repositories")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long, env = "REPOCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override `cache.root` from the configuration.
    #[arg(long, env = "REPOCACHE_ROOT")]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover metadata and run the auto-refresh scheduler until signalled.
    Serve,
    /// Clone a repository into the cache and wait for the clone to finish.
    Clone {
        url: String,
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long, default_value = "shared")]
        strategy: CacheStrategy,
    },
    /// List cached repositories.
    List {
        /// Only entries whose URL contains this text.
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        status: Option<CloneState>,
    },
    /// List every cache entry for one repository URL.
    Branches { url: String },
    /// Delete by repository URL (all entries) or by cache directory path.
    Delete { identifier: String },
    /// Pull the latest changes into a cached entry.
    Refresh { path: PathBuf },
    /// Report which files a cached entry's `.gitignore` excludes.
    CheckIgnore {
        /// Cache directory of the entry.
        path: PathBuf,
        /// Files relative to the checkout, or absolute paths inside it.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show cache capacity and auto-refresh status.
    Status,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

#[derive(Serialize)]
struct IgnoreVerdict {
    file: PathBuf,
    ignored: bool,
}

#[derive(Serialize)]
struct StatusBody {
    cache_dir: PathBuf,
    total_cached: usize,
    max_cached_repos: usize,
    auto_refresh: refresh::AutoRefreshStatus,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialise output")?;
    println!("{out}");
    Ok(())
}

async fn run_command(manager: Arc<RepositoryManager>, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Serve => serve(manager, config).await,
        Command::Clone {
            url,
            branch,
            strategy,
        } => {
            let outcome = manager
                .clone_repository(&url, branch.as_deref(), strategy)
                .await?;
            tracing::info!(status = ?outcome.status, path = %outcome.path.display(), "clone requested");
            let entry = manager.wait_for_clone(&outcome.path).await?;
            print_json(&serde_json::json!({ "request": outcome, "entry": entry }))
        }
        Command::List { url, status } => {
            let listing = manager
                .list_cached_repositories(&ListFilter { url, status })
                .await?;
            print_json(&listing)
        }
        Command::Branches { url } => print_json(&manager.list_branches(&url).await?),
        Command::Delete { identifier } => print_json(&manager.delete_repository(&identifier).await?),
        Command::Refresh { path } => print_json(&manager.refresh_repository(&path).await?),
        Command::CheckIgnore { path, files } => {
            let handle = manager.get_repository(&path).await?;
            tracing::debug!(path = %handle.path().display(), url = %handle.url(), "evaluating ignore rules");
            let verdicts: Vec<IgnoreVerdict> = files
                .into_iter()
                .map(|file| IgnoreVerdict {
                    ignored: handle.is_ignored(&file),
                    file,
                })
                .collect();
            print_json(&verdicts)
        }
        Command::Status => {
            let entries = manager.list_repositories().await?;
            print_json(&StatusBody {
                cache_dir: manager.cache_root().to_path_buf(),
                total_cached: entries.len(),
                max_cached_repos: manager.max_cached_repos(),
                auto_refresh: manager.get_auto_refresh_status(),
            })
        }
    }
}

async fn serve(manager: Arc<RepositoryManager>, config: &Config) -> Result<()> {
    let summary = manager.recover().await?;
    tracing::info!(
        interrupted = summary.interrupted,
        dropped = summary.dropped,
        "metadata reconciled"
    );

    manager.start_auto_refresh().await?;
    shutdown_signal().await;

    manager.stop_auto_refresh().await;
    manager
        .shutdown(config.auto_refresh.stop_grace_period().max(Duration::from_secs(1)))
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(root) = cli.cache_root.clone() {
        config.cache.root = root;
    }

    // ---- Tracing ----
    // stdout carries command output; logs go to stderr.
    let (json, pretty) = match config.logging.format {
        LogFormat::Json => (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Pretty => (
            None,
            Some(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr)),
        ),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json)
        .with(pretty)
        .init();

    tracing::info!(
        config_path = ?cli.config,
        cache_root = %config.cache.root.display(),
        "starting repocache"
    );

    // ---- Repository manager ----
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(Duration::from_secs(config.clone.git_timeout)));
    let manager = RepositoryManager::new(&config, vcs)?;

    match run_command(manager, &config, cli.command).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            let (kind, code) = match err.downcast_ref::<CacheError>() {
                Some(e) if e.is_validation() => (e.kind(), 2),
                Some(e) => (e.kind(), 1),
                None => ("unexpected_error", 1),
            };
            tracing::error!(error = %format!("{err:#}"), kind, "command failed");
            let body = ErrorBody {
                error: kind,
                message: credentials::redact(&format!("{err:#}")),
            };
            eprintln!("{}", serde_json::to_string(&body).unwrap_or_else(|_| body.message.clone()));
            Ok(ExitCode::from(code))
        }
    }
}
