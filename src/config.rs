use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Every section is optional; a missing or empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub auto_refresh: AutoRefreshConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding every cached clone plus the metadata file.
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    /// Number of cache entries allowed before new clones are refused.
    #[serde(default = "default_max_cached_repos")]
    pub max_cached_repos: usize,
    /// New clones are refused when the cache volume has less free space than
    /// this many bytes.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    /// File name of the persisted metadata, relative to `root`.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_cached_repos: default_max_cached_repos(),
            min_free_bytes: default_min_free_bytes(),
            metadata_file: default_metadata_file(),
        }
    }
}

impl CacheConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(&self.metadata_file)
    }
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/cache/repocache")
}

fn default_max_cached_repos() -> usize {
    50
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_metadata_file() -> String {
    "metadata.json".to_string()
}

// ---------------------------------------------------------------------------
// Clone behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CloneConfig {
    /// Semaphore limit for background clone jobs.
    #[serde(default = "default_max_concurrent_clones")]
    pub max_concurrent_clones: usize,
    /// Upper bound (seconds) for a single git invocation.
    #[serde(default = "default_git_timeout")]
    pub git_timeout: u64,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            max_concurrent_clones: default_max_concurrent_clones(),
            git_timeout: default_git_timeout(),
        }
    }
}

fn default_max_concurrent_clones() -> usize {
    4
}

fn default_git_timeout() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Provider credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Name of the environment variable holding a GitHub token.
    #[serde(default = "default_github_token_env")]
    pub github_token_env: String,
    /// Name of the environment variable holding an Azure DevOps PAT.
    #[serde(default = "default_azure_token_env")]
    pub azure_token_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            github_token_env: default_github_token_env(),
            azure_token_env: default_azure_token_env(),
        }
    }
}

fn default_github_token_env() -> String {
    "GITHUB_PERSONAL_ACCESS_TOKEN".to_string()
}

fn default_azure_token_env() -> String {
    "AZURE_DEVOPS_PAT".to_string()
}

// ---------------------------------------------------------------------------
// Auto-refresh schedule
// ---------------------------------------------------------------------------

/// All durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoRefreshConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Refresh cadence for repositories with recent activity.
    #[serde(default = "default_active_interval")]
    pub active_interval: u64,
    /// Refresh cadence for repositories without recent activity.
    #[serde(default = "default_inactive_interval")]
    pub inactive_interval: u64,
    /// A repository is active if its last commit falls inside this window.
    #[serde(default = "default_activity_window")]
    pub activity_window: u64,
    /// Delay applied the first time a repository is scheduled.
    #[serde(default = "default_startup_delay")]
    pub startup_delay: u64,
    /// How often the due-table is scanned.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default = "default_max_concurrent_refreshes")]
    pub max_concurrent_refreshes: usize,
    /// How long `stop` waits for in-flight refreshes before aborting them.
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: u64,
}

impl Default for AutoRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            active_interval: default_active_interval(),
            inactive_interval: default_inactive_interval(),
            activity_window: default_activity_window(),
            startup_delay: default_startup_delay(),
            scan_interval: default_scan_interval(),
            max_concurrent_refreshes: default_max_concurrent_refreshes(),
            stop_grace_period: default_stop_grace_period(),
        }
    }
}

impl AutoRefreshConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval)
    }

    pub fn inactive_interval(&self) -> Duration {
        Duration::from_secs(self.inactive_interval)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period)
    }
}

fn bool_true() -> bool {
    true
}

fn default_active_interval() -> u64 {
    24 * 3600
}

fn default_inactive_interval() -> u64 {
    7 * 24 * 3600
}

fn default_activity_window() -> u64 {
    7 * 24 * 3600
}

fn default_startup_delay() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    30
}

fn default_max_concurrent_refreshes() -> usize {
    2
}

fn default_stop_grace_period() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate YAML config text.  An empty document yields defaults.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.cache.max_cached_repos >= 1,
        "max_cached_repos must be at least 1"
    );
    anyhow::ensure!(
        !config.cache.metadata_file.is_empty()
            && !config.cache.metadata_file.contains(['/', '\\']),
        "metadata_file must be a plain file name"
    );
    anyhow::ensure!(
        config.clone.max_concurrent_clones >= 1,
        "max_concurrent_clones must be at least 1"
    );
    anyhow::ensure!(config.clone.git_timeout >= 1, "git_timeout must be non-zero");

    let refresh = &config.auto_refresh;
    anyhow::ensure!(
        refresh.max_concurrent_refreshes >= 1,
        "max_concurrent_refreshes must be at least 1"
    );
    anyhow::ensure!(refresh.scan_interval >= 1, "scan_interval must be non-zero");
    anyhow::ensure!(
        refresh.active_interval >= 1 && refresh.inactive_interval >= 1,
        "refresh intervals must be non-zero"
    );
    Ok(())
}
