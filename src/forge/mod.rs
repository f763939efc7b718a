//! Git-hosting provider recognition.
//!
//! Classifies a repository URL into a [`Provider`] and the path segments that
//! identify the repository on that provider (`owner/repo` for GitHub,
//! `org/project/repo` for Azure DevOps, `host/path...` for any other git
//! host).  The cache path resolver and the credential layer both dispatch on
//! the result so that no provider-specific URL handling leaks elsewhere.

use std::path::{Path, PathBuf};

use crate::error::CacheError;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GitHub,
    AzureDevOps,
    /// Any other host reachable over http(s), ssh or the git protocol.
    Git,
    /// A directory on the local filesystem (plain path or `file://` URL).
    Local,
}

/// Namespace directories created directly under the cache root.
pub const CACHE_NAMESPACES: &[&str] = &["github", "azure", "git", "local"];

impl Provider {
    /// Top-level directory under the cache root for this provider.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::AzureDevOps => "azure",
            Self::Git => "git",
            Self::Local => "local",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::GitHub => "GitHub",
            Self::AzureDevOps => "Azure DevOps",
            Self::Git => "Git",
            Self::Local => "Local",
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed location
// ---------------------------------------------------------------------------

/// Where a repository lives, as far as the cache is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub provider: Provider,
    /// Filesystem-safe identifying segments; the last one is the repository
    /// name.  Never empty.
    pub segments: Vec<String>,
    /// Source directory for [`Provider::Local`].
    pub local_path: Option<PathBuf>,
}

impl RepoLocation {
    pub fn repo_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("repo")
    }
}

/// True for identifiers that name a remote repository rather than a path.
pub fn is_remote_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("ssh://")
        || s.starts_with("git://")
        || is_scp_like(s)
}

/// True for anything the manager should treat as a URL (remote or `file://`).
pub fn is_url_identifier(s: &str) -> bool {
    is_remote_url(s) || s.starts_with("file://")
}

fn is_scp_like(s: &str) -> bool {
    // `git@host:owner/repo.git`
    match s.split_once('@') {
        Some((user, rest)) => {
            !user.is_empty()
                && !user.contains('/')
                && rest.split_once(':').is_some_and(|(host, _)| !host.contains('/'))
        }
        None => false,
    }
}

/// Classify `url` and extract its identifying segments.
pub fn parse_repo_url(url: &str) -> Result<RepoLocation, CacheError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(invalid(url, "URL is empty"));
    }

    if url.starts_with("file://") {
        let parsed = url::Url::parse(url).map_err(|e| invalid(url, &e.to_string()))?;
        let path = parsed
            .to_file_path()
            .map_err(|_| invalid(url, "file URL does not name a local path"))?;
        return Ok(local_location(&path));
    }

    if is_scp_like(url) && !url.contains("://") {
        let (_, rest) = url.split_once('@').unwrap_or(("", url));
        let (host, path) = rest
            .split_once(':')
            .ok_or_else(|| invalid(url, "missing ':' after host"))?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        return classify_remote(url, host, &segments);
    }

    if is_remote_url(url) {
        let parsed = url::Url::parse(url).map_err(|e| invalid(url, &e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid(url, "URL has no host"))?
            .to_ascii_lowercase();
        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        return classify_remote(url, &host, &segments);
    }

    if url.contains("://") {
        return Err(invalid(url, "unsupported URL scheme"));
    }

    Ok(local_location(Path::new(url)))
}

fn classify_remote(url: &str, host: &str, segments: &[&str]) -> Result<RepoLocation, CacheError> {
    let host = host.to_ascii_lowercase();
    let host = host.trim_start_matches("www.");

    let (provider, raw): (Provider, Vec<&str>) = match host {
        "github.com" => {
            if segments.len() < 2 {
                return Err(invalid(url, "GitHub URLs need an owner and a repository"));
            }
            (Provider::GitHub, segments[..2].to_vec())
        }
        "dev.azure.com" => {
            // org/project/_git/repo
            match segments {
                [org, project, "_git", repo, ..] => (Provider::AzureDevOps, vec![*org, *project, *repo]),
                _ => return Err(invalid(url, "expected dev.azure.com/<org>/<project>/_git/<repo>")),
            }
        }
        "ssh.dev.azure.com" => {
            // v3/org/project/repo
            match segments {
                ["v3", org, project, repo, ..] => (Provider::AzureDevOps, vec![*org, *project, *repo]),
                _ => return Err(invalid(url, "expected ssh.dev.azure.com:v3/<org>/<project>/<repo>")),
            }
        }
        h if h.ends_with(".visualstudio.com") => {
            let org = h.trim_end_matches(".visualstudio.com");
            match segments {
                [project, "_git", repo, ..] => (Provider::AzureDevOps, vec![org, *project, *repo]),
                _ => return Err(invalid(url, "expected <org>.visualstudio.com/<project>/_git/<repo>")),
            }
        }
        _ => {
            if segments.is_empty() {
                return Err(invalid(url, "URL has no repository path"));
            }
            let mut raw = vec![host];
            raw.extend_from_slice(segments);
            (Provider::Git, raw)
        }
    };

    let segments = raw
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let s = if i == raw.len() - 1 {
                s.strip_suffix(".git").unwrap_or(s)
            } else {
                s
            };
            sanitize_segment(s)
        })
        .collect();

    Ok(RepoLocation {
        provider,
        segments,
        local_path: None,
    })
}

fn local_location(path: &Path) -> RepoLocation {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    RepoLocation {
        provider: Provider::Local,
        segments: vec![sanitize_segment(&name)],
        local_path: Some(path),
    }
}

/// Keep path segments to a conservative character set so that nothing a URL
/// carries can become a separator or a parent reference on disk.
pub fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn invalid(url: &str, reason: &str) -> CacheError {
    CacheError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}
