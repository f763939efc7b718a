//! Upstream credential handling.
//!
//! Two directions: [`canonical_url`] strips whatever userinfo a caller put in
//! a URL so that secrets never reach the metadata file or the logs, and
//! [`authenticated_url`] re-injects the configured provider token right
//! before a clone or fetch.

use tracing::debug;

use crate::config::CredentialsConfig;
use crate::forge::{self, Provider};

/// Canonical form recorded in cache metadata: credentials removed, trailing
/// slashes trimmed.  Local paths and `file://` URLs both become the absolute
/// path, so either spelling names the same entry.
pub fn canonical_url(url: &str) -> String {
    let url = url.trim();

    if url.starts_with("file://") {
        let path = url::Url::parse(url).ok().and_then(|u| u.to_file_path().ok());
        if let Some(path) = path {
            return canonical_url(&path.to_string_lossy());
        }
    }

    if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("ssh://") {
        if let Ok(mut parsed) = url::Url::parse(url) {
            // `set_username` only fails for cannot-be-a-base URLs, which
            // these schemes never are.
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            return parsed.as_str().trim_end_matches('/').to_string();
        }
        return url.trim_end_matches('/').to_string();
    }

    if forge::is_url_identifier(url) {
        return url.trim_end_matches('/').to_string();
    }

    let path = std::path::Path::new(url);
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let rendered = absolute.to_string_lossy().into_owned();
    if rendered.len() > 1 {
        rendered.trim_end_matches('/').to_string()
    } else {
        rendered
    }
}

/// Build the URL handed to git: the canonical URL with the provider token
/// embedded when one is configured in the environment.
pub fn authenticated_url(canonical: &str, config: &CredentialsConfig) -> String {
    let Ok(location) = forge::parse_repo_url(canonical) else {
        return canonical.to_string();
    };

    let env_name = match location.provider {
        Provider::GitHub => &config.github_token_env,
        Provider::AzureDevOps => &config.azure_token_env,
        Provider::Git | Provider::Local => return canonical.to_string(),
    };

    match std::env::var(env_name) {
        Ok(token) if !token.is_empty() => match inject_token(canonical, &token) {
            Some(url) => {
                debug!(
                    provider = location.provider.display_name(),
                    "using token-authenticated upstream URL"
                );
                url
            }
            None => canonical.to_string(),
        },
        _ => canonical.to_string(),
    }
}

/// Produce `https://{token}@{host}/{path}`.  Only https URLs can carry a
/// token; ssh remotes authenticate with keys.
fn inject_token(canonical: &str, token: &str) -> Option<String> {
    let rest = canonical.strip_prefix("https://")?;
    Some(format!("https://{token}@{rest}"))
}

/// Remove any `user:secret@` section from text destined for logs or error
/// messages (git echoes the remote URL in its stderr).
pub fn redact(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find("://") {
        let (head, tail) = rest.split_at(idx + 3);
        out.push_str(head);
        let end = tail
            .find(|c: char| c.is_whitespace() || c == '/' || c == '\'' || c == '"')
            .unwrap_or(tail.len());
        let authority = &tail[..end];
        match authority.rfind('@') {
            Some(at) => {
                out.push_str("***@");
                out.push_str(&authority[at + 1..]);
            }
            None => out.push_str(authority),
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}
