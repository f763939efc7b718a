//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the system `git` binary with terminal
//! prompts disabled and a hard timeout; a timed-out child is killed when its
//! future is dropped.  Remote URLs may carry a token, so they are never
//! logged verbatim and git's stderr is redacted before it is surfaced.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::credentials::redact;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `git <args>` (optionally with `-C repo`) and return its output,
/// failing on a non-zero exit status.
async fn run_git<I, S>(repo: Option<&Path>, args: I, timeout: Duration, what: &str) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    if let Some(repo) = repo {
        cmd.arg("-C").arg(repo);
    }
    cmd.args(args);

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!(command = what, "spawning git");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.with_context(|| format!("failed to spawn {what}"))?,
        Err(_) => bail!("{what} timed out after {}s", timeout.as_secs()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{what} failed (status {}): {}",
            output.status,
            redact(stderr.trim()),
        );
    }

    Ok(output)
}

fn stdout_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone [--branch <branch>] <url> <dest>`.
#[instrument(skip(url, timeout), fields(dest = %dest.display(), ?branch))]
pub async fn git_clone(url: &str, dest: &Path, branch: Option<&str>, timeout: Duration) -> Result<()> {
    let mut args: Vec<&OsStr> = vec![OsStr::new("clone")];
    if let Some(branch) = branch {
        args.push(OsStr::new("--branch"));
        args.push(OsStr::new(branch));
    }
    args.push(OsStr::new("--"));
    args.push(OsStr::new(url));
    args.push(dest.as_os_str());

    run_git(None, args, timeout, "git clone").await?;
    debug!("git clone succeeded");
    Ok(())
}

/// Point `remote` at `url` (used to drop the token-bearing URL after clone).
#[instrument(skip(url, timeout), fields(repo = %repo.display(), %remote))]
pub async fn git_set_remote_url(repo: &Path, remote: &str, url: &str, timeout: Duration) -> Result<()> {
    run_git(
        Some(repo),
        ["remote", "set-url", remote, url],
        timeout,
        "git remote set-url",
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch / pull / checkout
// ---------------------------------------------------------------------------

/// Fetch one branch from `url` into `refs/remotes/origin/<branch>`.
#[instrument(skip(url, timeout), fields(repo = %repo.display(), %branch))]
pub async fn git_fetch_branch(repo: &Path, url: &str, branch: &str, timeout: Duration) -> Result<()> {
    let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
    run_git(
        Some(repo),
        ["fetch", "--prune", url, refspec.as_str()],
        timeout,
        "git fetch",
    )
    .await?;
    Ok(())
}

/// Check out `branch`, resetting the local branch to the fetched remote tip.
#[instrument(skip(timeout), fields(repo = %repo.display(), %branch))]
pub async fn git_checkout_tracking(repo: &Path, branch: &str, timeout: Duration) -> Result<()> {
    let start = format!("refs/remotes/origin/{branch}");
    run_git(
        Some(repo),
        ["checkout", "-B", branch, start.as_str()],
        timeout,
        "git checkout",
    )
    .await?;
    Ok(())
}

/// Fast-forward the checked-out branch from `url`.
#[instrument(skip(url, timeout), fields(repo = %repo.display(), %branch))]
pub async fn git_pull(repo: &Path, url: &str, branch: &str, timeout: Duration) -> Result<()> {
    run_git(
        Some(repo),
        ["pull", "--ff-only", url, branch],
        timeout,
        "git pull",
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// `git rev-parse HEAD`.
pub async fn git_head_commit(repo: &Path, timeout: Duration) -> Result<String> {
    let output = run_git(Some(repo), ["rev-parse", "HEAD"], timeout, "git rev-parse").await?;
    Ok(stdout_line(&output))
}

/// Name of the checked-out branch, `None` on a detached HEAD.
pub async fn git_current_branch(repo: &Path, timeout: Duration) -> Result<Option<String>> {
    let output = run_git(
        Some(repo),
        ["rev-parse", "--abbrev-ref", "HEAD"],
        timeout,
        "git rev-parse --abbrev-ref",
    )
    .await?;
    let name = stdout_line(&output);
    Ok(if name.is_empty() || name == "HEAD" {
        None
    } else {
        Some(name)
    })
}

/// Commit time of HEAD, `None` for a repository without commits.
pub async fn git_last_commit_time(repo: &Path, timeout: Duration) -> Result<Option<DateTime<Utc>>> {
    let output = match run_git(
        Some(repo),
        ["log", "-1", "--format=%ct"],
        timeout,
        "git log",
    )
    .await
    {
        Ok(o) => o,
        Err(e) if e.to_string().contains("does not have any commits") => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(parse_commit_timestamp(&stdout_line(&output)))
}

fn parse_commit_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
