//! Thin driver around the `git` CLI for the clone-and-pick cherry-pick mode.
//!
//! Mutations go through the CLI; inspection (conflicts, parents, HEAD) goes
//! through `git2` on the resulting working copy.

use anyhow::{bail, Context, Result};
use git2::Repository;
use std::path::Path;
use std::process::{Command, Output};

/// Bot identity used for cherry-pick commits.
pub const BOT_NAME: &str = "pr-cli";
pub const BOT_EMAIL: &str = "pr-cli@users.noreply.github.com";

fn git(root: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("Failed to run `git {}`", args.first().copied().unwrap_or_default()))
}

fn git_ok(root: &Path, args: &[&str]) -> Result<Output> {
    let output = git(root, args)?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Strip credentials from a remote URL before it reaches a log line.
pub fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() || !parsed.username().is_empty() => {
            let _ = parsed.set_password(None);
            let _ = parsed.set_username("");
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

/// Shallow single-branch clone of `branch` into `dest`.
pub fn shallow_clone(remote: &str, branch: &str, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["clone", "--depth", "50", "--single-branch", "--branch", branch, remote])
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .context("Failed to run `git clone`")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).replace(remote, &redact(remote));
        bail!("git clone of branch '{}' failed: {}", branch, stderr.trim());
    }
    Ok(())
}

/// Set the committer identity for this working copy only.
pub fn configure_identity(root: &Path, name: &str, email: &str) -> Result<()> {
    git_ok(root, &["config", "user.name", name])?;
    git_ok(root, &["config", "user.email", email])?;
    Ok(())
}

/// Make `sha` (and its parents) available locally.
pub fn fetch_commit(root: &Path, sha: &str) -> Result<()> {
    if git(root, &["fetch", "--depth", "2", "origin", sha])?.status.success() {
        return Ok(());
    }
    // Servers that refuse unadvertised objects: fall back to all branch heads.
    git_ok(
        root,
        &["fetch", "--depth", "50", "origin", "+refs/heads/*:refs/remotes/origin/*"],
    )?;
    let repo = Repository::open(root)?;
    let oid = git2::Oid::from_str(sha).with_context(|| format!("'{}' is not a commit id", sha))?;
    repo.find_commit(oid)
        .with_context(|| format!("commit {} is not reachable from any branch", sha))?;
    Ok(())
}

/// Create a new branch pointing at `base_ref` and check it out.
pub fn create_branch(root: &Path, branch_name: &str, base_ref: &str) -> Result<()> {
    let output = git(root, &["checkout", "-b", branch_name, base_ref])?;
    if !output.status.success() {
        bail!("Failed to create branch '{}'", branch_name);
    }
    Ok(())
}

/// Number of parents of `sha`; merge commits need `-m 1` to be picked.
pub fn parent_count(root: &Path, sha: &str) -> Result<usize> {
    let repo = Repository::open(root)?;
    let commit = repo.find_commit(git2::Oid::from_str(sha)?)?;
    Ok(commit.parent_count())
}

pub fn has_conflicts(root: &Path) -> Result<bool> {
    let repo = Repository::open(root)?;
    let index = repo.index()?;
    Ok(index.has_conflicts())
}

pub fn head_sha(root: &Path) -> Result<String> {
    let repo = Repository::open(root)?;
    let head = repo.head().context("No HEAD after cherry-pick")?;
    let commit = head.peel_to_commit()?;
    Ok(commit.id().to_string())
}

/// `git cherry-pick -x`. Returns `true` when the pick stopped on conflicts.
pub fn cherry_pick(root: &Path, sha: &str) -> Result<bool> {
    let mut args = vec!["cherry-pick", "-x"];
    if parent_count(root, sha)? > 1 {
        args.extend(["-m", "1"]);
    }
    args.push(sha);

    let output = git(root, &args)?;
    if output.status.success() {
        return Ok(false);
    }
    if has_conflicts(root)? {
        return Ok(true);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    // An empty pick means the change is already on the branch.
    if stderr.contains("empty") || stdout.contains("nothing to commit") {
        bail!("cherry-pick of {} is empty on this branch", sha);
    }
    bail!("git cherry-pick failed: {}{}", stderr.trim(), stdout.trim());
}

/// Stage everything, conflict markers included, and finish the pick.
pub fn commit_all(root: &Path, message: &str) -> Result<()> {
    git_ok(root, &["add", "-A"])?;
    let output = git(root, &["commit", "--no-verify", "-m", message])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        // git prints "nothing to commit" on stdout, not stderr
        let detail = if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
            "nothing to commit, working tree clean".to_string()
        } else {
            format!("{}{}", stderr.trim(), stdout.trim())
        };
        bail!("git commit failed: {}", detail);
    }
    Ok(())
}

/// Paths with unmerged entries, for the conflict report.
pub fn conflicted_files(root: &Path) -> Result<Vec<String>> {
    let output = git_ok(root, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn remote_branch_exists(root: &Path, branch_name: &str) -> Result<bool> {
    let output = git(root, &["ls-remote", "--exit-code", "--heads", "origin", branch_name])?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(2) => Ok(false),
        _ => bail!(
            "git ls-remote failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Push a new branch to origin. Never forces.
pub fn push_branch(root: &Path, branch_name: &str) -> Result<()> {
    let refspec = format!("HEAD:refs/heads/{}", branch_name);
    let output = git(root, &["push", "origin", &refspec])?;
    if !output.status.success() {
        bail!(
            "Failed to push branch '{}': {}",
            branch_name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Result of [`pick_onto`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliPick {
    pub sha: String,
    pub conflict: bool,
    pub conflicted_files: Vec<String>,
    /// The branch already existed on the remote; nothing was pushed.
    pub already_exists: bool,
}

/// Clone `target`, pick `sha` onto a new `branch`, and push it.
///
/// On conflict the markers are committed as-is so the pushed branch shows
/// exactly what needs resolving.
pub fn pick_onto(remote: &str, target: &str, branch: &str, sha: &str, workdir: &Path) -> Result<CliPick> {
    let root = workdir.join("repo");
    shallow_clone(remote, target, &root)?;
    configure_identity(&root, BOT_NAME, BOT_EMAIL)?;

    if remote_branch_exists(&root, branch)? {
        return Ok(CliPick {
            sha: String::new(),
            conflict: false,
            conflicted_files: vec![],
            already_exists: true,
        });
    }

    fetch_commit(&root, sha)?;
    create_branch(&root, branch, "HEAD")?;

    let conflict = cherry_pick(&root, sha)?;
    let mut files = vec![];
    if conflict {
        files = conflicted_files(&root)?;
        let short = sha.get(..7).unwrap_or(sha);
        commit_all(
            &root,
            &format!("CONFLICT: cherry-pick of {short} onto {target}\n\n(cherry picked from commit {sha})"),
        )?;
    }

    push_branch(&root, branch)?;
    Ok(CliPick {
        sha: head_sha(&root)?,
        conflict,
        conflicted_files: files,
        already_exists: false,
    })
}
