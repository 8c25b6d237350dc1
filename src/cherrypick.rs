//! Cherry-pick orchestration: branch naming, deferred intents, and the two
//! ways of applying the merge commit (platform API or git CLI).

use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::config::{CherryPickMode, ProcessorConfig};
use crate::error::{ErrorKind, PrError, Result};
use crate::git;
use crate::model::{CherryPickRequest, Comment, CreatedPr, PullRequest};
use crate::platform::PlatformClient;

const INTENT_TAG: &str = "pr-cli:cherry-pick-intent";
const DONE_TAG: &str = "pr-cli:cherry-pick-done";

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*pr-cli:cherry-pick-(intent|done)\s+pr=(\d+)\s+target=(\S+?)\s*-->")
        .expect("intent marker pattern is valid")
});

/// `cherry-pick-<pr>-to-<target with / and . as ->-<first 7 of sha>`.
pub fn branch_name(pr: u64, sha: &str, target: &str) -> String {
    let sanitized = target.replace(['/', '.'], "-");
    let short = sha.get(..7).unwrap_or(sha);
    format!("cherry-pick-{pr}-to-{sanitized}-{short}")
}

pub fn intent_marker(pr: u64, target: &str) -> String {
    format!("<!-- {INTENT_TAG} pr={pr} target={target} -->")
}

/// A cherry-pick recorded in a bot comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub comment_id: u64,
    pub source_pr: u64,
    pub target: String,
    pub done: bool,
    body: String,
}

/// Intents for `pr` found in comments authored by `bot`, in comment order.
pub fn find_intents(comments: &[Comment], bot: &str, pr: u64) -> Vec<Intent> {
    comments
        .iter()
        .filter(|c| c.author.eq_ignore_ascii_case(bot))
        .filter_map(|c| {
            let caps = MARKER.captures(&c.body)?;
            let source_pr: u64 = caps.get(2)?.as_str().parse().ok()?;
            if source_pr != pr {
                return None;
            }
            Some(Intent {
                comment_id: c.id,
                source_pr,
                target: caps.get(3)?.as_str().to_string(),
                done: caps.get(1)?.as_str() == "done",
                body: c.body.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Recorded,
    AlreadyPending,
    AlreadyDone,
}

/// Post an intent comment unless one for the same `(pr, target)` exists.
pub async fn record_intent(
    client: &dyn PlatformClient,
    comments: &[Comment],
    bot: &str,
    pr: u64,
    target: &str,
    requested_by: &str,
    dry_run: bool,
) -> Result<IntentStatus> {
    if let Some(existing) = find_intents(comments, bot, pr)
        .into_iter()
        .find(|i| i.target == target)
    {
        return Ok(if existing.done {
            IntentStatus::AlreadyDone
        } else {
            IntentStatus::AlreadyPending
        });
    }

    let body = format!(
        "{}\nCherry-pick to `{target}` requested by @{requested_by}. It will run once this PR is merged.",
        intent_marker(pr, target)
    );
    if !dry_run {
        client.post_comment(&body).await?;
    }
    Ok(IntentStatus::Recorded)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickStatus {
    Opened { pr: CreatedPr, conflict: bool },
    /// The target branch already exists: a previous delivery did the work.
    AlreadyPicked,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickReport {
    pub target: String,
    pub branch: String,
    pub status: PickStatus,
}

impl PickReport {
    pub fn message(&self) -> String {
        match &self.status {
            PickStatus::Opened { pr, conflict: false } => {
                format!("cherry-picked onto `{}` in #{} ({})", self.target, pr.number, pr.url)
            }
            PickStatus::Opened { pr, conflict: true } => format!(
                "CONFLICT cherry-picking onto `{}`; opened #{} for manual resolution ({})",
                self.target, pr.number, pr.url
            ),
            PickStatus::AlreadyPicked => {
                format!("already cherry-picked onto `{}` (branch `{}`)", self.target, self.branch)
            }
            PickStatus::DryRun => {
                format!("would cherry-pick onto `{}` as `{}`", self.target, self.branch)
            }
        }
    }
}

struct Applied {
    conflict: bool,
    conflicted_files: Vec<String>,
    already_exists: bool,
}

async fn apply_native(client: &dyn PlatformClient, req: &CherryPickRequest, branch: &str) -> Result<Applied> {
    match client.create_branch(branch, &req.target_branch).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::Conflict => {
            return Ok(Applied { conflict: false, conflicted_files: vec![], already_exists: true });
        }
        Err(e) => return Err(e),
    }
    let outcome = client.cherry_pick_commit(&req.source_merge_sha, branch).await?;
    Ok(Applied { conflict: outcome.conflict, conflicted_files: vec![], already_exists: false })
}

async fn apply_git(client: &dyn PlatformClient, req: &CherryPickRequest, branch: &str) -> Result<Applied> {
    let remote = client.git_remote_url();
    let target = req.target_branch.clone();
    let sha = req.source_merge_sha.clone();
    let branch = branch.to_string();

    let picked = tokio::task::spawn_blocking(move || -> anyhow::Result<git::CliPick> {
        let workdir = tempfile::tempdir()?;
        git::pick_onto(&remote, &target, &branch, &sha, workdir.path())
    })
    .await
    .map_err(|e| PrError::Internal(format!("cherry-pick worker failed: {e}")))?
    .map_err(|e| PrError::Internal(format!("{e:#}")))?;

    Ok(Applied {
        conflict: picked.conflict,
        conflicted_files: picked.conflicted_files,
        already_exists: picked.already_exists,
    })
}

fn pr_body(source: &PullRequest, req: &CherryPickRequest, applied: &Applied, mode: CherryPickMode) -> String {
    let short = req.source_merge_sha.get(..7).unwrap_or(&req.source_merge_sha);
    let mut body = format!(
        "Automated cherry-pick of #{} (`{}`) onto `{}`.\n\nOriginal PR: {}\n",
        req.source_pr_number, short, req.target_branch, source.url
    );
    if applied.conflict {
        body.push_str("\n**CONFLICT**: the commit did not apply cleanly.\n");
        match mode {
            CherryPickMode::Git => {
                body.push_str("Conflict markers are committed on this branch. Resolve them before merging.\n");
                for file in &applied.conflicted_files {
                    body.push_str(&format!("- `{file}`\n"));
                }
            }
            CherryPickMode::Native => body.push_str(&format!(
                "The commit was not applied to this branch. Apply `{}` manually on top of `{}`.\n",
                req.source_merge_sha, req.target_branch
            )),
        }
    }
    body
}

async fn run_pick(
    client: &dyn PlatformClient,
    config: &ProcessorConfig,
    source: &PullRequest,
    req: &CherryPickRequest,
) -> Result<PickReport> {
    let branch = branch_name(req.source_pr_number, &req.source_merge_sha, &req.target_branch);
    if config.dry_run {
        return Ok(PickReport {
            target: req.target_branch.clone(),
            branch,
            status: PickStatus::DryRun,
        });
    }

    let applied = match config.cherry_pick_mode {
        CherryPickMode::Native => apply_native(client, req, &branch).await?,
        CherryPickMode::Git => apply_git(client, req, &branch).await?,
    };
    if applied.already_exists {
        info!(branch = %branch, "cherry-pick branch already exists");
        return Ok(PickReport {
            target: req.target_branch.clone(),
            branch,
            status: PickStatus::AlreadyPicked,
        });
    }

    let title = if applied.conflict {
        format!("CONFLICT: [{}] {}", req.target_branch, source.title)
    } else {
        format!("[{}] {}", req.target_branch, source.title)
    };
    let body = pr_body(source, req, &applied, config.cherry_pick_mode);
    let created = client.create_pr(&title, &body, &branch, &req.target_branch).await?;
    info!(branch = %branch, pr = created.number, conflict = applied.conflict, "cherry-pick PR opened");

    Ok(PickReport {
        target: req.target_branch.clone(),
        branch,
        status: PickStatus::Opened { pr: created, conflict: applied.conflict },
    })
}

/// Cherry-pick a merged PR onto `target`, bounded by the cherry-pick timeout.
pub async fn cherry_pick(
    client: &dyn PlatformClient,
    config: &ProcessorConfig,
    source: &PullRequest,
    target: &str,
) -> Result<PickReport> {
    let sha = source
        .merge_commit_sha
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PrError::InvalidInput(format!("PR #{} has no merge commit to cherry-pick", source.number)))?;
    let req = CherryPickRequest {
        source_pr_number: source.number,
        source_merge_sha: sha,
        target_branch: target.to_string(),
    };

    let limit = config.timeouts.cherry_pick;
    tokio::time::timeout(limit, run_pick(client, config, source, &req))
        .await
        .map_err(|_| {
            PrError::PlatformUnavailable(format!(
                "cherry-pick onto {target} timed out after {}s",
                limit.as_secs()
            ))
        })?
}

/// Outcome of consuming one pending intent.
#[derive(Debug)]
pub struct Consumed {
    pub target: String,
    pub result: Result<PickReport>,
}

/// Execute every pending intent for a merged PR and mark each one done.
///
/// An intent whose pick fails stays pending so a later merge trigger retries it.
pub async fn consume_intents(
    client: &dyn PlatformClient,
    config: &ProcessorConfig,
    source: &PullRequest,
    comments: &[Comment],
    bot: &str,
) -> Vec<Consumed> {
    let pending: Vec<Intent> = find_intents(comments, bot, source.number)
        .into_iter()
        .filter(|i| !i.done)
        .collect();

    let mut consumed = Vec::with_capacity(pending.len());
    for intent in pending {
        let result = cherry_pick(client, config, source, &intent.target).await;
        if let Ok(report) = &result {
            if !config.dry_run {
                let body = format!(
                    "{}\n\n{}",
                    intent.body.replacen(INTENT_TAG, DONE_TAG, 1),
                    report.message()
                );
                if let Err(e) = client.update_comment(intent.comment_id, &body).await {
                    warn!(target = %intent.target, error = %e, "failed to mark cherry-pick intent done");
                }
            }
        }
        consumed.push(Consumed { target: intent.target, result });
    }
    consumed
}
