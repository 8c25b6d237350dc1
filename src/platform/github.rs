use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{CherryPickOutcome, PlatformClient, encode_segment, retry};
use crate::config::{PlatformConfig, RetryPolicy};
use crate::error::{ErrorKind, PrError, Result};
use crate::model::{
    CheckConclusion, CheckRun, CheckStatus, Comment, CommitInfo, CreatedPr, GitRef, MergeMethod,
    Permission, PrState, PullRequest, Review, ReviewState,
};

pub const DEFAULT_API: &str = "https://api.github.com";

const PAGE_SIZE: u32 = 100;

/// File committed to a cherry-pick branch when the pick did not apply.
pub const CONFLICT_NOTE: &str = "CHERRY_PICK_CONFLICT.md";

/// GitHub client backed by octocrab's generic REST routes.
pub struct GithubClient {
    octo: Octocrab,
    owner: String,
    repo: String,
    pr: u64,
    token: String,
    web_host: String,
    retry: RetryPolicy,
    timeout: Duration,
    login: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    ref_field: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    #[serde(default)]
    title: Option<String>,
    state: String,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    merged_at: Option<String>,
    #[serde(default)]
    draft: Option<bool>,
    #[serde(default)]
    user: Option<GhUser>,
    head: GhRef,
    base: GhRef,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    id: u64,
    #[serde(default)]
    user: Option<GhUser>,
    state: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhCheckRuns {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    check_runs: Vec<GhCheckRun>,
}

#[derive(Debug, Deserialize)]
struct GhCheckRun {
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhCombinedStatus {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    statuses: Vec<GhStatus>,
}

#[derive(Debug, Deserialize)]
struct GhStatus {
    context: String,
    state: String,
    #[serde(default)]
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhRequestedReviewers {
    #[serde(default)]
    users: Vec<GhUser>,
}

#[derive(Debug, Deserialize)]
struct GhPermission {
    permission: String,
    #[serde(default)]
    role_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhCreated {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    number: u64,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhRefObject {
    object: GhObject,
}

#[derive(Debug, Deserialize)]
struct GhGitCommit {
    tree: GhObject,
}

#[derive(Debug, Deserialize)]
struct GhCommitMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    commit: GhCommitMessage,
    #[serde(default)]
    parents: Vec<GhObject>,
}

#[derive(Debug, Deserialize)]
struct GhMergeResult {
    commit: GhMergeCommit,
}

#[derive(Debug, Deserialize)]
struct GhMergeCommit {
    tree: GhObject,
}

#[derive(Serialize)]
struct Page {
    per_page: u32,
    page: u32,
}

/// Convert an octocrab error into the processor's error kinds.
fn map_error(operation: &str, err: octocrab::Error) -> PrError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            PrError::from_status(source.status_code.as_u16(), operation, &source.message)
        }
        _ => PrError::PlatformUnavailable(format!("{operation}: {err}")),
    }
}

fn review_state(raw: &str) -> ReviewState {
    match raw {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "DISMISSED" => ReviewState::Dismissed,
        "PENDING" => ReviewState::Pending,
        _ => ReviewState::Commented,
    }
}

fn check_status(raw: &str) -> CheckStatus {
    match raw {
        "completed" => CheckStatus::Completed,
        "in_progress" => CheckStatus::InProgress,
        _ => CheckStatus::Queued,
    }
}

fn check_conclusion(raw: &str) -> CheckConclusion {
    match raw {
        "success" => CheckConclusion::Success,
        "failure" => CheckConclusion::Failure,
        "neutral" => CheckConclusion::Neutral,
        "cancelled" => CheckConclusion::Cancelled,
        "skipped" => CheckConclusion::Skipped,
        "timed_out" => CheckConclusion::TimedOut,
        _ => CheckConclusion::ActionRequired,
    }
}

/// Legacy commit statuses are folded into check runs.
fn status_to_check(status: GhStatus) -> CheckRun {
    let (state, conclusion) = match status.state.as_str() {
        "success" => (CheckStatus::Completed, Some(CheckConclusion::Success)),
        "failure" | "error" => (CheckStatus::Completed, Some(CheckConclusion::Failure)),
        _ => (CheckStatus::InProgress, None),
    };
    CheckRun {
        name: status.context,
        status: state,
        conclusion,
        url: status.target_url.unwrap_or_default(),
    }
}

/// `api.github.com` → `github.com`; `ghe.example.com/api/v3` → `ghe.example.com`.
fn web_host_for(api_base: &str) -> Result<String> {
    let url = url::Url::parse(api_base)
        .map_err(|e| PrError::InvalidInput(format!("invalid GitHub base URL '{api_base}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| PrError::InvalidInput(format!("GitHub base URL '{api_base}' has no host")))?;
    let host = host.strip_prefix("api.").unwrap_or(host);
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

impl GithubClient {
    pub fn new(cfg: &PlatformConfig) -> Result<Self> {
        super::install_crypto_provider();

        let base = cfg
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_API)
            .trim_end_matches('/')
            .to_string();

        let octo = Octocrab::builder()
            .personal_token(cfg.token.clone())
            .base_uri(base.as_str())
            .map_err(|e| PrError::InvalidInput(format!("invalid GitHub base URL '{base}': {e}")))?
            .build()
            .map_err(|e| PrError::Internal(format!("failed to build GitHub client: {e}")))?;

        Ok(GithubClient {
            octo,
            owner: cfg.owner.clone(),
            repo: cfg.repo.clone(),
            pr: cfg.pr_number,
            token: cfg.token.clone(),
            web_host: web_host_for(&base)?,
            retry: cfg.retry,
            timeout: cfg.operation_timeout,
            login: OnceCell::new(),
        })
    }

    fn repo_route(&self, tail: &str) -> String {
        format!("/repos/{}/{}/{}", self.owner, self.repo, tail)
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = octocrab::Result<T>>,
    {
        debug!(owner = %self.owner, repo = %self.repo, pr = self.pr, operation, "github call");
        retry::with_retry(&self.retry, self.timeout, operation, || {
            let fut = f();
            async move { fut.await.map_err(|e| map_error(operation, e)) }
        })
        .await
    }

    async fn paged<T>(&self, operation: &str, route: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let params = Page { per_page: PAGE_SIZE, page };
            let chunk: Vec<T> = self
                .call(operation, || self.octo.get(route, Some(&params)))
                .await?;
            let len = chunk.len();
            rows.extend(chunk);
            if len < PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }

    /// Every check run on `sha`; the list endpoint wraps rows in an envelope with `total_count`.
    async fn all_check_runs(&self, sha: &str) -> Result<Vec<GhCheckRun>> {
        let route = self.repo_route(&format!("commits/{sha}/check-runs"));
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let params = Page { per_page: PAGE_SIZE, page };
            let chunk: GhCheckRuns = self
                .call("list check runs", || self.octo.get(&route, Some(&params)))
                .await?;
            let len = chunk.check_runs.len();
            rows.extend(chunk.check_runs);
            if len == 0 || rows.len() >= chunk.total_count {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }

    /// Every commit status in the combined status of `sha`.
    async fn all_statuses(&self, sha: &str) -> Result<Vec<GhStatus>> {
        let route = self.repo_route(&format!("commits/{sha}/status"));
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let params = Page { per_page: PAGE_SIZE, page };
            let chunk: GhCombinedStatus = self
                .call("get combined status", || self.octo.get(&route, Some(&params)))
                .await?;
            let len = chunk.statuses.len();
            rows.extend(chunk.statuses);
            if len == 0 || rows.len() >= chunk.total_count {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }

    async fn raw_reviews(&self) -> Result<Vec<GhReview>> {
        let route = self.repo_route(&format!("pulls/{}/reviews", self.pr));
        self.paged("list reviews", &route).await
    }

    async fn branch_tip(&self, branch: &str) -> Result<String> {
        let route = self.repo_route(&format!("git/ref/heads/{branch}"));
        let r: GhRefObject = self
            .call("get branch ref", || self.octo.get(&route, None::<&()>))
            .await?;
        Ok(r.object.sha)
    }

    async fn force_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let route = self.repo_route(&format!("git/refs/heads/{branch}"));
        let body = json!({ "sha": sha, "force": true });
        let _: Value = self
            .call("update branch ref", || self.octo.patch(&route, Some(&body)))
            .await?;
        Ok(())
    }

    /// Commit on top of `tip` adding a note that `pick` needs a manual cherry-pick, so the
    /// branch differs from its target and a pull request can be opened for it.
    async fn conflict_commit(&self, pick: &GhCommit, branch: &str, tip: &str, tip_tree: &str) -> Result<String> {
        let note = format!(
            "# Cherry-pick conflict\n\n\
             Commit {} could not be applied cleanly to `{branch}`.\n\n\
             ```\n\
             git fetch origin\n\
             git checkout {branch}\n\
             git cherry-pick {}\n\
             ```\n\n\
             Resolve the conflicts, delete this file and push.\n",
            pick.sha, pick.sha
        );
        let route = self.repo_route("git/trees");
        let body = json!({
            "base_tree": tip_tree,
            "tree": [{
                "path": CONFLICT_NOTE,
                "mode": "100644",
                "type": "blob",
                "content": note,
            }],
        });
        let tree: GhObject = self
            .call("create conflict tree", || self.octo.post(&route, Some(&body)))
            .await?;

        let message = format!(
            "CONFLICT: cherry-pick of {} needs manual resolution\n\n{}",
            pick.sha.get(..7).unwrap_or(&pick.sha),
            pick.commit.message.trim_end()
        );
        self.create_commit(&message, &tree.sha, tip).await
    }

    async fn create_commit(&self, message: &str, tree: &str, parent: &str) -> Result<String> {
        let route = self.repo_route("git/commits");
        let body = json!({ "message": message, "tree": tree, "parents": [parent] });
        let c: GhObject = self
            .call("create commit", || self.octo.post(&route, Some(&body)))
            .await?;
        Ok(c.sha)
    }
}

#[async_trait]
impl PlatformClient for GithubClient {
    async fn current_user(&self) -> Result<String> {
        if let Some(login) = self.login.get() {
            return Ok(login.clone());
        }
        let me: GhUser = self
            .call("get authenticated user", || self.octo.get("/user", None::<&()>))
            .await?;
        let _ = self.login.set(me.login.clone());
        Ok(me.login)
    }

    async fn get_pr(&self) -> Result<PullRequest> {
        let route = self.repo_route(&format!("pulls/{}", self.pr));
        let pr: GhPull = self
            .call("get pull request", || self.octo.get(&route, None::<&()>))
            .await?;
        let merged = pr.merged.unwrap_or(pr.merged_at.is_some());
        Ok(PullRequest {
            number: pr.number,
            title: pr.title.unwrap_or_default(),
            state: if pr.state == "open" { PrState::Open } else { PrState::Closed },
            merged,
            draft: pr.draft.unwrap_or(false),
            author: pr.user.map(|u| u.login).unwrap_or_default(),
            head: GitRef { branch: pr.head.ref_field, sha: pr.head.sha },
            base: GitRef { branch: pr.base.ref_field, sha: pr.base.sha },
            mergeable: pr.mergeable,
            merge_commit_sha: pr.merge_commit_sha,
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
            url: pr.html_url.unwrap_or_else(|| {
                format!("https://{}/{}/{}/pull/{}", self.web_host, self.owner, self.repo, self.pr)
            }),
        })
    }

    async fn post_comment(&self, body: &str) -> Result<String> {
        let route = self.repo_route(&format!("issues/{}/comments", self.pr));
        let payload = json!({ "body": body });
        let c: GhCreated = self
            .call("create comment", || self.octo.post(&route, Some(&payload)))
            .await?;
        Ok(c.html_url.unwrap_or_else(|| format!("{}#issuecomment-{}", self.pr, c.id)))
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        let route = self.repo_route(&format!("issues/comments/{comment_id}"));
        let payload = json!({ "body": body });
        let _: Value = self
            .call("update comment", || self.octo.patch(&route, Some(&payload)))
            .await?;
        Ok(())
    }

    async fn get_comments(&self) -> Result<Vec<Comment>> {
        let route = self.repo_route(&format!("issues/{}/comments", self.pr));
        let raw: Vec<GhComment> = self.paged("list comments", &route).await?;
        let mut comments: Vec<Comment> = raw
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                author: c.user.map(|u| u.login).unwrap_or_default(),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
                url: c.html_url,
            })
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.url.cmp(&b.url)));
        Ok(comments)
    }

    async fn get_reviews(&self) -> Result<Vec<Review>> {
        let mut reviews: Vec<Review> = self
            .raw_reviews()
            .await?
            .into_iter()
            .filter_map(|r| {
                let submitted_at = r.submitted_at?;
                Some(Review {
                    author: r.user.map(|u| u.login).unwrap_or_default(),
                    state: review_state(&r.state),
                    body: r.body.unwrap_or_default(),
                    submitted_at,
                    url: r.html_url.unwrap_or_default(),
                })
            })
            .collect();
        reviews.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.url.cmp(&b.url)));
        Ok(reviews)
    }

    async fn get_requested_reviewers(&self) -> Result<Vec<String>> {
        let route = self.repo_route(&format!("pulls/{}/requested_reviewers", self.pr));
        let r: GhRequestedReviewers = self
            .call("list requested reviewers", || self.octo.get(&route, None::<&()>))
            .await?;
        Ok(r.users.into_iter().map(|u| u.login).collect())
    }

    async fn assign_reviewers(&self, users: &[String]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let route = self.repo_route(&format!("pulls/{}/requested_reviewers", self.pr));
        let body = json!({ "reviewers": users });
        let _: Value = self
            .call("request reviewers", || self.octo.post(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn remove_reviewers(&self, users: &[String]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let route = self.repo_route(&format!("pulls/{}/requested_reviewers", self.pr));
        let body = json!({ "reviewers": users });
        let _: Value = self
            .call("remove reviewers", || self.octo.delete(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn approve_pr(&self, body: &str) -> Result<()> {
        let route = self.repo_route(&format!("pulls/{}/reviews", self.pr));
        let payload = json!({ "event": "APPROVE", "body": body });
        let _: Value = self
            .call("approve pull request", || self.octo.post(&route, Some(&payload)))
            .await?;
        Ok(())
    }

    async fn dismiss_approve(&self, body: &str) -> Result<()> {
        let me = self.current_user().await?;
        let latest = self
            .raw_reviews()
            .await?
            .into_iter()
            .filter(|r| r.state == "APPROVED")
            .filter(|r| r.user.as_ref().map(|u| u.login == me).unwrap_or(false))
            .max_by_key(|r| r.submitted_at);

        let Some(review) = latest else {
            debug!(pr = self.pr, "no approval of ours to dismiss");
            return Ok(());
        };

        let route = self.repo_route(&format!("pulls/{}/reviews/{}/dismissals", self.pr, review.id));
        let payload = json!({ "message": body, "event": "DISMISS" });
        let _: Value = self
            .call("dismiss review", || self.octo.put(&route, Some(&payload)))
            .await?;
        Ok(())
    }

    async fn get_user_permission(&self, user: &str) -> Result<Permission> {
        let route = self.repo_route(&format!("collaborators/{}/permission", encode_segment(user)));
        let result: Result<GhPermission> = self
            .call("get collaborator permission", || self.octo.get(&route, None::<&()>))
            .await;
        match result {
            Ok(p) => Ok(Permission::from_github(p.role_name.as_deref().unwrap_or(&p.permission))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Permission::None),
            Err(e) => Err(e),
        }
    }

    async fn get_labels(&self) -> Result<Vec<String>> {
        let route = self.repo_route(&format!("issues/{}/labels", self.pr));
        let labels: Vec<GhLabel> = self.paged("list labels", &route).await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn add_labels(&self, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let route = self.repo_route(&format!("issues/{}/labels", self.pr));
        let body = json!({ "labels": labels });
        let _: Value = self
            .call("add labels", || self.octo.post(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn remove_labels(&self, labels: &[String]) -> Result<()> {
        for label in labels {
            let route = self.repo_route(&format!("issues/{}/labels/{}", self.pr, encode_segment(label)));
            let result: Result<Value> = self
                .call("remove label", || self.octo.delete(&route, None::<&()>))
                .await;
            match result {
                Ok(_) => {}
                // Removing an absent label is a no-op.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn get_check_runs(&self) -> Result<Vec<CheckRun>> {
        let pr = self.get_pr().await?;
        let runs = self.all_check_runs(&pr.head.sha).await?;
        let statuses = self.all_statuses(&pr.head.sha).await?;

        let mut out: Vec<CheckRun> = runs
            .into_iter()
            .map(|r| CheckRun {
                status: check_status(&r.status),
                conclusion: r.conclusion.as_deref().map(check_conclusion),
                name: r.name,
                url: r.html_url.unwrap_or_default(),
            })
            .collect();
        out.extend(statuses.into_iter().map(status_to_check));
        Ok(out)
    }

    async fn merge_pr(&self, method: MergeMethod) -> Result<()> {
        let pr = self.get_pr().await?;
        let route = self.repo_route(&format!("pulls/{}/merge", self.pr));
        let body = json!({ "merge_method": method.as_str(), "sha": pr.head.sha });
        let _: Value = self
            .call("merge pull request", || self.octo.put(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn rebase_pr(&self) -> Result<()> {
        let pr = self.get_pr().await?;
        let route = self.repo_route(&format!("pulls/{}/update-branch", self.pr));
        let body = json!({ "expected_head_sha": pr.head.sha });
        let _: Value = self
            .call("update branch", || self.octo.put(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        let sha = self.branch_tip(base).await?;
        let route = self.repo_route("git/refs");
        let body = json!({ "ref": format!("refs/heads/{name}"), "sha": sha });
        let _: Value = self
            .call("create branch", || self.octo.post(&route, Some(&body)))
            .await?;
        Ok(())
    }

    async fn get_commits(&self) -> Result<Vec<CommitInfo>> {
        let route = self.repo_route(&format!("pulls/{}/commits", self.pr));
        let commits: Vec<GhCommit> = self.paged("list commits", &route).await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitInfo { sha: c.sha, message: c.commit.message })
            .collect())
    }

    async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> Result<CreatedPr> {
        let route = self.repo_route("pulls");
        let payload = json!({ "title": title, "body": body, "head": head, "base": base });
        let c: GhCreated = self
            .call("create pull request", || self.octo.post(&route, Some(&payload)))
            .await?;
        Ok(CreatedPr {
            number: c.number,
            url: c.html_url.unwrap_or_else(|| {
                format!("https://{}/{}/{}/pull/{}", self.web_host, self.owner, self.repo, c.number)
            }),
        })
    }

    async fn cherry_pick_commit(&self, sha: &str, branch: &str) -> Result<CherryPickOutcome> {
        let tip = self.branch_tip(branch).await?;

        let tip_route = self.repo_route(&format!("git/commits/{tip}"));
        let tip_commit: GhGitCommit = self
            .call("get branch commit", || self.octo.get(&tip_route, None::<&()>))
            .await?;

        let pick_route = self.repo_route(&format!("commits/{sha}"));
        let pick: GhCommit = self
            .call("get picked commit", || self.octo.get(&pick_route, None::<&()>))
            .await?;
        let parent = pick
            .parents
            .first()
            .map(|p| p.sha.clone())
            .ok_or_else(|| PrError::InvalidInput(format!("commit {sha} has no parent to pick against")))?;

        // Sibling of the picked commit carrying the target tree; merging the pick into it
        // applies exactly the pick's diff on top of the target.
        let scratch = self
            .create_commit("pr-cli: temporary cherry-pick base", &tip_commit.tree.sha, &parent)
            .await?;
        self.force_ref(branch, &scratch).await?;

        let merges_route = self.repo_route("merges");
        let merge_body = json!({
            "base": branch,
            "head": sha,
            "commit_message": format!("pr-cli: temporary merge of {sha}"),
        });
        let merged: Result<GhMergeResult> = self
            .call("merge picked commit", || self.octo.post(&merges_route, Some(&merge_body)))
            .await;

        let merged = match merged {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                let note = self.conflict_commit(&pick, branch, &tip, &tip_commit.tree.sha).await?;
                self.force_ref(branch, &note).await?;
                return Ok(CherryPickOutcome { sha: note, conflict: true });
            }
            Err(e) => {
                self.force_ref(branch, &tip).await?;
                return Err(e);
            }
        };

        let message = format!(
            "{}\n\n(cherry picked from commit {})",
            pick.commit.message.trim_end(),
            pick.sha
        );
        let new_sha = self.create_commit(&message, &merged.commit.tree.sha, &tip).await?;
        self.force_ref(branch, &new_sha).await?;
        Ok(CherryPickOutcome { sha: new_sha, conflict: false })
    }

    fn git_remote_url(&self) -> String {
        format!(
            "https://x-access-token:{}@{}/{}/{}.git",
            self.token, self.web_host, self.owner, self.repo
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_host_for_public_and_enterprise() {
        assert_eq!(web_host_for("https://api.github.com").unwrap(), "github.com");
        assert_eq!(web_host_for("https://ghe.example.com/api/v3").unwrap(), "ghe.example.com");
        assert_eq!(web_host_for("http://127.0.0.1:8080").unwrap(), "127.0.0.1:8080");
        assert!(web_host_for("not a url").is_err());
    }

    #[test]
    fn test_review_state_mapping() {
        assert_eq!(review_state("APPROVED"), ReviewState::Approved);
        assert_eq!(review_state("CHANGES_REQUESTED"), ReviewState::ChangesRequested);
        assert_eq!(review_state("DISMISSED"), ReviewState::Dismissed);
        assert_eq!(review_state("COMMENTED"), ReviewState::Commented);
    }

    #[test]
    fn test_check_mapping() {
        assert_eq!(check_status("waiting"), CheckStatus::Queued);
        assert_eq!(check_status("in_progress"), CheckStatus::InProgress);
        assert_eq!(check_conclusion("timed_out"), CheckConclusion::TimedOut);
        assert_eq!(check_conclusion("stale"), CheckConclusion::ActionRequired);
    }

    #[test]
    fn test_legacy_status_folding() {
        let run = status_to_check(GhStatus {
            context: "ci/jenkins".to_string(),
            state: "error".to_string(),
            target_url: None,
        });
        assert_eq!(run.status, CheckStatus::Completed);
        assert_eq!(run.conclusion, Some(CheckConclusion::Failure));

        let pending = status_to_check(GhStatus {
            context: "ci/jenkins".to_string(),
            state: "pending".to_string(),
            target_url: Some("https://ci/1".to_string()),
        });
        assert!(!pending.is_green());
        assert_eq!(pending.url, "https://ci/1");
    }
}
