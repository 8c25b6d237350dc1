use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
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

pub const DEFAULT_API: &str = "https://gitlab.com/api/v4";

const PAGE_SIZE: usize = 100;

/// GitLab merge-request client over the v4 REST API.
pub struct GitlabClient {
    http: Client,
    api: String,
    project: String,
    owner: String,
    repo: String,
    iid: u64,
    token: String,
    web_base: String,
    retry: RetryPolicy,
    timeout: Duration,
    login: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
struct GlUser {
    #[serde(default)]
    id: u64,
    username: String,
}

#[derive(Debug, Deserialize)]
struct GlDiffRefs {
    #[serde(default)]
    base_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: u64,
    #[serde(default)]
    title: String,
    state: String,
    #[serde(default)]
    draft: Option<bool>,
    #[serde(default)]
    work_in_progress: Option<bool>,
    author: GlUser,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    diff_refs: Option<GlDiffRefs>,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    squash_commit_sha: Option<String>,
    #[serde(default)]
    has_conflicts: Option<bool>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    reviewers: Vec<GlUser>,
    #[serde(default)]
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct GlNote {
    id: u64,
    #[serde(default)]
    body: String,
    author: GlUser,
    created_at: DateTime<Utc>,
    #[serde(default)]
    system: bool,
}

#[derive(Debug, Deserialize)]
struct GlStatus {
    name: String,
    status: String,
    #[serde(default)]
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlMember {
    access_level: u32,
}

#[derive(Debug, Deserialize)]
struct GlCommit {
    id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GlCreatedMr {
    iid: u64,
    #[serde(default)]
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct GlCreatedNote {
    id: u64,
}

/// Approval state changes are recorded as system notes on the merge request.
fn system_note_review(body: &str) -> Option<ReviewState> {
    let body = body.trim().to_ascii_lowercase();
    if body.starts_with("unapproved this merge request") {
        Some(ReviewState::Dismissed)
    } else if body.starts_with("approved this merge request") {
        Some(ReviewState::Approved)
    } else if body.starts_with("requested changes") {
        Some(ReviewState::ChangesRequested)
    } else {
        None
    }
}

fn status_to_check(s: GlStatus) -> CheckRun {
    let (status, conclusion) = match s.status.as_str() {
        "running" => (CheckStatus::InProgress, None),
        "success" => (CheckStatus::Completed, Some(CheckConclusion::Success)),
        "failed" => (CheckStatus::Completed, Some(CheckConclusion::Failure)),
        "canceled" => (CheckStatus::Completed, Some(CheckConclusion::Cancelled)),
        "skipped" => (CheckStatus::Completed, Some(CheckConclusion::Skipped)),
        "manual" => (CheckStatus::Completed, Some(CheckConclusion::ActionRequired)),
        _ => (CheckStatus::Queued, None),
    };
    CheckRun {
        name: s.name,
        status,
        conclusion,
        url: s.target_url.unwrap_or_default(),
    }
}

/// `https://gitlab.example.com/api/v4` → `https://gitlab.example.com`.
fn web_base_for(api: &str) -> Result<String> {
    let mut url = url::Url::parse(api)
        .map_err(|e| PrError::InvalidInput(format!("invalid GitLab base URL '{api}': {e}")))?;
    let path = url.path().trim_end_matches('/').to_string();
    let trimmed = path.strip_suffix("/api/v4").unwrap_or(&path).to_string();
    url.set_path(&trimmed);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

impl GitlabClient {
    pub fn new(cfg: &PlatformConfig) -> Result<Self> {
        let mut api = cfg
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_API)
            .trim_end_matches('/')
            .to_string();
        if !api.ends_with("/api/v4") {
            api.push_str("/api/v4");
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "PRIVATE-TOKEN",
            reqwest::header::HeaderValue::from_str(cfg.token.trim())
                .map_err(|_| PrError::InvalidInput("GitLab token contains invalid characters".to_string()))?,
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("pr-cli"),
        );
        let http = Client::builder()
            .default_headers(headers)
            .timeout(cfg.operation_timeout)
            .build()
            .map_err(|e| PrError::Internal(format!("failed to build GitLab client: {e}")))?;

        Ok(GitlabClient {
            http,
            web_base: web_base_for(&api)?,
            api,
            project: encode_segment(&format!("{}/{}", cfg.owner, cfg.repo)),
            owner: cfg.owner.clone(),
            repo: cfg.repo.clone(),
            iid: cfg.pr_number,
            token: cfg.token.clone(),
            retry: cfg.retry,
            timeout: cfg.operation_timeout,
            login: OnceCell::new(),
        })
    }

    fn project_url(&self, tail: &str) -> String {
        format!("{}/projects/{}/{}", self.api, self.project, tail)
    }

    fn mr_url(&self, tail: &str) -> String {
        if tail.is_empty() {
            self.project_url(&format!("merge_requests/{}", self.iid))
        } else {
            self.project_url(&format!("merge_requests/{}/{}", self.iid, tail))
        }
    }

    /// Send a request with retries and return the body of a successful response.
    async fn send_text<F>(&self, operation: &str, build: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder,
    {
        debug!(owner = %self.owner, repo = %self.repo, pr = self.iid, operation, "gitlab call");
        retry::with_retry(&self.retry, self.timeout, operation, || {
            let request = build();
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| PrError::PlatformUnavailable(format!("{operation}: {e}")))?;
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(body)
                } else {
                    Err(PrError::from_status(status.as_u16(), operation, &body))
                }
            }
        })
        .await
    }

    async fn send<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let body = self.send_text(operation, build).await?;
        serde_json::from_str(&body)
            .map_err(|e| PrError::Internal(format!("{operation}: unexpected response: {e}")))
    }

    async fn paged<T>(&self, operation: &str, url: &str, extra: &[(&str, &str)]) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut rows = Vec::new();
        let mut page = 1_u32;
        loop {
            let page_str = page.to_string();
            let chunk: Vec<T> = self
                .send(operation, || {
                    self.http
                        .get(url)
                        .query(extra)
                        .query(&[("per_page", "100"), ("page", page_str.as_str())])
                })
                .await?;
            let len = chunk.len();
            rows.extend(chunk);
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }

    async fn merge_request(&self) -> Result<GlMergeRequest> {
        let url = self.mr_url("");
        self.send("get merge request", || self.http.get(&url)).await
    }

    async fn notes(&self) -> Result<Vec<GlNote>> {
        let url = self.mr_url("notes");
        self.paged(
            "list notes",
            &url,
            &[("sort", "asc"), ("order_by", "created_at")],
        )
        .await
    }

    async fn user_id(&self, username: &str) -> Result<Option<u64>> {
        let url = format!("{}/users", self.api);
        let users: Vec<GlUser> = self
            .send("look up user", || self.http.get(&url).query(&[("username", username)]))
            .await?;
        Ok(users.first().map(|u| u.id))
    }

    async fn set_reviewers(&self, ids: Vec<u64>) -> Result<()> {
        let url = self.mr_url("");
        let body = json!({ "reviewer_ids": ids });
        let _: Value = self
            .send("update reviewers", || self.http.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn update_mr(&self, operation: &str, body: Value) -> Result<()> {
        let url = self.mr_url("");
        let _: Value = self
            .send(operation, || self.http.request(Method::PUT, &url).json(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for GitlabClient {
    async fn current_user(&self) -> Result<String> {
        if let Some(login) = self.login.get() {
            return Ok(login.clone());
        }
        let url = format!("{}/user", self.api);
        let me: GlUser = self.send("get authenticated user", || self.http.get(&url)).await?;
        let _ = self.login.set(me.username.clone());
        Ok(me.username)
    }

    async fn get_pr(&self) -> Result<PullRequest> {
        let mr = self.merge_request().await?;
        let merged = mr.state == "merged";
        let merge_commit_sha = mr.merge_commit_sha.or(mr.squash_commit_sha);
        Ok(PullRequest {
            number: mr.iid,
            title: mr.title,
            state: if mr.state == "opened" { PrState::Open } else { PrState::Closed },
            merged,
            draft: mr.draft.or(mr.work_in_progress).unwrap_or(false),
            author: mr.author.username,
            head: GitRef {
                branch: mr.source_branch,
                sha: mr.sha.unwrap_or_default(),
            },
            base: GitRef {
                branch: mr.target_branch,
                sha: mr.diff_refs.and_then(|d| d.base_sha).unwrap_or_default(),
            },
            mergeable: mr.has_conflicts.map(|c| !c),
            merge_commit_sha,
            labels: mr.labels,
            url: mr.web_url,
        })
    }

    async fn post_comment(&self, body: &str) -> Result<String> {
        let url = self.mr_url("notes");
        let payload = json!({ "body": body });
        let note: GlCreatedNote = self
            .send("create note", || self.http.post(&url).json(&payload))
            .await?;
        Ok(format!(
            "{}/{}/{}/-/merge_requests/{}#note_{}",
            self.web_base, self.owner, self.repo, self.iid, note.id
        ))
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        let url = self.mr_url(&format!("notes/{comment_id}"));
        let payload = json!({ "body": body });
        let _: Value = self
            .send("update note", || self.http.put(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn get_comments(&self) -> Result<Vec<Comment>> {
        let base = format!("{}/{}/{}/-/merge_requests/{}", self.web_base, self.owner, self.repo, self.iid);
        let mut comments: Vec<Comment> = self
            .notes()
            .await?
            .into_iter()
            .filter(|n| !n.system)
            .map(|n| Comment {
                url: format!("{base}#note_{}", n.id),
                id: n.id,
                author: n.author.username,
                body: n.body,
                created_at: n.created_at,
            })
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.url.cmp(&b.url)));
        Ok(comments)
    }

    async fn get_reviews(&self) -> Result<Vec<Review>> {
        let base = format!("{}/{}/{}/-/merge_requests/{}", self.web_base, self.owner, self.repo, self.iid);
        let mut reviews: Vec<Review> = self
            .notes()
            .await?
            .into_iter()
            .filter(|n| n.system)
            .filter_map(|n| {
                let state = system_note_review(&n.body)?;
                Some(Review {
                    author: n.author.username,
                    state,
                    body: n.body,
                    submitted_at: n.created_at,
                    url: format!("{base}#note_{}", n.id),
                })
            })
            .collect();
        reviews.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.url.cmp(&b.url)));
        Ok(reviews)
    }

    async fn get_requested_reviewers(&self) -> Result<Vec<String>> {
        let mr = self.merge_request().await?;
        Ok(mr.reviewers.into_iter().map(|u| u.username).collect())
    }

    async fn assign_reviewers(&self, users: &[String]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let mr = self.merge_request().await?;
        let mut ids: Vec<u64> = mr.reviewers.iter().map(|u| u.id).collect();
        for user in users {
            let id = self
                .user_id(user)
                .await?
                .ok_or_else(|| PrError::InvalidInput(format!("unknown user '{user}'")))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.set_reviewers(ids).await
    }

    async fn remove_reviewers(&self, users: &[String]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let mr = self.merge_request().await?;
        let ids: Vec<u64> = mr
            .reviewers
            .iter()
            .filter(|r| !users.iter().any(|u| u.eq_ignore_ascii_case(&r.username)))
            .map(|r| r.id)
            .collect();
        self.set_reviewers(ids).await
    }

    async fn approve_pr(&self, body: &str) -> Result<()> {
        // GitLab approvals carry no message; the system note records the change.
        debug!(body, "approving merge request");
        let url = self.mr_url("approve");
        let _: Value = self.send("approve merge request", || self.http.post(&url)).await?;
        Ok(())
    }

    async fn dismiss_approve(&self, body: &str) -> Result<()> {
        debug!(body, "unapproving merge request");
        let url = self.mr_url("unapprove");
        match self.send_text("unapprove merge request", || self.http.post(&url)).await {
            Ok(_) => Ok(()),
            // Not currently approved by us.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_user_permission(&self, user: &str) -> Result<Permission> {
        let Some(id) = self.user_id(user).await? else {
            return Ok(Permission::None);
        };
        let url = self.project_url(&format!("members/all/{id}"));
        let member: Result<GlMember> = self.send("get member", || self.http.get(&url)).await;
        match member {
            Ok(m) => Ok(Permission::from_gitlab_access_level(m.access_level)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Permission::None),
            Err(e) => Err(e),
        }
    }

    async fn get_labels(&self) -> Result<Vec<String>> {
        Ok(self.merge_request().await?.labels)
    }

    async fn add_labels(&self, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.update_mr("add labels", json!({ "add_labels": labels.join(",") }))
            .await
    }

    async fn remove_labels(&self, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.update_mr("remove labels", json!({ "remove_labels": labels.join(",") }))
            .await
    }

    async fn get_check_runs(&self) -> Result<Vec<CheckRun>> {
        let mr = self.merge_request().await?;
        let Some(sha) = mr.sha else {
            return Ok(vec![]);
        };
        let url = self.project_url(&format!("repository/commits/{sha}/statuses"));
        let statuses: Vec<GlStatus> = self.paged("list commit statuses", &url, &[]).await?;
        Ok(statuses.into_iter().map(status_to_check).collect())
    }

    async fn merge_pr(&self, method: MergeMethod) -> Result<()> {
        if method == MergeMethod::Rebase {
            self.rebase_pr().await?;
        }
        let mr = self.merge_request().await?;
        let url = self.mr_url("merge");
        let mut body = json!({ "squash": method == MergeMethod::Squash });
        if let Some(sha) = mr.sha {
            body["sha"] = json!(sha);
        }
        let _: Value = self
            .send("merge merge request", || self.http.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn rebase_pr(&self) -> Result<()> {
        let url = self.mr_url("rebase");
        let _: Value = self.send("rebase merge request", || self.http.put(&url)).await?;
        Ok(())
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        let url = self.project_url("repository/branches");
        let _: Value = self
            .send("create branch", || {
                self.http.post(&url).query(&[("branch", name), ("ref", base)])
            })
            .await?;
        Ok(())
    }

    async fn get_commits(&self) -> Result<Vec<CommitInfo>> {
        let url = self.mr_url("commits");
        let commits: Vec<GlCommit> = self.paged("list commits", &url, &[]).await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitInfo { sha: c.id, message: c.message })
            .collect())
    }

    async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> Result<CreatedPr> {
        let url = self.project_url("merge_requests");
        let payload = json!({
            "source_branch": head,
            "target_branch": base,
            "title": title,
            "description": body,
        });
        let mr: GlCreatedMr = self
            .send("create merge request", || self.http.post(&url).json(&payload))
            .await?;
        Ok(CreatedPr { number: mr.iid, url: mr.web_url })
    }

    async fn cherry_pick_commit(&self, sha: &str, branch: &str) -> Result<CherryPickOutcome> {
        let url = self.project_url(&format!("repository/commits/{sha}/cherry_pick"));
        let payload = json!({ "branch": branch });
        let picked: Result<GlCommit> = self
            .send("cherry-pick commit", || self.http.post(&url).json(&payload))
            .await;
        match picked {
            Ok(c) => Ok(CherryPickOutcome { sha: c.id, conflict: false }),
            // GitLab answers 400 when the pick does not apply cleanly.
            Err(e) if matches!(e.kind(), ErrorKind::InvalidInput | ErrorKind::Conflict) => {
                debug!(sha, branch, error = %e, "cherry-pick did not apply");
                Ok(CherryPickOutcome { sha: String::new(), conflict: true })
            }
            Err(e) => Err(e),
        }
    }

    fn git_remote_url(&self) -> String {
        let (scheme, host) = self
            .web_base
            .split_once("://")
            .unwrap_or(("https", self.web_base.as_str()));
        format!("{scheme}://oauth2:{}@{host}/{}/{}.git", self.token, self.owner, self.repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_note_mapping() {
        assert_eq!(system_note_review("approved this merge request"), Some(ReviewState::Approved));
        assert_eq!(system_note_review("unapproved this merge request"), Some(ReviewState::Dismissed));
        assert_eq!(system_note_review("requested changes"), Some(ReviewState::ChangesRequested));
        assert_eq!(system_note_review("added 1 commit"), None);
    }

    #[test]
    fn test_status_mapping() {
        let mk = |status: &str| GlStatus {
            name: "build".to_string(),
            status: status.to_string(),
            target_url: None,
        };
        assert!(status_to_check(mk("success")).is_green());
        assert!(status_to_check(mk("skipped")).is_green());
        assert_eq!(status_to_check(mk("pending")).status, CheckStatus::Queued);
        assert_eq!(status_to_check(mk("running")).status, CheckStatus::InProgress);
        assert_eq!(
            status_to_check(mk("manual")).conclusion,
            Some(CheckConclusion::ActionRequired)
        );
        assert_eq!(status_to_check(mk("canceled")).conclusion, Some(CheckConclusion::Cancelled));
    }

    #[test]
    fn test_web_base_strips_api_suffix() {
        assert_eq!(web_base_for("https://gitlab.com/api/v4").unwrap(), "https://gitlab.com");
        assert_eq!(
            web_base_for("https://git.example.com/gitlab/api/v4").unwrap(),
            "https://git.example.com/gitlab"
        );
    }
}
