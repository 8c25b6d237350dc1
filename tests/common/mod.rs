//! In-memory `PlatformClient` shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use pr_cli::error::{PrError, Result};
use pr_cli::model::{
    CheckConclusion, CheckRun, CheckStatus, Comment, CommitInfo, CreatedPr, GitRef, MergeMethod,
    Permission, PrState, PullRequest, Review, ReviewState,
};
use pr_cli::platform::{CherryPickOutcome, PlatformClient};

pub const BOT: &str = "pr-bot";
pub const MERGE_SHA: &str = "abcdef123456789fedcba";

pub fn open_pr(number: u64, author: &str) -> PullRequest {
    PullRequest {
        number,
        title: "Add retry budget".to_string(),
        state: PrState::Open,
        merged: false,
        draft: false,
        author: author.to_string(),
        head: GitRef { branch: "feature".to_string(), sha: "f00d".to_string() },
        base: GitRef { branch: "main".to_string(), sha: "ba5e".to_string() },
        mergeable: Some(true),
        merge_commit_sha: None,
        labels: vec![],
        url: format!("https://example.test/acme/app/pull/{number}"),
    }
}

#[derive(Debug)]
pub struct State {
    pub pr: PullRequest,
    pub pr_missing: bool,
    pub comments: Vec<Comment>,
    pub reviews: Vec<Review>,
    pub requested: Vec<String>,
    pub permissions: HashMap<String, Permission>,
    pub checks: Vec<CheckRun>,
    pub branches: HashSet<String>,
    pub created_prs: Vec<(String, String, String, String)>,
    pub merges: Vec<MergeMethod>,
    pub merge_conflict: bool,
    pub cherry_pick_conflict: bool,
    pub reviews_unavailable: bool,
    /// Every mutating call, in order.
    pub calls: Vec<String>,
    clock: DateTime<Utc>,
    next_id: u64,
}

pub struct FakePlatform {
    pub state: Mutex<State>,
}

impl FakePlatform {
    pub fn new(pr: PullRequest) -> Self {
        let mut branches = HashSet::new();
        branches.insert(pr.base.branch.clone());
        branches.insert(pr.head.branch.clone());
        FakePlatform {
            state: Mutex::new(State {
                pr,
                pr_missing: false,
                comments: vec![],
                reviews: vec![],
                requested: vec![],
                permissions: HashMap::new(),
                checks: vec![],
                branches,
                created_prs: vec![],
                merges: vec![],
                merge_conflict: false,
                cherry_pick_conflict: false,
                reviews_unavailable: false,
                calls: vec![],
                clock: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
                next_id: 1,
            }),
        }
    }

    pub fn with(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    /// Mutate state between invocations.
    pub fn update(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn permission(self, user: &str, perm: Permission) -> Self {
        self.with(|s| {
            s.permissions.insert(user.to_string(), perm);
        })
    }

    /// Append a user comment one minute after the previous event.
    pub fn comment(self, author: &str, body: &str) -> Self {
        self.with(|s| s.push_comment(author, body))
    }

    pub fn review(self, author: &str, state: ReviewState) -> Self {
        self.with(|s| s.push_review(author, state))
    }

    pub fn check(self, name: &str, status: CheckStatus, conclusion: Option<CheckConclusion>) -> Self {
        self.with(|s| {
            s.checks.push(CheckRun {
                name: name.to_string(),
                status,
                conclusion,
                url: String::new(),
            })
        })
    }

    pub fn snapshot(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn bot_comments(&self) -> Vec<Comment> {
        self.snapshot()
            .comments
            .iter()
            .filter(|c| c.author == BOT)
            .cloned()
            .collect()
    }
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::minutes(1);
        self.clock
    }

    pub fn push_comment(&mut self, author: &str, body: &str) {
        let at = self.tick();
        let id = self.next_id;
        self.next_id += 1;
        self.comments.push(Comment {
            id,
            author: author.to_string(),
            body: body.to_string(),
            created_at: at,
            url: format!("https://example.test/acme/app/pull/{}#issuecomment-{id}", self.pr.number),
        });
    }

    pub fn push_review(&mut self, author: &str, state: ReviewState) {
        let at = self.tick();
        let id = self.next_id;
        self.next_id += 1;
        self.reviews.push(Review {
            author: author.to_string(),
            state,
            body: String::new(),
            submitted_at: at,
            url: format!("https://example.test/acme/app/pull/{}#pullrequestreview-{id}", self.pr.number),
        });
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn current_user(&self) -> Result<String> {
        Ok(BOT.to_string())
    }

    async fn get_pr(&self) -> Result<PullRequest> {
        let s = self.snapshot();
        if s.pr_missing {
            return Err(PrError::NotFound(format!("pull request #{} not found", s.pr.number)));
        }
        Ok(s.pr.clone())
    }

    async fn post_comment(&self, body: &str) -> Result<String> {
        let mut s = self.snapshot();
        s.calls.push("post_comment".to_string());
        s.push_comment(BOT, body);
        Ok(s.comments.last().map(|c| c.url.clone()).unwrap_or_default())
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("update_comment {comment_id}"));
        match s.comments.iter_mut().find(|c| c.id == comment_id) {
            Some(c) => {
                c.body = body.to_string();
                Ok(())
            }
            None => Err(PrError::NotFound(format!("comment {comment_id}"))),
        }
    }

    async fn get_comments(&self) -> Result<Vec<Comment>> {
        Ok(self.snapshot().comments.clone())
    }

    async fn get_reviews(&self) -> Result<Vec<Review>> {
        let s = self.snapshot();
        if s.reviews_unavailable {
            return Err(PrError::PlatformUnavailable("reviews endpoint returned 503".to_string()));
        }
        Ok(s.reviews.clone())
    }

    async fn get_requested_reviewers(&self) -> Result<Vec<String>> {
        Ok(self.snapshot().requested.clone())
    }

    async fn assign_reviewers(&self, users: &[String]) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("assign_reviewers {}", users.join(",")));
        for u in users {
            if !s.requested.contains(u) {
                s.requested.push(u.clone());
            }
        }
        Ok(())
    }

    async fn remove_reviewers(&self, users: &[String]) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("remove_reviewers {}", users.join(",")));
        s.requested.retain(|r| !users.contains(r));
        Ok(())
    }

    async fn approve_pr(&self, _body: &str) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push("approve_pr".to_string());
        s.push_review(BOT, ReviewState::Approved);
        Ok(())
    }

    async fn dismiss_approve(&self, _body: &str) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push("dismiss_approve".to_string());
        if let Some(r) = s
            .reviews
            .iter_mut()
            .rev()
            .find(|r| r.author == BOT && r.state == ReviewState::Approved)
        {
            r.state = ReviewState::Dismissed;
        }
        Ok(())
    }

    async fn get_user_permission(&self, user: &str) -> Result<Permission> {
        Ok(self.snapshot().permissions.get(user).copied().unwrap_or(Permission::None))
    }

    async fn get_labels(&self) -> Result<Vec<String>> {
        Ok(self.snapshot().pr.labels.clone())
    }

    async fn add_labels(&self, labels: &[String]) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("add_labels {}", labels.join(",")));
        for l in labels {
            if !s.pr.labels.contains(l) {
                s.pr.labels.push(l.clone());
            }
        }
        Ok(())
    }

    async fn remove_labels(&self, labels: &[String]) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("remove_labels {}", labels.join(",")));
        s.pr.labels.retain(|l| !labels.contains(l));
        Ok(())
    }

    async fn get_check_runs(&self) -> Result<Vec<CheckRun>> {
        Ok(self.snapshot().checks.clone())
    }

    async fn merge_pr(&self, method: MergeMethod) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("merge_pr {method}"));
        if s.merge_conflict {
            return Err(PrError::Conflict("Pull Request is not mergeable".to_string()));
        }
        s.merges.push(method);
        s.pr.merged = true;
        s.pr.state = PrState::Closed;
        s.pr.merge_commit_sha = Some(MERGE_SHA.to_string());
        Ok(())
    }

    async fn rebase_pr(&self) -> Result<()> {
        self.snapshot().calls.push("rebase_pr".to_string());
        Ok(())
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        let mut s = self.snapshot();
        s.calls.push(format!("create_branch {name} {base}"));
        if !s.branches.contains(base) {
            return Err(PrError::NotFound(format!("branch {base}")));
        }
        if !s.branches.insert(name.to_string()) {
            return Err(PrError::Conflict("Reference already exists".to_string()));
        }
        Ok(())
    }

    async fn get_commits(&self) -> Result<Vec<CommitInfo>> {
        Ok(vec![CommitInfo { sha: "f00d".to_string(), message: "work".to_string() }])
    }

    async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> Result<CreatedPr> {
        let mut s = self.snapshot();
        s.calls.push(format!("create_pr {head} {base}"));
        s.created_prs
            .push((title.to_string(), body.to_string(), head.to_string(), base.to_string()));
        let number = 1000 + s.created_prs.len() as u64;
        Ok(CreatedPr {
            number,
            url: format!("https://example.test/acme/app/pull/{number}"),
        })
    }

    async fn cherry_pick_commit(&self, sha: &str, branch: &str) -> Result<CherryPickOutcome> {
        let mut s = self.snapshot();
        s.calls.push(format!("cherry_pick_commit {sha} {branch}"));
        Ok(CherryPickOutcome {
            sha: format!("picked-{}", &sha[..7.min(sha.len())]),
            conflict: s.cherry_pick_conflict,
        })
    }

    fn git_remote_url(&self) -> String {
        "https://example.test/acme/app.git".to_string()
    }
}
