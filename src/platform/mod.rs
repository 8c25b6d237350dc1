//! Uniform capability set over GitHub and GitLab.
//!
//! A client is bound to one repository and one pull/merge request when it is
//! built. Clients are constructed through [`PlatformRegistry`], a name → factory
//! map populated once at process start.

pub mod github;
pub mod gitlab;
pub mod retry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PlatformConfig;
use crate::error::{PrError, Result};
use crate::model::{
    CheckRun, Comment, CommitInfo, CreatedPr, MergeMethod, Permission, PullRequest, Review,
};

/// Result of applying a commit onto a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CherryPickOutcome {
    /// Head of the branch after the pick. On conflict the branch carries a note
    /// commit instead of the picked change.
    pub sha: String,
    pub conflict: bool,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Login of the account the client authenticates as.
    async fn current_user(&self) -> Result<String>;

    async fn get_pr(&self) -> Result<PullRequest>;

    /// Create a comment on the PR and return its URL.
    async fn post_comment(&self, body: &str) -> Result<String>;
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()>;
    async fn get_comments(&self) -> Result<Vec<Comment>>;
    async fn get_reviews(&self) -> Result<Vec<Review>>;

    async fn get_requested_reviewers(&self) -> Result<Vec<String>>;
    async fn assign_reviewers(&self, users: &[String]) -> Result<()>;
    async fn remove_reviewers(&self, users: &[String]) -> Result<()>;

    async fn approve_pr(&self, body: &str) -> Result<()>;
    /// Dismiss the caller's most recent approval, if any.
    async fn dismiss_approve(&self, body: &str) -> Result<()>;

    async fn get_user_permission(&self, user: &str) -> Result<Permission>;

    async fn get_labels(&self) -> Result<Vec<String>>;
    async fn add_labels(&self, labels: &[String]) -> Result<()>;
    async fn remove_labels(&self, labels: &[String]) -> Result<()>;

    async fn get_check_runs(&self) -> Result<Vec<CheckRun>>;

    async fn merge_pr(&self, method: MergeMethod) -> Result<()>;
    async fn rebase_pr(&self) -> Result<()>;

    /// Create `name` pointing at the tip of `base`.
    async fn create_branch(&self, name: &str, base: &str) -> Result<()>;
    async fn get_commits(&self) -> Result<Vec<CommitInfo>>;
    async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> Result<CreatedPr>;
    /// Apply `sha` on top of `branch`.
    async fn cherry_pick_commit(&self, sha: &str, branch: &str) -> Result<CherryPickOutcome>;

    /// Authenticated HTTPS URL for `git clone`.
    fn git_remote_url(&self) -> String;

    /// `(all_green, runs)`, ignoring the processor's own check.
    async fn check_runs_status(&self, self_check_name: &str) -> Result<(bool, Vec<CheckRun>)> {
        let runs = self.get_check_runs().await?;
        Ok((all_green(&runs, self_check_name), runs))
    }
}

/// True iff every run other than `self_check_name` completed with a passing conclusion.
pub fn all_green(runs: &[CheckRun], self_check_name: &str) -> bool {
    runs.iter()
        .filter(|r| r.name != self_check_name)
        .all(CheckRun::is_green)
}

/// Install ring as the process-level rustls provider.
///
/// octocrab and the TLS listener compile in different rustls backends, and with
/// more than one present rustls refuses to pick a default. Must run before any
/// HTTPS client or TLS config is built; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Percent-encode a single URL path segment (`/` included).
pub(crate) fn encode_segment(segment: &str) -> String {
    match url::Url::parse("http://localhost/") {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.clear().push(segment);
            }
            url.path().trim_start_matches('/').to_string()
        }
        Err(_) => segment.to_string(),
    }
}

pub type PlatformFactory =
    Arc<dyn Fn(&PlatformConfig) -> Result<Arc<dyn PlatformClient>> + Send + Sync>;

/// Name → constructor map for platform clients.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    factories: HashMap<String, PlatformFactory>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in GitHub and GitLab clients.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("github", |cfg| {
            Ok(Arc::new(github::GithubClient::new(cfg)?) as Arc<dyn PlatformClient>)
        });
        registry.register("gitlab", |cfg| {
            Ok(Arc::new(gitlab::GitlabClient::new(cfg)?) as Arc<dyn PlatformClient>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PlatformConfig) -> Result<Arc<dyn PlatformClient>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, cfg: &PlatformConfig) -> Result<Arc<dyn PlatformClient>> {
        let name = cfg.platform.as_str();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PrError::InvalidInput(format!("no client registered for platform '{name}'")))?;
        factory(cfg)
    }
}
