use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PrError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Github,
    Gitlab,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Github => "github",
            Platform::Gitlab => "gitlab",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Platform::Github),
            "gitlab" => Ok(Platform::Gitlab),
            other => Err(PrError::InvalidInput(format!("unsupported platform '{other}'"))),
        }
    }
}

/// The normalized event that runs the processor once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub platform: Platform,
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
    pub comment_sender: String,
    pub trigger_text: String,
    #[serde(default)]
    pub is_pr_event: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_event_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Trigger {
    pub fn comment(
        platform: Platform,
        owner: &str,
        repo: &str,
        pr_number: u64,
        sender: &str,
        text: &str,
    ) -> Self {
        Trigger {
            platform,
            repo_owner: owner.to_string(),
            repo_name: repo.to_string(),
            pr_number,
            comment_sender: sender.to_string(),
            trigger_text: text.to_string(),
            is_pr_event: false,
            pr_event_action: None,
            event_id: None,
        }
    }

    pub fn pr_event(
        platform: Platform,
        owner: &str,
        repo: &str,
        pr_number: u64,
        sender: &str,
        action: &str,
    ) -> Self {
        Trigger {
            platform,
            repo_owner: owner.to_string(),
            repo_name: repo.to_string(),
            pr_number,
            comment_sender: sender.to_string(),
            trigger_text: String::new(),
            is_pr_event: true,
            pr_event_action: Some(action.to_string()),
            event_id: None,
        }
    }

    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitRef {
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: PrState,
    pub merged: bool,
    pub draft: bool,
    pub author: String,
    pub head: GitRef,
    pub base: GitRef,
    /// `Some(false)` when the platform reports a merge conflict; `None` while unknown.
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub url: String,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == PrState::Open && !self.merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
    pub body: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
}

impl CheckConclusion {
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Success | CheckConclusion::Skipped | CheckConclusion::Neutral
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub conclusion: Option<CheckConclusion>,
    #[serde(default)]
    pub url: String,
}

impl CheckRun {
    pub fn is_green(&self) -> bool {
        self.status == CheckStatus::Completed
            && self.conclusion.map(|c| c.is_passing()).unwrap_or(false)
    }
}

/// Platform-independent permission level; ordering follows privilege.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    None,
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    /// Normalise GitHub's collaborator permission vocabulary.
    pub fn from_github(role: &str) -> Self {
        match role {
            "admin" => Permission::Admin,
            "maintain" | "write" => Permission::Write,
            "triage" | "read" => Permission::Read,
            _ => Permission::None,
        }
    }

    /// Normalise a GitLab member access level.
    pub fn from_gitlab_access_level(level: u32) -> Self {
        match level {
            40.. => Permission::Admin,
            30..=39 => Permission::Write,
            10..=29 => Permission::Read,
            _ => Permission::None,
        }
    }

    /// Every level at or above `self`.
    pub fn and_above(self) -> Vec<Permission> {
        [Permission::Read, Permission::Write, Permission::Admin]
            .into_iter()
            .filter(|p| *p >= self)
            .collect()
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Permission::Admin),
            "write" => Ok(Permission::Write),
            "read" => Ok(Permission::Read),
            "none" => Ok(Permission::None),
            other => Err(PrError::InvalidInput(format!("unknown permission '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMethod {
    type Err = PrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(MergeMethod::Merge),
            "squash" => Ok(MergeMethod::Squash),
            "rebase" => Ok(MergeMethod::Rebase),
            other => Err(PrError::InvalidInput(format!(
                "unknown merge method '{other}' (expected merge, squash or rebase)"
            ))),
        }
    }
}

/// A lexed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Verb including the leading slash, e.g. `/assign`.
    pub verb: String,
    pub raw_args: String,
    pub parsed_args: Vec<String>,
    pub sender: String,
    pub source_comment_url: Option<String>,
}

impl Command {
    /// The command as the user typed it (after canonicalisation).
    pub fn line(&self) -> String {
        if self.raw_args.is_empty() {
            self.verb.clone()
        } else {
            format!("{} {}", self.verb, self.raw_args)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CherryPickRequest {
    pub source_pr_number: u64,
    pub source_merge_sha: String,
    pub target_branch: String,
}

/// A pull request freshly created by the bot (cherry-pick target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPr {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
}
