use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PrError, Result};
use crate::model::{MergeMethod, Permission, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CherryPickMode {
    /// Use the platform's API to apply the commit.
    #[default]
    Native,
    /// Shallow clone, `git cherry-pick -x`, push.
    Git,
}

impl FromStr for CherryPickMode {
    type Err = PrError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "api" => Ok(CherryPickMode::Native),
            "git" | "git-cli" | "cli" => Ok(CherryPickMode::Git),
            other => Err(PrError::InvalidInput(format!("unknown cherry-pick mode '{other}'"))),
        }
    }
}

/// Exponential backoff applied to `RateLimited` platform errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_secs(1),
            factor: 2,
            max_attempts: 5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let mult = self.factor.saturating_pow(exp);
        self.initial.saturating_mul(mult).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub operation: Duration,
    pub invocation: Duration,
    pub cherry_pick: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            operation: Duration::from_secs(30),
            invocation: Duration::from_secs(5 * 60),
            cherry_pick: Duration::from_secs(10 * 60),
        }
    }
}

/// Policy knobs for a single processor invocation.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub lgtm_threshold: u32,
    pub lgtm_permissions: Vec<Permission>,
    pub merge_method: MergeMethod,
    pub self_check_name: String,
    pub robot_accounts: Vec<String>,
    pub denied_users: Vec<String>,
    pub required_labels: Vec<String>,
    pub forbidden_labels: Vec<String>,
    pub auto_merge_on_ready: bool,
    pub cherry_pick_mode: CherryPickMode,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub dry_run: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            lgtm_threshold: 1,
            lgtm_permissions: vec![Permission::Admin, Permission::Write],
            merge_method: MergeMethod::Merge,
            self_check_name: "pr-cli".to_string(),
            robot_accounts: vec![],
            denied_users: vec![],
            required_labels: vec![],
            forbidden_labels: vec![],
            auto_merge_on_ready: false,
            cherry_pick_mode: CherryPickMode::Native,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            dry_run: false,
        }
    }
}

/// Connection settings used to construct a platform client.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub platform: Platform,
    pub token: String,
    pub base_url: Option<String>,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_permissions(raw: &str) -> Result<Vec<Permission>> {
    let perms = parse_list(raw)
        .iter()
        .map(|p| p.parse::<Permission>())
        .collect::<Result<Vec<_>>>()?;
    if perms.is_empty() {
        return Err(PrError::InvalidInput("lgtm permissions must not be empty".to_string()));
    }
    Ok(perms)
}

/// Resolve a platform token: explicit value, then the platform env var, then `gh auth token`.
pub fn resolve_token(platform: Platform, explicit: Option<&str>) -> Result<String> {
    if let Some(tok) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(tok.to_string());
    }

    let var = match platform {
        Platform::Github => "GITHUB_TOKEN",
        Platform::Gitlab => "GITLAB_TOKEN",
    };
    if let Ok(tok) = std::env::var(var) {
        if !tok.trim().is_empty() {
            return Ok(tok.trim().to_string());
        }
    }

    if platform == Platform::Github {
        if let Ok(output) = Command::new("gh").args(["auth", "token"]).output() {
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() && !token.is_empty() {
                return Ok(token);
            }
        }
    }

    Err(PrError::AuthRequired(format!(
        "No {platform} token found. Pass --token or set the {var} environment variable."
    )))
}
