//! Platform webhook payloads → [`Trigger`]s.
//!
//! Only the fields the processor needs are modelled; everything else in the
//! delivery is ignored by serde.

use serde::Deserialize;

use crate::model::{Platform, Trigger};

/// Action used for CI-completion triggers on both platforms.
pub const CHECK_COMPLETED: &str = "check_completed";

/// Which PR lifecycle events produce triggers.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub pr_event_enabled: bool,
    pub pr_event_actions: Vec<String>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            pr_event_enabled: true,
            pr_event_actions: ["opened", "synchronize", "reopened", "ready_for_review", "edited"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl EventFilter {
    fn wants(&self, action: &str) -> bool {
        self.pr_event_enabled && self.pr_event_actions.iter().any(|a| a == action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Triggers(Vec<Trigger>),
    Ignored(String),
}

fn ignored(reason: impl Into<String>) -> Parsed {
    Parsed::Ignored(reason.into())
}

// ── GitHub ──

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    name: String,
    owner: GhUser,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    body: String,
    user: GhUser,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct GhPullRef {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct GhSuite {
    #[serde(default)]
    pull_requests: Vec<GhPullRef>,
}

#[derive(Debug, Deserialize)]
struct GhPayload {
    #[serde(default)]
    action: Option<String>,
    repository: Option<GhRepo>,
    sender: Option<GhUser>,
    issue: Option<GhIssue>,
    comment: Option<GhComment>,
    pull_request: Option<GhPull>,
    check_suite: Option<GhSuite>,
    workflow_run: Option<GhSuite>,
}

/// Translate a GitHub delivery of type `event` (the `X-GitHub-Event` header).
pub fn parse_github(event: &str, body: &[u8], filter: &EventFilter) -> serde_json::Result<Parsed> {
    let payload: GhPayload = serde_json::from_slice(body)?;
    let Some(repo) = payload.repository.as_ref() else {
        return Ok(ignored("no repository in payload"));
    };
    let owner = repo.owner.login.as_str();
    let name = repo.name.as_str();
    let action = payload.action.as_deref().unwrap_or_default();
    let sender = payload.sender.as_ref().map(|s| s.login.as_str()).unwrap_or_default();

    let parsed = match event {
        "issue_comment" => {
            if action != "created" {
                return Ok(ignored(format!("issue_comment {action}")));
            }
            match (&payload.issue, &payload.comment) {
                (Some(issue), Some(comment)) if issue.pull_request.is_some() => {
                    Parsed::Triggers(vec![Trigger::comment(
                        Platform::Github,
                        owner,
                        name,
                        issue.number,
                        &comment.user.login,
                        &comment.body,
                    )])
                }
                _ => ignored("comment is not on a pull request"),
            }
        }
        "pull_request" => {
            let Some(pr) = &payload.pull_request else {
                return Ok(ignored("no pull_request in payload"));
            };
            let merged_close = action == "closed" && pr.merged;
            if merged_close || filter.wants(action) {
                Parsed::Triggers(vec![Trigger::pr_event(
                    Platform::Github,
                    owner,
                    name,
                    pr.number,
                    sender,
                    action,
                )])
            } else {
                ignored(format!("pull_request {action}"))
            }
        }
        "check_suite" | "workflow_run" => {
            if action != "completed" {
                return Ok(ignored(format!("{event} {action}")));
            }
            let suite = if event == "check_suite" {
                &payload.check_suite
            } else {
                &payload.workflow_run
            };
            let prs: Vec<u64> = suite
                .as_ref()
                .map(|s| s.pull_requests.iter().map(|p| p.number).collect())
                .unwrap_or_default();
            if prs.is_empty() {
                ignored(format!("{event} not attached to a pull request"))
            } else {
                Parsed::Triggers(
                    prs.into_iter()
                        .map(|n| {
                            Trigger::pr_event(Platform::Github, owner, name, n, sender, CHECK_COMPLETED)
                        })
                        .collect(),
                )
            }
        }
        other => ignored(format!("event {other}")),
    };
    Ok(parsed)
}

// ── GitLab ──

#[derive(Debug, Deserialize)]
struct GlUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    path_with_namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct GlAttributes {
    #[serde(default)]
    noteable_type: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    iid: Option<u64>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    oldrev: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequestRef {
    iid: u64,
}

#[derive(Debug, Deserialize)]
struct GlPayload {
    object_kind: String,
    user: Option<GlUser>,
    project: Option<GlProject>,
    #[serde(default)]
    object_attributes: GlAttributes,
    merge_request: Option<GlMergeRequestRef>,
}

/// `group/sub/project` → (`group/sub`, `project`).
fn split_project_path(path: &str) -> Option<(&str, &str)> {
    let (owner, name) = path.rsplit_once('/')?;
    (!owner.is_empty() && !name.is_empty()).then_some((owner, name))
}

/// GitLab merge request actions in the GitHub vocabulary the processor uses.
fn gitlab_action(attrs: &GlAttributes) -> Option<&'static str> {
    match attrs.action.as_deref()? {
        "open" => Some("opened"),
        "reopen" => Some("reopened"),
        "update" if attrs.oldrev.as_deref().is_some_and(|r| !r.is_empty()) => Some("synchronize"),
        "update" => Some("edited"),
        "merge" => Some("closed"),
        "close" => Some("closed"),
        _ => None,
    }
}

/// Translate a GitLab delivery. The hook kind comes from `object_kind`.
pub fn parse_gitlab(body: &[u8], filter: &EventFilter) -> serde_json::Result<Parsed> {
    let payload: GlPayload = serde_json::from_slice(body)?;
    let Some((owner, name)) = payload
        .project
        .as_ref()
        .and_then(|p| split_project_path(&p.path_with_namespace))
    else {
        return Ok(ignored("no project in payload"));
    };
    let sender = payload.user.as_ref().map(|u| u.username.as_str()).unwrap_or_default();
    let attrs = &payload.object_attributes;

    let parsed = match payload.object_kind.as_str() {
        "note" => match (attrs.noteable_type.as_deref(), &payload.merge_request) {
            (Some("MergeRequest"), Some(mr)) => Parsed::Triggers(vec![Trigger::comment(
                Platform::Gitlab,
                owner,
                name,
                mr.iid,
                sender,
                attrs.note.as_deref().unwrap_or_default(),
            )]),
            _ => ignored("note is not on a merge request"),
        },
        "merge_request" => {
            let Some(iid) = attrs.iid else {
                return Ok(ignored("merge request without iid"));
            };
            let raw = attrs.action.as_deref().unwrap_or_default();
            match gitlab_action(attrs) {
                // Only a real merge counts as the merged close.
                Some("closed") if raw == "merge" => Parsed::Triggers(vec![Trigger::pr_event(
                    Platform::Gitlab,
                    owner,
                    name,
                    iid,
                    sender,
                    "closed",
                )]),
                Some(action) if filter.wants(action) => Parsed::Triggers(vec![Trigger::pr_event(
                    Platform::Gitlab,
                    owner,
                    name,
                    iid,
                    sender,
                    action,
                )]),
                _ => ignored(format!("merge_request {raw}")),
            }
        }
        "pipeline" => {
            let status = attrs.status.as_deref().unwrap_or_default();
            match (&payload.merge_request, status) {
                (Some(mr), "success" | "failed") => Parsed::Triggers(vec![Trigger::pr_event(
                    Platform::Gitlab,
                    owner,
                    name,
                    mr.iid,
                    sender,
                    CHECK_COMPLETED,
                )]),
                (None, _) => ignored("pipeline not attached to a merge request"),
                _ => ignored(format!("pipeline {status}")),
            }
        }
        other => ignored(format!("event {other}")),
    };
    Ok(parsed)
}

/// True if `owner/repo` matches an `ALLOWED_REPOS` entry (`owner/repo` or
/// `owner/*`). An empty list allows everything.
pub fn repo_allowed(allowed: &[String], owner: &str, repo: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let full = format!("{owner}/{repo}");
    allowed.iter().any(|entry| match entry.strip_suffix("/*") {
        Some(prefix) => prefix.eq_ignore_ascii_case(owner),
        None => entry.eq_ignore_ascii_case(&full),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn triggers(parsed: Parsed) -> Vec<Trigger> {
        match parsed {
            Parsed::Triggers(t) => t,
            Parsed::Ignored(reason) => panic!("unexpectedly ignored: {reason}"),
        }
    }

    fn bytes(v: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    fn gh_repo() -> serde_json::Value {
        json!({ "name": "app", "owner": { "login": "acme" } })
    }

    // ── GitHub ──

    #[test]
    fn test_github_pr_comment() {
        let body = bytes(json!({
            "action": "created",
            "repository": gh_repo(),
            "sender": { "login": "bob" },
            "issue": { "number": 7, "pull_request": { "url": "x" } },
            "comment": { "body": "/lgtm", "user": { "login": "bob" } }
        }));
        let t = triggers(parse_github("issue_comment", &body, &EventFilter::default()).unwrap());
        assert_eq!(t.len(), 1);
        assert_eq!(t[0], Trigger::comment(Platform::Github, "acme", "app", 7, "bob", "/lgtm"));
    }

    #[test]
    fn test_github_issue_comment_ignored() {
        let body = bytes(json!({
            "action": "created",
            "repository": gh_repo(),
            "issue": { "number": 7 },
            "comment": { "body": "/lgtm", "user": { "login": "bob" } }
        }));
        let parsed = parse_github("issue_comment", &body, &EventFilter::default()).unwrap();
        assert!(matches!(parsed, Parsed::Ignored(_)));
    }

    #[test]
    fn test_github_pull_request_actions() {
        let event = |action: &str, merged: bool| {
            bytes(json!({
                "action": action,
                "repository": gh_repo(),
                "sender": { "login": "alice" },
                "pull_request": { "number": 3, "merged": merged }
            }))
        };
        let filter = EventFilter::default();

        let t = triggers(parse_github("pull_request", &event("opened", false), &filter).unwrap());
        assert_eq!(t[0].pr_event_action.as_deref(), Some("opened"));
        assert!(t[0].is_pr_event);

        let t = triggers(parse_github("pull_request", &event("closed", true), &filter).unwrap());
        assert_eq!(t[0].pr_event_action.as_deref(), Some("closed"));

        let parsed = parse_github("pull_request", &event("closed", false), &filter).unwrap();
        assert!(matches!(parsed, Parsed::Ignored(_)));
        let parsed = parse_github("pull_request", &event("labeled", false), &filter).unwrap();
        assert!(matches!(parsed, Parsed::Ignored(_)));
    }

    #[test]
    fn test_merged_close_survives_disabled_pr_events() {
        let filter = EventFilter { pr_event_enabled: false, ..Default::default() };
        let body = bytes(json!({
            "action": "closed",
            "repository": gh_repo(),
            "pull_request": { "number": 3, "merged": true }
        }));
        assert_eq!(triggers(parse_github("pull_request", &body, &filter).unwrap()).len(), 1);
        let body = bytes(json!({
            "action": "opened",
            "repository": gh_repo(),
            "pull_request": { "number": 3 }
        }));
        assert!(matches!(
            parse_github("pull_request", &body, &filter).unwrap(),
            Parsed::Ignored(_)
        ));
    }

    #[test]
    fn test_github_check_suite_fans_out_per_pr() {
        let body = bytes(json!({
            "action": "completed",
            "repository": gh_repo(),
            "sender": { "login": "ci" },
            "check_suite": { "pull_requests": [ { "number": 1 }, { "number": 2 } ] }
        }));
        let t = triggers(parse_github("check_suite", &body, &EventFilter::default()).unwrap());
        assert_eq!(t.iter().map(|t| t.pr_number).collect::<Vec<_>>(), vec![1, 2]);
        assert!(t.iter().all(|t| t.pr_event_action.as_deref() == Some(CHECK_COMPLETED)));
    }

    #[test]
    fn test_github_unknown_event_ignored() {
        let body = bytes(json!({ "repository": gh_repo() }));
        let parsed = parse_github("star", &body, &EventFilter::default()).unwrap();
        assert_eq!(parsed, Parsed::Ignored("event star".to_string()));
    }

    #[test]
    fn test_github_malformed_body_is_an_error() {
        assert!(parse_github("issue_comment", b"not json", &EventFilter::default()).is_err());
    }

    // ── GitLab ──

    fn gl_base(kind: &str) -> serde_json::Value {
        json!({
            "object_kind": kind,
            "user": { "username": "bob" },
            "project": { "path_with_namespace": "group/sub/app" }
        })
    }

    #[test]
    fn test_gitlab_note_on_merge_request() {
        let mut v = gl_base("note");
        v["object_attributes"] = json!({ "noteable_type": "MergeRequest", "note": "/lgtm" });
        v["merge_request"] = json!({ "iid": 12 });
        let t = triggers(parse_gitlab(&bytes(v), &EventFilter::default()).unwrap());
        assert_eq!(t[0], Trigger::comment(Platform::Gitlab, "group/sub", "app", 12, "bob", "/lgtm"));
    }

    #[test]
    fn test_gitlab_note_on_issue_ignored() {
        let mut v = gl_base("note");
        v["object_attributes"] = json!({ "noteable_type": "Issue", "note": "/lgtm" });
        assert!(matches!(
            parse_gitlab(&bytes(v), &EventFilter::default()).unwrap(),
            Parsed::Ignored(_)
        ));
    }

    #[test]
    fn test_gitlab_merge_request_action_mapping() {
        let case = |action: &str, oldrev: Option<&str>| {
            let mut v = gl_base("merge_request");
            v["object_attributes"] = json!({ "iid": 4, "action": action, "oldrev": oldrev });
            parse_gitlab(&bytes(v), &EventFilter::default()).unwrap()
        };
        let action_of = |p: Parsed| triggers(p)[0].pr_event_action.clone().unwrap();

        assert_eq!(action_of(case("open", None)), "opened");
        assert_eq!(action_of(case("reopen", None)), "reopened");
        assert_eq!(action_of(case("update", Some("abc123"))), "synchronize");
        assert_eq!(action_of(case("update", None)), "edited");
        assert_eq!(action_of(case("merge", None)), "closed");
        assert!(matches!(case("close", None), Parsed::Ignored(_)));
        assert!(matches!(case("approved", None), Parsed::Ignored(_)));
    }

    #[test]
    fn test_gitlab_pipeline() {
        let pipeline = |status: &str| {
            let mut v = gl_base("pipeline");
            v["object_attributes"] = json!({ "status": status });
            v["merge_request"] = json!({ "iid": 9 });
            parse_gitlab(&bytes(v), &EventFilter::default()).unwrap()
        };
        let t = triggers(pipeline("success"));
        assert_eq!(t[0].pr_event_action.as_deref(), Some(CHECK_COMPLETED));
        assert_eq!(t[0].pr_number, 9);
        assert_eq!(triggers(pipeline("failed")).len(), 1);
        assert!(matches!(pipeline("running"), Parsed::Ignored(_)));
    }

    #[test]
    fn test_repo_allowlist() {
        let allowed = vec!["acme/app".to_string(), "tools/*".to_string()];
        assert!(repo_allowed(&allowed, "acme", "app"));
        assert!(repo_allowed(&allowed, "ACME", "App"));
        assert!(repo_allowed(&allowed, "tools", "anything"));
        assert!(!repo_allowed(&allowed, "acme", "other"));
        assert!(!repo_allowed(&allowed, "toolsmith", "x"));
        assert!(repo_allowed(&[], "any", "repo"));
    }
}
