//! Merge-readiness evaluation.
//!
//! [`evaluate`] is pure over already-fetched data and may run any number of
//! times per invocation. [`MergeMachine`] tracks the `Ready → Merging → Merged`
//! leg, which is the only part that depends on an action having been taken.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::ProcessorConfig;
use crate::error::{PrError, Result};
use crate::lgtm::Ledger;
use crate::model::{CheckRun, CheckStatus, PullRequest, Review, ReviewState};
use crate::platform::all_green;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    Draft,
    AwaitingReview,
    ChangesRequested,
    Ready,
    Merging,
    Merged,
    Closed,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Draft => "Draft",
            GateState::AwaitingReview => "Awaiting-Review",
            GateState::ChangesRequested => "Changes-Requested",
            GateState::Ready => "Ready",
            GateState::Merging => "Merging",
            GateState::Merged => "Merged",
            GateState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub state: GateState,
    pub conditions: Vec<Condition>,
    pub lgtm_count: usize,
    pub threshold: u32,
    pub changes_requested_by: Vec<String>,
}

impl GateReport {
    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    pub fn blocking(&self) -> Vec<&Condition> {
        self.conditions.iter().filter(|c| !c.passed).collect()
    }

    /// One-line explanation of what keeps the PR from merging.
    pub fn blocking_summary(&self) -> String {
        let blocking = self.blocking();
        if blocking.is_empty() {
            return self.state.to_string();
        }
        blocking
            .iter()
            .map(|c| format!("{} ({})", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct GateInputs<'a> {
    pub pr: &'a PullRequest,
    pub ledger: &'a Ledger,
    pub reviews: &'a [Review],
    pub runs: &'a [CheckRun],
    pub config: &'a ProcessorConfig,
}

/// Reviewers whose latest decisive review is `CHANGES_REQUESTED`.
pub fn unresolved_change_requests(reviews: &[Review]) -> Vec<String> {
    let mut ordered: Vec<&Review> = reviews.iter().collect();
    ordered.sort_by(|a, b| {
        a.submitted_at
            .timestamp()
            .cmp(&b.submitted_at.timestamp())
            .then_with(|| a.url.cmp(&b.url))
    });

    let mut latest: HashMap<&str, ReviewState> = HashMap::new();
    for r in ordered {
        if matches!(
            r.state,
            ReviewState::ChangesRequested | ReviewState::Approved | ReviewState::Dismissed
        ) {
            latest.insert(r.author.as_str(), r.state);
        }
    }

    let mut users: Vec<String> = latest
        .into_iter()
        .filter(|(_, s)| *s == ReviewState::ChangesRequested)
        .map(|(u, _)| u.to_string())
        .collect();
    users.sort();
    users
}

fn has_label(labels: &[String], wanted: &str) -> bool {
    labels.iter().any(|l| l.eq_ignore_ascii_case(wanted))
}

fn checks_detail(runs: &[CheckRun], self_check_name: &str) -> String {
    let relevant: Vec<&CheckRun> = runs.iter().filter(|r| r.name != self_check_name).collect();
    if relevant.is_empty() {
        return "no checks".to_string();
    }
    let passing = relevant.iter().filter(|r| r.is_green()).count();
    let pending = relevant
        .iter()
        .filter(|r| r.status != CheckStatus::Completed)
        .count();
    let failing = relevant.len() - passing - pending;
    let mut parts = vec![format!("{passing}/{} passing", relevant.len())];
    if pending > 0 {
        parts.push(format!("{pending} pending"));
    }
    if failing > 0 {
        parts.push(format!("{failing} failing"));
    }
    parts.join(", ")
}

pub fn evaluate(inputs: &GateInputs<'_>) -> GateReport {
    let GateInputs { pr, ledger, reviews, runs, config } = *inputs;
    let changes_requested_by = unresolved_change_requests(reviews);
    let threshold = config.lgtm_threshold;

    let mut conditions = vec![
        Condition {
            name: "Not a draft",
            passed: !pr.draft,
            detail: if pr.draft { "marked as draft" } else { "ready for review" }.to_string(),
        },
        Condition {
            name: "No changes requested",
            passed: changes_requested_by.is_empty(),
            detail: if changes_requested_by.is_empty() {
                "none".to_string()
            } else {
                format!("requested by {}", changes_requested_by.join(", "))
            },
        },
        Condition {
            name: "Approvals",
            passed: ledger.count >= threshold as usize,
            detail: format!("{}/{} approvals", ledger.count, threshold),
        },
        Condition {
            name: "Checks",
            passed: all_green(runs, &config.self_check_name),
            detail: checks_detail(runs, &config.self_check_name),
        },
        Condition {
            name: "No merge conflicts",
            passed: pr.mergeable != Some(false),
            detail: match pr.mergeable {
                Some(false) => "conflicts with base".to_string(),
                Some(true) => "mergeable".to_string(),
                None => "not yet computed".to_string(),
            },
        },
    ];

    if !config.required_labels.is_empty() {
        let missing: Vec<&str> = config
            .required_labels
            .iter()
            .filter(|l| !has_label(&pr.labels, l))
            .map(String::as_str)
            .collect();
        conditions.push(Condition {
            name: "Required labels",
            passed: missing.is_empty(),
            detail: if missing.is_empty() {
                "present".to_string()
            } else {
                format!("missing {}", missing.join(", "))
            },
        });
    }

    if !config.forbidden_labels.is_empty() {
        let present: Vec<&str> = config
            .forbidden_labels
            .iter()
            .filter(|l| has_label(&pr.labels, l))
            .map(String::as_str)
            .collect();
        conditions.push(Condition {
            name: "Forbidden labels",
            passed: present.is_empty(),
            detail: if present.is_empty() {
                "absent".to_string()
            } else {
                format!("remove {}", present.join(", "))
            },
        });
    }

    let state = if pr.merged {
        GateState::Merged
    } else if !pr.is_open() {
        GateState::Closed
    } else if pr.draft {
        GateState::Draft
    } else if !changes_requested_by.is_empty() {
        GateState::ChangesRequested
    } else if conditions.iter().all(|c| c.passed) {
        GateState::Ready
    } else {
        GateState::AwaitingReview
    };

    GateReport {
        state,
        conditions,
        lgtm_count: ledger.count,
        threshold,
        changes_requested_by,
    }
}

/// The merge leg of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMachine {
    state: GateState,
    previous: Option<GateState>,
}

impl MergeMachine {
    pub fn new(state: GateState) -> Self {
        MergeMachine { state, previous: None }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// `Ready → Merging`. Any other starting state is refused.
    pub fn begin_merge(&mut self) -> Result<()> {
        if self.state != GateState::Ready {
            return Err(PrError::InvalidInput(format!(
                "cannot merge from state {}",
                self.state
            )));
        }
        self.previous = Some(self.state);
        self.state = GateState::Merging;
        Ok(())
    }

    pub fn succeed(&mut self) {
        if self.state == GateState::Merging {
            self.state = GateState::Merged;
            self.previous = None;
        }
    }

    /// Return to the state held before `begin_merge`.
    pub fn fail(&mut self) -> GateState {
        if let Some(prev) = self.previous.take() {
            self.state = prev;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lgtm::{Vote, VoteSource, VoteState};
    use crate::model::{CheckConclusion, GitRef, PrState};
    use chrono::{TimeZone, Utc};

    fn pr() -> PullRequest {
        PullRequest {
            number: 7,
            title: "Add feature".to_string(),
            state: PrState::Open,
            merged: false,
            draft: false,
            author: "alice".to_string(),
            head: GitRef { branch: "feature".to_string(), sha: "aaa".to_string() },
            base: GitRef { branch: "main".to_string(), sha: "bbb".to_string() },
            mergeable: Some(true),
            merge_commit_sha: None,
            labels: vec![],
            url: "https://example.test/pr/7".to_string(),
        }
    }

    fn ledger(count: usize) -> Ledger {
        let mut ledger = Ledger::default();
        for i in 0..count {
            ledger.votes.insert(
                format!("user{i}"),
                Vote {
                    state: VoteState::Approve,
                    at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                    url: String::new(),
                    source: VoteSource::Comment,
                },
            );
        }
        ledger.count = count;
        ledger
    }

    fn green() -> Vec<CheckRun> {
        vec![CheckRun {
            name: "ci".to_string(),
            status: CheckStatus::Completed,
            conclusion: Some(CheckConclusion::Success),
            url: String::new(),
        }]
    }

    fn review(author: &str, state: ReviewState, secs: i64) -> Review {
        Review {
            author: author.to_string(),
            state,
            body: String::new(),
            submitted_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            url: format!("https://example.test/r/{secs}"),
        }
    }

    fn eval(pr: &PullRequest, ledger: &Ledger, reviews: &[Review], runs: &[CheckRun], config: &ProcessorConfig) -> GateReport {
        evaluate(&GateInputs { pr, ledger, reviews, runs, config })
    }

    #[test]
    fn test_ready_when_all_conditions_hold() {
        let report = eval(&pr(), &ledger(1), &[], &green(), &ProcessorConfig::default());
        assert_eq!(report.state, GateState::Ready);
        assert!(report.blocking().is_empty());
        let approvals = report.conditions.iter().find(|c| c.name == "Approvals").unwrap();
        assert_eq!(approvals.detail, "1/1 approvals");
    }

    #[test]
    fn test_missing_approval_awaits_review() {
        let report = eval(&pr(), &ledger(0), &[], &green(), &ProcessorConfig::default());
        assert_eq!(report.state, GateState::AwaitingReview);
        assert_eq!(report.blocking().len(), 1);
        assert!(report.blocking_summary().contains("0/1 approvals"));
    }

    #[test]
    fn test_draft_takes_precedence() {
        let mut p = pr();
        p.draft = true;
        let report = eval(&p, &ledger(3), &[], &green(), &ProcessorConfig::default());
        assert_eq!(report.state, GateState::Draft);
    }

    #[test]
    fn test_merged_and_closed() {
        let mut p = pr();
        p.state = PrState::Closed;
        let cfg = ProcessorConfig::default();
        assert_eq!(eval(&p, &ledger(0), &[], &[], &cfg).state, GateState::Closed);
        p.merged = true;
        assert_eq!(eval(&p, &ledger(0), &[], &[], &cfg).state, GateState::Merged);
    }

    #[test]
    fn test_changes_requested_until_superseded() {
        let cfg = ProcessorConfig::default();
        let reviews = vec![review("dan", ReviewState::ChangesRequested, 1)];
        let report = eval(&pr(), &ledger(1), &reviews, &green(), &cfg);
        assert_eq!(report.state, GateState::ChangesRequested);
        assert_eq!(report.changes_requested_by, vec!["dan"]);

        let reviews = vec![
            review("dan", ReviewState::ChangesRequested, 1),
            review("dan", ReviewState::Commented, 2),
        ];
        assert_eq!(eval(&pr(), &ledger(1), &reviews, &green(), &cfg).state, GateState::ChangesRequested);

        let reviews = vec![
            review("dan", ReviewState::Approved, 3),
            review("dan", ReviewState::ChangesRequested, 1),
        ];
        assert_eq!(eval(&pr(), &ledger(1), &reviews, &green(), &cfg).state, GateState::Ready);
    }

    #[test]
    fn test_pending_checks_block() {
        let runs = vec![CheckRun {
            name: "ci".to_string(),
            status: CheckStatus::InProgress,
            conclusion: None,
            url: String::new(),
        }];
        let report = eval(&pr(), &ledger(1), &[], &runs, &ProcessorConfig::default());
        assert_eq!(report.state, GateState::AwaitingReview);
        let checks = report.conditions.iter().find(|c| c.name == "Checks").unwrap();
        assert_eq!(checks.detail, "0/1 passing, 1 pending");
    }

    #[test]
    fn test_conflict_blocks_but_unknown_does_not() {
        let cfg = ProcessorConfig::default();
        let mut p = pr();
        p.mergeable = Some(false);
        assert_eq!(eval(&p, &ledger(1), &[], &green(), &cfg).state, GateState::AwaitingReview);
        p.mergeable = None;
        assert_eq!(eval(&p, &ledger(1), &[], &green(), &cfg).state, GateState::Ready);
    }

    #[test]
    fn test_label_policy() {
        let cfg = ProcessorConfig {
            required_labels: vec!["approved".to_string()],
            forbidden_labels: vec!["do-not-merge".to_string()],
            ..ProcessorConfig::default()
        };
        let mut p = pr();
        assert_eq!(eval(&p, &ledger(1), &[], &green(), &cfg).state, GateState::AwaitingReview);
        p.labels = vec!["Approved".to_string()];
        assert_eq!(eval(&p, &ledger(1), &[], &green(), &cfg).state, GateState::Ready);
        p.labels.push("do-not-merge".to_string());
        let report = eval(&p, &ledger(1), &[], &green(), &cfg);
        assert_eq!(report.state, GateState::AwaitingReview);
        assert!(report.blocking_summary().contains("remove do-not-merge"));
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let cfg = ProcessorConfig::default();
        let (p, l, runs) = (pr(), ledger(1), green());
        assert_eq!(eval(&p, &l, &[], &runs, &cfg), eval(&p, &l, &[], &runs, &cfg));
    }

    // ── merge machine ────────────────────────────────────────────────────────

    #[test]
    fn test_merge_machine_success() {
        let mut m = MergeMachine::new(GateState::Ready);
        m.begin_merge().unwrap();
        assert_eq!(m.state(), GateState::Merging);
        m.succeed();
        assert_eq!(m.state(), GateState::Merged);
    }

    #[test]
    fn test_merge_machine_failure_restores_previous() {
        let mut m = MergeMachine::new(GateState::Ready);
        m.begin_merge().unwrap();
        assert_eq!(m.fail(), GateState::Ready);
    }

    #[test]
    fn test_merge_machine_refuses_unready() {
        let mut m = MergeMachine::new(GateState::AwaitingReview);
        assert!(m.begin_merge().is_err());
        assert_eq!(m.state(), GateState::AwaitingReview);
    }
}
