//! Approval accounting.
//!
//! The ledger is rebuilt from the full comment and review timeline on every
//! call. A user's latest event wins; events are ordered by timestamp seconds
//! with the comment/review URL as tie-break, so the input order never matters.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::model::{Comment, Permission, Review, ReviewState};

static VOTE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*/(lgtm|remove-lgtm)(?:[ \t]+([^\r\n]*?))?[ \t]*\r?$")
        .expect("vote pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteState {
    Approve,
    Remove,
}

impl VoteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteState::Approve => "approve",
            VoteState::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteSource {
    Comment,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vote {
    pub state: VoteState,
    pub at: DateTime<Utc>,
    pub url: String,
    pub source: VoteSource,
}

/// Latest vote per user and the number of users currently approving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    pub votes: BTreeMap<String, Vote>,
    pub count: usize,
}

impl Ledger {
    pub fn approvers(&self) -> Vec<&str> {
        self.votes
            .iter()
            .filter(|(_, v)| v.state == VoteState::Approve)
            .map(|(u, _)| u.as_str())
            .collect()
    }
}

/// Who may vote and which events to disregard.
#[derive(Debug, Clone, Copy)]
pub struct LgtmPolicy<'a> {
    pub required: &'a [Permission],
    pub pr_author: &'a str,
    /// Accounts whose events never count (the bot itself).
    pub excluded: &'a [String],
    /// Drop this user's most recent `remove` event before tallying.
    pub ignore_user_remove: Option<&'a str>,
}

/// The vote expressed by a comment body, if any. The last vote line wins.
pub fn comment_vote(body: &str) -> Option<VoteState> {
    VOTE_LINE.captures_iter(body).last().map(|caps| {
        let verb = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let arg = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if verb.eq_ignore_ascii_case("remove-lgtm") || arg.eq_ignore_ascii_case("cancel") {
            VoteState::Remove
        } else {
            VoteState::Approve
        }
    })
}

fn review_vote(state: ReviewState) -> Option<VoteState> {
    match state {
        ReviewState::Approved => Some(VoteState::Approve),
        ReviewState::Dismissed => Some(VoteState::Remove),
        _ => None,
    }
}

struct Event {
    user: String,
    vote: Vote,
}

fn timeline(comments: &[Comment], reviews: &[Review]) -> Vec<Event> {
    let mut events: Vec<Event> = comments
        .iter()
        .filter_map(|c| {
            comment_vote(&c.body).map(|state| Event {
                user: c.author.clone(),
                vote: Vote {
                    state,
                    at: c.created_at,
                    url: c.url.clone(),
                    source: VoteSource::Comment,
                },
            })
        })
        .chain(reviews.iter().filter_map(|r| {
            review_vote(r.state).map(|state| Event {
                user: r.author.clone(),
                vote: Vote {
                    state,
                    at: r.submitted_at,
                    url: r.url.clone(),
                    source: VoteSource::Review,
                },
            })
        }))
        .collect();

    events.sort_by(|a, b| {
        a.vote
            .at
            .timestamp()
            .cmp(&b.vote.at.timestamp())
            .then_with(|| a.vote.url.cmp(&b.vote.url))
    });
    events
}

/// Authors of every comment or review that carries a vote.
pub fn voters(comments: &[Comment], reviews: &[Review]) -> Vec<String> {
    let mut users: Vec<String> = timeline(comments, reviews).into_iter().map(|e| e.user).collect();
    users.sort();
    users.dedup();
    users
}

/// Rebuild the ledger. `permissions` must hold the live level of every voter;
/// a missing entry counts as `none`.
pub fn compute(
    comments: &[Comment],
    reviews: &[Review],
    permissions: &HashMap<String, Permission>,
    policy: &LgtmPolicy<'_>,
) -> Ledger {
    let mut events: Vec<Event> = timeline(comments, reviews)
        .into_iter()
        .filter(|e| !e.user.eq_ignore_ascii_case(policy.pr_author))
        .filter(|e| !policy.excluded.iter().any(|x| x.eq_ignore_ascii_case(&e.user)))
        .filter(|e| {
            let level = permissions.get(&e.user).copied().unwrap_or(Permission::None);
            policy.required.contains(&level)
        })
        .collect();

    if let Some(user) = policy.ignore_user_remove {
        if let Some(idx) = events
            .iter()
            .rposition(|e| e.user == user && e.vote.state == VoteState::Remove)
        {
            events.remove(idx);
        }
    }

    let mut votes = BTreeMap::new();
    for event in events {
        votes.insert(event.user, event.vote);
    }
    let count = votes.values().filter(|v| v.state == VoteState::Approve).count();
    Ledger { votes, count }
}
