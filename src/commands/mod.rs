//! Command registry and dispatcher.
//!
//! Every verb has an entry in [`COMMANDS`] carrying its permission requirement,
//! argument arity, and whether it is still allowed once the PR has merged.
//! Handlers live in one file per verb family and share a [`Context`].

pub mod cherrypick;
pub mod info;
pub mod labels;
pub mod lgtm;
pub mod merge;
pub mod reviewers;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ProcessorConfig;
use crate::error::{ErrorKind, PrError, Result};
use crate::gate::{self, GateInputs, GateReport};
use crate::lexer::Lexed;
use crate::lgtm::{self as ledger, Ledger, LgtmPolicy, VoteState};
use crate::model::{CheckRun, Command, Comment, Permission, PullRequest, Review, ReviewState};
use crate::permission::PermissionResolver;
use crate::platform::PlatformClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Anyone,
    Read,
    Write,
    /// The configured `lgtm_permissions`.
    Lgtm,
}

impl Requirement {
    fn levels(self, config: &ProcessorConfig) -> Vec<Permission> {
        match self {
            Requirement::Anyone => vec![],
            Requirement::Read => Permission::Read.and_above(),
            Requirement::Write => Permission::Write.and_above(),
            Requirement::Lgtm => config.lgtm_permissions.clone(),
        }
    }

    fn describe(self, config: &ProcessorConfig) -> String {
        match self {
            Requirement::Anyone => "no".to_string(),
            Requirement::Read => "read".to_string(),
            Requirement::Write => "write".to_string(),
            Requirement::Lgtm => config
                .lgtm_permissions
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandEntry {
    pub verb: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub help: &'static str,
    pub requirement: Requirement,
    pub args: Arity,
    /// Changes platform state; preceded by a fresh PR fetch.
    pub mutating: bool,
    pub allowed_after_merge: bool,
}

pub static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        verb: "/lgtm",
        aliases: &[],
        usage: "/lgtm",
        help: "Approve the PR. `/lgtm cancel` withdraws the approval.",
        requirement: Requirement::Lgtm,
        args: Arity::None,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/remove-lgtm",
        aliases: &[],
        usage: "/remove-lgtm",
        help: "Withdraw your approval.",
        requirement: Requirement::Lgtm,
        args: Arity::None,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/assign",
        aliases: &[],
        usage: "/assign @user [@user...]",
        help: "Request reviews.",
        requirement: Requirement::Write,
        args: Arity::Required,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/unassign",
        aliases: &[],
        usage: "/unassign @user [@user...]",
        help: "Remove requested reviewers.",
        requirement: Requirement::Write,
        args: Arity::Required,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/label",
        aliases: &[],
        usage: "/label name [name...]",
        help: "Add labels.",
        requirement: Requirement::Write,
        args: Arity::Required,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/remove-label",
        aliases: &["/unlabel"],
        usage: "/remove-label name [name...]",
        help: "Remove labels.",
        requirement: Requirement::Write,
        args: Arity::Required,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/ready",
        aliases: &[],
        usage: "/ready",
        help: "Re-evaluate merge readiness.",
        requirement: Requirement::Write,
        args: Arity::None,
        mutating: false,
        allowed_after_merge: true,
    },
    CommandEntry {
        verb: "/rebase",
        aliases: &[],
        usage: "/rebase",
        help: "Update the PR branch from its base.",
        requirement: Requirement::Write,
        args: Arity::None,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/merge",
        aliases: &[],
        usage: "/merge [merge|squash|rebase]",
        help: "Merge once every gate passes.",
        requirement: Requirement::Write,
        args: Arity::Optional,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/squash",
        aliases: &[],
        usage: "/squash",
        help: "Squash-merge once every gate passes.",
        requirement: Requirement::Write,
        args: Arity::None,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/rebase-merge",
        aliases: &[],
        usage: "/rebase-merge",
        help: "Rebase-merge once every gate passes.",
        requirement: Requirement::Write,
        args: Arity::None,
        mutating: true,
        allowed_after_merge: false,
    },
    CommandEntry {
        verb: "/cherrypick",
        aliases: &["/cherry-pick"],
        usage: "/cherrypick branch [branch...]",
        help: "Cherry-pick the merged PR onto other branches (queued until merge).",
        requirement: Requirement::Write,
        args: Arity::Required,
        mutating: true,
        allowed_after_merge: true,
    },
    CommandEntry {
        verb: "/check",
        aliases: &[],
        usage: "/check",
        help: "Show the current gate status.",
        requirement: Requirement::Read,
        args: Arity::None,
        mutating: false,
        allowed_after_merge: true,
    },
    CommandEntry {
        verb: "/help",
        aliases: &[],
        usage: "/help",
        help: "List available commands.",
        requirement: Requirement::Anyone,
        args: Arity::None,
        mutating: false,
        allowed_after_merge: true,
    },
];

pub fn lookup(verb: &str) -> Option<&'static CommandEntry> {
    let verb = verb.to_ascii_lowercase();
    COMMANDS
        .iter()
        .find(|entry| entry.verb == verb || entry.aliases.contains(&verb.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Rejected,
    Failed,
    Skipped,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Ok => "ok",
            CommandStatus::Rejected => "rejected",
            CommandStatus::Failed => "failed",
            CommandStatus::Skipped => "skipped",
        }
    }
}

/// What a handler reports back for the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: CommandStatus,
    pub message: String,
}

impl Reply {
    pub fn done(message: impl Into<String>) -> Self {
        Reply { status: CommandStatus::Ok, message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Reply { status: CommandStatus::Rejected, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Reply { status: CommandStatus::Failed, message: message.into() }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Reply { status: CommandStatus::Skipped, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub verb: String,
    /// The line as typed.
    pub line: String,
    pub status: CommandStatus,
    pub message: String,
}

/// Comments, reviews, and the ledger derived from them.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub comments: Vec<Comment>,
    pub reviews: Vec<Review>,
    pub ledger: Ledger,
}

/// A full gate evaluation over freshly fetched data.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub report: GateReport,
    pub ledger: Ledger,
    pub comments: Vec<Comment>,
    pub runs: Vec<CheckRun>,
}

/// Shared state for one invocation.
pub struct Context<'a> {
    pub client: &'a dyn PlatformClient,
    pub config: &'a ProcessorConfig,
    /// Login of the account the processor acts as.
    pub bot: String,
    pub pr: PullRequest,
    /// Set once a command in this invocation merged the PR.
    pub merged_now: bool,
    cast_votes: Vec<(String, VoteState)>,
}

impl<'a> Context<'a> {
    pub fn new(
        client: &'a dyn PlatformClient,
        config: &'a ProcessorConfig,
        bot: String,
        pr: PullRequest,
    ) -> Self {
        Context {
            client,
            config,
            bot,
            pr,
            merged_now: false,
            cast_votes: vec![],
        }
    }

    pub fn resolver(&self) -> PermissionResolver<'a> {
        PermissionResolver::new(self.client, self.config)
    }

    pub async fn refresh_pr(&mut self) -> Result<()> {
        self.pr = self.client.get_pr().await?;
        Ok(())
    }

    /// Record a vote cast by a command in this invocation. It is layered on
    /// top of the fetched timeline so it wins even if the platform has not
    /// surfaced the triggering comment yet.
    pub fn cast_vote(&mut self, user: &str, state: VoteState) {
        self.cast_votes.push((user.to_string(), state));
    }

    fn overlay(&self, comments: &[Comment], reviews: &[Review]) -> Vec<Comment> {
        let latest = comments
            .iter()
            .map(|c| c.created_at)
            .chain(reviews.iter().map(|r| r.submitted_at))
            .max()
            .unwrap_or_else(Utc::now);
        let base = latest.max(Utc::now());
        self.cast_votes
            .iter()
            .enumerate()
            .map(|(i, (user, state))| Comment {
                id: 0,
                author: user.clone(),
                body: match state {
                    VoteState::Approve => "/lgtm".to_string(),
                    VoteState::Remove => "/remove-lgtm".to_string(),
                },
                created_at: base + ChronoDuration::seconds(i as i64 + 1),
                url: String::new(),
            })
            .collect()
    }

    fn compute_ledger(
        &self,
        comments: &[Comment],
        reviews: &[Review],
        permissions: &std::collections::HashMap<String, Permission>,
        ignore_user_remove: Option<&str>,
    ) -> Ledger {
        let excluded = [self.bot.clone()];
        let policy = LgtmPolicy {
            required: &self.config.lgtm_permissions,
            pr_author: &self.pr.author,
            excluded: &excluded,
            ignore_user_remove,
        };
        ledger::compute(comments, reviews, permissions, &policy)
    }

    async fn ledger_for(
        &self,
        comments: &[Comment],
        reviews: &[Review],
        ignore_user_remove: Option<&str>,
    ) -> Result<Ledger> {
        let mut timeline = comments.to_vec();
        timeline.extend(self.overlay(comments, reviews));
        let permissions = self
            .resolver()
            .resolve_all(ledger::voters(&timeline, reviews))
            .await?;
        Ok(self.compute_ledger(&timeline, reviews, &permissions, ignore_user_remove))
    }

    /// Fetch comments and reviews concurrently and rebuild the ledger.
    pub async fn snapshot(&self, ignore_user_remove: Option<&str>) -> Result<Snapshot> {
        let (comments, reviews) =
            tokio::try_join!(self.client.get_comments(), self.client.get_reviews())?;
        let ledger = self.ledger_for(&comments, &reviews, ignore_user_remove).await?;
        Ok(Snapshot { comments, reviews, ledger })
    }

    /// Refresh the PR and evaluate every gate from scratch.
    pub async fn evaluate(&mut self) -> Result<Evaluation> {
        let (pr, comments, reviews, runs) = tokio::try_join!(
            self.client.get_pr(),
            self.client.get_comments(),
            self.client.get_reviews(),
            self.client.get_check_runs(),
        )?;
        self.pr = pr;
        let ledger = self.ledger_for(&comments, &reviews, None).await?;
        let report = gate::evaluate(&GateInputs {
            pr: &self.pr,
            ledger: &ledger,
            reviews: &reviews,
            runs: &runs,
            config: self.config,
        });
        Ok(Evaluation { report, ledger, comments, runs })
    }
}

/// True when the bot's latest approval-type review is still standing.
pub fn bot_has_approved(reviews: &[Review], bot: &str) -> bool {
    reviews
        .iter()
        .filter(|r| r.author.eq_ignore_ascii_case(bot))
        .filter(|r| matches!(r.state, ReviewState::Approved | ReviewState::Dismissed))
        .max_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.url.cmp(&b.url)))
        .map(|r| r.state == ReviewState::Approved)
        .unwrap_or(false)
}

/// Users named in the arguments, without `@` and duplicates.
pub fn user_args(cmd: &Command) -> Vec<String> {
    let mut users: Vec<String> = Vec::new();
    for arg in &cmd.parsed_args {
        let user = arg.trim_start_matches('@').trim_end_matches(',');
        if !user.is_empty() && !users.iter().any(|u| u.eq_ignore_ascii_case(user)) {
            users.push(user.to_string());
        }
    }
    users
}

pub fn help_text() -> String {
    COMMANDS
        .iter()
        .map(|entry| format!("`{}`: {}", entry.usage, entry.help))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Results of a dispatch run.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub results: Vec<CommandResult>,
    /// The error that stopped dispatch, if any.
    pub fatal: Option<PrError>,
}

async fn run_one(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let entry = lookup(&cmd.verb).ok_or_else(|| {
        PrError::InvalidInput(format!("unknown command `{}`; try `/help`", cmd.verb))
    })?;

    let resolver = ctx.resolver();
    if resolver.is_denied(&cmd.sender) {
        return Err(PrError::PermissionDenied(format!(
            "@{} is not allowed to run commands",
            cmd.sender
        )));
    }
    if entry.args == Arity::Required && cmd.parsed_args.is_empty() {
        return Err(PrError::InvalidInput(format!("missing arguments; usage: `{}`", entry.usage)));
    }

    let required = entry.requirement.levels(ctx.config);
    if !required.is_empty() {
        let (ok, actual) = resolver.check_permissions(&cmd.sender, &required).await?;
        if !ok {
            return Err(PrError::PermissionDenied(format!(
                "@{} needs {} permission (has {})",
                cmd.sender,
                entry.requirement.describe(ctx.config),
                actual
            )));
        }
    }

    if entry.mutating {
        ctx.refresh_pr().await?;
        if !ctx.pr.is_open() && !entry.allowed_after_merge {
            let state = if ctx.pr.merged { "merged" } else { "closed" };
            return Ok(Reply::skipped(format!("PR is {state}")));
        }
    }

    match entry.verb {
        "/lgtm" => lgtm::approve(ctx, cmd).await,
        "/remove-lgtm" => lgtm::remove(ctx, cmd).await,
        "/assign" => reviewers::assign(ctx, cmd).await,
        "/unassign" => reviewers::unassign(ctx, cmd).await,
        "/label" => labels::add(ctx, cmd).await,
        "/remove-label" => labels::remove(ctx, cmd).await,
        "/ready" => merge::ready(ctx).await,
        "/rebase" => merge::rebase(ctx).await,
        "/merge" | "/squash" | "/rebase-merge" => merge::merge(ctx, cmd).await,
        "/cherrypick" => cherrypick::run(ctx, cmd).await,
        "/check" => info::check(ctx).await,
        "/help" => Ok(info::help()),
        other => Err(PrError::Internal(format!("no handler for `{other}`"))),
    }
}

/// Execute commands in order. Rejections and ordinary failures do not stop
/// later commands; `PlatformUnavailable` and `Internal` do.
pub async fn dispatch(ctx: &mut Context<'_>, commands: &[Lexed]) -> Dispatch {
    let mut out = Dispatch::default();
    for lexed in commands {
        let cmd = &lexed.command;
        let reply = if out.fatal.is_some() {
            Reply::skipped("not run after an earlier error")
        } else {
            match run_one(ctx, cmd).await {
                Ok(reply) => reply,
                Err(e) => match e.kind() {
                    ErrorKind::InvalidInput | ErrorKind::PermissionDenied => {
                        Reply::rejected(e.rationale())
                    }
                    ErrorKind::PlatformUnavailable | ErrorKind::Internal => {
                        warn!(verb = %cmd.verb, error = %e, "command aborted the invocation");
                        let reply = Reply::failed(e.rationale());
                        out.fatal = Some(e);
                        reply
                    }
                    _ => Reply::failed(e.rationale()),
                },
            }
        };

        info!(
            verb = %cmd.verb,
            sender = %cmd.sender,
            status = reply.status.as_str(),
            "command handled"
        );
        out.results.push(CommandResult {
            verb: cmd.verb.clone(),
            line: lexed.raw.clone(),
            status: reply.status,
            message: reply.message,
        });
    }
    out
}
