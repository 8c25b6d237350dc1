//! One invocation: lex, dispatch, evaluate, summarise.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cherrypick;
use crate::commands::{self, CommandResult, CommandStatus, Context, Evaluation, merge};
use crate::config::ProcessorConfig;
use crate::error::{ErrorKind, PrError, Result};
use crate::gate::GateReport;
use crate::lexer;
use crate::lgtm::Ledger;
use crate::model::{Comment, Trigger};
use crate::platform::PlatformClient;
use crate::render::{self, Summary};

#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    /// Nothing to do: no commands and not a PR event.
    pub noop: bool,
    pub commands: Vec<CommandResult>,
    pub gate: Option<GateReport>,
    pub ledger: Option<Ledger>,
    /// The rendered summary, whether or not it was posted.
    pub summary: Option<String>,
    pub summary_url: Option<String>,
    pub failed: bool,
    pub error: Option<String>,
}

impl Outcome {
    pub fn noop() -> Self {
        Outcome { noop: true, ..Default::default() }
    }
}

/// Run one trigger to completion, bounded by the invocation timeout.
///
/// `Err` is returned only when nothing could be reported on the PR (it does
/// not exist, credentials are rejected, or the invocation timed out).
pub async fn process(
    trigger: &Trigger,
    client: &dyn PlatformClient,
    config: &ProcessorConfig,
) -> Result<Outcome> {
    let limit = config.timeouts.invocation;
    match tokio::time::timeout(limit, run(trigger, client, config)).await {
        Ok(result) => result,
        Err(_) => Err(PrError::PlatformUnavailable(format!(
            "invocation timed out after {}s",
            limit.as_secs()
        ))),
    }
}

fn failure_result(verb: &str, line: String, e: &PrError) -> CommandResult {
    let status = match e.kind() {
        ErrorKind::InvalidInput | ErrorKind::PermissionDenied => CommandStatus::Rejected,
        _ => CommandStatus::Failed,
    };
    CommandResult {
        verb: verb.to_string(),
        line,
        status,
        message: e.rationale().to_string(),
    }
}

/// Merge when the gate is already Ready: on a check-completion event, or after a
/// comment's commands brought it there.
async fn auto_merge(ctx: &mut Context<'_>) -> Result<Option<CommandResult>> {
    let eval = ctx.evaluate().await?;
    if !eval.report.is_ready() {
        debug!(state = %eval.report.state, "auto-merge skipped, gate not ready");
        return Ok(None);
    }
    let line = "/merge (auto-merge on ready)".to_string();
    let method = ctx.config.merge_method;
    match merge::execute(ctx, method).await {
        Ok(reply) => Ok(Some(CommandResult {
            verb: "/merge".to_string(),
            line,
            status: reply.status,
            message: reply.message,
        })),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Some(failure_result("/merge", line, &e))),
    }
}

async fn consume_intents(ctx: &Context<'_>) -> Result<Vec<CommandResult>> {
    let comments = ctx.client.get_comments().await?;
    let consumed =
        cherrypick::consume_intents(ctx.client, ctx.config, &ctx.pr, &comments, &ctx.bot).await;
    let mut results = Vec::with_capacity(consumed.len());
    for c in consumed {
        let line = format!("/cherrypick {}", c.target);
        match c.result {
            Ok(report) => results.push(CommandResult {
                verb: "/cherrypick".to_string(),
                line,
                status: CommandStatus::Ok,
                message: report.message(),
            }),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => results.push(failure_result("/cherrypick", line, &e)),
        }
    }
    Ok(results)
}

fn latest_summary<'c>(comments: &'c [Comment], bot: &str) -> Option<&'c Comment> {
    comments
        .iter()
        .rev()
        .find(|c| c.author.eq_ignore_ascii_case(bot) && render::is_summary(&c.body))
}

/// Replace the bot's previous summary in place, or post a new one.
async fn upsert_summary(
    client: &dyn PlatformClient,
    comments: Option<&[Comment]>,
    bot: &str,
    body: &str,
) -> Result<String> {
    let fetched;
    let comments = match comments {
        Some(c) => c,
        None => {
            fetched = client.get_comments().await?;
            &fetched[..]
        }
    };
    match latest_summary(comments, bot) {
        Some(prev) => {
            client.update_comment(prev.id, body).await?;
            Ok(prev.url.clone())
        }
        None => client.post_comment(body).await,
    }
}

/// Tick the checklist of the previous summary after a merge.
async fn close_out_summary(client: &dyn PlatformClient, bot: &str) -> Result<Option<String>> {
    let comments = client.get_comments().await?;
    let Some(prev) = latest_summary(&comments, bot) else {
        return Ok(None);
    };
    let ticked = render::check_all_boxes(&prev.body);
    if ticked != prev.body {
        client.update_comment(prev.id, &ticked).await?;
    }
    Ok(Some(prev.url.clone()))
}

async fn run(
    trigger: &Trigger,
    client: &dyn PlatformClient,
    config: &ProcessorConfig,
) -> Result<Outcome> {
    let lexed = lexer::lex(&trigger.trigger_text, &trigger.comment_sender, None);
    if lexed.is_empty() && !trigger.is_pr_event {
        debug!(repo = %trigger.full_repo(), pr = trigger.pr_number, "no commands in trigger");
        return Ok(Outcome::noop());
    }

    let pr = client.get_pr().await?;
    let bot = client.current_user().await?;
    let mut ctx = Context::new(client, config, bot, pr);
    let mut results: Vec<CommandResult> = Vec::new();
    let mut fatal: Option<PrError> = None;
    let mut changed = false;

    let action = trigger.pr_event_action.as_deref().unwrap_or_default();
    let merged_event = trigger.is_pr_event && action == "closed" && ctx.pr.merged;
    if trigger.is_pr_event && action == "check_completed" && config.auto_merge_on_ready {
        match auto_merge(&mut ctx).await {
            Ok(Some(result)) => {
                changed = true;
                results.push(result);
            }
            Ok(None) => {}
            Err(e) => fatal = Some(e),
        }
    }

    if fatal.is_none() {
        let dispatched = commands::dispatch(&mut ctx, &lexed).await;
        results.extend(dispatched.results);
        fatal = dispatched.fatal;
    }

    let promotable = !lexed.is_empty() && !ctx.merged_now && !ctx.pr.merged;
    if fatal.is_none() && config.auto_merge_on_ready && promotable {
        match auto_merge(&mut ctx).await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) => fatal = Some(e),
        }
    }

    let mut picks = 0;
    if fatal.is_none() && ctx.pr.merged && (ctx.merged_now || merged_event) {
        match consume_intents(&ctx).await {
            Ok(consumed) => {
                picks = consumed.len();
                results.extend(consumed);
            }
            Err(e) => fatal = Some(e),
        }
    }
    changed |= picks > 0 || ctx.merged_now;

    let mut outcome = Outcome::default();

    // A plain merge notification only closes out the previous checklist.
    if merged_event && lexed.is_empty() && picks == 0 && fatal.is_none() {
        if !config.dry_run {
            outcome.summary_url = close_out_summary(client, &ctx.bot).await?;
        }
        outcome.commands = results;
        return Ok(outcome);
    }

    let evaluation: Option<Evaluation> = if fatal.is_none() {
        match ctx.evaluate().await {
            Ok(eval) => Some(eval),
            Err(e) => {
                fatal = Some(e);
                None
            }
        }
    } else {
        None
    };

    let should_post = !lexed.is_empty() || changed || fatal.is_some();
    let error = fatal.as_ref().map(|e| e.rationale().to_string());
    let body = render::render(&Summary {
        pr: &ctx.pr,
        commands: &results,
        ledger: evaluation.as_ref().map(|e| &e.ledger),
        gate: evaluation.as_ref().map(|e| &e.report),
        error: error.as_deref(),
    });

    if should_post && !config.dry_run {
        let comments = evaluation.as_ref().map(|e| e.comments.as_slice());
        match upsert_summary(client, comments, &ctx.bot, &body).await {
            Ok(url) => outcome.summary_url = Some(url),
            Err(e) if fatal.is_some() => {
                warn!(error = %e, "could not post error summary");
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(e) = &fatal {
        warn!(repo = %trigger.full_repo(), pr = trigger.pr_number, error = %e, "invocation failed");
    }
    info!(
        repo = %trigger.full_repo(),
        pr = trigger.pr_number,
        commands = results.len(),
        failed = fatal.is_some(),
        "invocation finished"
    );

    outcome.commands = results;
    outcome.summary = should_post.then_some(body);
    outcome.failed = fatal.is_some();
    outcome.error = error;
    if let Some(eval) = evaluation {
        outcome.gate = Some(eval.report);
        outcome.ledger = Some(eval.ledger);
    }
    Ok(outcome)
}
