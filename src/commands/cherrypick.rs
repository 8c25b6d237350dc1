use super::{Context, Reply};
use crate::cherrypick::{self, IntentStatus};
use crate::error::Result;
use crate::model::Command;

fn targets(cmd: &Command) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for arg in &cmd.parsed_args {
        let t = arg.trim_end_matches(',');
        if !t.is_empty() && !out.iter().any(|x| x == t) {
            out.push(t.to_string());
        }
    }
    out
}

/// Run now if the PR is merged, otherwise leave an intent for the merge trigger.
pub async fn run(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let targets = targets(cmd);

    if ctx.pr.merged {
        let mut lines = Vec::with_capacity(targets.len());
        let mut any_failed = false;
        for target in &targets {
            match cherrypick::cherry_pick(ctx.client, ctx.config, &ctx.pr, target).await {
                Ok(report) => lines.push(report.message()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    any_failed = true;
                    lines.push(format!("`{target}`: {}", e.rationale()));
                }
            }
        }
        let message = lines.join("; ");
        return Ok(if any_failed { Reply::failed(message) } else { Reply::done(message) });
    }

    if !ctx.pr.is_open() {
        return Ok(Reply::rejected("PR was closed without merging; nothing to cherry-pick"));
    }

    let comments = ctx.client.get_comments().await?;
    let mut lines = Vec::with_capacity(targets.len());
    for target in &targets {
        let status = cherrypick::record_intent(
            ctx.client,
            &comments,
            &ctx.bot,
            ctx.pr.number,
            target,
            &cmd.sender,
            ctx.config.dry_run,
        )
        .await?;
        lines.push(match status {
            IntentStatus::Recorded => format!("queued `{target}` for after merge"),
            IntentStatus::AlreadyPending => format!("`{target}` is already queued"),
            IntentStatus::AlreadyDone => format!("`{target}` was already cherry-picked"),
        });
    }
    Ok(Reply::done(lines.join("; ")))
}
