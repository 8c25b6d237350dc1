use tracing::info;

use super::{Context, Reply};
use crate::error::{ErrorKind, PrError, Result};
use crate::gate::MergeMachine;
use crate::model::{Command, MergeMethod};

/// Merge method named by the command, falling back to the configured default.
pub fn method_for(cmd: &Command, default: MergeMethod) -> Result<MergeMethod> {
    match cmd.verb.as_str() {
        "/squash" => Ok(MergeMethod::Squash),
        "/rebase-merge" => Ok(MergeMethod::Rebase),
        _ => match cmd.parsed_args.first() {
            Some(arg) => arg.parse(),
            None => Ok(default),
        },
    }
}

pub async fn merge(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let method = method_for(cmd, ctx.config.merge_method)?;
    execute(ctx, method).await
}

/// Drive `Ready → Merging → Merged`. A merge refused by the platform returns
/// the machine to the state it started in.
pub async fn execute(ctx: &mut Context<'_>, method: MergeMethod) -> Result<Reply> {
    let eval = ctx.evaluate().await?;
    let mut machine = MergeMachine::new(eval.report.state);
    if machine.begin_merge().is_err() {
        return Ok(Reply::rejected(format!(
            "not ready to merge ({}): {}",
            eval.report.state,
            eval.report.blocking_summary()
        )));
    }

    if ctx.config.dry_run {
        machine.fail();
        return Ok(Reply::done(format!("would merge with {method}")));
    }

    match ctx.client.merge_pr(method).await {
        Ok(()) => {
            machine.succeed();
            ctx.merged_now = true;
            info!(pr = ctx.pr.number, method = %method, "merged");
            ctx.refresh_pr().await?;
            Ok(Reply::done(format!(
                "merged with {method} ({}/{} approvals)",
                eval.report.lgtm_count, eval.report.threshold
            )))
        }
        Err(e) if e.kind() == ErrorKind::Conflict => {
            let back = machine.fail();
            Err(PrError::Conflict(format!(
                "merge refused: {}; gate back to {back}",
                e.rationale()
            )))
        }
        Err(e) => {
            machine.fail();
            Err(e)
        }
    }
}

pub async fn ready(ctx: &mut Context<'_>) -> Result<Reply> {
    let eval = ctx.evaluate().await?;
    if eval.report.is_ready() {
        Ok(Reply::done("Ready to merge"))
    } else {
        Ok(Reply::done(format!(
            "{}: {}",
            eval.report.state,
            eval.report.blocking_summary()
        )))
    }
}

pub async fn rebase(ctx: &mut Context<'_>) -> Result<Reply> {
    if ctx.config.dry_run {
        return Ok(Reply::done("would update branch"));
    }
    ctx.client.rebase_pr().await?;
    Ok(Reply::done(format!("updated branch from `{}`", ctx.pr.base.branch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::parse_line;

    #[test]
    fn test_method_for_verbs() {
        let d = MergeMethod::Merge;
        assert_eq!(method_for(&parse_line("/squash", "b", None), d).unwrap(), MergeMethod::Squash);
        assert_eq!(method_for(&parse_line("/rebase-merge", "b", None), d).unwrap(), MergeMethod::Rebase);
        assert_eq!(method_for(&parse_line("/merge", "b", None), MergeMethod::Squash).unwrap(), MergeMethod::Squash);
        assert_eq!(method_for(&parse_line("/merge rebase", "b", None), d).unwrap(), MergeMethod::Rebase);
        assert!(method_for(&parse_line("/merge octopus", "b", None), d).is_err());
    }
}
