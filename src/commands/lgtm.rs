use super::{Context, Reply, bot_has_approved};
use crate::error::{PrError, Result};
use crate::lgtm::VoteState;
use crate::model::Command;

fn progress(count: usize, threshold: u32) -> String {
    format!("{count}/{threshold} approvals")
}

/// `/lgtm`: record the vote and approve on the bot's behalf once the threshold is met.
pub async fn approve(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    if cmd.sender.eq_ignore_ascii_case(&ctx.pr.author) {
        return Err(PrError::PermissionDenied(
            "the PR author cannot /lgtm their own PR".to_string(),
        ));
    }
    if cmd.sender.eq_ignore_ascii_case(&ctx.bot) {
        return Err(PrError::PermissionDenied("the bot account does not vote".to_string()));
    }

    ctx.cast_vote(&cmd.sender, VoteState::Approve);
    let snap = ctx.snapshot(Some(&cmd.sender)).await?;
    let threshold = ctx.config.lgtm_threshold;
    let progress = progress(snap.ledger.count, threshold);

    if snap.ledger.count < threshold as usize {
        return Ok(Reply::done(format!("LGTM recorded ({progress})")));
    }
    if bot_has_approved(&snap.reviews, &ctx.bot) {
        return Ok(Reply::done(format!("LGTM recorded ({progress}); already approved")));
    }
    if ctx.config.dry_run {
        return Ok(Reply::done(format!("LGTM recorded ({progress}); would approve")));
    }
    ctx.client
        .approve_pr(&format!("Approved: {progress} via /lgtm."))
        .await?;
    Ok(Reply::done(format!("LGTM recorded ({progress}); PR approved")))
}

/// `/remove-lgtm`: withdraw the vote and the bot's approval if the count drops below threshold.
pub async fn remove(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    ctx.cast_vote(&cmd.sender, VoteState::Remove);
    let snap = ctx.snapshot(None).await?;
    let threshold = ctx.config.lgtm_threshold;
    let progress = progress(snap.ledger.count, threshold);

    if snap.ledger.count >= threshold as usize || !bot_has_approved(&snap.reviews, &ctx.bot) {
        return Ok(Reply::done(format!("LGTM removed ({progress})")));
    }
    if ctx.config.dry_run {
        return Ok(Reply::done(format!("LGTM removed ({progress}); would dismiss approval")));
    }
    ctx.client
        .dismiss_approve(&format!("Approval withdrawn: {progress}."))
        .await?;
    Ok(Reply::done(format!("LGTM removed ({progress}); approval dismissed")))
}
