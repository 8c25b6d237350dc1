use super::{Context, Reply, user_args};
use crate::error::{PrError, Result};
use crate::model::Command;

fn mentions(users: &[String]) -> String {
    users.iter().map(|u| format!("@{u}")).collect::<Vec<_>>().join(", ")
}

pub async fn assign(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let mut users = user_args(cmd);
    let author = ctx.pr.author.clone();
    users.retain(|u| !u.eq_ignore_ascii_case(&author));
    if users.is_empty() {
        return Err(PrError::InvalidInput(
            "the PR author cannot be requested as a reviewer".to_string(),
        ));
    }

    if ctx.config.dry_run {
        return Ok(Reply::done(format!("would request review from {}", mentions(&users))));
    }
    ctx.client.assign_reviewers(&users).await?;
    Ok(Reply::done(format!("requested review from {}", mentions(&users))))
}

pub async fn unassign(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let users = user_args(cmd);
    let current = ctx.client.get_requested_reviewers().await?;
    let (present, absent): (Vec<String>, Vec<String>) = users
        .into_iter()
        .partition(|u| current.iter().any(|c| c.eq_ignore_ascii_case(u)));

    let mut message = if present.is_empty() {
        "no matching reviewers to remove".to_string()
    } else if ctx.config.dry_run {
        format!("would remove {}", mentions(&present))
    } else {
        ctx.client.remove_reviewers(&present).await?;
        format!("removed {}", mentions(&present))
    };
    if !absent.is_empty() {
        message.push_str(&format!(" ({} not requested)", mentions(&absent)));
    }
    Ok(Reply::done(message))
}
