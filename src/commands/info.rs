use super::{Context, Reply, help_text};
use crate::error::Result;

/// `/check`: read-only gate report.
pub async fn check(ctx: &mut Context<'_>) -> Result<Reply> {
    let eval = ctx.evaluate().await?;
    let report = &eval.report;
    let approvals = format!("{}/{} approvals", report.lgtm_count, report.threshold);
    if report.blocking().is_empty() {
        Ok(Reply::done(format!("{} ({approvals})", report.state)))
    } else {
        Ok(Reply::done(format!("{}: {}", report.state, report.blocking_summary())))
    }
}

pub fn help() -> Reply {
    Reply::done(help_text())
}
