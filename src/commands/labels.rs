use super::{Context, Reply};
use crate::error::Result;
use crate::model::Command;

fn label_args(cmd: &Command) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for arg in &cmd.parsed_args {
        let label = arg.trim_matches(|c| c == '"' || c == '\'' || c == ',');
        if !label.is_empty() && !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

fn quoted(labels: &[String]) -> String {
    labels.iter().map(|l| format!("`{l}`")).collect::<Vec<_>>().join(", ")
}

pub async fn add(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let labels = label_args(cmd);
    let new: Vec<String> = labels
        .into_iter()
        .filter(|l| !ctx.pr.labels.iter().any(|have| have.eq_ignore_ascii_case(l)))
        .collect();
    if new.is_empty() {
        return Ok(Reply::done("labels already present"));
    }
    if ctx.config.dry_run {
        return Ok(Reply::done(format!("would add {}", quoted(&new))));
    }
    ctx.client.add_labels(&new).await?;
    ctx.pr.labels.extend(new.iter().cloned());
    Ok(Reply::done(format!("added {}", quoted(&new))))
}

pub async fn remove(ctx: &mut Context<'_>, cmd: &Command) -> Result<Reply> {
    let labels = label_args(cmd);
    let present: Vec<String> = ctx
        .pr
        .labels
        .iter()
        .filter(|have| labels.iter().any(|l| l.eq_ignore_ascii_case(have)))
        .cloned()
        .collect();
    if present.is_empty() {
        return Ok(Reply::done("no matching labels to remove"));
    }
    if ctx.config.dry_run {
        return Ok(Reply::done(format!("would remove {}", quoted(&present))));
    }
    ctx.client.remove_labels(&present).await?;
    ctx.pr.labels.retain(|have| !present.contains(have));
    Ok(Reply::done(format!("removed {}", quoted(&present))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_args_trim_quotes_and_dedup() {
        let cmd = crate::lexer::parse_line("/label \"bug\" kind/feature, bug", "bob", None);
        assert_eq!(label_args(&cmd), vec!["bug", "kind/feature"]);
    }
}
