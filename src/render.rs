//! The single summary comment posted per invocation.

use std::sync::LazyLock;

use comfy_table::{presets::ASCII_MARKDOWN, Table};
use regex::Regex;

use crate::commands::{CommandResult, CommandStatus};
use crate::gate::{GateReport, GateState};
use crate::lgtm::Ledger;
use crate::model::PullRequest;

/// First line of every summary; used to find and replace the previous one.
pub const SUMMARY_MARKER: &str = "<!-- pr-cli:summary -->";

static UNCHECKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*[-*][ \t]+)\[ \]").expect("checkbox pattern is valid")
});

pub fn is_summary(body: &str) -> bool {
    body.trim_start().starts_with(SUMMARY_MARKER)
}

/// Tick every unchecked Markdown checkbox.
pub fn check_all_boxes(text: &str) -> String {
    UNCHECKED.replace_all(text, "${1}[x]").into_owned()
}

pub struct Summary<'a> {
    pub pr: &'a PullRequest,
    pub commands: &'a [CommandResult],
    pub ledger: Option<&'a Ledger>,
    pub gate: Option<&'a GateReport>,
    /// Set when the invocation stopped early.
    pub error: Option<&'a str>,
}

fn symbol(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Ok => "✓",
        CommandStatus::Rejected | CommandStatus::Failed => "✗",
        CommandStatus::Skipped => "○",
    }
}

/// Put free text on one line with pipes escaped, so it cannot split a table cell
/// or start a new list item.
fn inline(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ").replace('|', "\\|")
}

fn markdown_table(header: Vec<&str>, rows: Vec<Vec<String>>) -> String {
    let mut table = Table::new();
    table.load_preset(ASCII_MARKDOWN).set_header(header);
    for row in rows {
        table.add_row(row);
    }
    table.to_string()
}

fn commands_section(out: &mut String, commands: &[CommandResult]) {
    out.push_str("\n**Commands**\n\n");
    for c in commands {
        out.push_str(&format!(
            "- {} `{}`: {}\n",
            symbol(c.status),
            c.line.replace('`', "'"),
            inline(&c.message)
        ));
    }
}

fn ledger_section(out: &mut String, ledger: &Ledger, threshold: Option<u32>) {
    match threshold {
        Some(t) => out.push_str(&format!("\n**LGTM** ({}/{} approvals)\n\n", ledger.count, t)),
        None => out.push_str(&format!("\n**LGTM** ({} approvals)\n\n", ledger.count)),
    }
    if ledger.votes.is_empty() {
        out.push_str("No votes yet.\n");
        return;
    }
    let rows = ledger
        .votes
        .iter()
        .map(|(user, vote)| {
            vec![
                format!("@{user}"),
                vote.state.as_str().to_string(),
                vote.at.format("%Y-%m-%d %H:%M UTC").to_string(),
            ]
        })
        .collect();
    out.push_str(&markdown_table(vec!["Reviewer", "Vote", "When"], rows));
    out.push('\n');
}

fn gate_section(out: &mut String, gate: &GateReport) {
    out.push_str(&format!("\n**Gate: {}**\n\n", gate.state));
    let rows = gate
        .conditions
        .iter()
        .map(|c| {
            vec![
                c.name.to_string(),
                if c.passed { "✓" } else { "✗" }.to_string(),
                inline(&c.detail),
            ]
        })
        .collect();
    out.push_str(&markdown_table(vec!["Condition", "Status", "Detail"], rows));
    out.push('\n');
}

fn next_steps(out: &mut String, gate: &GateReport) {
    out.push_str("\n**Next steps**\n\n");
    for c in &gate.conditions {
        let mark = if c.passed { "x" } else { " " };
        out.push_str(&format!("- [{mark}] {}: {}\n", c.name, inline(&c.detail)));
    }
    let merged = gate.state == GateState::Merged;
    out.push_str(&format!(
        "- [{}] Merge (`/merge`, `/squash` or `/rebase-merge`)\n",
        if merged { "x" } else { " " }
    ));
}

pub fn render(s: &Summary<'_>) -> String {
    let mut out = String::new();
    out.push_str(SUMMARY_MARKER);
    out.push('\n');
    out.push_str(&format!("### PR #{}: {}\n", s.pr.number, inline(&s.pr.title)));

    if !s.commands.is_empty() {
        commands_section(&mut out, s.commands);
    }
    if let Some(err) = s.error {
        out.push_str(&format!("\n**Error**: {}\n", inline(err)));
    }
    if let Some(ledger) = s.ledger {
        ledger_section(&mut out, ledger, s.gate.map(|g| g.threshold));
    }
    if let Some(gate) = s.gate {
        gate_section(&mut out, gate);
        next_steps(&mut out, gate);
        if gate.state == GateState::Merged {
            out = check_all_boxes(&out);
        }
    }
    out
}
