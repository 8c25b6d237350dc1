//! Turns trigger text into an ordered list of slash commands.
//!
//! Two streams are produced from the same text: the canonical stream, in which
//! `/lgtm cancel` is rewritten to `/remove-lgtm`, and the raw stream, which keeps
//! every line as typed. Duplicates are preserved in both.

use crate::model::Command;

pub const REMOVE_LGTM: &str = "/remove-lgtm";

/// Trim the text and drop trailing literal `\n` / `\r` escape sequences left by shell wrappers.
pub fn normalize(text: &str) -> String {
    let mut s = text.trim();
    loop {
        if let Some(rest) = s.strip_suffix("\\n").or_else(|| s.strip_suffix("\\r")) {
            s = rest.trim_end();
        } else {
            break;
        }
    }
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Command lines as typed, without canonicalisation.
pub fn split_raw(text: &str) -> Vec<String> {
    normalize(text)
        .split('\n')
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
        .collect()
}

/// Command lines in canonical form.
pub fn split(text: &str) -> Vec<String> {
    split_raw(text).into_iter().map(|l| canonicalize(&l)).collect()
}

/// Rewrite special forms; everything else passes through unchanged.
pub fn canonicalize(line: &str) -> String {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    if verb.eq_ignore_ascii_case("/lgtm") && args.len() == 1 && args[0].eq_ignore_ascii_case("cancel") {
        REMOVE_LGTM.to_string()
    } else {
        line.to_string()
    }
}

/// Parse a single command line into verb and arguments.
pub fn parse_line(line: &str, sender: &str, source_url: Option<&str>) -> Command {
    let line = line.trim();
    let (verb, rest) = match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    };
    Command {
        verb: verb.to_ascii_lowercase(),
        raw_args: rest.to_string(),
        parsed_args: rest.split_whitespace().map(str::to_string).collect(),
        sender: sender.to_string(),
        source_comment_url: source_url.map(str::to_string),
    }
}

/// Lex trigger text into canonical commands.
pub fn parse(text: &str, sender: &str, source_url: Option<&str>) -> Vec<Command> {
    split(text)
        .iter()
        .map(|line| parse_line(line, sender, source_url))
        .collect()
}

/// A canonical command alongside the line exactly as it was typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexed {
    pub raw: String,
    pub command: Command,
}

/// Lex into canonical commands, keeping each command's raw line for display.
pub fn lex(text: &str, sender: &str, source_url: Option<&str>) -> Vec<Lexed> {
    split_raw(text)
        .into_iter()
        .map(|raw| {
            let command = parse_line(&canonicalize(&raw), sender, source_url);
            Lexed { raw, command }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ignores_prose_lines() {
        let text = "Thanks for the fix!\n/lgtm\nsee /assign below\n  /assign @alice  ";
        assert_eq!(split(text), vec!["/lgtm", "/assign @alice"]);
    }

    #[test]
    fn test_trailing_escape_sequences_are_stripped() {
        assert_eq!(split("/rebase\\n"), vec!["/rebase"]);
        assert_eq!(split("/rebase\\r\\n\\n"), vec!["/rebase"]);
        assert_eq!(split("  /ready \\n \\r "), vec!["/ready"]);
    }

    #[test]
    fn test_line_endings_are_normalized() {
        assert_eq!(split("/rebase\r\n/ready\r/check"), vec!["/rebase", "/ready", "/check"]);
    }

    #[test]
    fn test_lgtm_cancel_canonical_vs_raw() {
        let text = "/rebase\n/lgtm cancel\n/ready";
        assert_eq!(split(text), vec!["/rebase", "/remove-lgtm", "/ready"]);
        assert_eq!(split_raw(text), vec!["/rebase", "/lgtm cancel", "/ready"]);
    }

    #[test]
    fn test_lgtm_with_other_argument_is_not_cancel() {
        assert_eq!(canonicalize("/lgtm thanks"), "/lgtm thanks");
        assert_eq!(canonicalize("/lgtm   CANCEL"), REMOVE_LGTM);
    }

    #[test]
    fn test_duplicates_and_order_preserved() {
        assert_eq!(split("/label a\n/rebase\n/label a"), vec!["/label a", "/rebase", "/label a"]);
    }

    #[test]
    fn test_split_is_idempotent() {
        let inputs = [
            "/rebase\n/lgtm cancel\n/ready",
            "hello\r\n /assign a b \r\n\r\n/lgtm\\n",
            "no commands here",
            "",
        ];
        for input in inputs {
            let once = split(input);
            let twice = split(&once.join("\n"));
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_empty_text_yields_no_commands() {
        assert!(parse("   \n  ", "bob", None).is_empty());
        assert!(parse("just a comment", "bob", None).is_empty());
    }

    #[test]
    fn test_parse_line_splits_verb_and_args() {
        let cmd = parse_line("/Assign  @alice   bob", "carol", Some("https://x/1"));
        assert_eq!(cmd.verb, "/assign");
        assert_eq!(cmd.raw_args, "@alice   bob");
        assert_eq!(cmd.parsed_args, vec!["@alice", "bob"]);
        assert_eq!(cmd.sender, "carol");
        assert_eq!(cmd.source_comment_url.as_deref(), Some("https://x/1"));
    }

    #[test]
    fn test_lex_pairs_raw_and_canonical() {
        let lexed = lex("/lgtm cancel\n/merge squash", "bob", None);
        assert_eq!(lexed.len(), 2);
        assert_eq!(lexed[0].raw, "/lgtm cancel");
        assert_eq!(lexed[0].command.verb, REMOVE_LGTM);
        assert_eq!(lexed[1].raw, "/merge squash");
        assert_eq!(lexed[1].command.parsed_args, vec!["squash"]);
    }
}
