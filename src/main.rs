use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use pr_cli::commands::CommandStatus;
use pr_cli::config::{self, CherryPickMode, PlatformConfig, ProcessorConfig};
use pr_cli::model::{MergeMethod, Platform, Trigger};
use pr_cli::platform::{self, PlatformRegistry};
use pr_cli::{logging, processor};

#[derive(Parser)]
#[command(
    name = "pr-cli",
    version,
    about = "Run slash commands from a pull/merge request comment",
    long_about = "pr-cli processes one trigger against one pull request: it runs the\n\
                  slash commands in the comment (/lgtm, /merge, /cherrypick, ...),\n\
                  re-evaluates the merge gate and posts a single summary comment."
)]
struct Cli {
    /// Hosting platform
    #[arg(long, env = "PLATFORM", default_value = "github")]
    platform: Platform,

    /// API token (falls back to GITHUB_TOKEN / GITLAB_TOKEN, then `gh auth token`)
    #[arg(long, env = "PLATFORM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// API base URL for self-hosted instances
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Repository owner (GitLab: group path)
    #[arg(long, env = "REPO_OWNER")]
    owner: String,

    /// Repository name
    #[arg(long, env = "REPO_NAME")]
    repo: String,

    /// Pull request number (GitLab: merge request iid)
    #[arg(long, env = "PR_NUMBER")]
    pr: u64,

    /// Login of the user who wrote the trigger comment
    #[arg(long, env = "COMMENT_SENDER")]
    comment_sender: String,

    /// Comment text containing slash commands
    #[arg(long, env = "TRIGGER_COMMENT", allow_hyphen_values = true)]
    trigger_comment: String,

    /// Run as a PR lifecycle event (opened, synchronize, closed, check_completed, ...)
    #[arg(long, value_name = "ACTION")]
    pr_event_action: Option<String>,

    /// Approvals needed before the gate opens
    #[arg(long, env = "LGTM_THRESHOLD", default_value_t = 1)]
    lgtm_threshold: u32,

    /// Permission levels whose /lgtm counts (comma separated)
    #[arg(long, env = "LGTM_PERMISSIONS", default_value = "admin,write")]
    lgtm_permissions: String,

    /// Default merge method for /merge
    #[arg(long, env = "MERGE_METHOD", default_value = "merge")]
    merge_method: MergeMethod,

    /// Name of this tool's own status check, ignored when evaluating CI
    #[arg(long, env = "SELF_CHECK_NAME", default_value = "pr-cli")]
    self_check_name: String,

    /// Merge as soon as the gate is ready when a check run completes
    #[arg(long, env = "AUTO_MERGE_ON_READY")]
    auto_merge_on_ready: bool,

    /// How /cherrypick applies commits
    #[arg(long, env = "CHERRY_PICK_MODE", default_value = "native")]
    cherry_pick_mode: CherryPickMode,

    /// Accounts treated as having write access (comma separated)
    #[arg(long, env = "ROBOT_ACCOUNTS", default_value = "")]
    robot_accounts: String,

    /// Users whose commands are always rejected (comma separated)
    #[arg(long, env = "DENIED_USERS", default_value = "")]
    denied_users: String,

    /// Labels that must be present before merging (comma separated)
    #[arg(long, env = "REQUIRED_LABELS", default_value = "")]
    required_labels: String,

    /// Labels that block merging (comma separated)
    #[arg(long, env = "FORBIDDEN_LABELS", default_value = "")]
    forbidden_labels: String,

    /// Print the summary instead of posting it; skip every write
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn processor_config(&self) -> Result<ProcessorConfig> {
        Ok(ProcessorConfig {
            lgtm_threshold: self.lgtm_threshold,
            lgtm_permissions: config::parse_permissions(&self.lgtm_permissions)?,
            merge_method: self.merge_method,
            self_check_name: self.self_check_name.clone(),
            robot_accounts: config::parse_list(&self.robot_accounts),
            denied_users: config::parse_list(&self.denied_users),
            required_labels: config::parse_list(&self.required_labels),
            forbidden_labels: config::parse_list(&self.forbidden_labels),
            auto_merge_on_ready: self.auto_merge_on_ready,
            cherry_pick_mode: self.cherry_pick_mode,
            dry_run: self.dry_run,
            ..ProcessorConfig::default()
        })
    }

    fn trigger(&self) -> Trigger {
        // Actions pass the comment with a leading mention in some setups.
        let text = self.trigger_comment.trim_start().trim_start_matches('@');
        let sender = self.comment_sender.trim().trim_start_matches('@');
        match self.pr_event_action.as_deref() {
            Some(action) => {
                let mut t = Trigger::pr_event(self.platform, &self.owner, &self.repo, self.pr, sender, action);
                t.trigger_text = text.to_string();
                t
            }
            None => Trigger::comment(self.platform, &self.owner, &self.repo, self.pr, sender, text),
        }
    }
}

fn print_report(outcome: &processor::Outcome) {
    if outcome.noop {
        println!("{} No commands found in trigger", "·".dimmed());
        return;
    }
    for c in &outcome.commands {
        let mark = match c.status {
            CommandStatus::Ok => "✓".green().bold(),
            CommandStatus::Rejected => "✗".yellow().bold(),
            CommandStatus::Failed => "✗".red().bold(),
            CommandStatus::Skipped => "○".dimmed(),
        };
        println!("{} {} {}", mark, c.line.bold(), c.message);
    }
    if let Some(gate) = &outcome.gate {
        println!(
            "{} Gate: {} ({}/{} approvals)",
            "→".blue().bold(),
            gate.state.to_string().cyan(),
            gate.lgtm_count,
            gate.threshold
        );
    }
    if let Some(url) = &outcome.summary_url {
        println!("{} Summary: {}", "→".blue().bold(), url.underline());
    }
    if let Some(err) = &outcome.error {
        eprintln!("{} {}", "error:".red().bold(), err);
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = cli.processor_config()?;
    let trigger = cli.trigger();
    let token = config::resolve_token(cli.platform, cli.token.as_deref())?;

    let registry = PlatformRegistry::with_defaults();
    let client = registry.build(&PlatformConfig {
        platform: cli.platform,
        token,
        base_url: cli.base_url.clone(),
        owner: cli.owner.clone(),
        repo: cli.repo.clone(),
        pr_number: cli.pr,
        retry: config.retry,
        operation_timeout: config.timeouts.operation,
    })?;

    let outcome = processor::process(&trigger, client.as_ref(), &config)
        .await
        .with_context(|| format!("failed to process {}#{}", trigger.full_repo(), trigger.pr_number))?;

    print_report(&outcome);
    if cli.dry_run {
        if let Some(summary) = &outcome.summary {
            println!("\n{}", "--- summary (dry run) ---".dimmed());
            println!("{summary}");
        }
    }
    Ok(!outcome.failed)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(if cli.debug { "debug" } else { "info" });
    platform::install_crypto_provider();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}
