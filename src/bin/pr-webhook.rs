use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use pr_cli::config::{self, CherryPickMode, ProcessorConfig};
use pr_cli::logging;
use pr_cli::model::MergeMethod;
use pr_cli::platform::{self, PlatformRegistry};
use pr_cli::webhook::event::EventFilter;
use pr_cli::webhook::{self, Credentials, PlatformHandler, TlsConfig, WebhookConfig};

/// Webhook server feeding pull/merge request events into pr-cli.
#[derive(Parser)]
#[command(name = "pr-webhook", version)]
struct Args {
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    #[arg(long, env = "WEBHOOK_PATH", default_value = "/webhook")]
    webhook_path: String,

    #[arg(long, env = "HEALTH_PATH", default_value = "/health")]
    health_path: String,

    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Read the secret from a file; wins over WEBHOOK_SECRET
    #[arg(long, env = "WEBHOOK_SECRET_FILE")]
    webhook_secret_file: Option<PathBuf>,

    /// `owner/repo` or `owner/*`, comma separated; empty allows all
    #[arg(long, env = "ALLOWED_REPOS", default_value = "")]
    allowed_repos: String,

    #[arg(long, env = "REQUIRE_SIGNATURE", default_value_t = false, action = clap::ArgAction::Set)]
    require_signature: bool,

    #[arg(long, env = "TLS_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    tls_enabled: bool,

    #[arg(long, env = "TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    #[arg(long, env = "ASYNC_PROCESSING", default_value_t = true, action = clap::ArgAction::Set)]
    async_processing: bool,

    #[arg(long, env = "WORKER_COUNT", default_value_t = 10)]
    worker_count: usize,

    #[arg(long, env = "QUEUE_SIZE", default_value_t = 100)]
    queue_size: usize,

    #[arg(long, env = "RATE_LIMIT_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    rate_limit_enabled: bool,

    /// Requests per minute across the server
    #[arg(long, env = "RATE_LIMIT_REQUESTS", default_value_t = 60)]
    rate_limit_requests: u32,

    #[arg(long, env = "PR_EVENT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pr_event_enabled: bool,

    #[arg(
        long,
        env = "PR_EVENT_ACTIONS",
        default_value = "opened,synchronize,reopened,ready_for_review,edited"
    )]
    pr_event_actions: String,

    #[arg(long, env = "PLATFORM_TOKEN", hide_env_values = true)]
    platform_token: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    gitlab_token: Option<String>,

    #[arg(long, env = "GITHUB_BASE_URL")]
    github_base_url: Option<String>,

    #[arg(long, env = "GITLAB_BASE_URL")]
    gitlab_base_url: Option<String>,

    #[arg(long, env = "LGTM_THRESHOLD", default_value_t = 1)]
    lgtm_threshold: u32,

    #[arg(long, env = "LGTM_PERMISSIONS", default_value = "admin,write")]
    lgtm_permissions: String,

    #[arg(long, env = "MERGE_METHOD", default_value = "merge")]
    merge_method: MergeMethod,

    #[arg(long, env = "SELF_CHECK_NAME", default_value = "pr-cli")]
    self_check_name: String,

    #[arg(long, env = "AUTO_MERGE_ON_READY", default_value_t = false, action = clap::ArgAction::Set)]
    auto_merge_on_ready: bool,

    #[arg(long, env = "CHERRY_PICK_MODE", default_value = "native")]
    cherry_pick_mode: CherryPickMode,

    #[arg(long, env = "ROBOT_ACCOUNTS", default_value = "")]
    robot_accounts: String,

    #[arg(long, env = "DENIED_USERS", default_value = "")]
    denied_users: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn secret(&self) -> Result<Option<String>> {
        if let Some(path) = &self.webhook_secret_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return Ok(Some(raw.trim().to_string()).filter(|s| !s.is_empty()));
        }
        Ok(self.webhook_secret.clone().filter(|s| !s.is_empty()))
    }

    fn tls(&self) -> Result<Option<TlsConfig>> {
        if !self.tls_enabled {
            return Ok(None);
        }
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => Ok(Some(TlsConfig {
                cert_file: cert.clone(),
                key_file: key.clone(),
            })),
            _ => bail!("TLS_ENABLED requires TLS_CERT_FILE and TLS_KEY_FILE"),
        }
    }

    fn webhook_config(&self) -> Result<WebhookConfig> {
        Ok(WebhookConfig {
            listen_addr: self.listen_addr,
            webhook_path: self.webhook_path.clone(),
            health_path: self.health_path.clone(),
            metrics_path: self.metrics_path.clone(),
            secret: self.secret()?,
            require_signature: self.require_signature,
            allowed_repos: config::parse_list(&self.allowed_repos),
            tls: self.tls()?,
            async_processing: self.async_processing,
            worker_count: self.worker_count,
            queue_size: self.queue_size,
            rate_limit: self.rate_limit_enabled.then_some(self.rate_limit_requests),
            filter: EventFilter {
                pr_event_enabled: self.pr_event_enabled,
                pr_event_actions: config::parse_list(&self.pr_event_actions),
            },
        })
    }

    fn processor_config(&self) -> Result<ProcessorConfig> {
        Ok(ProcessorConfig {
            lgtm_threshold: self.lgtm_threshold,
            lgtm_permissions: config::parse_permissions(&self.lgtm_permissions)?,
            merge_method: self.merge_method,
            self_check_name: self.self_check_name.clone(),
            robot_accounts: config::parse_list(&self.robot_accounts),
            denied_users: config::parse_list(&self.denied_users),
            auto_merge_on_ready: self.auto_merge_on_ready,
            cherry_pick_mode: self.cherry_pick_mode,
            ..ProcessorConfig::default()
        })
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            platform_token: self.platform_token.clone(),
            github_token: self.github_token.clone(),
            gitlab_token: self.gitlab_token.clone(),
            github_base_url: self.github_base_url.clone(),
            gitlab_base_url: self.gitlab_base_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);
    platform::install_crypto_provider();

    let config = args.webhook_config()?;
    let handler = Arc::new(PlatformHandler {
        registry: PlatformRegistry::with_defaults(),
        credentials: args.credentials(),
        config: args.processor_config()?,
    });

    webhook::serve(config, handler).await
}
