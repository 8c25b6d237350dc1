//! HTTP shell that turns platform webhooks into processor invocations.
//!
//! The router verifies, filters, de-duplicates and rate-limits deliveries;
//! accepted triggers either run inline or go through [`queue`] to a worker
//! pool. Everything the processor itself decides stays in
//! [`crate::processor`].

pub mod event;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod signature;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::{PlatformConfig, ProcessorConfig};
use crate::model::{Platform, Trigger};
use crate::platform::PlatformRegistry;
use crate::processor::{self, Outcome};

use event::{EventFilter, Parsed};
use metrics::Metrics;
use queue::{Queue, WorkerPool};
use ratelimit::{FixedWindow, RecentIds};

/// In-flight invocations get this long to finish after a shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How many delivery ids are remembered for redelivery detection.
const DEDUP_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub listen_addr: SocketAddr,
    pub webhook_path: String,
    pub health_path: String,
    pub metrics_path: String,
    pub secret: Option<String>,
    pub require_signature: bool,
    pub allowed_repos: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub async_processing: bool,
    pub worker_count: usize,
    pub queue_size: usize,
    pub rate_limit: Option<u32>,
    pub filter: EventFilter,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            webhook_path: "/webhook".to_string(),
            health_path: "/health".to_string(),
            metrics_path: "/metrics".to_string(),
            secret: None,
            require_signature: false,
            allowed_repos: vec![],
            tls: None,
            async_processing: true,
            worker_count: 10,
            queue_size: 100,
            rate_limit: None,
            filter: EventFilter::default(),
        }
    }
}

/// Runs one accepted trigger. The production implementation builds a
/// platform client per trigger and calls [`processor::process`].
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, trigger: &Trigger) -> Result<Outcome>;
}

/// API credentials and endpoints for the platforms the server accepts.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Used for every platform when set.
    pub platform_token: Option<String>,
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub github_base_url: Option<String>,
    pub gitlab_base_url: Option<String>,
}

impl Credentials {
    fn token_for(&self, platform: Platform) -> Option<&str> {
        let specific = match platform {
            Platform::Github => self.github_token.as_deref(),
            Platform::Gitlab => self.gitlab_token.as_deref(),
        };
        self.platform_token
            .as_deref()
            .or(specific)
            .filter(|t| !t.trim().is_empty())
    }

    fn base_url_for(&self, platform: Platform) -> Option<String> {
        match platform {
            Platform::Github => self.github_base_url.clone(),
            Platform::Gitlab => self.gitlab_base_url.clone(),
        }
    }
}

pub struct PlatformHandler {
    pub registry: PlatformRegistry,
    pub credentials: Credentials,
    pub config: ProcessorConfig,
}

#[async_trait]
impl TriggerHandler for PlatformHandler {
    async fn handle(&self, trigger: &Trigger) -> Result<Outcome> {
        let token = self
            .credentials
            .token_for(trigger.platform)
            .with_context(|| format!("no {} token configured", trigger.platform))?;
        let client = self.registry.build(&PlatformConfig {
            platform: trigger.platform,
            token: token.to_string(),
            base_url: self.credentials.base_url_for(trigger.platform),
            owner: trigger.repo_owner.clone(),
            repo: trigger.repo_name.clone(),
            pr_number: trigger.pr_number,
            retry: self.config.retry,
            operation_timeout: self.config.timeouts.operation,
        })?;
        Ok(processor::process(trigger, client.as_ref(), &self.config).await?)
    }
}

/// Run a trigger and record its metrics. `None` means the invocation errored.
pub(crate) async fn run_trigger(
    handler: &dyn TriggerHandler,
    metrics: &Metrics,
    trigger: Trigger,
) -> Option<Outcome> {
    let started = Instant::now();
    let result = handler.handle(&trigger).await;
    metrics.observe_invocation(started.elapsed().as_secs_f64());
    match result {
        Ok(outcome) => {
            metrics.outcome(&outcome);
            Some(outcome)
        }
        Err(e) => {
            error!(
                repo = %trigger.full_repo(),
                pr = trigger.pr_number,
                event_id = trigger.event_id.as_deref().unwrap_or_default(),
                error = %format!("{e:#}"),
                "invocation failed"
            );
            None
        }
    }
}

pub struct AppState {
    pub config: WebhookConfig,
    pub handler: Arc<dyn TriggerHandler>,
    pub metrics: Metrics,
    /// Present when processing asynchronously.
    pub queue: Option<Queue>,
    limiter: Option<FixedWindow>,
    seen: RecentIds,
}

impl AppState {
    pub fn new(
        config: WebhookConfig,
        handler: Arc<dyn TriggerHandler>,
        metrics: Metrics,
        queue: Option<Queue>,
    ) -> Self {
        let limiter = config.rate_limit.map(FixedWindow::per_minute);
        Self {
            config,
            handler,
            metrics,
            queue,
            limiter,
            seen: RecentIds::new(DEDUP_WINDOW),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cfg = &state.config;
    Router::new()
        .route(&cfg.webhook_path, post(receive))
        .route(&cfg.health_path, get(health))
        .route(&cfg.metrics_path, get(metrics_text))
        .with_state(state.clone())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reply(state: &AppState, code: StatusCode, result: &str, body: Value) -> Response {
    state.metrics.request(result);
    (code, Json(body)).into_response()
}

fn status(state: &AppState, code: StatusCode, status: &str) -> Response {
    reply(state, code, status, json!({ "status": status }))
}

/// Signature check for the detected platform.
fn authenticated(state: &AppState, platform: Platform, headers: &HeaderMap, body: &[u8]) -> bool {
    if !state.config.require_signature {
        return true;
    }
    let Some(secret) = state.config.secret.as_deref() else {
        return false;
    };
    match platform {
        Platform::Github => header_str(headers, "x-hub-signature-256")
            .is_some_and(|sig| signature::verify_github(secret, body, sig)),
        Platform::Gitlab => header_str(headers, "x-gitlab-token")
            .is_some_and(|tok| signature::verify_gitlab(secret, tok)),
    }
}

async fn receive(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(limiter) = &state.limiter {
        if !limiter.allow() {
            warn!("rate limit exceeded");
            return status(&state, StatusCode::TOO_MANY_REQUESTS, "rate_limited");
        }
    }

    let (platform, kind, delivery) = if let Some(ev) = header_str(&headers, "x-github-event") {
        (Platform::Github, ev, header_str(&headers, "x-github-delivery"))
    } else if let Some(ev) = header_str(&headers, "x-gitlab-event") {
        (Platform::Gitlab, ev, header_str(&headers, "x-gitlab-event-uuid"))
    } else {
        return status(&state, StatusCode::BAD_REQUEST, "unknown_source");
    };

    if !authenticated(&state, platform, &headers, &body) {
        warn!(%platform, kind, "invalid webhook signature");
        return status(&state, StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let parsed = match platform {
        Platform::Github => event::parse_github(kind, &body, &state.config.filter),
        Platform::Gitlab => event::parse_gitlab(&body, &state.config.filter),
    };
    let mut triggers = match parsed {
        Ok(Parsed::Triggers(t)) => t,
        Ok(Parsed::Ignored(reason)) => {
            debug!(%platform, kind, %reason, "event ignored");
            return status(&state, StatusCode::OK, "ignored");
        }
        Err(e) => {
            warn!(%platform, kind, error = %e, "malformed payload");
            return status(&state, StatusCode::BAD_REQUEST, "bad_request");
        }
    };

    if let Some(denied) = triggers
        .iter()
        .find(|t| !event::repo_allowed(&state.config.allowed_repos, &t.repo_owner, &t.repo_name))
    {
        warn!(repo = %denied.full_repo(), "repository not allowed");
        return status(&state, StatusCode::FORBIDDEN, "forbidden");
    }

    if let Some(id) = delivery {
        if !state.seen.insert(id) {
            info!(event_id = id, "duplicate delivery");
            return status(&state, StatusCode::OK, "duplicate");
        }
        for t in &mut triggers {
            t.event_id = Some(id.to_string());
        }
    }

    match &state.queue {
        Some(queue) => {
            let count = triggers.len();
            for trigger in triggers {
                if let Err(t) = queue.try_enqueue(trigger) {
                    warn!(repo = %t.full_repo(), pr = t.pr_number, "queue full, shedding trigger");
                    // The platform redelivers on 429; that retry must not count as a duplicate.
                    if let Some(id) = delivery {
                        state.seen.remove(id);
                    }
                    state.metrics.set_queue_depth(queue.depth());
                    return status(&state, StatusCode::TOO_MANY_REQUESTS, "queue_full");
                }
            }
            state.metrics.set_queue_depth(queue.depth());
            reply(
                &state,
                StatusCode::ACCEPTED,
                "queued",
                json!({ "status": "queued", "triggers": count }),
            )
        }
        None => {
            let mut outcomes = Vec::with_capacity(triggers.len());
            let mut failed = false;
            for trigger in triggers {
                match run_trigger(state.handler.as_ref(), &state.metrics, trigger).await {
                    Some(outcome) => {
                        failed |= outcome.failed;
                        outcomes.push(outcome);
                    }
                    None => failed = true,
                }
            }
            let (code, result) = if failed {
                (StatusCode::INTERNAL_SERVER_ERROR, "failed")
            } else {
                (StatusCode::OK, "processed")
            };
            reply(&state, code, result, json!({ "status": result, "outcomes": outcomes }))
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let saturated = state.queue.as_ref().is_some_and(Queue::is_saturated);
    if saturated {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "saturated" }))).into_response()
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    if let Some(queue) = &state.queue {
        state.metrics.set_queue_depth(queue.depth());
    }
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Bind, serve until a shutdown signal, then drain the worker pool.
pub async fn serve(config: WebhookConfig, handler: Arc<dyn TriggerHandler>) -> Result<()> {
    if config.require_signature && config.secret.is_none() {
        bail!("REQUIRE_SIGNATURE is set but no WEBHOOK_SECRET or WEBHOOK_SECRET_FILE was given");
    }

    let metrics = Metrics::new().context("failed to register metrics")?;
    let (queue, pool): (Option<Queue>, Option<WorkerPool>) = if config.async_processing {
        let (q, p) = queue::start(config.queue_size, config.worker_count, handler.clone(), metrics.clone());
        (Some(q), Some(p))
    } else {
        (None, None)
    };

    let addr = config.listen_addr;
    let tls = config.tls.clone();
    let state = Arc::new(AppState::new(config, handler, metrics, queue));
    let app = router(state);

    match tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                .await
                .with_context(|| format!("failed to load TLS material from {}", tls.cert_file.display()))?;
            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received");
                signal_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
            info!(%addr, "pr-webhook listening (tls)");
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(%addr, "pr-webhook listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_signal().await;
                    info!("shutdown signal received");
                })
                .await
                .context("server failed")?;
        }
    }

    if let Some(pool) = pool {
        pool.shutdown(SHUTDOWN_GRACE).await;
    }
    info!("pr-webhook stopped");
    Ok(())
}
