use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::processor::Outcome;

/// Every series the webhook server exports, registered in one registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    commands: IntCounterVec,
    queue_depth: IntGauge,
    invocation_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "pr_cli_webhook_requests_total",
                "Webhook deliveries by how they were handled",
            ),
            &["result"],
        )?;
        let commands = IntCounterVec::new(
            Opts::new("pr_cli_commands_total", "Commands dispatched by verb and status"),
            &["verb", "status"],
        )?;
        let queue_depth = IntGauge::with_opts(Opts::new(
            "pr_cli_queue_depth",
            "Triggers waiting for a worker",
        ))?;
        let invocation_seconds = Histogram::with_opts(
            HistogramOpts::new("pr_cli_invocation_seconds", "Wall time of one invocation")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(invocation_seconds.clone()))?;

        Ok(Self {
            registry,
            requests,
            commands,
            queue_depth,
            invocation_seconds,
        })
    }

    pub fn request(&self, result: &str) {
        self.requests.with_label_values(&[result]).inc();
    }

    pub fn outcome(&self, outcome: &Outcome) {
        for c in &outcome.commands {
            self.commands
                .with_label_values(&[c.verb.as_str(), c.status.as_str()])
                .inc();
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn observe_invocation(&self, seconds: f64) {
        self.invocation_seconds.observe(seconds);
    }

    /// Prometheus text exposition of the registry.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}
